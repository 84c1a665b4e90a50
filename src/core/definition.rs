//! Pipeline definition and its compiler

use crate::core::activity::{ActivityError, ActivityRegistry};
use crate::core::config::{Attribute, DefinitionConfig, IoMetadata};
use crate::core::context::DataScope;
use crate::core::mapping::{
    CompositeResolver, ExprMapperFactory, MapperFactory, MappingError, Reference, ACTIVITY_SCOPE,
    PIPELINE_SCOPE, STAGE_SCOPE,
};
use crate::core::stage::Stage;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Error raised while compiling a pipeline definition
#[derive(Debug, Error)]
pub enum CompilationError {
    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    #[error("Stage {index} ('{stage}'): unknown activity reference '{reference}'")]
    UnknownActivity {
        index: usize,
        stage: String,
        reference: String,
    },

    #[error("Stage {index} ('{stage}'): cannot create activity '{reference}': {source}")]
    Activity {
        index: usize,
        stage: String,
        reference: String,
        #[source]
        source: ActivityError,
    },

    #[error("Stage {index} ('{stage}'): {source}")]
    Binding {
        index: usize,
        stage: String,
        #[source]
        source: MappingError,
    },

    #[error("Stage {index}: duplicate stage name '{stage}'")]
    DuplicateStage { index: usize, stage: String },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BindingKind {
    Input,
    Output,
}

/// An immutable, compiled pipeline
#[derive(Debug)]
pub struct Definition {
    name: String,
    stages: Vec<Stage>,
    metadata: IoMetadata,
}

impl Definition {
    /// Compile a definition from its configuration
    ///
    /// Stages are compiled in order and compilation stops at the first
    /// failing stage. Every binding reference is checked against the
    /// resolver's scopes and against the names visible at that stage.
    pub fn new(
        config: &DefinitionConfig,
        mapper_factory: &dyn MapperFactory,
        resolver: &CompositeResolver,
        activities: &ActivityRegistry,
    ) -> Result<Self, CompilationError> {
        config
            .validate()
            .map_err(|e| CompilationError::Config(e.to_string()))?;

        let declared_inputs: Option<HashSet<&str>> = config
            .metadata
            .as_ref()
            .filter(|m| !m.input.is_empty())
            .map(|m| m.input.iter().map(|a| a.name.as_str()).collect());

        let mut produced: HashSet<String> = HashSet::new();
        let mut earlier_stages: HashSet<String> = HashSet::new();
        let mut stages = Vec::with_capacity(config.stages.len());

        for (index, stage_config) in config.stages.iter().enumerate() {
            let stage = Stage::from_config(index, stage_config, mapper_factory, activities)?;

            if earlier_stages.contains(stage.name()) {
                return Err(CompilationError::DuplicateStage {
                    index,
                    stage: stage.name().to_string(),
                });
            }

            let check = |reference: &Reference, kind: BindingKind| {
                check_reference(
                    reference,
                    kind,
                    stage.name(),
                    resolver,
                    declared_inputs.as_ref(),
                    &produced,
                    &earlier_stages,
                )
                .map_err(|source| CompilationError::Binding {
                    index,
                    stage: stage.name().to_string(),
                    source,
                })
            };
            for reference in stage.input().references() {
                check(reference, BindingKind::Input)?;
            }
            for reference in stage.output().references() {
                check(reference, BindingKind::Output)?;
            }

            debug!(
                "Compiled stage {} '{}' ({})",
                index,
                stage.name(),
                stage.activity_ref()
            );
            produced.extend(stage.output().targets().map(str::to_string));
            earlier_stages.insert(stage.name().to_string());
            stages.push(stage);
        }

        Ok(Self {
            name: config.name.clone(),
            stages,
            metadata: config.metadata.clone().unwrap_or_default(),
        })
    }

    /// Compile with the default expression mapper and the built-in scopes
    pub fn compile(
        config: &DefinitionConfig,
        activities: &ActivityRegistry,
    ) -> Result<Self, CompilationError> {
        let resolver = Arc::new(CompositeResolver::default());
        let mapper_factory = ExprMapperFactory::new(resolver.clone());
        Self::new(config, &mapper_factory, &resolver, activities)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in execution order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn metadata(&self) -> &IoMetadata {
        &self.metadata
    }

    /// Declared inputs that carry a default value
    pub fn input_defaults(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.metadata
            .input
            .iter()
            .filter_map(|attr| attr.value.as_ref().map(|v| (attr.name.as_str(), v)))
    }

    /// Pipeline outputs: declared output attributes looked up in the scope
    ///
    /// Absent values are omitted. No declared outputs yields an empty map.
    pub fn extract_outputs(&self, scope: &DataScope) -> Map<String, Value> {
        self.metadata
            .output
            .iter()
            .filter_map(|attr: &Attribute| {
                scope
                    .value(&attr.name)
                    .map(|value| (attr.name.clone(), value.clone()))
            })
            .collect()
    }

    /// Release resources held by the stage activities
    ///
    /// Singleton activities are skipped. Failures are logged and do not stop
    /// the remaining cleanups.
    pub fn cleanup(&self) {
        for stage in &self.stages {
            let capabilities = stage.capabilities();
            if capabilities.singleton || !capabilities.cleanup {
                continue;
            }
            if let Err(e) = stage.activity().cleanup() {
                warn!(
                    "Error cleaning up activity '{}' in pipeline '{}': {}",
                    stage.activity_ref(),
                    self.name,
                    e
                );
            }
        }
    }
}

fn check_reference(
    reference: &Reference,
    kind: BindingKind,
    current_stage: &str,
    resolver: &CompositeResolver,
    declared_inputs: Option<&HashSet<&str>>,
    produced: &HashSet<String>,
    earlier_stages: &HashSet<String>,
) -> Result<(), MappingError> {
    match reference.scope.as_str() {
        PIPELINE_SCOPE => {
            let name = reference.name();
            if let Some(declared) = declared_inputs {
                if !declared.contains(name) && !produced.contains(name) {
                    return Err(MappingError::Undeclared(reference.to_string()));
                }
            }
        }
        STAGE_SCOPE => {
            let name = reference.name();
            let is_self = kind == BindingKind::Output && name == current_stage;
            if !earlier_stages.contains(name) && !is_self {
                return Err(MappingError::Undeclared(reference.to_string()));
            }
        }
        ACTIVITY_SCOPE if kind == BindingKind::Input => {
            return Err(MappingError::ScopeNotAllowed {
                scope: ACTIVITY_SCOPE.to_string(),
                context: "input".to_string(),
            });
        }
        scope if !resolver.contains(scope) => {
            return Err(MappingError::UnknownScope {
                scope: scope.to_string(),
                expr: reference.to_string(),
            });
        }
        _ => {}
    }
    Ok(())
}
