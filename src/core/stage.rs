//! Stage domain model

use crate::core::activity::{Activity, ActivityRegistry, Capabilities};
use crate::core::config::StageConfig;
use crate::core::definition::CompilationError;
use crate::core::mapping::{Mapper, MapperFactory};
use std::sync::Arc;

/// One compiled stage of a pipeline
///
/// Holds the resolved activity, its capability set and the compiled input
/// and output mappers. A stage is immutable and shared by every partition.
#[derive(Clone)]
pub struct Stage {
    name: String,
    activity_ref: String,
    activity: Arc<dyn Activity>,
    capabilities: Capabilities,
    input: Mapper,
    output: Mapper,
}

impl Stage {
    /// Compile a stage from its configuration
    pub fn from_config(
        index: usize,
        config: &StageConfig,
        mapper_factory: &dyn MapperFactory,
        activities: &ActivityRegistry,
    ) -> Result<Self, CompilationError> {
        let name = config.stage_name(index);

        let activity = match activities.create(&config.activity_ref, &config.settings) {
            None => {
                return Err(CompilationError::UnknownActivity {
                    index,
                    stage: name,
                    reference: config.activity_ref.clone(),
                })
            }
            Some(Err(source)) => {
                return Err(CompilationError::Activity {
                    index,
                    stage: name,
                    reference: config.activity_ref.clone(),
                    source,
                })
            }
            Some(Ok(activity)) => activity,
        };

        let binding_error = |source| CompilationError::Binding {
            index,
            stage: name.clone(),
            source,
        };
        let input = mapper_factory
            .new_mapper(&config.input)
            .map_err(binding_error)?;
        let output = mapper_factory
            .new_mapper(&config.output)
            .map_err(binding_error)?;

        Ok(Self {
            capabilities: activity.capabilities(),
            name,
            activity_ref: config.activity_ref.clone(),
            activity,
            input,
            output,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activity_ref(&self) -> &str {
        &self.activity_ref
    }

    pub fn activity(&self) -> &Arc<dyn Activity> {
        &self.activity
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Bindings evaluated before the activity runs
    pub fn input(&self) -> &Mapper {
        &self.input
    }

    /// Bindings evaluated after the activity completes
    pub fn output(&self) -> &Mapper {
        &self.output
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("activity_ref", &self.activity_ref)
            .field("capabilities", &self.capabilities)
            .field("input", &self.input.targets().collect::<Vec<_>>())
            .field("output", &self.output.targets().collect::<Vec<_>>())
            .finish()
    }
}
