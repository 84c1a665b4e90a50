//! Pipeline resources: loading documents and resolving `res://` URIs

use crate::core::activity::ActivityRegistry;
use crate::core::config::DefinitionConfig;
use crate::core::definition::{CompilationError, Definition};
use crate::core::mapping::{CompositeResolver, ExprMapperFactory, MapperFactory};
use crate::registry::ResolutionError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Resource type of pipeline definitions
pub const PIPELINE_RESOURCE_TYPE: &str = "pipeline";

/// Prefix of resource URIs (`res://<kind>:<id>`)
pub const RESOURCE_URI_PREFIX: &str = "res://";

/// A stored resource
#[derive(Debug, Clone)]
pub enum Resource {
    Pipeline(Arc<Definition>),
    /// Any other resource kind, kept as raw data
    Data { kind: String, value: Value },
}

impl Resource {
    pub fn kind(&self) -> &str {
        match self {
            Resource::Pipeline(_) => PIPELINE_RESOURCE_TYPE,
            Resource::Data { kind, .. } => kind,
        }
    }
}

/// Parses pipeline resource documents and compiles them
#[derive(Clone)]
pub struct ResourceLoader {
    mapper_factory: Arc<dyn MapperFactory>,
    resolver: Arc<CompositeResolver>,
    activities: Arc<ActivityRegistry>,
}

impl ResourceLoader {
    /// Loader using the built-in expression mapper and scopes
    pub fn new(activities: Arc<ActivityRegistry>) -> Self {
        let resolver = Arc::new(CompositeResolver::default());
        Self {
            mapper_factory: Arc::new(ExprMapperFactory::new(resolver.clone())),
            resolver,
            activities,
        }
    }

    pub fn with_mapping(
        mut self,
        mapper_factory: Arc<dyn MapperFactory>,
        resolver: Arc<CompositeResolver>,
    ) -> Self {
        self.mapper_factory = mapper_factory;
        self.resolver = resolver;
        self
    }

    /// Parse a JSON or YAML document into a configuration
    ///
    /// A document without a name takes the resource id as its name.
    pub fn parse(&self, id: &str, data: &str) -> Result<DefinitionConfig, CompilationError> {
        let parsed = if data.trim_start().starts_with('{') {
            serde_json::from_str::<DefinitionConfig>(data).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str::<DefinitionConfig>(data).map_err(|e| e.to_string())
        };
        let mut config = parsed.map_err(|reason| {
            CompilationError::Config(format!(
                "error parsing pipeline resource with id '{}': {}",
                id, reason
            ))
        })?;

        if config.name.trim().is_empty() {
            config.name = id.to_string();
        }
        Ok(config)
    }

    /// Parse and compile a pipeline document
    pub fn load(&self, id: &str, data: &str) -> Result<Definition, CompilationError> {
        let config = self.parse(id, data)?;
        Definition::new(
            &config,
            self.mapper_factory.as_ref(),
            &self.resolver,
            &self.activities,
        )
    }
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("resolver", &self.resolver)
            .field("activities", &self.activities)
            .finish()
    }
}

/// Resources addressed by `<kind>:<id>`
#[derive(Debug)]
pub struct ResourceStore {
    loader: ResourceLoader,
    resources: RwLock<HashMap<String, Resource>>,
}

impl ResourceStore {
    pub fn new(loader: ResourceLoader) -> Self {
        Self {
            loader,
            resources: RwLock::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &ResourceLoader {
        &self.loader
    }

    /// Compile a pipeline document and store it as `pipeline:<id>`
    ///
    /// `id` may already carry the `pipeline:` prefix.
    pub fn load_pipeline(&self, id: &str, data: &str) -> Result<Arc<Definition>, CompilationError> {
        let id = id
            .strip_prefix(PIPELINE_RESOURCE_TYPE)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(id);
        let definition = Arc::new(self.loader.load(id, data)?);
        let key = format!("{}:{}", PIPELINE_RESOURCE_TYPE, id);
        info!("Loaded pipeline resource '{}'", key);
        self.insert(key, Resource::Pipeline(definition.clone()));
        Ok(definition)
    }

    /// Store a resource under a full `<kind>:<id>` key, replacing any previous one
    pub fn insert(&self, key: impl Into<String>, resource: Resource) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), resource);
    }

    pub fn get(&self, key: &str) -> Option<Resource> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Resolve `res://pipeline:<id>` to its definition
    pub fn get_pipeline(&self, uri: &str) -> Result<Arc<Definition>, ResolutionError> {
        let key = uri
            .strip_prefix(RESOURCE_URI_PREFIX)
            .filter(|key| key.contains(':'))
            .ok_or_else(|| ResolutionError::InvalidUri(uri.to_string()))?;

        match self.get(key) {
            Some(Resource::Pipeline(definition)) => Ok(definition),
            Some(other) => Err(ResolutionError::WrongKind {
                id: key.to_string(),
                expected: PIPELINE_RESOURCE_TYPE.to_string(),
                found: other.kind().to_string(),
            }),
            None => Err(ResolutionError::ResourceNotFound(key.to_string())),
        }
    }

    /// Stored resource keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
