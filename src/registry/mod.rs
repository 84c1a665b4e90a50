//! Pipeline registry
//!
//! The [`Manager`] maps pipeline names to compiled definitions. Names of the
//! form `res://<kind>:<id>` are resolved through an attached
//! [`ResourceStore`] instead.

pub mod resource;

pub use resource::{Resource, ResourceLoader, ResourceStore, PIPELINE_RESOURCE_TYPE, RESOURCE_URI_PREFIX};

use crate::core::definition::Definition;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Error raised when a pipeline cannot be resolved or registered
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Pipeline '{0}' not found")]
    NotFound(String),

    #[error("Resource '{0}' not found")]
    ResourceNotFound(String),

    #[error("Resource '{id}' is a '{found}', expected a '{expected}'")]
    WrongKind {
        id: String,
        expected: String,
        found: String,
    },

    #[error("Pipeline '{0}' is already registered")]
    Duplicate(String),

    #[error("Invalid resource URI '{0}'")]
    InvalidUri(String),

    #[error("Pipeline name must not be empty")]
    InvalidName,
}

/// Registry of compiled pipelines
#[derive(Debug, Default)]
pub struct Manager {
    pipelines: RwLock<HashMap<String, Arc<Definition>>>,
    resources: Option<Arc<ResourceStore>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `res://` names through `store`
    pub fn with_resources(mut self, store: Arc<ResourceStore>) -> Self {
        self.resources = Some(store);
        self
    }

    /// Register a pipeline under its name. An existing pipeline with the
    /// same name is not replaced.
    pub fn register_pipeline(&self, definition: impl Into<Arc<Definition>>) -> Result<(), ResolutionError> {
        let definition = definition.into();
        let name = definition.name().to_string();
        if name.is_empty() {
            return Err(ResolutionError::InvalidName);
        }

        let mut pipelines = self.pipelines.write().unwrap_or_else(PoisonError::into_inner);
        if pipelines.contains_key(&name) {
            return Err(ResolutionError::Duplicate(name));
        }
        pipelines.insert(name.clone(), definition);
        info!("Registered pipeline '{}'", name);
        Ok(())
    }

    /// Register a pipeline, returning the one it replaced
    pub fn replace_pipeline(
        &self,
        definition: impl Into<Arc<Definition>>,
    ) -> Result<Option<Arc<Definition>>, ResolutionError> {
        let definition = definition.into();
        let name = definition.name().to_string();
        if name.is_empty() {
            return Err(ResolutionError::InvalidName);
        }

        let previous = self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), definition);
        debug!("Replaced pipeline '{}' (existed: {})", name, previous.is_some());
        Ok(previous)
    }

    pub fn unregister_pipeline(&self, name: &str) -> Option<Arc<Definition>> {
        self.pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Resolve a pipeline by name or resource URI
    pub fn get_pipeline(&self, name_or_uri: &str) -> Result<Arc<Definition>, ResolutionError> {
        if name_or_uri.starts_with(RESOURCE_URI_PREFIX) {
            return match &self.resources {
                Some(store) => store.get_pipeline(name_or_uri),
                None => Err(ResolutionError::ResourceNotFound(name_or_uri.to_string())),
            };
        }

        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name_or_uri)
            .cloned()
            .ok_or_else(|| ResolutionError::NotFound(name_or_uri.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered pipeline names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
