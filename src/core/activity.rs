//! Activity abstraction and the activity registry
//!
//! An activity is the unit of work a stage invokes. Activities are shared
//! by every partition that runs their stage, so anything an activity needs
//! to remember between evaluations belongs in the partition-scoped state
//! exposed by [`ActivityContext::state_mut`].

use crate::core::context::ActivityContext;
use crate::execution::timer::TimerError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Settings passed to an activity factory (the stage's `settings` object)
pub type ActivitySettings = Map<String, Value>;

/// Builds an activity from its stage settings
pub type ActivityFactory =
    Arc<dyn Fn(&ActivitySettings) -> Result<Arc<dyn Activity>, ActivityError> + Send + Sync>;

/// Error types for activity creation and evaluation
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("Invalid setting '{name}': {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("Missing input '{0}'")]
    MissingInput(String),

    #[error("Timer error: {0}")]
    Timer(#[from] TimerError),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("{0}")]
    Eval(String),
}

/// Optional capabilities of an activity, captured once when a stage is compiled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The activity holds resources released by [`Activity::cleanup`]
    pub cleanup: bool,

    /// One instance is shared process-wide; exempt from per-definition cleanup
    pub singleton: bool,
}

impl Capabilities {
    pub fn with_cleanup(mut self) -> Self {
        self.cleanup = true;
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }
}

/// A unit of work invoked by a stage
#[async_trait]
pub trait Activity: Send + Sync {
    /// Evaluate the activity.
    ///
    /// Returns `Ok(true)` when the activity is done and its outputs are final.
    /// Returns `Ok(false)` when it armed a timer and the stage must wait for it.
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Release resources held by the activity
    fn cleanup(&self) -> Result<(), ActivityError> {
        Ok(())
    }
}

/// Maps activity references to factories or shared instances
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    factories: HashMap<String, ActivityFactory>,
    shared: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in activities
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::activities::register_builtins(&mut registry);
        registry
    }

    /// Register a factory that builds a fresh activity for every stage using it
    pub fn register<F>(&mut self, reference: impl Into<String>, factory: F)
    where
        F: Fn(&ActivitySettings) -> Result<Arc<dyn Activity>, ActivityError> + Send + Sync + 'static,
    {
        self.factories.insert(reference.into(), Arc::new(factory));
    }

    /// Register one activity instance reused by every stage that references it
    pub fn register_shared(&mut self, reference: impl Into<String>, activity: Arc<dyn Activity>) {
        self.shared.insert(reference.into(), activity);
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.shared.contains_key(reference) || self.factories.contains_key(reference)
    }

    /// Resolve a reference. `None` when the reference is unknown.
    pub fn create(
        &self,
        reference: &str,
        settings: &ActivitySettings,
    ) -> Option<Result<Arc<dyn Activity>, ActivityError>> {
        if let Some(activity) = self.shared.get(reference) {
            return Some(Ok(activity.clone()));
        }
        self.factories.get(reference).map(|factory| factory(settings))
    }

    /// Registered references, sorted
    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .factories
            .keys()
            .chain(self.shared.keys())
            .cloned()
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("references", &self.references())
            .finish()
    }
}
