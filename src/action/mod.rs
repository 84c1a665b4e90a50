//! Pipeline action - the composition root for running a pipeline
//!
//! An action resolves its pipeline once, owns a single [`Instance`] and
//! turns each incoming input map into a run for the partition selected by
//! the `groupBy` field.

pub mod channel;

pub use channel::{BoundedChannel, ChannelRegistry, OutputChannel, PublishError};

use crate::core::config::IoMetadata;
use crate::core::definition::Definition;
use crate::execution::{ExecutionError, Instance, RunOutcome};
use crate::registry::{Manager, ResolutionError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Error raised while building or running a pipeline action
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Invalid action settings: {0}")]
    Settings(String),

    #[error("Pipeline URI not specified")]
    MissingPipelineUri,

    #[error("Unable to resolve pipeline: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Output channel '{0}' not registered")]
    UnknownChannel(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Settings of a pipeline action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSettings {
    /// Pipeline name or `res://pipeline:<id>` URI
    #[serde(rename = "pipelineURI", alias = "pipeline_uri", default)]
    pub pipeline_uri: String,

    /// Input field whose value selects the partition
    #[serde(rename = "groupBy", alias = "group_by", default)]
    pub group_by: Option<String>,

    /// Channel that receives the outputs of completed runs
    #[serde(rename = "outputChannel", alias = "output_channel", default)]
    pub output_channel: Option<String>,
}

impl ActionSettings {
    pub fn new(pipeline_uri: impl Into<String>) -> Self {
        Self {
            pipeline_uri: pipeline_uri.into(),
            ..Self::default()
        }
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    pub fn output_channel(mut self, name: impl Into<String>) -> Self {
        self.output_channel = Some(name.into());
        self
    }

    /// Decode settings from an action configuration object
    pub fn from_map(settings: &Map<String, Value>) -> Result<Self, ActionError> {
        serde_json::from_value(Value::Object(settings.clone()))
            .map_err(|e| ActionError::Settings(e.to_string()))
    }
}

/// Builds pipeline actions against a registry of pipelines and channels
#[derive(Debug, Clone)]
pub struct ActionFactory {
    manager: Arc<Manager>,
    channels: Arc<ChannelRegistry>,
}

impl ActionFactory {
    pub fn new(manager: Arc<Manager>, channels: Arc<ChannelRegistry>) -> Self {
        Self { manager, channels }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn new_action(&self, settings: &ActionSettings) -> Result<PipelineAction, ActionError> {
        if settings.pipeline_uri.trim().is_empty() {
            return Err(ActionError::MissingPipelineUri);
        }
        let definition = self.manager.get_pipeline(&settings.pipeline_uri)?;

        let output_channel = match settings.output_channel.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => Some(
                self.channels
                    .get(name)
                    .ok_or_else(|| ActionError::UnknownChannel(name.to_string()))?,
            ),
            None => None,
        };

        let group_by = settings.group_by.clone().filter(|g| !g.is_empty());
        let instance = Instance::new(definition.clone(), group_by.is_none(), output_channel);
        info!(
            "Created action for pipeline '{}' (instance {}, group by: {})",
            definition.name(),
            instance.id(),
            group_by.as_deref().unwrap_or("-")
        );

        Ok(PipelineAction {
            definition,
            instance,
            group_by,
        })
    }
}

/// A resolved pipeline bound to one instance
#[derive(Debug, Clone)]
pub struct PipelineAction {
    definition: Arc<Definition>,
    instance: Instance,
    group_by: Option<String>,
}

impl PipelineAction {
    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }

    pub fn io_metadata(&self) -> &IoMetadata {
        self.definition.metadata()
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn group_by(&self) -> Option<&str> {
        self.group_by.as_deref()
    }

    /// Partition discriminator for an input map
    pub fn discriminator(&self, inputs: &Map<String, Value>) -> String {
        self.group_by
            .as_ref()
            .and_then(|field| inputs.get(field))
            .map(coerce_to_string)
            .unwrap_or_default()
    }

    /// Run the pipeline for one input map
    pub async fn run(&self, inputs: Map<String, Value>) -> Result<RunOutcome, ExecutionError> {
        let discriminator = self.discriminator(&inputs);
        debug!("Running pipeline '{}' for '{}'", self.definition.name(), discriminator);
        self.instance.run(&discriminator, inputs).await
    }

    /// Run on a tokio task; `handler` receives the result exactly once
    pub fn run_async<F>(&self, inputs: Map<String, Value>, handler: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<RunOutcome, ExecutionError>) + Send + 'static,
    {
        let discriminator = self.discriminator(&inputs);
        debug!("Scheduling pipeline '{}' for '{}'", self.definition.name(), discriminator);
        self.instance.spawn_run(discriminator, inputs, handler)
    }
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
