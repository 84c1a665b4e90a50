//! Partition data scope and the activity execution context

use crate::execution::timer::{TimerSlots, TimerSupport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Accumulated data of one partition
///
/// Holds the pipeline-level values (inputs plus everything output bindings
/// produced) and the raw outputs of each completed stage, keyed by stage name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataScope {
    /// Pipeline-level named values
    pub values: Map<String, Value>,

    /// Raw activity outputs (stage name -> output object)
    pub stage_outputs: Map<String, Value>,
}

impl DataScope {
    /// Create a scope seeded with pipeline inputs
    pub fn from_inputs(inputs: Map<String, Value>) -> Self {
        Self {
            values: inputs,
            stage_outputs: Map::new(),
        }
    }

    /// Merge values into the pipeline-level scope, replacing existing names
    pub fn merge_values(&mut self, values: Map<String, Value>) {
        self.values.extend(values);
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Record the raw outputs of a stage
    pub fn set_stage_output(&mut self, stage: &str, outputs: Map<String, Value>) {
        self.stage_outputs
            .insert(stage.to_string(), Value::Object(outputs));
    }

    pub fn stage_output(&self, stage: &str) -> Option<&Value> {
        self.stage_outputs.get(stage)
    }
}

/// Context handed to an activity while it is evaluated
///
/// The context is built for one stage of one partition. Inputs are the
/// result of the stage's input bindings, outputs are read back by the
/// stage's output bindings, and `state` survives across evaluations of the
/// same stage in the same partition.
pub struct ActivityContext {
    stage_name: String,
    discriminator: String,
    inputs: Map<String, Value>,
    outputs: Map<String, Value>,
    state: Map<String, Value>,
    timers: Option<TimerSlots>,
}

impl ActivityContext {
    pub(crate) fn new(
        stage_name: impl Into<String>,
        discriminator: impl Into<String>,
        inputs: Map<String, Value>,
        state: Map<String, Value>,
        timers: TimerSlots,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            discriminator: discriminator.into(),
            inputs,
            outputs: Map::new(),
            state,
            timers: Some(timers),
        }
    }

    /// A context not bound to any instance (no timer support)
    pub fn detached(stage_name: impl Into<String>, inputs: Map<String, Value>) -> Self {
        Self {
            stage_name: stage_name.into(),
            discriminator: String::new(),
            inputs,
            outputs: Map::new(),
            state: Map::new(),
            timers: None,
        }
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Discriminator of the partition this evaluation belongs to
    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn set_output(&mut self, name: impl Into<String>, value: Value) {
        self.outputs.insert(name.into(), value);
    }

    pub fn outputs(&self) -> &Map<String, Value> {
        &self.outputs
    }

    /// Partition-scoped state of this stage's activity
    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.state
    }

    /// Timer support, when the context is bound to a running instance
    pub fn timer_support(&mut self) -> Option<&mut dyn TimerSupport> {
        self.timers.as_mut().map(|t| t as &mut dyn TimerSupport)
    }

    pub(crate) fn into_parts(self) -> ContextParts {
        ContextParts {
            inputs: self.inputs,
            outputs: self.outputs,
            state: self.state,
            timers: self.timers,
        }
    }
}

/// What the engine takes back from a context after evaluation
pub(crate) struct ContextParts {
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub state: Map<String, Value>,
    pub timers: Option<TimerSlots>,
}
