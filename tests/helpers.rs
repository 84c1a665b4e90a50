//! Test utility functions for stream-pipeline

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_pipeline::core::activity::ActivitySettings;
use stream_pipeline::execution::{timer_callback, TimerCallback};
use stream_pipeline::{
    Activity, ActivityContext, ActivityError, ActivityRegistry, Definition, DefinitionConfig,
    Instance, InstanceEvent,
};

pub const RECORD_REF: &str = "test/record";
pub const SLOW_REF: &str = "test/slow";
pub const FAIL_REF: &str = "test/fail";
pub const TIMER_REF: &str = "test/timer";

/// Build a JSON object map
pub fn map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// One evaluation seen by a [`RecordingActivity`]
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub discriminator: String,
    pub stage: String,
    pub inputs: Map<String, Value>,
}

/// Records every evaluation and copies its inputs to its outputs
#[derive(Default)]
pub struct RecordingActivity {
    calls: Mutex<Vec<Call>>,
}

impl RecordingActivity {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stages_for(&self, discriminator: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.discriminator == discriminator)
            .map(|c| c.stage)
            .collect()
    }
}

#[async_trait]
impl Activity for RecordingActivity {
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        self.calls.lock().unwrap().push(Call {
            discriminator: ctx.discriminator().to_string(),
            stage: ctx.stage_name().to_string(),
            inputs: ctx.inputs().clone(),
        });
        let inputs = ctx.inputs().clone();
        for (name, value) in inputs {
            ctx.set_output(name, value);
        }
        Ok(true)
    }
}

/// Sleeps while tracking how many evaluations are in flight, overall and
/// per partition
pub struct SlowActivity {
    delay: Duration,
    state: Mutex<SlowState>,
}

#[derive(Default)]
struct SlowState {
    in_flight: usize,
    max_in_flight: usize,
    per_partition: HashMap<String, usize>,
    max_per_partition: usize,
}

impl SlowActivity {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Mutex::new(SlowState::default()),
        }
    }

    /// Highest number of evaluations in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    /// Highest number of evaluations in flight at once for a single partition
    pub fn max_per_partition(&self) -> usize {
        self.state.lock().unwrap().max_per_partition
    }
}

#[async_trait]
impl Activity for SlowActivity {
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        let key = ctx.discriminator().to_string();
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            let count = state.per_partition.entry(key.clone()).or_insert(0);
            *count += 1;
            let count = *count;
            state.max_per_partition = state.max_per_partition.max(count);
        }

        tokio::time::sleep(self.delay).await;

        {
            let mut state = self.state.lock().unwrap();
            state.in_flight -= 1;
            if let Some(count) = state.per_partition.get_mut(&key) {
                *count -= 1;
            }
        }

        let inputs = ctx.inputs().clone();
        for (name, value) in inputs {
            ctx.set_output(name, value);
        }
        Ok(true)
    }
}

/// Fails when its `fail` input is true, otherwise passes inputs through
pub struct FailingActivity;

#[async_trait]
impl Activity for FailingActivity {
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        if ctx.input("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ActivityError::Eval(format!(
                "forced failure in partition '{}'",
                ctx.discriminator()
            )));
        }
        let inputs = ctx.inputs().clone();
        for (name, value) in inputs {
            ctx.set_output(name, value);
        }
        Ok(true)
    }
}

/// Arms a timer and completes once a firing asks to resume
///
/// `script` lists the resume decision of each firing (missing entries mean
/// resume). A one-shot timer that declines to resume re-arms itself.
/// Outputs `firings` and `evaluations` on completion.
pub struct ScriptedTimerActivity {
    interval: Duration,
    repeating: bool,
    script: Arc<Vec<bool>>,
}

impl ScriptedTimerActivity {
    pub fn new(interval: Duration, repeating: bool, script: Vec<bool>) -> Self {
        Self {
            interval,
            repeating,
            script: Arc::new(script),
        }
    }

    pub fn from_settings(settings: &ActivitySettings) -> Result<Self, ActivityError> {
        let interval = settings
            .get("interval_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .ok_or_else(|| ActivityError::InvalidSetting {
                name: "interval_ms".to_string(),
                reason: "required".to_string(),
            })?;
        let repeating = settings.get("repeating").and_then(Value::as_bool).unwrap_or(false);
        let script = settings
            .get("script")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(|v| v.as_bool().unwrap_or(true)).collect())
            .unwrap_or_default();
        Ok(Self::new(interval, repeating, script))
    }
}

fn counter(state: &Map<String, Value>, key: &str) -> u64 {
    state.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn firing_callback(script: Arc<Vec<bool>>, interval: Duration, repeating: bool) -> TimerCallback {
    timer_callback(move |ctx| {
        let firings = counter(ctx.state(), "firings") + 1;
        ctx.state_mut().insert("firings".to_string(), Value::from(firings));

        let resume = script.get(firings as usize - 1).copied().unwrap_or(true);
        if resume {
            ctx.state_mut().insert("done".to_string(), Value::Bool(true));
        } else if !repeating {
            let again = firing_callback(script.clone(), interval, repeating);
            if let Some(timers) = ctx.timer_support() {
                timers
                    .create_timer(interval, again, false)
                    .expect("re-arming a fired one-shot timer succeeds");
            }
        }
        resume
    })
}

#[async_trait]
impl Activity for ScriptedTimerActivity {
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        let evaluations = counter(ctx.state(), "evaluations") + 1;
        ctx.state_mut()
            .insert("evaluations".to_string(), Value::from(evaluations));

        if ctx.state_mut().remove("done").is_some() {
            let firings = counter(ctx.state(), "firings");
            ctx.set_output("firings", Value::from(firings));
            ctx.set_output("evaluations", Value::from(evaluations));
            ctx.state_mut().remove("firings");
            ctx.state_mut().remove("evaluations");
            return Ok(true);
        }

        let callback = firing_callback(self.script.clone(), self.interval, self.repeating);
        let timers = ctx
            .timer_support()
            .ok_or_else(|| ActivityError::Eval("timer support required".to_string()))?;
        if !timers.has_timer(self.repeating) {
            timers.create_timer(self.interval, callback, self.repeating)?;
        }
        Ok(false)
    }
}

/// Registry with the built-ins plus shared test activities
pub struct TestActivities {
    pub registry: ActivityRegistry,
    pub recorder: Arc<RecordingActivity>,
    pub slow: Arc<SlowActivity>,
}

pub fn test_activities() -> TestActivities {
    let recorder = Arc::new(RecordingActivity::default());
    let slow = Arc::new(SlowActivity::new(Duration::from_millis(20)));

    let mut registry = ActivityRegistry::with_builtins();
    registry.register_shared(RECORD_REF, recorder.clone());
    registry.register_shared(SLOW_REF, slow.clone());
    registry.register_shared(FAIL_REF, Arc::new(FailingActivity));
    registry.register(TIMER_REF, |settings: &ActivitySettings| {
        Ok(Arc::new(ScriptedTimerActivity::from_settings(settings)?) as Arc<dyn Activity>)
    });

    TestActivities {
        registry,
        recorder,
        slow,
    }
}

/// Parse and compile a YAML pipeline
pub fn compile_yaml(yaml: &str, registry: &ActivityRegistry) -> Arc<Definition> {
    let config = DefinitionConfig::from_yaml(yaml).expect("pipeline YAML is valid");
    Arc::new(Definition::compile(&config, registry).expect("pipeline compiles"))
}

/// Collect every event an instance emits
pub fn record_events(instance: &Instance) -> Arc<Mutex<Vec<InstanceEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    instance.add_event_handler(move |event| sink.lock().unwrap().push(event));
    events
}

/// Names of the events, in order, for compact assertions
pub fn event_names(events: &Mutex<Vec<InstanceEvent>>) -> Vec<&'static str> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|event| match event {
            InstanceEvent::PartitionCreated { .. } => "created",
            InstanceEvent::StageStarted { .. } => "stage_started",
            InstanceEvent::StageCompleted { .. } => "stage_completed",
            InstanceEvent::PartitionWaiting { .. } => "waiting",
            InstanceEvent::PartitionResumed { .. } => "resumed",
            InstanceEvent::PartitionCompleted { .. } => "completed",
            InstanceEvent::PartitionFailed { .. } => "failed",
        })
        .collect()
}
