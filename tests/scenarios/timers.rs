use crate::helpers::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stream_pipeline::action::BoundedChannel;
use stream_pipeline::{ExecutionError, ExecutionStatus, Instance, OutputChannel};
use tokio::sync::mpsc::Receiver;
use tokio::time::sleep;

fn timer_pipeline(settings: &str) -> String {
    format!(
        r#"
name: timed
metadata:
  output:
    - name: firings
    - name: evaluations
stages:
  - name: wait
    ref: test/timer
    settings: {settings}
    output:
      firings: "${{{{ activity.firings }}}}"
      evaluations: "${{{{ activity.evaluations }}}}"
"#
    )
}

fn instance_with_channel(yaml: &str) -> (Instance, Receiver<serde_json::Value>, TestActivities) {
    let activities = test_activities();
    let (channel, rx) = BoundedChannel::new("out", 8);
    let channel: Arc<dyn OutputChannel> = Arc::new(channel);
    let instance = Instance::new(compile_yaml(yaml, &activities.registry), false, Some(channel));
    (instance, rx, activities)
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_timer_resumes_after_declining_once() {
    let yaml = timer_pipeline(r#"{"interval_ms": 100, "script": [false, true]}"#);
    let (instance, mut rx, _activities) = instance_with_channel(&yaml);
    let events = record_events(&instance);

    let outcome = instance.run("door", map(json!({}))).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Waiting);
    assert!(outcome.outputs.is_empty());

    sleep(Duration::from_millis(150)).await;
    let snapshot = instance.partition("door").await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Waiting);
    assert_eq!(snapshot.armed_timers, 1);
    assert!(rx.try_recv().is_err());

    sleep(Duration::from_millis(100)).await;
    let snapshot = instance.partition("door").await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.armed_timers, 0);
    assert_eq!(rx.try_recv().unwrap(), json!({"firings": 2, "evaluations": 2}));

    assert_eq!(
        event_names(&events),
        vec![
            "created",
            "stage_started",
            "waiting",
            "resumed",
            "stage_started",
            "stage_completed",
            "completed",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeating_timer_ticks_until_resume() {
    let yaml = timer_pipeline(r#"{"interval_ms": 50, "repeating": true, "script": [false, false, true]}"#);
    let (instance, mut rx, _activities) = instance_with_channel(&yaml);

    let outcome = instance.run("pump", map(json!({}))).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Waiting);

    sleep(Duration::from_millis(120)).await;
    assert!(rx.try_recv().is_err());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(rx.try_recv().unwrap(), json!({"firings": 3, "evaluations": 2}));
    let snapshot = instance.partition("pump").await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.armed_timers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_input_while_waiting_does_not_rearm() {
    let yaml = timer_pipeline(r#"{"interval_ms": 100}"#);
    let (instance, mut rx, _activities) = instance_with_channel(&yaml);

    instance.run("door", map(json!({}))).await.unwrap();
    sleep(Duration::from_millis(60)).await;
    let again = instance.run("door", map(json!({}))).await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Waiting);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(rx.try_recv().unwrap(), json!({"firings": 1, "evaluations": 3}));
}

#[tokio::test(start_paused = true)]
async fn test_delay_passes_inputs_through_after_interval() {
    let yaml = r##"
name: debounce
metadata:
  input:
    - name: reading
  output:
    - name: settled
stages:
  - name: hold
    ref: "#delay"
    settings:
      interval_ms: 200
    input:
      reading: "${{ pipeline.reading }}"
    output:
      settled: "${{ activity.reading }}"
"##;
    let (instance, mut rx, _activities) = instance_with_channel(yaml);

    let outcome = instance.run("t1", map(json!({"reading": 4}))).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Waiting);

    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    sleep(Duration::from_millis(150)).await;
    assert_eq!(rx.try_recv().unwrap(), json!({"settled": 4}));
}

#[tokio::test(start_paused = true)]
async fn test_delay_restart_extends_the_countdown() {
    let yaml = r##"
name: restartable
metadata:
  input:
    - name: reading
  output:
    - name: settled
stages:
  - name: hold
    ref: "#delay"
    settings:
      interval_ms: 100
      restart: true
    input:
      reading: "${{ pipeline.reading }}"
    output:
      settled: "${{ activity.reading }}"
"##;
    let (instance, mut rx, _activities) = instance_with_channel(yaml);

    instance.run("t1", map(json!({"reading": 1}))).await.unwrap();
    sleep(Duration::from_millis(70)).await;
    instance.run("t1", map(json!({"reading": 2}))).await.unwrap();

    sleep(Duration::from_millis(70)).await;
    assert!(rx.try_recv().is_err());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(rx.try_recv().unwrap(), json!({"settled": 2}));
}

#[tokio::test(start_paused = true)]
async fn test_windowed_aggregate_per_partition() {
    let yaml = r##"
name: window
metadata:
  input:
    - name: sensor
    - name: value
      type: number
  output:
    - name: sensor
    - name: total
    - name: samples
stages:
  - name: sum
    ref: "#aggregate"
    settings:
      function: sum
      window_ms: 1000
    input:
      value: "${{ pipeline.value }}"
    output:
      total: "${{ activity.result }}"
      samples: "${{ activity.count }}"
"##;
    let (instance, mut rx, _activities) = instance_with_channel(yaml);

    for (sensor, value) in [("a", 1.0), ("b", 10.0), ("a", 2.5), ("a", 0.5)] {
        let outcome = instance
            .run(sensor, map(json!({"sensor": sensor, "value": value})))
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Waiting);
    }

    sleep(Duration::from_millis(1100)).await;

    let mut results = Vec::new();
    while let Ok(value) = rx.try_recv() {
        results.push(value);
    }
    results.sort_by_key(|v| v["sensor"].as_str().unwrap_or_default().to_string());
    assert_eq!(
        results,
        vec![
            json!({"sensor": "a", "total": 4.0, "samples": 3}),
            json!({"sensor": "b", "total": 10.0, "samples": 1}),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_timer_of_same_kind_conflicts() {
    use async_trait::async_trait;
    use stream_pipeline::execution::{timer_callback, TimerError};
    use stream_pipeline::{Activity, ActivityContext, ActivityError, Definition, DefinitionConfig, StageConfig};

    struct DoubleArm;

    #[async_trait]
    impl Activity for DoubleArm {
        async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
            let timers = ctx.timer_support().expect("timer support");
            timers.create_timer(Duration::from_millis(10), timer_callback(|_| true), false)?;
            timers.create_timer(Duration::from_millis(10), timer_callback(|_| true), false)?;
            Ok(false)
        }
    }

    let mut activities = test_activities();
    activities.registry.register_shared("test/double", Arc::new(DoubleArm));
    let config = DefinitionConfig::new("conflict").with_stage(StageConfig::new("test/double").named("arm"));
    let definition = Definition::compile(&config, &activities.registry).unwrap();
    let instance = Instance::new(Arc::new(definition), true, None);

    let err = instance.run("", map(json!({}))).await.unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::Activity {
            source: ActivityError::Timer(TimerError::Conflict { .. }),
            ..
        }
    ));

    let snapshot = instance.partition("").await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.armed_timers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_removed_partition_ignores_its_timer() {
    let yaml = timer_pipeline(r#"{"interval_ms": 100}"#);
    let (instance, mut rx, _activities) = instance_with_channel(&yaml);

    instance.run("gone", map(json!({}))).await.unwrap();
    assert!(instance.remove_partition("gone").await);

    sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert!(instance.partition("gone").await.is_none());
}

/// Arms a one-shot timer that marks the stage elapsed, optionally holding
/// the evaluation for `hold_ms` after arming
struct HeldDelay;

#[async_trait::async_trait]
impl stream_pipeline::Activity for HeldDelay {
    async fn eval(
        &self,
        ctx: &mut stream_pipeline::ActivityContext,
    ) -> Result<bool, stream_pipeline::ActivityError> {
        use serde_json::Value;
        use stream_pipeline::execution::timer_callback;

        let evaluations = ctx
            .state()
            .get("evaluations")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        ctx.state_mut()
            .insert("evaluations".to_string(), Value::from(evaluations));

        if ctx.state_mut().remove("elapsed").is_some() {
            ctx.state_mut().remove("evaluations");
            ctx.set_output("evaluations", Value::from(evaluations));
            return Ok(true);
        }

        let hold = ctx.input("hold_ms").and_then(Value::as_u64);
        {
            let timers = ctx.timer_support().ok_or_else(|| {
                stream_pipeline::ActivityError::Eval("timer support required".to_string())
            })?;
            if !timers.has_timer(false) {
                timers.create_timer(
                    Duration::from_millis(100),
                    timer_callback(|ctx| {
                        ctx.state_mut()
                            .insert("elapsed".to_string(), Value::Bool(true));
                        true
                    }),
                    false,
                )?;
            }
        }
        if let Some(ms) = hold {
            sleep(Duration::from_millis(ms)).await;
        }
        Ok(false)
    }
}

#[tokio::test(start_paused = true)]
async fn test_timer_firing_waits_for_running_evaluation() {
    use stream_pipeline::core::{Attribute, AttributeType, IoMetadata};
    use stream_pipeline::{Definition, DefinitionConfig, StageConfig};

    let mut activities = test_activities();
    activities.registry.register_shared("test/held", Arc::new(HeldDelay));
    let config = DefinitionConfig::new("held")
        .with_metadata(IoMetadata {
            input: vec![],
            output: vec![Attribute::new("evaluations", AttributeType::Any)],
        })
        .with_stage(
            StageConfig::new("test/held")
                .named("hold")
                .input("hold_ms", "${{ pipeline.hold_ms }}")
                .output("evaluations", "${{ activity.evaluations }}"),
        );
    let definition = Definition::compile(&config, &activities.registry).unwrap();
    let (channel, mut rx) = BoundedChannel::new("out", 4);
    let channel: Arc<dyn OutputChannel> = Arc::new(channel);
    let instance = Instance::new(Arc::new(definition), false, Some(channel));
    let events = record_events(&instance);

    let first = instance.run("k", map(json!({}))).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Waiting);

    sleep(Duration::from_millis(50)).await;
    let busy = {
        let instance = instance.clone();
        tokio::spawn(async move { instance.run("k", map(json!({"hold_ms": 200}))).await })
    };

    // The timer is due at 100ms while the second run holds the partition
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    let second = busy.await.unwrap().unwrap();
    assert_eq!(second.status, ExecutionStatus::Waiting);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(rx.try_recv().unwrap(), json!({"evaluations": 3}));
    assert!(rx.try_recv().is_err());
    assert_eq!(
        event_names(&events),
        vec![
            "created",
            "stage_started",
            "waiting",
            "stage_started",
            "waiting",
            "resumed",
            "stage_started",
            "stage_completed",
            "completed",
        ]
    );
    let snapshot = instance.partition("k").await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.armed_timers, 0);
}
