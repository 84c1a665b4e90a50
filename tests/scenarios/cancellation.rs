use crate::helpers::*;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use stream_pipeline::{
    Activity, ActivityContext, ActivityError, Definition, DefinitionConfig, ExecutionError,
    ExecutionStatus, Instance, StageConfig,
};
use tokio_util::sync::CancellationToken;

/// Cancels the run it belongs to, then completes
struct Trip {
    token: CancellationToken,
}

#[async_trait]
impl Activity for Trip {
    async fn eval(&self, _ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        self.token.cancel();
        Ok(true)
    }
}

fn two_stage_instance(activities: &mut TestActivities, token: CancellationToken) -> Instance {
    activities.registry.register_shared("test/trip", Arc::new(Trip { token }));
    let config = DefinitionConfig::new("cancellable")
        .with_stage(StageConfig::new("test/trip").named("trip"))
        .with_stage(StageConfig::new(RECORD_REF).named("after"));
    let definition = Definition::compile(&config, &activities.registry).unwrap();
    Instance::new(Arc::new(definition), false, None)
}

#[tokio::test]
async fn test_cancellation_stops_before_next_stage() {
    let token = CancellationToken::new();
    let mut activities = test_activities();
    let instance = two_stage_instance(&mut activities, token.clone());
    let events = record_events(&instance);

    let err = instance
        .run_with_cancel("job", map(json!({})), token)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ExecutionError::Cancelled { ref discriminator, stage_index: 1 } if discriminator == "job"
    ));
    assert!(activities.recorder.calls().is_empty());
    assert_eq!(instance.partition("job").await.unwrap().status, ExecutionStatus::Failed);
    assert_eq!(
        event_names(&events),
        vec!["created", "stage_started", "stage_completed", "failed"]
    );
}

#[tokio::test]
async fn test_already_cancelled_run_evaluates_nothing() {
    let mut activities = test_activities();
    let instance = two_stage_instance(&mut activities, CancellationToken::new());

    let token = CancellationToken::new();
    token.cancel();
    let err = instance
        .run_with_cancel("job", map(json!({})), token)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::Cancelled { stage_index: 0, .. }));
    assert!(activities.recorder.calls().is_empty());
}

#[tokio::test]
async fn test_untouched_token_lets_run_complete() {
    let mut activities = test_activities();
    let instance = two_stage_instance(&mut activities, CancellationToken::new());

    let outcome = instance
        .run_with_cancel("job", map(json!({})), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(activities.recorder.stages_for("job"), vec!["after".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_waiting_partition_disarms_timer() {
    use std::time::Duration;
    use stream_pipeline::action::BoundedChannel;
    use stream_pipeline::OutputChannel;

    let yaml = r##"
name: held
metadata:
  input:
    - name: reading
  output:
    - name: reading
stages:
  - name: hold
    ref: "#delay"
    settings:
      interval_ms: 100
    input:
      reading: "${{ pipeline.reading }}"
"##;
    let activities = test_activities();
    let (channel, mut rx) = BoundedChannel::new("out", 4);
    let channel: Arc<dyn OutputChannel> = Arc::new(channel);
    let instance = Instance::new(compile_yaml(yaml, &activities.registry), false, Some(channel));
    let events = record_events(&instance);

    let outcome = instance.run("a", map(json!({"reading": 1}))).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Waiting);
    assert_eq!(instance.partition("a").await.unwrap().armed_timers, 1);

    let token = CancellationToken::new();
    token.cancel();
    let err = instance
        .run_with_cancel("a", map(json!({"reading": 2})), token)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Cancelled { stage_index: 0, .. }));

    let snapshot = instance.partition("a").await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.armed_timers, 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert!(!event_names(&events).contains(&"resumed"));
    assert_eq!(instance.partition("a").await.unwrap().status, ExecutionStatus::Failed);
}
