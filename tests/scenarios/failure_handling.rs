use crate::helpers::*;
use serde_json::json;
use std::sync::Arc;
use stream_pipeline::{
    ActivityError, CompilationError, Definition, DefinitionConfig, ExecutionError, ExecutionStatus,
    Instance, StageConfig,
};

const GUARDED_PIPELINE: &str = r#"
name: guarded
metadata:
  input:
    - name: fail
      type: boolean
      value: false
  output:
    - name: fail
stages:
  - name: check
    ref: test/fail
    input:
      fail: "${{ pipeline.fail }}"
  - name: after
    ref: test/record
"#;

#[tokio::test]
async fn test_failure_marks_only_its_partition() {
    let activities = test_activities();
    let instance = Instance::new(compile_yaml(GUARDED_PIPELINE, &activities.registry), false, None);
    let events = record_events(&instance);

    let err = instance
        .run("bad", map(json!({"fail": true})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutionError::Activity { ref stage, source: ActivityError::Eval(_) } if stage == "check"
    ));

    let ok = instance.run("good", map(json!({}))).await.unwrap();
    assert!(ok.is_completed());

    let bad = instance.partition("bad").await.unwrap();
    assert_eq!(bad.status, ExecutionStatus::Failed);
    assert_eq!(bad.stage_index, 0);
    assert!(bad.last_error.unwrap().contains("forced failure"));
    assert_eq!(instance.partition("good").await.unwrap().status, ExecutionStatus::Completed);

    assert!(activities.recorder.stages_for("bad").is_empty());
    assert_eq!(activities.recorder.stages_for("good"), vec!["after".to_string()]);
    assert!(event_names(&events).contains(&"failed"));
}

#[tokio::test]
async fn test_failed_partition_rejects_runs_until_reset() {
    let activities = test_activities();
    let instance = Instance::new(compile_yaml(GUARDED_PIPELINE, &activities.registry), false, None);

    instance.run("k", map(json!({"fail": true}))).await.unwrap_err();
    let rejected = instance.run("k", map(json!({"fail": false}))).await.unwrap_err();
    assert!(matches!(rejected, ExecutionError::PartitionFailed { ref discriminator, .. } if discriminator == "k"));

    assert!(instance.reset_partition("k").await);
    let outcome = instance.run("k", map(json!({}))).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.outputs["fail"], json!(false));

    assert!(!instance.reset_partition("missing").await);
}

#[tokio::test]
async fn test_removed_partition_starts_fresh() {
    let activities = test_activities();
    let instance = Instance::new(compile_yaml(GUARDED_PIPELINE, &activities.registry), false, None);

    instance.run("k", map(json!({"fail": true}))).await.unwrap_err();
    assert!(instance.remove_partition("k").await);
    assert!(instance.partition_keys().is_empty());

    let outcome = instance.run("k", map(json!({}))).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(instance.partition("k").await.unwrap().runs, 1);
}

#[tokio::test]
async fn test_spawned_run_reports_failure_once() {
    let activities = test_activities();
    let instance = Instance::new(compile_yaml(GUARDED_PIPELINE, &activities.registry), false, None);
    let (tx, rx) = tokio::sync::oneshot::channel();

    instance
        .spawn_run("async", map(json!({"fail": true})), move |result| {
            let _ = tx.send(result);
        })
        .await
        .unwrap();

    let result = rx.await.unwrap();
    assert!(matches!(result, Err(ExecutionError::Activity { .. })));
}

#[tokio::test]
async fn test_stage_without_timer_that_never_completes_stalls() {
    use async_trait::async_trait;
    use stream_pipeline::{Activity, ActivityContext};

    struct Idle;

    #[async_trait]
    impl Activity for Idle {
        async fn eval(&self, _ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
            Ok(false)
        }
    }

    let mut activities = test_activities();
    activities.registry.register_shared("test/idle", Arc::new(Idle));
    let config = DefinitionConfig::new("stuck").with_stage(StageConfig::new("test/idle").named("idle"));
    let definition = Definition::compile(&config, &activities.registry).unwrap();
    let instance = Instance::new(Arc::new(definition), true, None);

    let err = instance.run("", map(json!({}))).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Stalled { ref stage } if stage == "idle"));
    assert_eq!(
        instance.partition("").await.unwrap().status,
        ExecutionStatus::Failed
    );
}

#[test]
fn test_unknown_activity_names_the_stage() {
    let activities = test_activities();
    let config = DefinitionConfig::new("broken")
        .with_stage(StageConfig::new(RECORD_REF))
        .with_stage(StageConfig::new("nowhere/to-be-found").named("lost"));

    let err = Definition::compile(&config, &activities.registry).unwrap_err();
    match err {
        CompilationError::UnknownActivity { index, stage, reference } => {
            assert_eq!(index, 1);
            assert_eq!(stage, "lost");
            assert_eq!(reference, "nowhere/to-be-found");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_invalid_activity_settings_fail_compilation() {
    let yaml = r##"
name: bad-delay
stages:
  - ref: "#delay"
    settings:
      interval_ms: 0
"##;
    let activities = test_activities();
    let config = DefinitionConfig::from_yaml(yaml).unwrap();
    let err = Definition::compile(&config, &activities.registry).unwrap_err();
    assert!(matches!(err, CompilationError::Activity { index: 0, .. }));
}

#[test]
fn test_binding_to_a_later_stage_is_rejected() {
    let yaml = r#"
name: forward
stages:
  - name: first
    ref: test/record
    input:
      peek: "${{ stage.second.value }}"
  - name: second
    ref: test/record
"#;
    let activities = test_activities();
    let config = DefinitionConfig::from_yaml(yaml).unwrap();
    let err = Definition::compile(&config, &activities.registry).unwrap_err();
    assert!(matches!(err, CompilationError::Binding { index: 0, .. }));
}

#[tokio::test]
async fn test_failed_partition_keeps_instance_usable_for_shared_definition() {
    let activities = test_activities();
    let definition = compile_yaml(GUARDED_PIPELINE, &activities.registry);
    let first = Instance::new(Arc::clone(&definition), true, None);
    let second = Instance::new(definition, true, None);

    first.run("", map(json!({"fail": true}))).await.unwrap_err();
    assert!(second.run("", map(json!({}))).await.unwrap().is_completed());
    assert_ne!(first.id(), second.id());
}
