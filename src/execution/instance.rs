//! Instance - runs a definition against discriminator-partitioned state
//!
//! Each distinct discriminator owns a [`Partition`] behind its own async
//! mutex. Runs for the same discriminator are serialized, runs for different
//! discriminators proceed independently. A stage that arms a timer and
//! reports not-done suspends its partition; the timer's task later resumes
//! it and reports the outcome through instance events and the output channel.

use crate::action::channel::OutputChannel;
use crate::core::activity::ActivityError;
use crate::core::context::ActivityContext;
use crate::core::definition::Definition;
use crate::core::mapping::MappingScope;
use crate::core::state::{ExecutionStatus, PartitionSnapshot};
use crate::execution::partition::Partition;
use crate::execution::timer::{TimerKey, TimerKind, TimerTarget};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Partition key used by single-partition instances
const SINGLE_PARTITION_KEY: &str = "";

/// Error raised while running a pipeline
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Stage '{stage}' failed: {source}")]
    Activity {
        stage: String,
        #[source]
        source: ActivityError,
    },

    #[error("Stage '{stage}' did not complete and armed no timer")]
    Stalled { stage: String },

    #[error("Partition '{discriminator}' has failed: {reason}")]
    PartitionFailed {
        discriminator: String,
        reason: String,
    },

    #[error("Run of partition '{discriminator}' was cancelled before stage {stage_index}")]
    Cancelled {
        discriminator: String,
        stage_index: usize,
    },
}

/// Result of a run that did not fail
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// `Completed` or `Waiting`
    pub status: ExecutionStatus,

    /// Pipeline outputs (empty unless completed)
    pub outputs: Map<String, Value>,
}

impl RunOutcome {
    fn waiting() -> Self {
        Self {
            status: ExecutionStatus::Waiting,
            outputs: Map::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Events that occur while an instance runs its partitions
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    PartitionCreated {
        discriminator: String,
    },
    StageStarted {
        discriminator: String,
        stage: String,
        index: usize,
    },
    StageCompleted {
        discriminator: String,
        stage: String,
    },
    PartitionWaiting {
        discriminator: String,
        stage: String,
    },
    PartitionResumed {
        discriminator: String,
        stage: String,
    },
    PartitionCompleted {
        discriminator: String,
        outputs: Map<String, Value>,
    },
    PartitionFailed {
        discriminator: String,
        error: String,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(InstanceEvent) + Send + Sync>;

/// A stateful execution unit bound to one definition
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    id: Uuid,
    definition: Arc<Definition>,
    single_partition: bool,
    partitions: RwLock<HashMap<String, Arc<Mutex<Partition>>>>,
    output_channel: Option<Arc<dyn OutputChannel>>,
    event_handlers: RwLock<Vec<EventHandler>>,
    self_ref: Weak<InstanceInner>,
}

impl Instance {
    /// Create an instance
    ///
    /// A single-partition instance maps every discriminator to one shared
    /// partition. Completed runs publish their outputs to `output_channel`.
    pub fn new(
        definition: Arc<Definition>,
        single_partition: bool,
        output_channel: Option<Arc<dyn OutputChannel>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|self_ref| InstanceInner {
            id: Uuid::new_v4(),
            definition,
            single_partition,
            partitions: RwLock::new(HashMap::new()),
            output_channel,
            event_handlers: RwLock::new(Vec::new()),
            self_ref: self_ref.clone(),
        });
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.inner.definition
    }

    pub fn is_single_partition(&self) -> bool {
        self.inner.single_partition
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(InstanceEvent) + Send + Sync + 'static,
    {
        self.inner
            .event_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Run the pipeline for one unit of work
    ///
    /// Returns when the partition completes, fails or starts waiting on a
    /// timer. A failure leaves the partition `Failed`.
    pub async fn run(
        &self,
        discriminator: &str,
        inputs: Map<String, Value>,
    ) -> Result<RunOutcome, ExecutionError> {
        self.inner.run(discriminator, inputs, None).await
    }

    /// Like [`Instance::run`], checking `cancel` before each stage
    pub async fn run_with_cancel(
        &self,
        discriminator: &str,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecutionError> {
        self.inner.run(discriminator, inputs, Some(&cancel)).await
    }

    /// Run on a tokio task, handing the result to `handler` exactly once
    pub fn spawn_run<F>(
        &self,
        discriminator: impl Into<String>,
        inputs: Map<String, Value>,
        handler: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<RunOutcome, ExecutionError>) + Send + 'static,
    {
        let instance = self.clone();
        let discriminator = discriminator.into();
        tokio::spawn(async move {
            let result = instance.run(&discriminator, inputs).await;
            handler(result);
        })
    }

    /// Snapshot of a partition's state
    pub async fn partition(&self, discriminator: &str) -> Option<PartitionSnapshot> {
        let partition = self.inner.lookup(&self.inner.partition_key(discriminator))?;
        let guard = partition.lock().await;
        Some(guard.snapshot(self.inner.definition.stages().len()))
    }

    /// Keys of all live partitions, sorted
    pub fn partition_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Clear a partition's state and cancel its timers. Returns `false` if
    /// the partition does not exist.
    pub async fn reset_partition(&self, discriminator: &str) -> bool {
        let key = self.inner.partition_key(discriminator);
        let Some(partition) = self.inner.lookup(&key) else {
            return false;
        };
        partition.lock().await.reset();
        info!("Reset partition '{}' of pipeline '{}'", key, self.inner.definition.name());
        true
    }

    /// Drop a partition and cancel its timers. Returns `false` if the
    /// partition does not exist.
    pub async fn remove_partition(&self, discriminator: &str) -> bool {
        let key = self.inner.partition_key(discriminator);
        let removed = self
            .inner
            .partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        match removed {
            Some(partition) => {
                partition.lock().await.cancel_all_timers();
                debug!("Removed partition '{}'", key);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.inner.id)
            .field("pipeline", &self.inner.definition.name())
            .field("single_partition", &self.inner.single_partition)
            .finish()
    }
}

impl InstanceInner {
    fn partition_key(&self, discriminator: &str) -> String {
        if self.single_partition {
            SINGLE_PARTITION_KEY.to_string()
        } else {
            discriminator.to_string()
        }
    }

    fn lookup(&self, key: &str) -> Option<Arc<Mutex<Partition>>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn partition_entry(&self, key: &str) -> Arc<Mutex<Partition>> {
        if let Some(partition) = self.lookup(key) {
            return partition;
        }

        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        let mut created = false;
        let partition = partitions
            .entry(key.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Partition::new(key)))
            })
            .clone();
        drop(partitions);

        if created {
            debug!("Created partition '{}' for pipeline '{}'", key, self.definition.name());
            self.emit_event(InstanceEvent::PartitionCreated {
                discriminator: key.to_string(),
            });
        }
        partition
    }

    fn emit_event(&self, event: InstanceEvent) {
        let handlers: Vec<EventHandler> = self
            .event_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    fn timer_target(&self) -> Weak<dyn TimerTarget> {
        self.self_ref.clone()
    }

    async fn run(
        &self,
        discriminator: &str,
        inputs: Map<String, Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RunOutcome, ExecutionError> {
        let key = self.partition_key(discriminator);
        let partition = self.partition_entry(&key);
        let mut guard = partition.lock().await;

        guard.accept(inputs, &self.definition)?;
        info!(
            "Running pipeline '{}' for partition '{}' from stage {}",
            self.definition.name(),
            key,
            guard.stage_index
        );

        let result = self.drive(&mut guard, cancel).await;
        self.report(&key, &result);
        result
    }

    /// Evaluate stages from the partition's current index
    async fn drive(
        &self,
        partition: &mut Partition,
        cancel: Option<&CancellationToken>,
    ) -> Result<RunOutcome, ExecutionError> {
        let stages = self.definition.stages();

        while let Some(stage) = stages.get(partition.stage_index) {
            let index = partition.stage_index;

            if cancel.is_some_and(CancellationToken::is_cancelled) {
                warn!(
                    "Run of partition '{}' cancelled before stage '{}'",
                    partition.discriminator,
                    stage.name()
                );
                let err = ExecutionError::Cancelled {
                    discriminator: partition.discriminator.clone(),
                    stage_index: index,
                };
                return Err(self.fail(partition, err));
            }

            self.emit_event(InstanceEvent::StageStarted {
                discriminator: partition.discriminator.clone(),
                stage: stage.name().to_string(),
                index,
            });
            debug!("Evaluating stage {} '{}'", index, stage.name());

            let inputs = stage.input().apply(&MappingScope::new(&partition.scope));
            let mut ctx = ActivityContext::new(
                stage.name(),
                partition.discriminator.clone(),
                inputs,
                partition.take_state(index),
                partition.take_timers(index, stage.name(), self.timer_target()),
            );
            let result = stage.activity().eval(&mut ctx).await;
            let parts = ctx.into_parts();
            partition.restore(index, parts.state, parts.timers);

            match result {
                Err(source) => {
                    let err = ExecutionError::Activity {
                        stage: stage.name().to_string(),
                        source,
                    };
                    return Err(self.fail(partition, err));
                }
                Ok(false) if partition.has_armed_timer(index) => {
                    partition.status = ExecutionStatus::Waiting;
                    partition.pending_inputs = Some(parts.inputs);
                    partition.touch();
                    info!(
                        "Partition '{}' waiting on a timer at stage '{}'",
                        partition.discriminator,
                        stage.name()
                    );
                    self.emit_event(InstanceEvent::PartitionWaiting {
                        discriminator: partition.discriminator.clone(),
                        stage: stage.name().to_string(),
                    });
                    return Ok(RunOutcome::waiting());
                }
                Ok(false) => {
                    let err = ExecutionError::Stalled {
                        stage: stage.name().to_string(),
                    };
                    return Err(self.fail(partition, err));
                }
                Ok(true) => {
                    partition.cancel_timers(index);
                    partition.pending_inputs = None;
                    partition
                        .scope
                        .set_stage_output(stage.name(), parts.outputs.clone());
                    let mapped = stage
                        .output()
                        .apply(&MappingScope::new(&partition.scope).with_activity(&parts.outputs));
                    partition.scope.merge_values(mapped);
                    partition.stage_index += 1;
                    partition.touch();
                    self.emit_event(InstanceEvent::StageCompleted {
                        discriminator: partition.discriminator.clone(),
                        stage: stage.name().to_string(),
                    });
                }
            }
        }

        partition.status = ExecutionStatus::Completed;
        partition.runs += 1;
        partition.touch();
        Ok(RunOutcome {
            status: ExecutionStatus::Completed,
            outputs: self.definition.extract_outputs(&partition.scope),
        })
    }

    fn fail(&self, partition: &mut Partition, err: ExecutionError) -> ExecutionError {
        error!(
            "Pipeline '{}' failed in partition '{}': {}",
            self.definition.name(),
            partition.discriminator,
            err
        );
        partition.cancel_all_timers();
        partition.status = ExecutionStatus::Failed;
        partition.pending_inputs = None;
        partition.last_error = Some(err.to_string());
        partition.touch();
        err
    }

    /// Emit the terminal event of a drive and publish completed outputs
    fn report(&self, key: &str, result: &Result<RunOutcome, ExecutionError>) {
        match result {
            Ok(outcome) if outcome.is_completed() => {
                info!(
                    "Pipeline '{}' completed for partition '{}'",
                    self.definition.name(),
                    key
                );
                self.emit_event(InstanceEvent::PartitionCompleted {
                    discriminator: key.to_string(),
                    outputs: outcome.outputs.clone(),
                });
                self.publish(&outcome.outputs);
            }
            Ok(_) => {}
            Err(err) => self.emit_event(InstanceEvent::PartitionFailed {
                discriminator: key.to_string(),
                error: err.to_string(),
            }),
        }
    }

    fn publish(&self, outputs: &Map<String, Value>) {
        let Some(channel) = &self.output_channel else {
            return;
        };
        if let Err(e) = channel.publish(Value::Object(outputs.clone())) {
            warn!(
                "Failed to publish outputs of pipeline '{}' to channel '{}': {}",
                self.definition.name(),
                channel.name(),
                e
            );
        }
    }
}

#[async_trait]
impl TimerTarget for InstanceInner {
    async fn timer_fired(&self, key: TimerKey, generation: u64) {
        let Some(partition) = self.lookup(&key.partition) else {
            debug!("Timer fired for removed partition '{}'", key.partition);
            return;
        };
        let mut guard = partition.lock().await;

        let Some(callback) = guard.timer_callback(key.stage, key.kind, generation) else {
            debug!("Dropping stale timer firing for partition '{}'", key.partition);
            return;
        };
        if guard.status != ExecutionStatus::Waiting || guard.stage_index != key.stage {
            debug!(
                "Dropping timer firing for partition '{}' not waiting at stage {}",
                key.partition, key.stage
            );
            return;
        }
        let Some(stage) = self.definition.stage(key.stage) else {
            return;
        };

        if key.kind == TimerKind::OneShot {
            guard.disarm_timer(key.stage, key.kind);
        }

        let inputs = guard.pending_inputs.clone().unwrap_or_default();
        let mut ctx = ActivityContext::new(
            stage.name(),
            guard.discriminator.clone(),
            inputs,
            guard.take_state(key.stage),
            guard.take_timers(key.stage, stage.name(), self.timer_target()),
        );
        let resume = callback(&mut ctx);
        let parts = ctx.into_parts();
        guard.restore(key.stage, parts.state, parts.timers);

        if !resume {
            debug!(
                "Timer of stage '{}' fired; partition '{}' keeps waiting",
                stage.name(),
                key.partition
            );
            return;
        }

        info!(
            "Resuming partition '{}' at stage '{}'",
            key.partition,
            stage.name()
        );
        guard.status = ExecutionStatus::Running;
        guard.touch();
        self.emit_event(InstanceEvent::PartitionResumed {
            discriminator: key.partition.clone(),
            stage: stage.name().to_string(),
        });

        let result = self.drive(&mut guard, None).await;
        self.report(&key.partition, &result);
    }
}
