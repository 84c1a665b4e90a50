//! Per-discriminator execution state

use crate::core::context::DataScope;
use crate::core::definition::Definition;
use crate::core::state::{ExecutionStatus, PartitionSnapshot};
use crate::execution::instance::ExecutionError;
use crate::execution::timer::{TimerCallback, TimerKind, TimerSlots, TimerTarget};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Weak;

/// Execution state of one partition of an instance
///
/// Always accessed through the partition's mutex, so a partition is never
/// driven by two runs (or a run and a timer firing) at the same time.
pub(crate) struct Partition {
    pub discriminator: String,
    pub status: ExecutionStatus,
    pub stage_index: usize,
    pub scope: DataScope,
    /// Inputs the waiting stage was last evaluated with
    pub pending_inputs: Option<Map<String, Value>>,
    pub runs: u64,
    pub last_error: Option<String>,
    activity_state: HashMap<usize, Map<String, Value>>,
    timers: HashMap<usize, TimerSlots>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Partition {
    pub fn new(discriminator: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            discriminator: discriminator.into(),
            status: ExecutionStatus::Running,
            stage_index: 0,
            scope: DataScope::default(),
            pending_inputs: None,
            runs: 0,
            last_error: None,
            activity_state: HashMap::new(),
            timers: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Take in the inputs of a new run
    ///
    /// A completed partition starts a new pass at the first stage with a
    /// scope seeded from the new inputs only; activity state carries over.
    /// A waiting partition re-enters its waiting stage with the inputs
    /// merged into its scope. A failed partition rejects the run.
    pub fn accept(
        &mut self,
        inputs: Map<String, Value>,
        definition: &Definition,
    ) -> Result<(), ExecutionError> {
        match self.status {
            ExecutionStatus::Failed => {
                return Err(ExecutionError::PartitionFailed {
                    discriminator: self.discriminator.clone(),
                    reason: self.last_error.clone().unwrap_or_default(),
                })
            }
            ExecutionStatus::Completed => {
                self.stage_index = 0;
                self.scope = DataScope::from_inputs(inputs);
            }
            ExecutionStatus::Waiting | ExecutionStatus::Running => self.scope.merge_values(inputs),
        }

        for (name, value) in definition.input_defaults() {
            if !self.scope.values.contains_key(name) {
                self.scope.values.insert(name.to_string(), value.clone());
            }
        }
        self.status = ExecutionStatus::Running;
        self.touch();
        Ok(())
    }

    /// Clear everything and cancel all timers, keeping the partition entry
    pub fn reset(&mut self) {
        self.cancel_all_timers();
        self.status = ExecutionStatus::Running;
        self.stage_index = 0;
        self.scope = DataScope::default();
        self.pending_inputs = None;
        self.last_error = None;
        self.activity_state.clear();
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn take_state(&mut self, stage: usize) -> Map<String, Value> {
        self.activity_state.remove(&stage).unwrap_or_default()
    }

    /// Timer slots of a stage, created on first use
    pub fn take_timers(
        &mut self,
        stage: usize,
        stage_name: &str,
        target: Weak<dyn TimerTarget>,
    ) -> TimerSlots {
        self.timers
            .remove(&stage)
            .unwrap_or_else(|| TimerSlots::new(target, self.discriminator.clone(), stage, stage_name))
    }

    /// Put back what an activity context borrowed
    pub fn restore(&mut self, stage: usize, state: Map<String, Value>, timers: Option<TimerSlots>) {
        if !state.is_empty() {
            self.activity_state.insert(stage, state);
        }
        if let Some(timers) = timers {
            self.timers.insert(stage, timers);
        }
    }

    pub fn has_armed_timer(&self, stage: usize) -> bool {
        self.timers.get(&stage).is_some_and(TimerSlots::any_armed)
    }

    /// Callback of a stage's timer if the firing generation is current
    pub fn timer_callback(&self, stage: usize, kind: TimerKind, generation: u64) -> Option<TimerCallback> {
        self.timers
            .get(&stage)
            .and_then(|slots| slots.current_callback(kind, generation))
    }

    pub fn disarm_timer(&mut self, stage: usize, kind: TimerKind) {
        if let Some(slots) = self.timers.get_mut(&stage) {
            slots.disarm(kind);
        }
    }

    pub fn cancel_timers(&mut self, stage: usize) {
        if let Some(slots) = self.timers.get_mut(&stage) {
            slots.cancel_all();
        }
    }

    pub fn cancel_all_timers(&mut self) {
        for slots in self.timers.values_mut() {
            slots.cancel_all();
        }
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.values().map(TimerSlots::armed_count).sum()
    }

    pub fn snapshot(&self, total_stages: usize) -> PartitionSnapshot {
        PartitionSnapshot {
            discriminator: self.discriminator.clone(),
            status: self.status,
            stage_index: self.stage_index,
            total_stages,
            runs: self.runs,
            scope: self.scope.clone(),
            armed_timers: self.armed_timers(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
