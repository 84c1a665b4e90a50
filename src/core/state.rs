//! Execution state models

use crate::core::context::DataScope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one partition of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Stages are being evaluated
    Running,
    /// Suspended on a timer armed by the current stage
    Waiting,
    /// Every stage completed
    Completed,
    /// A stage failed or the run was cancelled
    Failed,
}

impl ExecutionStatus {
    /// Check if the status ends a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Read-only view of a partition's execution state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    /// Partition key (empty for single-partition instances)
    pub discriminator: String,

    pub status: ExecutionStatus,

    /// Index of the stage to evaluate next (or the waiting stage)
    pub stage_index: usize,

    /// Total number of stages in the definition
    pub total_stages: usize,

    /// Number of passes that reached `Completed`
    pub runs: u64,

    /// Accumulated values and stage outputs
    pub scope: DataScope,

    /// Number of timers currently armed across all stages
    pub armed_timers: usize,

    /// Message of the error that failed the partition
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PartitionSnapshot {
    /// Calculate progress through the stage chain (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.status == ExecutionStatus::Completed {
            return 1.0;
        }
        if self.total_stages == 0 {
            return 0.0;
        }
        self.stage_index as f64 / self.total_stages as f64
    }
}
