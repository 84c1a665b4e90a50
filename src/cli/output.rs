//! CLI output formatting

use crate::core::ExecutionStatus;
use crate::execution::InstanceEvent;
use console::Emoji;
use serde_json::{Map, Value};

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Waiting => style("WAITING").blue().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
    }
}

fn partition_label(discriminator: &str) -> String {
    if discriminator.is_empty() {
        style("<all>").dim().to_string()
    } else {
        style(discriminator).cyan().to_string()
    }
}

/// Format an instance event for display
pub fn format_instance_event(event: &InstanceEvent) -> String {
    match event {
        InstanceEvent::PartitionCreated { discriminator } => {
            format!("{} New partition {}", ROCKET, partition_label(discriminator))
        }
        InstanceEvent::StageStarted {
            discriminator,
            stage,
            index,
        } => format!(
            "{} [{}] {} {}",
            SPINNER,
            partition_label(discriminator),
            style(format!("#{}", index)).dim(),
            style(stage).cyan()
        ),
        InstanceEvent::StageCompleted { discriminator, stage } => format!(
            "{} [{}] {}",
            CHECK,
            partition_label(discriminator),
            style(stage).green()
        ),
        InstanceEvent::PartitionWaiting { discriminator, stage } => format!(
            "{} [{}] waiting on timer in {}",
            SPINNER,
            partition_label(discriminator),
            style(stage).blue()
        ),
        InstanceEvent::PartitionResumed { discriminator, stage } => format!(
            "{} [{}] resumed at {}",
            INFO,
            partition_label(discriminator),
            style(stage).cyan()
        ),
        InstanceEvent::PartitionCompleted {
            discriminator,
            outputs,
        } => format!(
            "{} [{}] {} {}",
            CHECK,
            partition_label(discriminator),
            format_status(ExecutionStatus::Completed),
            format_outputs(outputs, 200)
        ),
        InstanceEvent::PartitionFailed {
            discriminator,
            error,
        } => format!(
            "{} [{}] {}: {}",
            CROSS,
            partition_label(discriminator),
            format_status(ExecutionStatus::Failed),
            style(error).dim()
        ),
    }
}

/// Format pipeline outputs as compact JSON, truncated to `max_chars`
pub fn format_outputs(outputs: &Map<String, Value>, max_chars: usize) -> String {
    let json = Value::Object(outputs.clone()).to_string();
    if json.chars().count() <= max_chars {
        return json;
    }
    let truncated: String = json.chars().take(max_chars).collect();
    format!("{}{}", truncated, style("... [truncated]").dim())
}
