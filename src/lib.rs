//! stream-pipeline - partitioned, timer-aware pipelines over streams of events

pub mod action;
pub mod activities;
pub mod cli;
pub mod core;
pub mod execution;
pub mod registry;

// Re-export commonly used types
pub use action::{ActionError, ActionFactory, ActionSettings, ChannelRegistry, OutputChannel, PipelineAction};
pub use core::{Activity, ActivityContext, ActivityError, ActivityRegistry, CompilationError, Definition, DefinitionConfig};
pub use core::{ExecutionStatus, PartitionSnapshot, StageConfig};
pub use execution::{ExecutionError, Instance, InstanceEvent, RunOutcome, TimerError, TimerSupport};
pub use registry::{Manager, ResolutionError, ResourceStore};
