//! Pipeline execution: instances, partitions and timers

pub mod instance;
mod partition;
pub mod timer;

pub use instance::{EventHandler, ExecutionError, Instance, InstanceEvent, RunOutcome};
pub use timer::{timer_callback, TimerCallback, TimerError, TimerKind, TimerSupport};
