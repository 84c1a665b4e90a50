//! Built-in activities
//!
//! | Reference    | Behaviour                                              |
//! |--------------|--------------------------------------------------------|
//! | `#log`       | logs its `message` input through `tracing`             |
//! | `#delay`     | suspends the stage for `interval_ms`                   |
//! | `#counter`   | keeps a per-partition running count                    |
//! | `#aggregate` | aggregates `value` inputs, optionally over a time window |

pub mod aggregate;
pub mod counter;
pub mod delay;
pub mod log;

pub use aggregate::{AggregateActivity, AggregateFunction};
pub use counter::CounterActivity;
pub use delay::DelayActivity;
pub use log::LogActivity;

use crate::core::activity::{Activity, ActivityError, ActivityRegistry, ActivitySettings};
use std::sync::Arc;
use std::time::Duration;

pub const LOG_REF: &str = "#log";
pub const DELAY_REF: &str = "#delay";
pub const COUNTER_REF: &str = "#counter";
pub const AGGREGATE_REF: &str = "#aggregate";

/// Register every built-in activity
pub fn register_builtins(registry: &mut ActivityRegistry) {
    registry.register_shared(LOG_REF, Arc::new(LogActivity));
    registry.register(DELAY_REF, |settings: &ActivitySettings| {
        Ok(Arc::new(DelayActivity::from_settings(settings)?) as Arc<dyn Activity>)
    });
    registry.register(COUNTER_REF, |settings: &ActivitySettings| {
        Ok(Arc::new(CounterActivity::from_settings(settings)?) as Arc<dyn Activity>)
    });
    registry.register(AGGREGATE_REF, |settings: &ActivitySettings| {
        Ok(Arc::new(AggregateActivity::from_settings(settings)?) as Arc<dyn Activity>)
    });
}

/// Read a positive millisecond duration setting
fn duration_setting(settings: &ActivitySettings, name: &str) -> Result<Option<Duration>, ActivityError> {
    let Some(value) = settings.get(name) else {
        return Ok(None);
    };
    match value.as_u64() {
        Some(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms))),
        _ => Err(ActivityError::InvalidSetting {
            name: name.to_string(),
            reason: format!("expected a positive number of milliseconds, got {}", value),
        }),
    }
}
