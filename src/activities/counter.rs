//! Counter activity

use crate::core::activity::{Activity, ActivityError, ActivitySettings};
use crate::core::context::ActivityContext;
use async_trait::async_trait;
use serde_json::Value;

const COUNT_KEY: &str = "count";

/// Keeps a running count per partition
///
/// Each evaluation adds the `increment` input (default: the `step` setting,
/// itself defaulting to 1) to the partition's count. A truthy `reset` input
/// restarts the count first. Outputs `count`.
#[derive(Debug, Clone)]
pub struct CounterActivity {
    step: i64,
}

impl CounterActivity {
    pub fn new(step: i64) -> Self {
        Self { step }
    }

    pub fn from_settings(settings: &ActivitySettings) -> Result<Self, ActivityError> {
        let step = match settings.get("step") {
            None => 1,
            Some(value) => value.as_i64().ok_or_else(|| ActivityError::InvalidSetting {
                name: "step".to_string(),
                reason: format!("expected an integer, got {}", value),
            })?,
        };
        Ok(Self::new(step))
    }
}

#[async_trait]
impl Activity for CounterActivity {
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        let increment = match ctx.input("increment") {
            None | Some(Value::Null) => self.step,
            Some(value) => value
                .as_i64()
                .ok_or_else(|| ActivityError::Eval(format!("increment must be an integer, got {}", value)))?,
        };
        let reset = ctx.input("reset").and_then(Value::as_bool).unwrap_or(false);

        let current = if reset {
            0
        } else {
            ctx.state().get(COUNT_KEY).and_then(Value::as_i64).unwrap_or(0)
        };
        let count = current + increment;

        ctx.state_mut().insert(COUNT_KEY.to_string(), Value::from(count));
        ctx.set_output(COUNT_KEY, Value::from(count));
        Ok(true)
    }
}
