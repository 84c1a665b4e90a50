//! Delay activity

use crate::activities::duration_setting;
use crate::core::activity::{Activity, ActivityError, ActivitySettings};
use crate::core::context::ActivityContext;
use crate::execution::timer::timer_callback;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const ELAPSED_KEY: &str = "elapsed";

/// Suspends its stage for a fixed interval, then passes its inputs through
///
/// The first evaluation arms a one-shot timer and reports not-done. The
/// timer marks the delay as elapsed and resumes the partition, and the
/// re-entered evaluation completes. Evaluations while the timer is pending
/// leave it untouched, unless the `restart` setting is set, in which case
/// each new input restarts the countdown.
#[derive(Debug, Clone)]
pub struct DelayActivity {
    interval: Duration,
    restart: bool,
}

impl DelayActivity {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            restart: false,
        }
    }

    pub fn from_settings(settings: &ActivitySettings) -> Result<Self, ActivityError> {
        let interval = duration_setting(settings, "interval_ms")?.ok_or_else(|| {
            ActivityError::InvalidSetting {
                name: "interval_ms".to_string(),
                reason: "required".to_string(),
            }
        })?;
        let restart = settings.get("restart").and_then(Value::as_bool).unwrap_or(false);
        Ok(Self { interval, restart })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl Activity for DelayActivity {
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        if ctx.state_mut().remove(ELAPSED_KEY).is_some() {
            let inputs = ctx.inputs().clone();
            for (name, value) in inputs {
                ctx.set_output(name, value);
            }
            return Ok(true);
        }

        let restart = self.restart;
        let interval = self.interval;
        let timers = ctx
            .timer_support()
            .ok_or_else(|| ActivityError::Eval("delay requires timer support".to_string()))?;

        if timers.has_timer(false) {
            if restart {
                timers.update_timer(false);
            }
        } else {
            timers.create_timer(
                interval,
                timer_callback(|ctx| {
                    ctx.state_mut().insert(ELAPSED_KEY.to_string(), Value::Bool(true));
                    true
                }),
                false,
            )?;
        }
        Ok(false)
    }
}
