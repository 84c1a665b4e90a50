//! Aggregate activity

use crate::activities::duration_setting;
use crate::core::activity::{Activity, ActivityError, ActivitySettings};
use crate::core::context::ActivityContext;
use crate::execution::timer::timer_callback;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

const VALUES_KEY: &str = "values";
const READY_KEY: &str = "ready";

/// Aggregation applied to the collected values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    #[serde(alias = "average")]
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateFunction {
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return match self {
                AggregateFunction::Count | AggregateFunction::Sum => Some(0.0),
                _ => None,
            };
        }
        let sum: f64 = values.iter().sum();
        Some(match self {
            AggregateFunction::Sum => sum,
            AggregateFunction::Avg => sum / values.len() as f64,
            AggregateFunction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregateFunction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregateFunction::Count => values.len() as f64,
        })
    }
}

/// Aggregates numeric `value` inputs per partition
///
/// Without a window every evaluation completes with the aggregate of all
/// values seen so far. With `window_ms` the first value of a window arms a
/// repeating timer and the stage waits; values arriving meanwhile join the
/// window. Each tick that finds values closes the window and resumes the
/// partition, which completes the stage with `result` and `count`.
#[derive(Debug, Clone)]
pub struct AggregateActivity {
    function: AggregateFunction,
    window: Option<Duration>,
}

impl AggregateActivity {
    pub fn new(function: AggregateFunction, window: Option<Duration>) -> Self {
        Self { function, window }
    }

    pub fn from_settings(settings: &ActivitySettings) -> Result<Self, ActivityError> {
        let function = match settings.get("function") {
            None => AggregateFunction::Sum,
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
                ActivityError::InvalidSetting {
                    name: "function".to_string(),
                    reason: format!("unknown aggregate function {}", value),
                }
            })?,
        };
        let window = duration_setting(settings, "window_ms")?;
        Ok(Self::new(function, window))
    }

    fn emit(&self, ctx: &mut ActivityContext, values: &[f64]) {
        let result = self
            .function
            .apply(values)
            .map(Value::from)
            .unwrap_or(Value::Null);
        ctx.set_output("result", result);
        ctx.set_output("count", Value::from(values.len()));
    }
}

fn collected(state: &Map<String, Value>) -> Vec<f64> {
    state
        .get(VALUES_KEY)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

fn push_value(state: &mut Map<String, Value>, value: f64) {
    let entry = state
        .entry(VALUES_KEY.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(items) = entry {
        items.push(Value::from(value));
    }
}

#[async_trait]
impl Activity for AggregateActivity {
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        if ctx.state_mut().remove(READY_KEY).is_some() {
            let values = collected(ctx.state());
            ctx.state_mut().remove(VALUES_KEY);
            self.emit(ctx, &values);
            return Ok(true);
        }

        let value = ctx
            .input("value")
            .ok_or_else(|| ActivityError::MissingInput("value".to_string()))?;
        let value = value
            .as_f64()
            .ok_or_else(|| ActivityError::Eval(format!("value must be numeric, got {}", value)))?;
        push_value(ctx.state_mut(), value);

        let Some(window) = self.window else {
            let values = collected(ctx.state());
            self.emit(ctx, &values);
            return Ok(true);
        };

        let timers = ctx
            .timer_support()
            .ok_or_else(|| ActivityError::Eval("windowed aggregate requires timer support".to_string()))?;
        if !timers.has_timer(true) {
            timers.create_timer(
                window,
                timer_callback(|ctx| {
                    if collected(ctx.state()).is_empty() {
                        return false;
                    }
                    ctx.state_mut().insert(READY_KEY.to_string(), Value::Bool(true));
                    true
                }),
                true,
            )?;
        }
        Ok(false)
    }
}
