//! Log activity

use crate::core::activity::{Activity, ActivityError, Capabilities};
use crate::core::context::ActivityContext;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

/// Logs the `message` input at the `level` input (default `info`)
///
/// Registered as a shared singleton. Passes `message` through as an output.
#[derive(Debug, Default)]
pub struct LogActivity;

#[async_trait]
impl Activity for LogActivity {
    async fn eval(&self, ctx: &mut ActivityContext) -> Result<bool, ActivityError> {
        let message = match ctx.input("message") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let level = ctx
            .input("level")
            .and_then(Value::as_str)
            .unwrap_or("info")
            .to_ascii_lowercase();

        let stage = ctx.stage_name();
        let partition = ctx.discriminator();
        match level.as_str() {
            "trace" => trace!(stage = %stage, partition = %partition, "{}", message),
            "debug" => debug!(stage = %stage, partition = %partition, "{}", message),
            "warn" | "warning" => warn!(stage = %stage, partition = %partition, "{}", message),
            "error" => error!(stage = %stage, partition = %partition, "{}", message),
            _ => info!(stage = %stage, partition = %partition, "{}", message),
        }

        ctx.set_output("message", Value::String(message));
        Ok(true)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default().singleton()
    }
}
