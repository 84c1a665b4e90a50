//! CLI command definitions

use clap::Args;
use serde_json::Value;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the pipeline file (JSON or YAML)
    #[arg(short, long)]
    pub file: String,

    /// Newline-delimited JSON events (stdin when omitted)
    #[arg(short, long)]
    pub events: Option<String>,

    /// Input field whose value selects the partition
    #[arg(short, long)]
    pub group_by: Option<String>,

    /// Values merged into every event (key=value, value parsed as JSON when possible)
    #[arg(long, value_parser = parse_key_value)]
    pub input: Vec<(String, String)>,

    /// Capacity of the output channel
    #[arg(long, default_value_t = 1024)]
    pub capacity: usize,

    /// Maximum time to wait for pending timers before exiting
    #[arg(long, default_value_t = 30_000)]
    pub wait_timeout_ms: u64,

    /// Print completed outputs as JSON lines instead of formatted events
    #[arg(long)]
    pub json: bool,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the pipeline file (JSON or YAML)
    #[arg(short, long)]
    pub file: String,

    /// Output the parsed configuration as JSON
    #[arg(long)]
    pub json: bool,
}

/// List activity references
#[derive(Debug, Args, Clone)]
pub struct ActivitiesCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// Interpret an input override: JSON when it parses, a plain string otherwise
pub fn parse_input_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
