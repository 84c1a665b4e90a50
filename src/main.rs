use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_pipeline::cli::commands::{parse_input_value, ActivitiesCommand, RunCommand, ValidateCommand};
use stream_pipeline::cli::output::*;
use stream_pipeline::cli::{Cli, Command};
use stream_pipeline::{
    ActionFactory, ActionSettings, ActivityRegistry, ChannelRegistry, Definition, DefinitionConfig,
    ExecutionStatus, InstanceEvent, Manager, PipelineAction,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const OUTPUT_CHANNEL: &str = "stdout";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Activities(cmd) => list_activities(cmd)?,
    }

    Ok(())
}

fn load_definition(file: &str, activities: &ActivityRegistry) -> Result<Definition> {
    let config = DefinitionConfig::from_file(file).context("Failed to load pipeline config")?;
    Definition::compile(&config, activities).context("Failed to compile pipeline")
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let activities = ActivityRegistry::with_builtins();
    let definition = load_definition(&cmd.file, &activities)?;
    let pipeline_name = definition.name().to_string();

    println!(
        "{} Loaded pipeline: {} ({} stages)",
        INFO,
        style(&pipeline_name).bold(),
        definition.stages().len()
    );

    let manager = Arc::new(Manager::new());
    manager.register_pipeline(definition)?;
    let channels = Arc::new(ChannelRegistry::new());
    let mut outputs = channels.create_bounded(OUTPUT_CHANNEL, cmd.capacity);

    let mut settings = ActionSettings::new(&pipeline_name).output_channel(OUTPUT_CHANNEL);
    if let Some(group_by) = &cmd.group_by {
        settings = settings.group_by(group_by);
    }
    let action = ActionFactory::new(manager, channels)
        .new_action(&settings)
        .context("Failed to create pipeline action")?;

    // Set up event handler for console output
    if !cmd.json {
        action.instance().add_event_handler(|event: InstanceEvent| {
            println!("{}", format_instance_event(&event));
        });
    }

    // Drain the output channel
    let published = Arc::new(AtomicUsize::new(0));
    let published_count = published.clone();
    let print_json = cmd.json;
    let printer = tokio::spawn(async move {
        while let Some(value) = outputs.recv().await {
            published_count.fetch_add(1, Ordering::Relaxed);
            if print_json {
                println!("{}", value);
            }
        }
    });

    let overrides: Map<String, Value> = cmd
        .input
        .iter()
        .map(|(key, raw)| (key.clone(), parse_input_value(raw)))
        .collect();

    let failed_runs = match &cmd.events {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open events file {}", path))?;
            feed_events(&action, BufReader::new(file), &overrides).await?
        }
        None => feed_events(&action, BufReader::new(tokio::io::stdin()), &overrides).await?,
    };

    let waiting = wait_for_timers(&action, Duration::from_millis(cmd.wait_timeout_ms)).await;

    // Summarize partitions
    let mut completed = 0;
    let mut failed = 0;
    for key in action.instance().partition_keys() {
        if let Some(snapshot) = action.instance().partition(&key).await {
            match snapshot.status {
                ExecutionStatus::Completed => completed += 1,
                ExecutionStatus::Failed => failed += 1,
                _ => {}
            }
        }
    }

    // Closing the action drops the last channel sender
    drop(action);
    let _ = printer.await;

    if !cmd.json {
        println!(
            "\n{} {}: {} completed, {} failed, {} waiting, {} outputs published",
            INFO,
            style(&pipeline_name).bold(),
            style(completed).green(),
            style(failed).red(),
            style(waiting).blue(),
            style(published.load(Ordering::Relaxed)).cyan()
        );
    }

    if failed_runs > 0 || failed > 0 {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&pipeline_name).bold(),
            style("had failed runs").red()
        );
        std::process::exit(1);
    }

    Ok(())
}

/// Run every JSON line of `reader` through the action. Returns the number of failed runs.
async fn feed_events<R>(action: &PipelineAction, reader: R, overrides: &Map<String, Value>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0;
    let mut failed = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read events")? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut inputs = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                println!("{} line {}: expected a JSON object, got {}", WARN, line_number, other);
                continue;
            }
            Err(e) => {
                println!("{} line {}: {}", WARN, line_number, e);
                continue;
            }
        };
        inputs.extend(overrides.clone());

        if let Err(e) = action.run(inputs).await {
            error!("Run for event on line {} failed: {}", line_number, e);
            failed += 1;
        }
    }

    Ok(failed)
}

/// Wait until no partition is waiting on a timer. Returns the number still waiting.
async fn wait_for_timers(action: &PipelineAction, timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut waiting = 0;
        for key in action.instance().partition_keys() {
            if let Some(snapshot) = action.instance().partition(&key).await {
                if snapshot.status == ExecutionStatus::Waiting {
                    waiting += 1;
                }
            }
        }
        if waiting == 0 {
            return 0;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("{} partitions still waiting on timers", waiting);
            return waiting;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let activities = ActivityRegistry::with_builtins();
    let config = match DefinitionConfig::from_file(&cmd.file) {
        Ok(config) => config,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    };

    match Definition::compile(&config, &activities) {
        Ok(definition) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(definition.name()).bold());
            println!("  Stages: {}", style(definition.stages().len()).cyan());
            for (index, stage) in definition.stages().iter().enumerate() {
                println!(
                    "    {} {} ({})",
                    style(format!("#{}", index)).dim(),
                    style(stage.name()).cyan(),
                    style(stage.activity_ref()).dim()
                );
            }
            println!("  Inputs: {}", style(definition.metadata().input.len()).cyan());
            println!("  Outputs: {}", style(definition.metadata().output.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

fn list_activities(cmd: &ActivitiesCommand) -> Result<()> {
    let references = ActivityRegistry::with_builtins().references();

    if cmd.json {
        let data = serde_json::json!({ "activities": references });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{} Available activities:", INFO);
    for reference in &references {
        println!("  {}", style(reference).bold());
    }
    Ok(())
}
