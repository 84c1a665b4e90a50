//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{ActivitiesCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// Run stream pipelines over newline-delimited JSON events
#[derive(Debug, Parser, Clone)]
#[command(name = "stream-pipeline")]
#[command(author = "Stream Pipeline Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Run partitioned, timer-aware stream pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline over a stream of JSON events
    Run(RunCommand),

    /// Validate and compile a pipeline file
    Validate(ValidateCommand),

    /// List the available activity references
    Activities(ActivitiesCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
