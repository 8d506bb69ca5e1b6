//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, ListCommand, MatchCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// CI pipeline execution engine
#[derive(Debug, Parser, Clone)]
#[command(name = "pipeline-engine")]
#[command(author = "Pipeline Engine Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Run declarative CI pipelines against repository events", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to engine settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print step output as it arrives
    #[arg(short, long, global = true)]
    pub stream: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline for an event
    Run(RunCommand),

    /// Validate a pipeline definition
    Validate(ValidateCommand),

    /// Check whether an event would trigger a pipeline
    Match(MatchCommand),

    /// Show run history
    History(HistoryCommand),

    /// List pipelines with recorded runs
    List(ListCommand),
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
