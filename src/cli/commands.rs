//! CLI command definitions

use crate::core::trigger::{Event, EventKind};
use clap::Args;
use std::path::PathBuf;

/// The event to match or run against
#[derive(Debug, Args, Clone)]
pub struct EventArgs {
    /// Event kind (push, pull_request, schedule, manual)
    #[arg(long, default_value = "push")]
    pub event: EventKind,

    /// Pushed ref or branch name
    #[arg(long = "ref", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Target branch of a pull request
    #[arg(long)]
    pub base_ref: Option<String>,

    /// Source branch of a pull request
    #[arg(long)]
    pub head_ref: Option<String>,

    #[arg(long)]
    pub sha: Option<String>,

    #[arg(long)]
    pub actor: Option<String>,

    #[arg(long)]
    pub repository: Option<String>,
}

impl EventArgs {
    pub fn to_event(&self) -> Event {
        Event {
            base_ref: self.base_ref.clone(),
            head_ref: self.head_ref.clone(),
            sha: self.sha.clone(),
            actor: self.actor.clone(),
            repository: self.repository.clone(),
            ..Event::new(self.event, self.git_ref.clone())
        }
    }
}

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,

    /// Secret values (NAME=value); when given, the process environment is not consulted
    #[arg(long, value_parser = parse_key_value)]
    pub secret: Vec<(String, String)>,

    /// Maximum number of jobs running at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Directory exposed to steps as CI_SOURCE_DIR
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Check trigger rules without running anything
#[derive(Debug, Args, Clone)]
pub struct MatchCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines with recorded runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show per-job and per-step details
    #[arg(long)]
    pub details: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show one run by execution ID
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
