//! Execution environments
//!
//! A [`Provisioner`] hands out one isolated [`Environment`] per job; the step
//! runner executes commands against it and releases it when the job ends.

pub mod local;
pub mod output;

pub use local::LocalProvisioner;
pub use output::{CollectingSink, OutputSink, OutputStream};

use crate::core::{step::Shell, trigger::RefContext};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Variables or inputs handed to a process; may hold secret values, so each
/// value is zeroed when the request is dropped
pub type ExecEnv = BTreeMap<String, Zeroizing<String>>;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("no environment available for labels {labels:?}")]
    Unsupported { labels: Vec<String> },

    #[error("failed to provision environment: {0}")]
    Provision(String),

    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("invalid working directory `{0}`")]
    InvalidWorkingDirectory(String),

    #[error("failed to start process: {0}")]
    Spawn(std::io::Error),

    #[error("process wait failed: {0}")]
    Wait(std::io::Error),

    #[error("failed to release environment: {0}")]
    Release(String),
}

/// What a job asks the provisioner for
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub job: String,
    /// `runs-on` labels
    pub runs_on: Vec<String>,
    pub ref_context: Arc<RefContext>,
}

/// What to run
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Shell { script: String, shell: Shell },
    Action {
        reference: String,
        inputs: ExecEnv,
    },
}

/// One command execution request
pub struct ExecRequest {
    pub invocation: Invocation,
    /// Variables applied on top of the environment's base variables
    pub env: ExecEnv,
    /// Relative to the job workspace
    pub working_directory: Option<String>,
    pub output: Option<Arc<dyn OutputSink>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Interleaved stdout/stderr lines
    pub output: String,
    pub truncated: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// External collaborator supplying isolated compute per job
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, spec: &EnvironmentSpec) -> Result<Box<dyn Environment>, EnvironmentError>;
}

/// Handle to one provisioned environment.
///
/// Dropping an in-flight `exec` future must terminate the process it started.
#[async_trait]
pub trait Environment: Send + Sync {
    fn id(&self) -> &str;

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput, EnvironmentError>;

    /// Give the environment back; called exactly once on every exit path
    async fn release(self: Box<Self>) -> Result<(), EnvironmentError>;
}
