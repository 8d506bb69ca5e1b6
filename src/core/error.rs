//! Error taxonomy for definition loading and step execution

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that make a pipeline definition invalid.
///
/// These are raised by the graph builder before anything is scheduled, so a
/// definition that produces one of them never starts a run.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Malformed structure: missing fields, wrong types, bad expressions
    #[error("schema error at {path}: {message}")]
    Schema { path: String, message: String },

    /// The job dependency relation contains a cycle
    #[error("cyclic job dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A step references a secret it did not declare
    #[error("step '{step}' in job '{job}' references undeclared secret '{secret}'")]
    UnknownSecretReference {
        job: String,
        step: String,
        secret: String,
    },

    #[error("failed to read pipeline definition: {0}")]
    Io(#[from] std::io::Error),
}

impl DefinitionError {
    pub fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        DefinitionError::Schema {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<serde_yaml::Error> for DefinitionError {
    fn from(err: serde_yaml::Error) -> Self {
        let path = match err.location() {
            Some(location) => format!("line {} column {}", location.line(), location.column()),
            None => "<document>".to_string(),
        };
        DefinitionError::Schema {
            path,
            message: err.to_string(),
        }
    }
}

/// Run-time failure of a single step.
///
/// Recorded on the step result; never escapes the scheduler.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// The credential vault refused to resolve a declared secret
    #[error("access denied for secret '{secret}': {reason}")]
    AccessDenied { secret: String, reason: String },

    /// The process exited with a non-zero status (or was killed by a signal)
    #[error("process exited with {}", exit_code.map(|c| format!("code {}", c)).unwrap_or_else(|| "no exit code".to_string()))]
    Execution { exit_code: Option<i32> },

    /// The step exceeded its timeout and was terminated
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The run was cancelled while the step was in flight
    #[error("cancelled")]
    Cancelled,

    /// The execution environment could not run the step at all
    #[error("environment error: {0}")]
    Environment(String),
}
