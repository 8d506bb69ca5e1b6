//! Execution state models and result records

use crate::core::{
    error::StepError,
    expression::StatusFlags,
    trigger::RefContext,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Terminal status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
    Cancelled,
}

impl StepStatus {
    /// Value of `steps.<id>.outcome`
    pub fn outcome(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "success",
            StepStatus::Failed | StepStatus::TimedOut => "failure",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::TimedOut)
    }
}

/// Terminal status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    /// Value of `needs.<job>.result`
    pub fn result(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "success",
            JobStatus::Failed => "failure",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Externally visible outcome of a triggered run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl PipelineStatus {
    /// Worst status among jobs (Failed > Skipped > Succeeded); a cancelled run
    /// is Cancelled regardless of its jobs
    pub fn aggregate<'a>(jobs: impl IntoIterator<Item = &'a JobStatus>, cancelled: bool) -> Self {
        if cancelled {
            return PipelineStatus::Cancelled;
        }
        jobs.into_iter().fold(PipelineStatus::Succeeded, |worst, status| {
            let status = match status {
                JobStatus::Succeeded => PipelineStatus::Succeeded,
                JobStatus::Skipped => PipelineStatus::Skipped,
                JobStatus::Failed => PipelineStatus::Failed,
                JobStatus::Cancelled => PipelineStatus::Cancelled,
            };
            if status.severity() > worst.severity() {
                status
            } else {
                worst
            }
        })
    }

    fn severity(&self) -> u8 {
        match self {
            PipelineStatus::Succeeded => 0,
            PipelineStatus::Skipped => 1,
            PipelineStatus::Failed => 2,
            PipelineStatus::Cancelled => 3,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == PipelineStatus::Succeeded
    }
}

macro_rules! display_as_debug {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self)
            }
        })*
    };
}

display_as_debug!(StepStatus, JobStatus, PipelineStatus);

/// Outcome of one step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Captured stdout/stderr with secret values masked
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Failure was tolerated by `continue-on-error`
    #[serde(default)]
    pub continue_on_error: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A step that never started
    pub fn skipped(index: usize, id: Option<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id,
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            error: None,
            output: String::new(),
            outputs: BTreeMap::new(),
            continue_on_error: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Failure that aborts the job
    pub fn is_blocking_failure(&self) -> bool {
        self.status.is_failure() && !self.continue_on_error
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Aggregate of one job's step results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Why a skipped job did not run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobResult {
    /// Status implied by step results: Cancelled if a step was cancelled,
    /// Failed if a step failed without `continue-on-error`, else Succeeded
    pub fn status_from_steps(steps: &[StepResult]) -> JobStatus {
        if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
            JobStatus::Cancelled
        } else if steps.iter().any(StepResult::is_blocking_failure) {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.id.as_deref() == Some(id))
    }
}

/// Aggregate of all job results for one triggering event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub ref_context: RefContext,
    pub status: PipelineStatus,
    /// Jobs in declaration order
    pub jobs: Vec<JobResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    pub fn job(&self, id: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.job_id == id)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Lifecycle state of a step inside a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Done(StepStatus),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("step {index} cannot start: step {blocking} has not finished")]
    PredecessorRunning { index: usize, blocking: usize },

    #[error("step {index} is {state:?}, cannot move to {target}")]
    InvalidTransition {
        index: usize,
        state: StepState,
        target: &'static str,
    },

    #[error("no step at index {0}")]
    OutOfRange(usize),
}

/// Per-job state machine.
///
/// Steps move Pending -> Running -> terminal, or Pending -> Skipped, strictly
/// in order: a step may only start once every earlier step is terminal.
#[derive(Debug, Clone)]
pub struct JobProgress {
    states: Vec<StepState>,
    results: Vec<StepResult>,
    flags: StatusFlags,
}

impl JobProgress {
    pub fn new(step_count: usize) -> Self {
        Self {
            states: vec![StepState::Pending; step_count],
            results: Vec::with_capacity(step_count),
            flags: StatusFlags::default(),
        }
    }

    fn state_mut(&mut self, index: usize) -> Result<&mut StepState, StateError> {
        self.states.get_mut(index).ok_or(StateError::OutOfRange(index))
    }

    /// Transition step `index` to Running
    pub fn start(&mut self, index: usize) -> Result<(), StateError> {
        if let Some(blocking) = self.states[..index.min(self.states.len())]
            .iter()
            .position(|s| !matches!(s, StepState::Done(_)))
        {
            return Err(StateError::PredecessorRunning { index, blocking });
        }
        let state = self.state_mut(index)?;
        match *state {
            StepState::Pending => {
                *state = StepState::Running;
                Ok(())
            }
            other => Err(StateError::InvalidTransition {
                index,
                state: other,
                target: "running",
            }),
        }
    }

    /// Record a terminal result for the step at `result.index`
    pub fn finish(&mut self, result: StepResult) -> Result<(), StateError> {
        let index = result.index;
        let status = result.status;
        let state = self.state_mut(index)?;
        match (*state, status) {
            (StepState::Running, _) | (StepState::Pending, StepStatus::Skipped) => {
                *state = StepState::Done(status);
            }
            (other, _) => {
                return Err(StateError::InvalidTransition {
                    index,
                    state: other,
                    target: "done",
                })
            }
        }

        if result.is_blocking_failure() {
            self.flags.failed = true;
        }
        if status == StepStatus::Cancelled {
            self.flags.cancelled = true;
        }
        self.results.push(result);
        Ok(())
    }

    /// Mark the job as cancelled; every remaining step is skipped
    pub fn cancel(&mut self) {
        self.flags.cancelled = true;
    }

    /// Flags for `success()`/`failure()`/`cancelled()` at the current point
    pub fn flags(&self) -> StatusFlags {
        self.flags
    }

    pub fn is_complete(&self) -> bool {
        self.states.iter().all(|s| matches!(s, StepState::Done(_)))
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn status(&self) -> JobStatus {
        if self.flags.cancelled {
            JobStatus::Cancelled
        } else {
            JobResult::status_from_steps(&self.results)
        }
    }

    pub fn into_results(self) -> Vec<StepResult> {
        self.results
    }
}
