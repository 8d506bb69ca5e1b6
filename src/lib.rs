//! pipeline-engine - a CI pipeline execution engine for declarative workflow definitions

pub mod cli;
pub mod core;
pub mod environment;
pub mod execution;
pub mod report;
pub mod vault;

// Re-export commonly used types
pub use core::{
    build, should_run, DefinitionError, EngineSettings, Event, EventKind, Job, JobResult, JobStatus,
    PipelineDefinition, PipelineResult, PipelineStatus, RefContext, Step, StepError, StepResult, StepStatus,
};
pub use environment::{Environment, LocalProvisioner, Provisioner};
pub use execution::{ExecutionEngine, ExecutionEvent, TriggerOutcome};
pub use report::{ResultReporter, StatusSink};
pub use vault::{CredentialVault, SecretPolicy, SecretStore};
