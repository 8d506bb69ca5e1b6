//! Pipeline execution: step runner, job scheduler and the engine facade

pub mod engine;
pub mod executor;
pub mod scheduler;

pub use engine::{EventBus, EventHandler, ExecutionEngine, ExecutionEvent, TriggerOutcome};
pub use executor::{parse_outputs, StepRunner, StepTarget};
pub use scheduler::{ExecutionScheduler, CANCELLED_REASON};
