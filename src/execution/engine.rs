//! Main execution engine - matches events, runs pipelines and reports results

use crate::{
    core::{
        error::StepError,
        pipeline::PipelineDefinition,
        settings::EngineSettings,
        state::{JobStatus, PipelineResult, PipelineStatus, StepStatus},
        trigger::{should_run, Event, RefContext},
    },
    environment::{OutputStream, Provisioner},
    execution::{executor::StepRunner, scheduler::ExecutionScheduler},
    report::ResultReporter,
    vault::CredentialVault,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline: String,
        git_ref: String,
    },
    /// An in-flight run was cancelled by a newer run on the same ref
    RunSuperseded {
        execution_id: Uuid,
        superseded_by: Uuid,
    },
    JobStarted {
        execution_id: Uuid,
        job: String,
        environment: String,
    },
    JobSkipped {
        execution_id: Uuid,
        job: String,
        reason: String,
    },
    JobFinished {
        execution_id: Uuid,
        job: String,
        status: JobStatus,
    },
    StepStarted {
        execution_id: Uuid,
        job: String,
        step: usize,
        name: String,
    },
    /// One masked line of step output
    StepOutput {
        execution_id: Uuid,
        job: String,
        step: usize,
        stream: OutputStream,
        line: String,
    },
    StepFinished {
        execution_id: Uuid,
        job: String,
        step: usize,
        status: StepStatus,
        error: Option<StepError>,
    },
    PipelineCompleted {
        execution_id: Uuid,
        pipeline: String,
        status: PipelineStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of execution events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: EventHandler) {
        match self.handlers.lock() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        // Snapshot so a handler may subscribe without deadlocking
        let handlers = match self.handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

/// What happened to an incoming event
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    /// Trigger rules did not match; nothing ran
    NotTriggered(RefContext),
    Completed(Arc<PipelineResult>),
}

impl TriggerOutcome {
    pub fn result(&self) -> Option<&Arc<PipelineResult>> {
        match self {
            TriggerOutcome::Completed(result) => Some(result),
            TriggerOutcome::NotTriggered(_) => None,
        }
    }
}

struct ActiveRun {
    execution_id: Uuid,
    cancel: CancellationToken,
}

/// Main pipeline execution engine.
///
/// Shared by reference across every incoming event; definitions are passed in
/// per run and never mutated.
pub struct ExecutionEngine {
    scheduler: ExecutionScheduler,
    reporter: Option<Arc<ResultReporter>>,
    events: EventBus,
    cancel_superseded: bool,
    active: Mutex<HashMap<(String, String), ActiveRun>>,
}

impl ExecutionEngine {
    pub fn new(provisioner: Arc<dyn Provisioner>, vault: Arc<CredentialVault>, settings: &EngineSettings) -> Self {
        let events = EventBus::new();
        let runner = Arc::new(StepRunner::new(vault, events.clone()));
        let scheduler = ExecutionScheduler::new(
            provisioner,
            runner,
            events.clone(),
            settings.concurrency,
            settings.default_timeout(),
        );

        Self {
            scheduler,
            reporter: None,
            events,
            cancel_superseded: settings.cancel_superseded,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Publish every finished run through `reporter`
    pub fn with_reporter(mut self, reporter: Arc<ResultReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(Arc::new(handler));
    }

    /// Match `event` against the definition's trigger rules and run it if it
    /// matches
    pub async fn trigger(&self, event: &Event, definition: Arc<PipelineDefinition>) -> TriggerOutcome {
        let decision = should_run(event, &definition);
        if !decision.run {
            debug!(
                "Pipeline {} not triggered by {} on {}",
                definition.name, event.kind, event.git_ref
            );
            return TriggerOutcome::NotTriggered(decision.ref_context);
        }
        TriggerOutcome::Completed(self.run(definition, decision.ref_context).await)
    }

    /// Run the definition against `ref_context` until every job is terminal
    pub async fn run(&self, definition: Arc<PipelineDefinition>, ref_context: RefContext) -> Arc<PipelineResult> {
        let execution_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let key = (definition.name.clone(), ref_context.git_ref.clone());
        self.register(key.clone(), execution_id, cancel.clone());

        info!(
            "Starting pipeline execution: {} ({}) on {}",
            definition.name, execution_id, ref_context.git_ref
        );
        self.events.emit(ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline: definition.name.clone(),
            git_ref: ref_context.git_ref.clone(),
        });

        let result = self
            .scheduler
            .run(definition, Arc::new(ref_context), execution_id, cancel)
            .await;
        self.unregister(&key, execution_id);

        info!(
            "Pipeline {} ({}) finished: {} in {}ms",
            result.pipeline,
            execution_id,
            result.status,
            result.duration_ms()
        );
        self.events.emit(ExecutionEvent::PipelineCompleted {
            execution_id,
            pipeline: result.pipeline.clone(),
            status: result.status,
        });

        let result = Arc::new(result);
        if let Some(reporter) = &self.reporter {
            // Fire and forget; delivery never holds up the caller
            let _ = reporter.publish(result.clone());
        }
        result
    }

    fn register(&self, key: (String, String), execution_id: Uuid, cancel: CancellationToken) {
        let previous = {
            let mut active = match self.active.lock() {
                Ok(active) => active,
                Err(poisoned) => poisoned.into_inner(),
            };
            active.insert(key.clone(), ActiveRun { execution_id, cancel })
        };

        if let Some(previous) = previous {
            if self.cancel_superseded {
                warn!(
                    "Cancelling run {} of {} on {}: superseded by {}",
                    previous.execution_id, key.0, key.1, execution_id
                );
                previous.cancel.cancel();
                self.events.emit(ExecutionEvent::RunSuperseded {
                    execution_id: previous.execution_id,
                    superseded_by: execution_id,
                });
            }
        }
    }

    fn unregister(&self, key: &(String, String), execution_id: Uuid) {
        let mut active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        if active.get(key).map(|run| run.execution_id) == Some(execution_id) {
            active.remove(key);
        }
    }

    /// Cancel the in-flight run of `pipeline` on `git_ref`, if any
    pub fn cancel(&self, pipeline: &str, git_ref: &str) -> bool {
        let active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        match active.get(&(pipeline.to_string(), git_ref.to_string())) {
            Some(run) => {
                info!("Cancelling run {} of {} on {}", run.execution_id, pipeline, git_ref);
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight run
    pub fn cancel_all(&self) {
        let active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        for run in active.values() {
            run.cancel.cancel();
        }
    }

    /// `(pipeline, ref, execution id)` of every in-flight run
    pub fn active_runs(&self) -> Vec<(String, String, Uuid)> {
        let active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        active
            .iter()
            .map(|((pipeline, git_ref), run)| (pipeline.clone(), git_ref.clone(), run.execution_id))
            .collect()
    }
}
