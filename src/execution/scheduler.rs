//! Execution scheduler - runs jobs in dependency order under a concurrency limit

use crate::{
    core::{
        context::{NeedsEntry, RunContext, SecretRendering},
        expression::StatusFlags,
        pipeline::{Job, PipelineDefinition},
        state::{JobProgress, JobResult, JobStatus, PipelineResult, PipelineStatus, StepResult},
        trigger::RefContext,
    },
    environment::{Environment, EnvironmentSpec, Provisioner},
    execution::{
        engine::{EventBus, ExecutionEvent},
        executor::{StepRunner, StepTarget},
    },
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reason recorded on jobs that never started because the run was cancelled
pub const CANCELLED_REASON: &str = "run cancelled";

/// Where a job stands relative to its dependencies
enum Readiness {
    Waiting,
    Blocked(String),
    Ready(Vec<(String, NeedsEntry)>),
}

fn readiness(job: &Job, finished: &HashMap<String, JobResult>) -> Readiness {
    let mut needs = Vec::with_capacity(job.needs.len());
    for dep in &job.needs {
        match finished.get(dep) {
            None => return Readiness::Waiting,
            Some(result) if result.status == JobStatus::Succeeded => needs.push((
                dep.clone(),
                NeedsEntry {
                    result: result.status,
                    outputs: result.outputs.clone(),
                },
            )),
            Some(result) => {
                return Readiness::Blocked(format!("dependency `{}` {}", dep, result.status.result()))
            }
        }
    }
    Readiness::Ready(needs)
}

fn unstarted_job(job: &Job, status: JobStatus, reason: impl Into<String>) -> JobResult {
    JobResult {
        job_id: job.id.clone(),
        name: job.name.clone(),
        status,
        steps: job
            .steps
            .iter()
            .map(|s| StepResult::skipped(s.index, s.id.clone(), s.name.clone()))
            .collect(),
        outputs: BTreeMap::new(),
        reason: Some(reason.into()),
        started_at: None,
        finished_at: None,
    }
}

/// Everything a job task needs, shared by all jobs of one run
struct RunShared {
    definition: Arc<PipelineDefinition>,
    ref_context: Arc<RefContext>,
    execution_id: Uuid,
    cancel: CancellationToken,
    provisioner: Arc<dyn Provisioner>,
    runner: Arc<StepRunner>,
    events: EventBus,
    permits: Arc<Semaphore>,
    default_timeout: Duration,
}

impl RunShared {
    fn skip(&self, job: &Job, reason: impl Into<String>) -> JobResult {
        let result = unstarted_job(job, JobStatus::Skipped, reason);
        let reason = result.reason.clone().unwrap_or_default();
        info!("Skipping job {}: {}", job.id, reason);
        self.events.emit(ExecutionEvent::JobSkipped {
            execution_id: self.execution_id,
            job: job.id.clone(),
            reason,
        });
        result
    }

    fn finished(&self, result: &JobResult) {
        self.events.emit(ExecutionEvent::JobFinished {
            execution_id: self.execution_id,
            job: result.job_id.clone(),
            status: result.status,
        });
    }
}

/// Runs the jobs of a definition.
///
/// Jobs start once every dependency succeeded and a permit is free; a job
/// whose dependency did not succeed is skipped without running, and so are
/// its dependents. The permit pool is shared by every run on this scheduler.
pub struct ExecutionScheduler {
    provisioner: Arc<dyn Provisioner>,
    runner: Arc<StepRunner>,
    events: EventBus,
    permits: Arc<Semaphore>,
    default_timeout: Duration,
}

impl ExecutionScheduler {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        runner: Arc<StepRunner>,
        events: EventBus,
        concurrency: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            provisioner,
            runner,
            events,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            default_timeout,
        }
    }

    /// Run every job and return once each has reached a terminal status
    pub async fn run(
        &self,
        definition: Arc<PipelineDefinition>,
        ref_context: Arc<RefContext>,
        execution_id: Uuid,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let started_at = Utc::now();
        let shared = Arc::new(RunShared {
            definition: definition.clone(),
            ref_context: ref_context.clone(),
            execution_id,
            cancel,
            provisioner: self.provisioner.clone(),
            runner: self.runner.clone(),
            events: self.events.clone(),
            permits: self.permits.clone(),
            default_timeout: self.default_timeout,
        });

        let mut pending: Vec<String> = definition.execution_order().to_vec();
        let mut finished: HashMap<String, JobResult> = HashMap::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<(String, JobResult)> = JoinSet::new();

        loop {
            Self::dispatch(&shared, &mut pending, &mut finished, &mut running, &mut tasks);
            match tasks.join_next().await {
                Some(Ok((job_id, result))) => {
                    debug!("Job {} finished with {}", job_id, result.status);
                    running.remove(&job_id);
                    finished.insert(job_id, result);
                }
                Some(Err(e)) => error!("Job task could not be joined: {}", e),
                None => break,
            }
        }

        for job_id in running.drain() {
            if let Some(job) = definition.job(&job_id) {
                finished.insert(job_id, unstarted_job(job, JobStatus::Failed, "job task aborted"));
            }
        }
        for job_id in pending.drain(..) {
            if let Some(job) = definition.job(&job_id) {
                finished.insert(job_id, unstarted_job(job, JobStatus::Skipped, "never became runnable"));
            }
        }

        let jobs: Vec<JobResult> = definition
            .jobs
            .iter()
            .filter_map(|job| finished.remove(&job.id))
            .collect();
        let cancelled = jobs
            .iter()
            .any(|j| j.status == JobStatus::Cancelled || j.reason.as_deref() == Some(CANCELLED_REASON));
        let status = PipelineStatus::aggregate(jobs.iter().map(|j| &j.status), cancelled);

        PipelineResult {
            execution_id,
            pipeline: definition.name.clone(),
            ref_context: ref_context.as_ref().clone(),
            status,
            jobs,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Settle every pending job whose dependencies are decided. `pending` is in
    /// topological order, so one pass also settles cascading skips.
    fn dispatch(
        shared: &Arc<RunShared>,
        pending: &mut Vec<String>,
        finished: &mut HashMap<String, JobResult>,
        running: &mut HashSet<String>,
        tasks: &mut JoinSet<(String, JobResult)>,
    ) {
        pending.retain(|job_id| {
            let Some(job) = shared.definition.job(job_id) else {
                return false;
            };
            if shared.cancel.is_cancelled() {
                finished.insert(job_id.clone(), shared.skip(job, CANCELLED_REASON));
                return false;
            }
            match readiness(job, finished) {
                Readiness::Waiting => true,
                Readiness::Blocked(reason) => {
                    finished.insert(job_id.clone(), shared.skip(job, reason));
                    false
                }
                Readiness::Ready(needs) => {
                    running.insert(job_id.clone());
                    tasks.spawn(supervise(shared.clone(), job_id.clone(), needs));
                    false
                }
            }
        });
    }
}

/// Run a job in its own task so a panic is contained and recorded as Failed
async fn supervise(shared: Arc<RunShared>, job_id: String, needs: Vec<(String, NeedsEntry)>) -> (String, JobResult) {
    let handle = tokio::spawn(run_job(shared.clone(), job_id.clone(), needs));
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!("Job {} task failed: {}", job_id, e);
            let result = match shared.definition.job(&job_id) {
                Some(job) => unstarted_job(job, JobStatus::Failed, format!("job task failed: {}", e)),
                None => JobResult {
                    job_id: job_id.clone(),
                    name: job_id.clone(),
                    status: JobStatus::Failed,
                    steps: Vec::new(),
                    outputs: BTreeMap::new(),
                    reason: Some(format!("job task failed: {}", e)),
                    started_at: None,
                    finished_at: None,
                },
            };
            shared.finished(&result);
            result
        }
    };
    (job_id, result)
}

async fn run_job(shared: Arc<RunShared>, job_id: String, needs: Vec<(String, NeedsEntry)>) -> JobResult {
    let definition = shared.definition.clone();
    let Some(job) = definition.job(&job_id) else {
        return JobResult {
            job_id: job_id.clone(),
            name: job_id,
            status: JobStatus::Failed,
            steps: Vec::new(),
            outputs: BTreeMap::new(),
            reason: Some("job not found in definition".to_string()),
            started_at: None,
            finished_at: None,
        };
    };

    let mut context = RunContext::new(shared.ref_context.clone());
    context.apply_env(&definition.env);
    for (dep, entry) in needs {
        context.set_needs(dep, entry);
    }
    context.apply_env(&job.env);
    context.set_flags(StatusFlags {
        failed: false,
        cancelled: shared.cancel.is_cancelled(),
    });

    if !job.condition.evaluate(&context.scope(SecretRendering::Value)) {
        return shared.skip(job, format!("condition `{}` is false", job.condition.source()));
    }

    let _permit = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => return shared.skip(job, CANCELLED_REASON),
        permit = shared.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return shared.skip(job, "scheduler closed"),
        },
    };

    let started_at = Utc::now();
    let spec = EnvironmentSpec {
        execution_id: shared.execution_id,
        pipeline: definition.name.clone(),
        job: job.id.clone(),
        runs_on: job.runs_on.clone(),
        ref_context: shared.ref_context.clone(),
    };
    let environment = match shared.provisioner.provision(&spec).await {
        Ok(environment) => environment,
        Err(e) => {
            error!("Failed to provision environment for job {}: {}", job.id, e);
            let result = JobResult {
                started_at: Some(started_at),
                finished_at: Some(Utc::now()),
                ..unstarted_job(job, JobStatus::Failed, e.to_string())
            };
            shared.finished(&result);
            return result;
        }
    };

    info!("Starting job {} in environment {}", job.id, environment.id());
    shared.events.emit(ExecutionEvent::JobStarted {
        execution_id: shared.execution_id,
        job: job.id.clone(),
        environment: environment.id().to_string(),
    });

    let progress = run_steps(&shared, job, environment.as_ref(), &mut context).await;
    let status = progress.status();

    let outputs = job
        .outputs
        .iter()
        .map(|(name, template)| {
            let value = template.render(&context.scope(SecretRendering::Value));
            (name.clone(), context.mask(&value))
        })
        .collect();

    if let Err(e) = environment.release().await {
        warn!("Failed to release environment for job {}: {}", job.id, e);
    }
    drop(context);

    let result = JobResult {
        job_id: job.id.clone(),
        name: job.name.clone(),
        status,
        steps: progress.into_results(),
        outputs,
        reason: None,
        started_at: Some(started_at),
        finished_at: Some(Utc::now()),
    };
    info!("Job {} finished: {}", job.id, result.status);
    shared.finished(&result);
    result
}

/// Run the steps of `job` strictly in order. After a blocking failure only
/// steps whose condition still holds (`failure()`, `always()`) execute; after
/// cancellation nothing does.
async fn run_steps(
    shared: &RunShared,
    job: &Job,
    environment: &dyn Environment,
    context: &mut RunContext,
) -> JobProgress {
    let mut progress = JobProgress::new(job.steps.len());
    let target = StepTarget {
        execution_id: shared.execution_id,
        pipeline: &shared.definition.name,
        job,
        environment,
        cancel: &shared.cancel,
    };

    for step in &job.steps {
        let cancelled = shared.cancel.is_cancelled();
        if cancelled {
            progress.cancel();
        }
        context.set_flags(progress.flags());

        if cancelled || !step.condition.evaluate(&context.scope(SecretRendering::Value)) {
            debug!("Skipping step {} in job {}", step.label(), job.id);
            let skipped = StepResult::skipped(step.index, step.id.clone(), step.name.clone());
            context.record_step(&skipped);
            shared.events.emit(ExecutionEvent::StepFinished {
                execution_id: shared.execution_id,
                job: job.id.clone(),
                step: step.index,
                status: skipped.status,
                error: None,
            });
            if let Err(e) = progress.finish(skipped) {
                error!("Step bookkeeping failed in job {}: {}", job.id, e);
            }
            continue;
        }

        if let Err(e) = progress.start(step.index) {
            error!("Step bookkeeping failed in job {}: {}", job.id, e);
            break;
        }
        let timeout = step
            .timeout
            .or(job.timeout)
            .unwrap_or(shared.default_timeout);
        let result = shared.runner.execute(&target, step, context, timeout).await;
        context.record_step(&result);
        if let Err(e) = progress.finish(result) {
            error!("Step bookkeeping failed in job {}: {}", job.id, e);
        }
    }

    progress
}
