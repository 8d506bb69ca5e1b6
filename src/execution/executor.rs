//! Step runner - executes one step inside a job's environment

use crate::{
    core::{
        context::{RunContext, SecretRendering},
        error::StepError,
        pipeline::Job,
        state::{StepResult, StepStatus},
        step::{Step, StepAction},
    },
    environment::{
        Environment, EnvironmentError, ExecEnv, ExecOutput, ExecRequest, Invocation, OutputSink, OutputStream,
    },
    execution::engine::{EventBus, ExecutionEvent},
    vault::{CredentialVault, SecretMap, SecretScope},
};
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Deadline used when a timeout is too long to add to the current instant
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn set_output_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^::set-output name=([A-Za-z0-9_\-]+)::(.*)$").ok())
        .as_ref()
}

/// Collect `::set-output name=<k>::<v>` lines; later lines win
pub fn parse_outputs(output: &str) -> BTreeMap<String, String> {
    let Some(pattern) = set_output_pattern() else {
        return BTreeMap::new();
    };
    output
        .lines()
        .filter_map(|line| pattern.captures(line.trim_end()))
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// Where a step runs and who asked for it
pub struct StepTarget<'a> {
    pub execution_id: Uuid,
    pub pipeline: &'a str,
    pub job: &'a Job,
    pub environment: &'a dyn Environment,
    pub cancel: &'a CancellationToken,
}

enum Outcome {
    Finished(Result<ExecOutput, EnvironmentError>),
    TimedOut,
    Cancelled,
}

/// Forwards live output lines as events, masked
struct MaskingSink {
    secrets: SecretMap,
    events: EventBus,
    execution_id: Uuid,
    job: String,
    step: usize,
}

impl OutputSink for MaskingSink {
    fn on_line(&self, stream: OutputStream, line: &str) {
        self.events.emit(ExecutionEvent::StepOutput {
            execution_id: self.execution_id,
            job: self.job.clone(),
            step: self.step,
            stream,
            line: self.secrets.mask(line),
        });
    }
}

/// Executes single steps: resolves declared secrets, renders the invocation,
/// runs it under a timeout and records the result
pub struct StepRunner {
    vault: Arc<CredentialVault>,
    events: EventBus,
}

impl StepRunner {
    pub fn new(vault: Arc<CredentialVault>, events: EventBus) -> Self {
        Self { vault, events }
    }

    /// Run `step` and return its terminal result. Never fails: every error
    /// becomes a Failed, TimedOut or Cancelled result.
    pub async fn execute(
        &self,
        target: &StepTarget<'_>,
        step: &Step,
        context: &mut RunContext,
        timeout: Duration,
    ) -> StepResult {
        let job_id = target.job.id.as_str();
        info!("Executing step: {} ({}/{})", step.name, job_id, step.label());

        let started_at = Utc::now();
        self.events.emit(ExecutionEvent::StepStarted {
            execution_id: target.execution_id,
            job: job_id.to_string(),
            step: step.index,
            name: step.name.clone(),
        });

        let mut result = StepResult {
            started_at: Some(started_at),
            ..StepResult::skipped(step.index, step.id.clone(), step.name.clone())
        };

        // Secrets for this step only; the context keeps a copy for masking
        let step_secrets = if step.secrets.is_empty() {
            SecretMap::new()
        } else {
            let scope = SecretScope::new(target.pipeline, job_id, &context.ref_context);
            match self.vault.resolve(&step.secrets, &scope).await {
                Ok(secrets) => secrets,
                Err(e) => {
                    warn!("Step {} in job {} denied secrets: {}", step.label(), job_id, e);
                    let fallback = step.secrets.join(",");
                    result.status = StepStatus::Failed;
                    result.error = Some(e.into_step_error(&fallback));
                    result.continue_on_error = step.continue_on_error;
                    return self.finish(target, result);
                }
            }
        };
        context.add_secrets(step_secrets.clone());

        let request = self.build_request(target, step, context, &step_secrets);
        let started = Instant::now();
        let deadline = started.checked_add(timeout).unwrap_or(started + FAR_FUTURE);
        let outcome = tokio::select! {
            biased;
            _ = target.cancel.cancelled() => Outcome::Cancelled,
            _ = sleep_until(deadline) => Outcome::TimedOut,
            finished = target.environment.exec(request) => {
                // An exit racing the deadline still counts as a timeout
                if Instant::now() >= deadline {
                    Outcome::TimedOut
                } else {
                    Outcome::Finished(finished)
                }
            }
        };
        drop(step_secrets);

        match outcome {
            Outcome::Finished(Ok(exec)) => {
                result.exit_code = exec.exit_code;
                result.outputs = parse_outputs(&exec.output)
                    .into_iter()
                    .map(|(k, v)| (k, context.mask(&v)))
                    .collect();
                result.output = context.mask(&exec.output);
                if exec.truncated {
                    result.output.push_str("\n[output truncated]");
                }
                if exec.success() {
                    result.status = StepStatus::Succeeded;
                } else {
                    result.status = StepStatus::Failed;
                    result.error = Some(StepError::Execution { exit_code: exec.exit_code });
                }
            }
            Outcome::Finished(Err(e)) => {
                result.status = StepStatus::Failed;
                result.error = Some(StepError::Environment(context.mask(&e.to_string())));
            }
            Outcome::TimedOut => {
                warn!("Step {} in job {} timed out after {:?}", step.label(), job_id, timeout);
                result.status = StepStatus::TimedOut;
                result.error = Some(StepError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Outcome::Cancelled => {
                info!("Step {} in job {} cancelled", step.label(), job_id);
                result.status = StepStatus::Cancelled;
                result.error = Some(StepError::Cancelled);
            }
        }

        result.continue_on_error = step.continue_on_error && result.status.is_failure();
        self.finish(target, result)
    }

    fn build_request(
        &self,
        target: &StepTarget<'_>,
        step: &Step,
        context: &RunContext,
        step_secrets: &SecretMap,
    ) -> ExecRequest {
        let values = context.scope(SecretRendering::Value);

        let mut env: ExecEnv = context
            .env()
            .iter()
            .map(|(k, v)| (k.clone(), Zeroizing::new(v.clone())))
            .collect();
        for (key, template) in &step.env {
            env.insert(key.clone(), template.render_zeroizing(&values));
        }
        for (name, value) in step_secrets.iter() {
            env.insert(name.clone(), Zeroizing::new(value.expose().to_string()));
        }

        let invocation = match &step.action {
            StepAction::Run { script, shell } => Invocation::Shell {
                script: script.render(&context.scope(SecretRendering::ShellReference)),
                shell: *shell,
            },
            StepAction::Uses { action, inputs } => Invocation::Action {
                reference: action.clone(),
                inputs: inputs
                    .iter()
                    .map(|(k, t)| (k.clone(), t.render_zeroizing(&values)))
                    .collect(),
            },
        };
        debug!("Step {} env keys: {:?}", step.label(), env.keys().collect::<Vec<_>>());

        ExecRequest {
            invocation,
            env,
            working_directory: step.working_directory.clone(),
            output: Some(Arc::new(MaskingSink {
                secrets: context.secrets().clone(),
                events: self.events.clone(),
                execution_id: target.execution_id,
                job: target.job.id.clone(),
                step: step.index,
            })),
        }
    }

    fn finish(&self, target: &StepTarget<'_>, mut result: StepResult) -> StepResult {
        result.finished_at = Some(Utc::now());
        self.events.emit(ExecutionEvent::StepFinished {
            execution_id: target.execution_id,
            job: target.job.id.clone(),
            step: result.index,
            status: result.status,
            error: result.error.clone(),
        });
        result
    }
}
