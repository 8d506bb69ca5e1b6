//! Test utilities: a scripted provisioner and result assertions

#![allow(dead_code)]

use async_trait::async_trait;
use pipeline_engine::core::{
    pipeline::{build, PipelineDefinition},
    settings::EngineSettings,
    state::{JobResult, JobStatus, PipelineResult, PipelineStatus, StepResult, StepStatus},
    trigger::Event,
};
use pipeline_engine::environment::{
    Environment, EnvironmentError, EnvironmentSpec, ExecOutput, ExecRequest, Invocation, OutputStream, Provisioner,
};
use pipeline_engine::execution::{ExecutionEngine, ExecutionEvent, TriggerOutcome};
use pipeline_engine::report::ResultReporter;
use pipeline_engine::vault::{CredentialVault, SecretPolicy, StaticSecretStore};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Build-and-deploy pipeline used by the release scenarios
pub const RELEASE: &str = r#"
name: release
on:
  push:
    branches: [main]
jobs:
  build:
    runs-on: linux
    steps:
      - id: install-deps
        run: npm ci
      - id: compile
        run: npm run build
      - id: test
        run: npm test
  publish:
    runs-on: linux
    needs: build
    steps:
      - id: push-artifact
        run: ./push.sh --token "${{ secrets.REGISTRY_TOKEN }}"
        secrets: [REGISTRY_TOKEN]
"#;

pub const REGISTRY_TOKEN: &str = "tok-3f9a1c77e2";

/// What a scripted command does
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Exit 0 after printing the given lines
    Succeed(Vec<String>),
    /// Exit with the given code
    Fail(i32),
    /// Sleep, then exit with the given code
    Sleep(Duration, i32),
    /// Print every variable in the request environment, then exit 0
    EchoEnv,
    Panic,
}

/// One recorded command execution
#[derive(Debug, Clone)]
pub struct ExecRecord {
    pub job: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub finished: bool,
}

#[derive(Default)]
struct Shared {
    rules: Mutex<Vec<(String, Behavior)>>,
    execs: Mutex<Vec<ExecRecord>>,
    /// "start:<job>:<command>" / "finish:<job>:<command>" / "dropped:<job>:<command>"
    timeline: Mutex<Vec<String>>,
    provisioned: AtomicUsize,
    released: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Provisioner whose environments run nothing; each command's behaviour is
/// chosen by the first rule whose pattern occurs in the command text
#[derive(Clone, Default)]
pub struct ScriptedProvisioner {
    shared: Arc<Shared>,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, pattern: &str, behavior: Behavior) -> Self {
        self.shared
            .rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), behavior));
        self
    }

    /// Every command started, in start order
    pub fn execs(&self) -> Vec<ExecRecord> {
        self.shared.execs.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.execs().into_iter().map(|e| e.command).collect()
    }

    pub fn commands_for(&self, job: &str) -> Vec<String> {
        self.execs()
            .into_iter()
            .filter(|e| e.job == job)
            .map(|e| e.command)
            .collect()
    }

    pub fn timeline(&self) -> Vec<String> {
        self.shared.timeline.lock().unwrap().clone()
    }

    pub fn provisioned(&self) -> usize {
        self.shared.provisioned.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Highest number of environments alive at once
    pub fn max_active(&self) -> usize {
        self.shared.max_active.load(Ordering::SeqCst)
    }

    fn behavior(&self, command: &str) -> Behavior {
        self.shared
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, behavior)| behavior.clone())
            .unwrap_or(Behavior::Succeed(Vec::new()))
    }

    /// Wait until a command containing `pattern` has started
    pub async fn wait_for_start(&self, pattern: &str) {
        for _ in 0..500 {
            if self.commands().iter().any(|c| c.contains(pattern)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("command containing {:?} never started", pattern);
    }
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    async fn provision(&self, spec: &EnvironmentSpec) -> Result<Box<dyn Environment>, EnvironmentError> {
        if spec.runs_on.iter().any(|l| l == "unavailable") {
            return Err(EnvironmentError::Unsupported {
                labels: spec.runs_on.clone(),
            });
        }
        self.shared.provisioned.fetch_add(1, Ordering::SeqCst);
        let active = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(ScriptedEnvironment {
            id: format!("scripted-{}", spec.job),
            job: spec.job.clone(),
            provisioner: self.clone(),
        }))
    }
}

struct ScriptedEnvironment {
    id: String,
    job: String,
    provisioner: ScriptedProvisioner,
}

/// Records `dropped:` when an exec future is abandoned before finishing
struct ExecGuard {
    shared: Arc<Shared>,
    label: String,
    done: bool,
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        if !self.done {
            self.shared
                .timeline
                .lock()
                .unwrap()
                .push(format!("dropped:{}", self.label));
        }
    }
}

#[async_trait]
impl Environment for ScriptedEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput, EnvironmentError> {
        let command = match &request.invocation {
            Invocation::Shell { script, .. } => script.clone(),
            Invocation::Action { reference, inputs } => {
                let inputs: BTreeMap<&str, &str> = inputs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                format!("uses {} {:?}", reference, inputs)
            }
        };
        let shared = self.provisioner.shared.clone();
        let index = {
            let mut execs = shared.execs.lock().unwrap();
            execs.push(ExecRecord {
                job: self.job.clone(),
                command: command.clone(),
                env: request.env.iter().map(|(k, v)| (k.clone(), v.as_str().to_string())).collect(),
                finished: false,
            });
            execs.len() - 1
        };
        let label = format!("{}:{}", self.job, command);
        shared.timeline.lock().unwrap().push(format!("start:{}", label));
        let mut guard = ExecGuard {
            shared: shared.clone(),
            label: label.clone(),
            done: false,
        };

        let emit = |line: &str| {
            if let Some(sink) = &request.output {
                sink.on_line(OutputStream::Stdout, line);
            }
        };

        let (exit_code, output) = match self.provisioner.behavior(&command) {
            Behavior::Succeed(lines) => {
                lines.iter().for_each(|l| emit(l));
                (0, lines.join("\n"))
            }
            Behavior::Fail(code) => {
                emit("error: command failed");
                (code, "error: command failed".to_string())
            }
            Behavior::Sleep(duration, code) => {
                tokio::time::sleep(duration).await;
                (code, String::new())
            }
            Behavior::EchoEnv => {
                let lines: Vec<String> = request.env.iter().map(|(k, v)| format!("{}={}", k, v.as_str())).collect();
                lines.iter().for_each(|l| emit(l));
                (0, lines.join("\n"))
            }
            Behavior::Panic => panic!("scripted panic in {}", label),
        };

        guard.done = true;
        shared.execs.lock().unwrap()[index].finished = true;
        shared.timeline.lock().unwrap().push(format!("finish:{}", label));
        Ok(ExecOutput {
            exit_code: Some(exit_code),
            output,
            truncated: false,
        })
    }

    async fn release(self: Box<Self>) -> Result<(), EnvironmentError> {
        let shared = &self.provisioner.shared;
        shared.released.fetch_add(1, Ordering::SeqCst);
        shared.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn definition(yaml: &str) -> Arc<PipelineDefinition> {
    Arc::new(build(yaml).expect("definition should build"))
}

/// Engine wired to a scripted provisioner, with every event captured
pub struct Harness {
    pub engine: Arc<ExecutionEngine>,
    pub provisioner: ScriptedProvisioner,
    pub events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl Harness {
    pub fn new(provisioner: ScriptedProvisioner) -> Self {
        Self::with_settings(provisioner, EngineSettings::default())
    }

    pub fn with_settings(provisioner: ScriptedProvisioner, settings: EngineSettings) -> Self {
        Self::build(provisioner, settings, None)
    }

    pub fn with_reporter(provisioner: ScriptedProvisioner, reporter: Arc<ResultReporter>) -> Self {
        Self::build(provisioner, EngineSettings::default(), Some(reporter))
    }

    fn build(provisioner: ScriptedProvisioner, settings: EngineSettings, reporter: Option<Arc<ResultReporter>>) -> Self {
        let store = StaticSecretStore::from_pairs([("REGISTRY_TOKEN", REGISTRY_TOKEN), ("DEPLOY_KEY", "dk-55aa")]);
        let vault = Arc::new(CredentialVault::new(Arc::new(store), SecretPolicy::protected_main()));
        let mut engine = ExecutionEngine::new(Arc::new(provisioner.clone()), vault, &settings);
        if let Some(reporter) = reporter {
            engine = engine.with_reporter(reporter);
        }
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.add_event_handler(move |event| sink.lock().unwrap().push(event));
        Self {
            engine: Arc::new(engine),
            provisioner,
            events,
        }
    }

    pub async fn trigger(&self, yaml: &str, event: Event) -> TriggerOutcome {
        self.engine.trigger(&event, definition(yaml)).await
    }

    /// Trigger and expect the pipeline to run
    pub async fn run(&self, yaml: &str, event: Event) -> Arc<PipelineResult> {
        match self.trigger(yaml, event).await {
            TriggerOutcome::Completed(result) => result,
            TriggerOutcome::NotTriggered(ctx) => panic!("pipeline not triggered for {}", ctx.git_ref),
        }
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }
}

pub fn job<'a>(result: &'a PipelineResult, id: &str) -> &'a JobResult {
    result
        .job(id)
        .unwrap_or_else(|| panic!("job {} missing from result", id))
}

pub fn step<'a>(result: &'a PipelineResult, job_id: &str, step_id: &str) -> &'a StepResult {
    job(result, job_id)
        .step(step_id)
        .unwrap_or_else(|| panic!("step {}.{} missing from result", job_id, step_id))
}

pub fn assert_pipeline_status(result: &PipelineResult, expected: PipelineStatus) {
    assert_eq!(
        result.status, expected,
        "pipeline status; jobs: {:?}",
        result.jobs.iter().map(|j| (&j.job_id, j.status)).collect::<Vec<_>>()
    );
}

pub fn assert_job_status(result: &PipelineResult, job_id: &str, expected: JobStatus) {
    let job = job(result, job_id);
    assert_eq!(job.status, expected, "job {} (reason: {:?})", job_id, job.reason);
}

pub fn assert_step_status(result: &PipelineResult, job_id: &str, step_id: &str, expected: StepStatus) {
    let step = step(result, job_id, step_id);
    assert_eq!(step.status, expected, "step {}.{} (error: {:?})", job_id, step_id, step.error);
}

/// No serialized form of the result carries `secret`
pub fn assert_secret_absent(result: &PipelineResult, secret: &str) {
    let json = serde_json::to_string(result).unwrap();
    assert!(!json.contains(secret), "secret leaked into result: {}", json);
    let debug = format!("{:?}", result);
    assert!(!debug.contains(secret), "secret leaked into result debug output");
}
