//! Local process-backed provisioner
//!
//! Each job gets a fresh temporary workspace; every command runs as a new
//! process (in its own process group on Unix) with a cleared environment.

use super::{
    EnvironmentError, EnvironmentSpec, ExecEnv, ExecOutput, ExecRequest, Environment, Invocation, OutputSink,
    OutputStream, Provisioner,
};
use crate::core::{settings::EnvironmentSettings, step::Shell, trigger::RefType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Captured output beyond this is dropped (the stream is still drained)
const MAX_CAPTURED_BYTES: usize = 1024 * 1024;

/// Provisioner that runs jobs as local processes
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    labels: Vec<String>,
    source_dir: Option<PathBuf>,
    actions: Arc<BTreeMap<String, String>>,
}

impl LocalProvisioner {
    pub fn new(settings: &EnvironmentSettings) -> Self {
        Self {
            labels: settings.labels.clone(),
            source_dir: settings.source_dir.clone(),
            actions: Arc::new(settings.actions.clone()),
        }
    }

    fn accepts(&self, runs_on: &[String]) -> bool {
        self.labels.is_empty() || runs_on.iter().all(|l| self.labels.contains(l))
    }

    fn base_env(&self, spec: &EnvironmentSpec, workspace: &Path) -> BTreeMap<String, String> {
        let refs = &spec.ref_context;
        let mut env = BTreeMap::new();

        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
        let workspace = workspace.to_string_lossy().to_string();
        env.insert("HOME".to_string(), workspace.clone());
        env.insert("CI".to_string(), "true".to_string());
        env.insert("GITHUB_WORKSPACE".to_string(), workspace);
        env.insert("GITHUB_RUN_ID".to_string(), spec.execution_id.to_string());
        env.insert("GITHUB_WORKFLOW".to_string(), spec.pipeline.clone());
        env.insert("GITHUB_JOB".to_string(), spec.job.clone());
        env.insert("GITHUB_EVENT_NAME".to_string(), refs.event.as_str().to_string());
        env.insert("GITHUB_REF".to_string(), refs.git_ref.clone());
        env.insert("GITHUB_REF_NAME".to_string(), refs.ref_name.clone());
        env.insert(
            "GITHUB_REF_TYPE".to_string(),
            match refs.ref_type {
                RefType::Branch => "branch",
                RefType::Tag => "tag",
            }
            .to_string(),
        );
        let optional = [
            ("GITHUB_BASE_REF", &refs.base_ref),
            ("GITHUB_HEAD_REF", &refs.head_ref),
            ("GITHUB_SHA", &refs.sha),
            ("GITHUB_ACTOR", &refs.actor),
            ("GITHUB_REPOSITORY", &refs.repository),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                env.insert(key.to_string(), value.clone());
            }
        }
        if let Some(source) = &self.source_dir {
            env.insert("CI_SOURCE_DIR".to_string(), source.to_string_lossy().to_string());
        }
        env
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(&self, spec: &EnvironmentSpec) -> Result<Box<dyn Environment>, EnvironmentError> {
        if !self.accepts(&spec.runs_on) {
            return Err(EnvironmentError::Unsupported {
                labels: spec.runs_on.clone(),
            });
        }

        let workspace = tempfile::Builder::new()
            .prefix(&format!("pipeline-{}-", spec.job))
            .tempdir()
            .map_err(|e| EnvironmentError::Provision(e.to_string()))?;

        let id = format!("local-{}-{}", spec.job, &spec.execution_id.simple().to_string()[..8]);
        debug!(environment = %id, workspace = %workspace.path().display(), "Provisioned local environment");

        Ok(Box::new(LocalEnvironment {
            id,
            base_env: self.base_env(spec, workspace.path()),
            workspace,
            actions: self.actions.clone(),
        }))
    }
}

/// One job's workspace; removed on release (or drop)
#[derive(Debug)]
pub struct LocalEnvironment {
    id: String,
    workspace: TempDir,
    base_env: BTreeMap<String, String>,
    actions: Arc<BTreeMap<String, String>>,
}

/// Environment variable name of an action input
fn input_variable(name: &str) -> String {
    format!("INPUT_{}", name.replace([' ', '-'], "_").to_uppercase())
}

impl LocalEnvironment {
    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    fn command_line(&self, invocation: &Invocation) -> Result<(Vec<String>, ExecEnv), EnvironmentError> {
        match invocation {
            Invocation::Shell { script, shell } => Ok((shell_args(*shell, script), ExecEnv::new())),
            Invocation::Action { reference, inputs } => {
                let name = reference.split('@').next().unwrap_or(reference);
                let script = self
                    .actions
                    .get(name)
                    .ok_or_else(|| EnvironmentError::UnknownAction(reference.clone()))?;
                let env = inputs
                    .iter()
                    .map(|(k, v)| (input_variable(k), v.clone()))
                    .collect();
                Ok((shell_args(Shell::Sh, script), env))
            }
        }
    }

    fn working_directory(&self, relative: Option<&str>) -> Result<PathBuf, EnvironmentError> {
        let Some(relative) = relative else {
            return Ok(self.workspace.path().to_path_buf());
        };
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        let dir = self.workspace.path().join(path);
        if escapes || !dir.is_dir() {
            return Err(EnvironmentError::InvalidWorkingDirectory(relative.to_string()));
        }
        Ok(dir)
    }
}

fn shell_args(shell: Shell, script: &str) -> Vec<String> {
    let args: &[&str] = match shell {
        Shell::Sh => &["sh", "-e", "-c"],
        Shell::Bash => &["bash", "--noprofile", "--norc", "-eo", "pipefail", "-c"],
    };
    args.iter()
        .map(|a| a.to_string())
        .chain(std::iter::once(script.to_string()))
        .collect()
}

fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Output is not required to be UTF-8; keep draining either way
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches('\n').trim_end_matches('\r');
                    if tx.send((stream, line.to_string())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("error reading process output: {}", e);
                    break;
                }
            }
        }
    });
}

struct Capture {
    output: String,
    truncated: bool,
    sink: Option<Arc<dyn OutputSink>>,
}

impl Capture {
    fn push(&mut self, stream: OutputStream, line: &str) {
        if let Some(sink) = &self.sink {
            sink.on_line(stream, line);
        }
        if self.output.len() + line.len() + 1 > MAX_CAPTURED_BYTES {
            self.truncated = true;
            return;
        }
        self.output.push_str(line);
        self.output.push('\n');
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput, EnvironmentError> {
        let (argv, action_env) = self.command_line(&request.invocation)?;
        let cwd = self.working_directory(request.working_directory.as_deref())?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(&self.base_env)
            .envs(request.env.iter().map(|(k, v)| (k, v.as_str())))
            .envs(action_env.iter().map(|(k, v)| (k, v.as_str())))
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(EnvironmentError::Spawn)?;
        let group = ProcessGroup::new(child.id());
        debug!(environment = %self.id, pid = ?child.id(), "Spawned step process");

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, OutputStream::Stderr, tx);
        }

        let mut capture = Capture {
            output: String::new(),
            truncated: false,
            sink: request.output,
        };
        let mut streams_open = true;

        let status = loop {
            tokio::select! {
                line = rx.recv(), if streams_open => match line {
                    Some((stream, line)) => capture.push(stream, &line),
                    None => streams_open = false,
                },
                status = child.wait() => break status.map_err(EnvironmentError::Wait)?,
            }
        };

        // Background processes left by the step would hold the pipes open
        drop(group);
        while let Some((stream, line)) = rx.recv().await {
            capture.push(stream, &line);
        }

        Ok(ExecOutput {
            exit_code: status.code(),
            output: capture.output,
            truncated: capture.truncated,
        })
    }

    async fn release(self: Box<Self>) -> Result<(), EnvironmentError> {
        debug!(environment = %self.id, "Releasing local environment");
        self.workspace
            .close()
            .map_err(|e| EnvironmentError::Release(e.to_string()))
    }
}

/// Kills the whole process group of a step when dropped
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "failed to kill process group"),
            }
        }
    }
}
