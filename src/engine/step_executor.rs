//! Step execution
//!
//! Runs one resolved step, either as an external process through a shell or
//! as an in-process built-in action. The executor owns only the lifecycle of
//! the process it spawns: it captures output, enforces the timeout and kills
//! the process on cancellation. Job state is never touched here.
//!
//! Step processes get a cleared environment. Only a small set of host
//! variables is passed through; everything else must be bound explicitly.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::engine::cancel::CancelSignal;
use crate::engine::error::StepError;
use crate::workflow::BuiltinAction;

/// Host variables visible to step processes
pub const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "TMPDIR"];

/// How long to keep reading pipes once the process is gone
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A fully rendered step, ready to run
#[derive(Clone)]
pub struct StepInvocation {
    pub job: String,
    pub step: String,
    pub action: InvocationAction,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub enum InvocationAction {
    Script {
        script: String,
        shell: String,
    },
    Builtin {
        action: BuiltinAction,
        inputs: BTreeMap<String, String>,
    },
}

// Rendered scripts and env values may contain secrets
impl fmt::Debug for StepInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInvocation")
            .field("job", &self.job)
            .field("step", &self.step)
            .field("action", &self.action)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("working_directory", &self.working_directory)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl fmt::Debug for InvocationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationAction::Script { shell, .. } => f
                .debug_struct("Script")
                .field("shell", shell)
                .finish_non_exhaustive(),
            InvocationAction::Builtin { action, .. } => f
                .debug_struct("Builtin")
                .field("action", &action.name())
                .finish_non_exhaustive(),
        }
    }
}

/// What a step produced. Text is raw; callers redact it.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<StepError>,
    pub duration: Duration,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    fn failed(error: StepError, started: Instant) -> Self {
        Self {
            error: Some(error),
            duration: started.elapsed(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, invocation: &StepInvocation, cancel: CancelSignal) -> StepOutput;
}

/// Runs scripts as host processes
#[derive(Debug, Clone)]
pub struct ShellStepExecutor {
    passthrough: Vec<String>,
}

impl Default for ShellStepExecutor {
    fn default() -> Self {
        Self {
            passthrough: PASSTHROUGH_ENV.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ShellStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of host variables passed through to step processes
    pub fn with_passthrough<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.passthrough = names.into_iter().map(Into::into).collect();
        self
    }

    async fn run_script(
        &self,
        invocation: &StepInvocation,
        script: &str,
        shell: &str,
        mut cancel: CancelSignal,
    ) -> StepOutput {
        let started = Instant::now();

        let (program, args) = match resolve_shell(shell) {
            Ok(resolved) => resolved,
            Err(e) => return StepOutput::failed(e, started),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.arg(script);
        cmd.env_clear();
        for name in &self.passthrough {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        cmd.envs(&invocation.env);
        if let Some(dir) = &invocation.working_directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StepOutput::failed(
                    StepError::Spawn {
                        program: program.display().to_string(),
                        message: e.to_string(),
                    },
                    started,
                )
            }
        };
        debug!(program = %program.display(), pid = ?child.id(), "Spawned step process");

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture(stdout, stdout_buf.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture(stderr, stderr_buf.clone())));
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(invocation.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill step process");
            }
        }

        // Background children can hold the pipes open after the shell exits
        let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            debug!("Output pipes still open after drain grace, detaching readers");
            for reader in &readers {
                reader.abort();
            }
        }

        let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_buf.lock().await).into_owned();

        let (exit_code, error) = match outcome {
            Outcome::TimedOut => {
                warn!(timeout_ms = invocation.timeout.as_millis() as u64, "Step timed out");
                (None, Some(StepError::timeout(invocation.timeout)))
            }
            Outcome::Cancelled => (None, Some(StepError::Cancelled)),
            Outcome::Exited(Err(e)) => (
                None,
                Some(StepError::Execution {
                    exit_code: -1,
                    message: format!("failed to wait for process: {}", e),
                }),
            ),
            Outcome::Exited(Ok(status)) => match status.code() {
                Some(0) => (Some(0), None),
                Some(code) => (
                    Some(code),
                    Some(StepError::Execution {
                        exit_code: code,
                        message: failure_message(&stderr, code),
                    }),
                ),
                None => (
                    None,
                    Some(StepError::Execution {
                        exit_code: -1,
                        message: "process terminated by signal".to_string(),
                    }),
                ),
            },
        };

        StepOutput {
            exit_code,
            stdout,
            stderr,
            error,
            duration: started.elapsed(),
        }
    }

    async fn run_builtin(
        &self,
        invocation: &StepInvocation,
        action: BuiltinAction,
        inputs: &BTreeMap<String, String>,
        mut cancel: CancelSignal,
    ) -> StepOutput {
        let started = Instant::now();

        match action {
            BuiltinAction::WaitMs => {
                let raw = inputs.get("duration").map(String::as_str).unwrap_or("");
                let Ok(ms) = raw.trim().parse::<u64>() else {
                    return StepOutput::failed(
                        StepError::invalid_input(format!("invalid duration '{}'", raw)),
                        started,
                    );
                };

                let error = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => None,
                    _ = tokio::time::sleep(invocation.timeout) => {
                        Some(StepError::timeout(invocation.timeout))
                    }
                    _ = cancel.cancelled() => Some(StepError::Cancelled),
                };

                StepOutput {
                    exit_code: error.is_none().then_some(0),
                    error,
                    duration: started.elapsed(),
                    ..Default::default()
                }
            }

            BuiltinAction::FailNow => {
                let message = inputs
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| "step failed".to_string());
                let exit_code = match inputs.get("exit_code") {
                    Some(raw) => match raw.trim().parse::<i32>() {
                        Ok(code) if code != 0 => code,
                        _ => {
                            return StepOutput::failed(
                                StepError::invalid_input(format!("invalid exit_code '{}'", raw)),
                                started,
                            )
                        }
                    },
                    None => 1,
                };

                StepOutput {
                    exit_code: Some(exit_code),
                    stdout: String::new(),
                    stderr: message.clone(),
                    error: Some(StepError::Execution { exit_code, message }),
                    duration: started.elapsed(),
                }
            }

            // The graph builder turns `shell/exec` into a script
            BuiltinAction::ShellExec => match inputs.get("command") {
                Some(command) => {
                    let shell = default_shell();
                    self.run_script(invocation, command, &shell, cancel).await
                }
                None => StepOutput::failed(
                    StepError::invalid_input("'shell/exec' requires 'command'"),
                    started,
                ),
            },
        }
    }
}

#[async_trait]
impl StepExecutor for ShellStepExecutor {
    #[instrument(skip_all, fields(job = %invocation.job, step = %invocation.step))]
    async fn execute(&self, invocation: &StepInvocation, cancel: CancelSignal) -> StepOutput {
        if cancel.is_cancelled() {
            return StepOutput::failed(StepError::Cancelled, Instant::now());
        }

        match &invocation.action {
            InvocationAction::Script { script, shell } => {
                self.run_script(invocation, script, shell, cancel).await
            }
            InvocationAction::Builtin { action, inputs } => {
                self.run_builtin(invocation, *action, inputs, cancel).await
            }
        }
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Resolve a shell setting (`bash`, `sh`, `python3 -u -c`) to a program and its arguments
fn resolve_shell(shell: &str) -> Result<(PathBuf, Vec<String>), StepError> {
    let mut parts = shell.split_whitespace();
    let name = parts.next().unwrap_or("sh");
    let extra: Vec<String> = parts.map(String::from).collect();

    let program = which::which(name).map_err(|e| StepError::Spawn {
        program: name.to_string(),
        message: e.to_string(),
    })?;

    if !extra.is_empty() {
        return Ok((program, extra));
    }

    let base = program
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_string();
    let args = match base.as_str() {
        "sh" | "bash" | "dash" | "zsh" | "ksh" => vec!["-e".to_string(), "-c".to_string()],
        "pwsh" | "powershell" => vec![
            "-NoLogo".to_string(),
            "-NoProfile".to_string(),
            "-Command".to_string(),
        ],
        _ => vec!["-c".to_string()],
    };
    Ok((program, args))
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.lock().await.extend_from_slice(&chunk[..n]),
        }
    }
}

fn failure_message(stderr: &str, code: i32) -> String {
    match stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => format!("process exited with code {}: {}", code, line),
        None => format!("process exited with code {}", code),
    }
}
