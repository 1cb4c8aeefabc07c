//! Runner module for executing the analysis pipeline.
//!
//! Key responsibilities:
//! - Spawn exactly one child per call with a fully replaced environment
//! - Capture stdout/stderr in full (bounded) while waiting
//! - Kill the child's whole process group on timeout or cancellation, then
//!   reap it
//! - Log failures with the command and captured output
//!
//! There are no retries: pipeline runs are long and not idempotent.

use gear_core::command::display_command;
use gear_core::{Environment, ExecutionResult};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between heartbeat log messages while the pipeline runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout for collecting stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured from each of stdout and stderr.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Read from an async reader with a maximum byte limit.
///
/// Returns the buffer truncated at `max_bytes`; the rest is drained.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

/// Collect a capture task's buffer, logging instead of failing.
async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &'static str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// Kill the child and everything it spawned, then reap the child.
///
/// The child leads its own process group, so grandchildren that still hold
/// the output pipes or write into the session directory die with it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(pid, error = %err, "failed to kill pipeline process group");
        }
    }
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill pipeline process");
    }
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command failed with exit code {}", .0.exit_code)]
    CommandFailed(ExecutionResult),
    #[error("command terminated by signal")]
    Signaled(ExecutionResult),
    #[error("timeout after {0} seconds")]
    Timeout(u32),
    #[error("cancelled")]
    Cancelled,
}

impl RunnerError {
    /// Process exit code this failure maps to: the child's own code when it
    /// exited non-zero, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandFailed(result) if result.exit_code != 0 => result.exit_code,
            _ => 1,
        }
    }

    /// Whether the child never started.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            Self::EmptyCommand | Self::ExecutableNotFound(_) | Self::Spawn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runner configuration.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Timeout in seconds (0 = no timeout).
    pub timeout_sec: u32,
    /// Log the command instead of running it.
    pub dry_run: bool,
}

impl RunnerConfig {
    /// Create from gear runtime settings.
    pub fn from_settings(settings: &gear_core::GearSettings) -> Self {
        Self {
            timeout_sec: settings.timeout_sec,
            dry_run: settings.dry_run,
        }
    }
}

/// Runner for the external pipeline executable.
#[derive(Debug)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    /// Create a new runner with the given configuration.
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `command` with exactly `environment` as the child environment.
    ///
    /// In dry-run mode the command is only logged and a zero exit code is
    /// returned. A non-zero exit is returned as `CommandFailed` carrying the
    /// captured output.
    pub async fn run(
        &self,
        command: &[String],
        environment: &Environment,
        cancel_token: CancellationToken,
    ) -> Result<ExecutionResult> {
        let rendered = display_command(command);
        let Some((program, args)) = command.split_first() else {
            return Err(RunnerError::EmptyCommand);
        };

        info!(command = %rendered, "pipeline command line");

        if self.config.dry_run {
            info!("dry run; not executing command");
            return Ok(ExecutionResult::default());
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %program, env_vars = environment.len(), "spawning pipeline process");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::ExecutableNotFound(program.clone())
            } else {
                RunnerError::Spawn {
                    program: program.clone(),
                    source: e,
                }
            }
        })?;

        // Drain both pipes while waiting so a chatty child never blocks.
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let timeout_duration = Duration::from_secs(u64::from(self.config.timeout_sec));

        let outcome = loop {
            let elapsed = started.elapsed();

            if self.config.timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(timeout_sec = self.config.timeout_sec, "pipeline timed out; killing");
                terminate(&mut child).await;
                break ProcessOutcome::TimedOut;
            }

            let remaining_timeout = if self.config.timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };
            let sleep_duration = HEARTBEAT_INTERVAL.min(remaining_timeout);

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessOutcome::Completed(status),
                        Err(e) => return Err(RunnerError::Io(e)),
                    }
                }
                () = cancel_token.cancelled() => {
                    info!("cancellation requested; killing pipeline process");
                    terminate(&mut child).await;
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    info!(elapsed_sec = started.elapsed().as_secs(), "pipeline still running");
                }
            }
        };

        let (stdout, stderr) = tokio::join!(
            collect(stdout_task, "stdout"),
            collect(stderr_task, "stderr")
        );
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            ProcessOutcome::TimedOut => Err(RunnerError::Timeout(self.config.timeout_sec)),
            ProcessOutcome::Cancelled => Err(RunnerError::Cancelled),
            ProcessOutcome::Completed(status) => {
                let result = ExecutionResult {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                };

                info!(exit_code = result.exit_code, duration_ms, "pipeline exited");
                if !result.stdout.is_empty() {
                    info!("pipeline stdout:\n{}", result.stdout);
                }

                if result.success() {
                    return Ok(result);
                }

                error!(command = %rendered, "the command failed; see log for debugging");
                error!("pipeline stdout:\n{}", result.stdout);
                error!("pipeline stderr:\n{}", result.stderr);

                if status.code().is_none() {
                    Err(RunnerError::Signaled(result))
                } else {
                    Err(RunnerError::CommandFailed(result))
                }
            }
        }
    }
}
