//! Process executor
//!
//! Spawns one shell command per call and supervises it until it is reaped.
//! Two backends sit behind [`ShellExecutionService::execute`]: plain pipes
//! and a pseudo-terminal. Both report through the same event callback and
//! resolve to the same [`ExecutionResult`].
//!
//! Cancellation signals the whole process group with SIGTERM and escalates
//! to SIGKILL after the configured grace period.

mod output;
mod pipe;
mod pty;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::config::ShellConfig;

pub use output::{is_binary, signal_name, strip_ansi, OutputCollector, Utf8Decoder, SNIFF_LIMIT};

/// Which backend ran the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMethod {
    Pipe,
    Pty,
}

impl fmt::Display for ExecutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMethod::Pipe => write!(f, "pipe"),
            ExecutionMethod::Pty => write!(f, "pty"),
        }
    }
}

/// Origin of a data chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Event delivered to the output callback as data arrives
#[derive(Debug, Clone, PartialEq)]
pub enum ShellOutputEvent {
    /// Decoded text; PTY output is always reported as stdout
    Data { stream: OutputStream, chunk: String },
    /// Sent once; no text is decoded afterwards
    BinaryDetected,
    BinaryProgress { bytes_received: usize },
}

/// Observer for output events
pub type OutputCallback = Arc<dyn Fn(ShellOutputEvent) + Send + Sync>;

/// Callback that discards every event
pub fn ignore_output() -> OutputCallback {
    Arc::new(|_| {})
}

/// Terminal state of one execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Exit code; `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Name of the terminating signal
    pub signal: Option<String>,
    /// Decoded text of both streams in arrival order
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip)]
    pub raw_output: Vec<u8>,
    /// Set only when the process could not be spawned or waited on
    pub error: Option<String>,
    /// Cancellation was requested before the process was reaped
    pub aborted: bool,
    pub pid: Option<u32>,
    pub method: ExecutionMethod,
}

impl ExecutionResult {
    /// Exit code 0 with no signal; the only unconditional success
    pub fn is_clean_exit(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }

    pub(crate) fn failed(error: impl Into<String>, pid: Option<u32>, method: ExecutionMethod) -> Self {
        Self {
            exit_code: None,
            signal: None,
            output: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            raw_output: Vec::new(),
            error: Some(error.into()),
            aborted: false,
            pid,
            method,
        }
    }

    pub(crate) fn from_collector(
        collector: OutputCollector,
        pid: Option<u32>,
        method: ExecutionMethod,
    ) -> Self {
        Self {
            exit_code: None,
            signal: None,
            output: collector.output,
            stdout: collector.stdout,
            stderr: collector.stderr,
            raw_output: collector.raw_output,
            error: None,
            aborted: false,
            pid,
            method,
        }
    }
}

/// A running (or already failed) execution
pub struct ExecutionHandle {
    pub pid: Option<u32>,
    pub method: ExecutionMethod,
    task: JoinHandle<ExecutionResult>,
}

impl ExecutionHandle {
    pub(crate) fn new(pid: Option<u32>, method: ExecutionMethod, task: JoinHandle<ExecutionResult>) -> Self {
        Self { pid, method, task }
    }

    fn spawn_failed(error: String, method: ExecutionMethod) -> Self {
        let task = tokio::spawn(async move { ExecutionResult::failed(error, None, method) });
        Self::new(None, method, task)
    }

    /// Wait for the process to be reaped
    pub async fn result(self) -> ExecutionResult {
        let (pid, method) = (self.pid, self.method);
        match self.task.await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failed(format!("supervisor task failed: {}", e), pid, method),
        }
    }
}

/// Executor settings resolved from configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Default backend when the caller does not choose
    pub use_pty: bool,
    /// Time between SIGTERM and SIGKILL on cancellation
    pub kill_grace_period: Duration,
    pub pty_rows: u16,
    pub pty_cols: u16,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ShellConfig::default())
    }
}

impl From<&ShellConfig> for ExecutorConfig {
    fn from(config: &ShellConfig) -> Self {
        Self {
            use_pty: config.use_pty,
            kill_grace_period: Duration::from_millis(config.kill_grace_period_ms),
            pty_rows: config.pty_rows,
            pty_cols: config.pty_cols,
        }
    }
}

/// Spawns and supervises shell commands
#[derive(Debug, Clone, Default)]
pub struct ShellExecutionService {
    config: ExecutorConfig,
}

impl ShellExecutionService {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start `command` in `cwd`.
    ///
    /// Must be called inside a tokio runtime. A PTY that cannot be opened
    /// falls back to pipes; a command that cannot be spawned at all yields a
    /// handle whose result carries `error`.
    pub fn execute(
        &self,
        command: &str,
        cwd: &Path,
        on_output: OutputCallback,
        cancel: CancellationToken,
        use_pty: bool,
    ) -> ExecutionHandle {
        if use_pty {
            match pty::spawn(command, cwd, &self.config, on_output.clone(), cancel.clone()) {
                Ok(handle) => return handle,
                Err(e) => tracing::warn!(error = %e, "pty unavailable, falling back to pipes"),
            }
        }

        match pipe::spawn(command, cwd, &self.config, on_output, cancel) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(command, cwd = %cwd.display(), error = %e, "failed to spawn command");
                ExecutionHandle::spawn_failed(e.to_string(), ExecutionMethod::Pipe)
            }
        }
    }
}

/// Signal a whole process group
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: i32) {
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if rc != 0 {
        tracing::debug!(pid, signal, error = %std::io::Error::last_os_error(), "killpg failed");
    } else {
        tracing::debug!(pid, signal = %signal_name(signal), "signalled process group");
    }
}

#[cfg(unix)]
pub(crate) const TERMINATE: i32 = libc::SIGTERM;
#[cfg(unix)]
pub(crate) const FORCE_KILL: i32 = libc::SIGKILL;

/// Draining stops once no chunk arrives for this long after exit
pub(crate) const DRAIN_IDLE: Duration = Duration::from_millis(250);
