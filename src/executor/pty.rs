//! Pseudo-terminal backend built on `portable-pty`
//!
//! The PTY merges stdout and stderr into one stream and adds terminal
//! echo and formatting. Reads and waits are blocking calls, so both run on
//! the blocking pool and report back over channels.

use std::io::Read;
use std::path::Path;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    ExecutionHandle, ExecutionMethod, ExecutionResult, ExecutorConfig, OutputCallback,
    OutputCollector, OutputStream, DRAIN_IDLE,
};
use crate::core::{GantryError, Result};

fn pty_error(e: impl std::fmt::Display) -> GantryError {
    GantryError::Pty(e.to_string())
}

fn shell_builder(command: &str, cwd: &Path) -> CommandBuilder {
    #[cfg(windows)]
    let mut builder = {
        let mut builder = CommandBuilder::new("cmd.exe");
        builder.args(["/c", command]);
        builder
    };
    #[cfg(not(windows))]
    let mut builder = {
        let mut builder = CommandBuilder::new("bash");
        builder.args(["-c", command]);
        builder
    };
    builder.cwd(cwd);
    builder
}

pub(super) fn spawn(
    command: &str,
    cwd: &Path,
    config: &ExecutorConfig,
    on_output: OutputCallback,
    cancel: CancellationToken,
) -> Result<ExecutionHandle> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: config.pty_rows,
            cols: config.pty_cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(pty_error)?;

    let mut child = pair
        .slave
        .spawn_command(shell_builder(command, cwd))
        .map_err(pty_error)?;
    // the child holds its own copy; ours would keep the master from seeing EOF
    drop(pair.slave);

    let pid = child.process_id();
    let mut killer = child.clone_killer();
    let mut reader = pair.master.try_clone_reader().map_err(pty_error)?;
    let master = pair.master;
    tracing::debug!(command, pid, "spawned process in pty");

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            // EIO once the slave side is closed is the PTY's end of file
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (exit_tx, mut exit_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = exit_tx.send(child.wait());
    });

    let grace = config.kill_grace_period;

    let task = tokio::spawn(async move {
        let mut collector = OutputCollector::new();
        let mut kill_deadline: Option<tokio::time::Instant> = None;
        let mut sent_signal: Option<String> = None;

        // a cancel that lands after the reap, while output drains, does not count
        let (status, aborted) = loop {
            tokio::select! {
                Some(bytes) = rx.recv() => {
                    for event in collector.push(OutputStream::Stdout, &bytes) {
                        on_output(event);
                    }
                }
                status = &mut exit_rx => break (status, cancel.is_cancelled()),
                _ = cancel.cancelled(), if kill_deadline.is_none() => {
                    tracing::debug!(pid, "cancellation requested, terminating pty process group");
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        super::signal_group(pid, super::TERMINATE);
                        sent_signal = Some(super::signal_name(super::TERMINATE));
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = killer.kill();
                        sent_signal = Some("SIGKILL".to_string());
                    }
                    kill_deadline = Some(tokio::time::Instant::now() + grace);
                }
                _ = async {
                    match kill_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                }, if kill_deadline.is_some() && sent_signal.as_deref() != Some("SIGKILL") => {
                    tracing::debug!(pid, "grace period elapsed, killing pty process group");
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        super::signal_group(pid, super::FORCE_KILL);
                    }
                    let _ = killer.kill();
                    sent_signal = Some("SIGKILL".to_string());
                }
            }
        };

        while let Ok(Some(bytes)) = tokio::time::timeout(DRAIN_IDLE, rx.recv()).await {
            for event in collector.push(OutputStream::Stdout, &bytes) {
                on_output(event);
            }
        }
        for event in collector.finish() {
            on_output(event);
        }
        drop(master);

        let mut result = ExecutionResult::from_collector(collector, pid, ExecutionMethod::Pty);
        result.aborted = aborted;

        match status {
            Ok(Ok(status)) => match sent_signal {
                // the pty layer reports no signal; record the one we delivered
                Some(signal) => result.signal = Some(signal),
                None => result.exit_code = Some(status.exit_code() as i32),
            },
            Ok(Err(e)) => result.error = Some(format!("failed to wait for process: {}", e)),
            Err(_) => result.error = Some("pty wait task ended unexpectedly".to_string()),
        }

        tracing::debug!(
            pid,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            aborted,
            "pty process reaped"
        );
        result
    });

    Ok(ExecutionHandle::new(pid, ExecutionMethod::Pty, task))
}
