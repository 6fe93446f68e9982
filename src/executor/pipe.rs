//! Pipe backend: `tokio::process` with stdout and stderr captured separately

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ExecutionHandle, ExecutionMethod, ExecutionResult, ExecutorConfig, OutputCallback,
    OutputCollector, OutputStream, DRAIN_IDLE,
};

/// Command running `command` under the host shell
pub(super) fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd.exe");
        cmd.arg("/c").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        cmd
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}

pub(super) fn spawn(
    command: &str,
    cwd: &Path,
    config: &ExecutorConfig,
    on_output: OutputCallback,
    cancel: CancellationToken,
) -> std::io::Result<ExecutionHandle> {
    let mut cmd = shell_command(command);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    tracing::debug!(command, pid, "spawned process");

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, OutputStream::Stderr, tx));
    }

    let grace = config.kill_grace_period;

    let task = tokio::spawn(async move {
        let mut collector = OutputCollector::new();
        let mut kill_deadline: Option<tokio::time::Instant> = None;
        let mut force_killed = false;

        // a cancel that lands after the reap, while output drains, does not count
        let (status, aborted) = loop {
            tokio::select! {
                Some((stream, bytes)) = rx.recv() => {
                    for event in collector.push(stream, &bytes) {
                        on_output(event);
                    }
                }
                status = child.wait() => break (status, cancel.is_cancelled()),
                _ = cancel.cancelled(), if kill_deadline.is_none() => {
                    tracing::debug!(pid, "cancellation requested, terminating process group");
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        super::signal_group(pid, super::TERMINATE);
                    }
                    #[cfg(not(unix))]
                    let _ = child.start_kill();
                    kill_deadline = Some(tokio::time::Instant::now() + grace);
                }
                _ = async {
                    match kill_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                }, if kill_deadline.is_some() && !force_killed => {
                    tracing::debug!(pid, "grace period elapsed, killing process group");
                    force_killed = true;
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        super::signal_group(pid, super::FORCE_KILL);
                    }
                    let _ = child.start_kill();
                }
            }
        };

        while let Ok(Some((stream, bytes))) = tokio::time::timeout(DRAIN_IDLE, rx.recv()).await {
            for event in collector.push(stream, &bytes) {
                on_output(event);
            }
        }
        for event in collector.finish() {
            on_output(event);
        }

        let mut result = ExecutionResult::from_collector(collector, pid, ExecutionMethod::Pipe);
        result.aborted = aborted;

        match status {
            Ok(status) => {
                result.exit_code = status.code();
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    result.signal = status.signal().map(super::signal_name);
                }
            }
            Err(e) => result.error = Some(format!("failed to wait for process: {}", e)),
        }

        tracing::debug!(
            pid,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            aborted,
            "process reaped"
        );
        result
    });

    Ok(ExecutionHandle::new(pid, ExecutionMethod::Pipe, task))
}
