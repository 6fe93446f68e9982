//! Process executor tests
//!
//! Spawn real shell commands; unix only.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gantry::executor::{
    ignore_output, ExecutionMethod, ExecutorConfig, OutputCallback, OutputStream,
    ShellExecutionService, ShellOutputEvent,
};
use tokio_util::sync::CancellationToken;

fn recorder() -> (OutputCallback, Arc<Mutex<Vec<ShellOutputEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: OutputCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
    (callback, events)
}

#[tokio::test]
async fn test_echo_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let service = ShellExecutionService::default();

    let handle = service.execute(
        "echo hello",
        dir.path(),
        ignore_output(),
        CancellationToken::new(),
        false,
    );
    assert!(handle.pid.is_some());
    let result = handle.result().await;

    assert!(result.is_clean_exit());
    assert!(!result.aborted);
    assert_eq!(result.output.trim(), "hello");
    assert_eq!(result.method, ExecutionMethod::Pipe);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_runs_in_requested_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

    let result = ShellExecutionService::default()
        .execute("ls", dir.path(), ignore_output(), CancellationToken::new(), false)
        .result()
        .await;
    assert!(result.stdout.contains("marker.txt"));
}

#[tokio::test]
async fn test_stderr_is_reported_separately() {
    let dir = tempfile::tempdir().unwrap();
    let (callback, events) = recorder();

    let result = ShellExecutionService::default()
        .execute("echo oops 1>&2; exit 3", dir.path(), callback, CancellationToken::new(), false)
        .result()
        .await;

    assert_eq!(result.exit_code, Some(3));
    assert!(!result.is_clean_exit());
    assert_eq!(result.stderr.trim(), "oops");
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        ShellOutputEvent::Data { stream: OutputStream::Stderr, chunk } if chunk.contains("oops")
    )));
}

#[tokio::test]
async fn test_cancel_terminates_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let service = ShellExecutionService::new(ExecutorConfig {
        kill_grace_period: Duration::from_millis(100),
        ..ExecutorConfig::default()
    });
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let handle = service.execute("sleep 20", dir.path(), ignore_output(), cancel.clone(), false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = handle.result().await;
    assert!(result.aborted);
    assert!(!result.is_clean_exit());
    assert!(result.signal.is_some() || result.exit_code != Some(0));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_ignored_term_escalates_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    let service = ShellExecutionService::new(ExecutorConfig {
        kill_grace_period: Duration::from_millis(100),
        ..ExecutorConfig::default()
    });
    let cancel = CancellationToken::new();

    // the backgrounded sleep holds the output pipe open until the group is killed
    let started = Instant::now();
    let handle = service.execute(
        "trap '' TERM; (sleep 30 &); sleep 30",
        dir.path(),
        ignore_output(),
        cancel.clone(),
        false,
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = handle.result().await;
    assert!(result.aborted);
    assert_eq!(result.signal.as_deref(), Some("SIGKILL"));
    assert_eq!(result.exit_code, None);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_cancel_after_exit_is_not_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    // the shell exits at once; "late" only arrives while the output is still draining
    let on_late = cancel.clone();
    let callback: OutputCallback = Arc::new(move |event| {
        if let ShellOutputEvent::Data { chunk, .. } = event {
            if chunk.contains("late") {
                on_late.cancel();
            }
        }
    });

    let result = ShellExecutionService::default()
        .execute("(sleep 0.1; echo late) & exit 0", dir.path(), callback, cancel.clone(), false)
        .result()
        .await;

    assert!(cancel.is_cancelled());
    assert!(!result.aborted);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.is_clean_exit());
    assert!(result.output.contains("late"));
}

#[tokio::test]
async fn test_missing_directory_sets_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");

    let result = ShellExecutionService::default()
        .execute("echo hi", &missing, ignore_output(), CancellationToken::new(), false)
        .result()
        .await;

    assert!(result.error.is_some());
    assert!(result.pid.is_none());
    assert!(!result.is_clean_exit());
}

#[tokio::test]
async fn test_pty_captures_output() {
    let dir = tempfile::tempdir().unwrap();
    let result = ShellExecutionService::default()
        .execute("printf 'from pty'", dir.path(), ignore_output(), CancellationToken::new(), true)
        .result()
        .await;

    // hosts without a pty device fall back to pipes
    assert!(result.output.contains("from pty"));
    assert_eq!(result.exit_code, Some(0));
}
