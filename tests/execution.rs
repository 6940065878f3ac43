//! End-to-end tests driving real processes through the engine
#![cfg(unix)]

use parking_lot::Mutex;
use procguard::{
    ChannelObserver, ExecutionEvent, ExecutionObserver, ExecutionRequest, ExecutionResult, Executor,
    ExecutorConfig, NullObserver, ProcessState, StdioEndpoints, StreamKind, SubmitError,
};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observer recording the order of lifecycle callbacks
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<&'static str>>,
    completions: AtomicUsize,
}

impl ExecutionObserver for Recorder {
    fn on_spawn(&self, _pid: u32) {
        self.calls.lock().push("spawn");
    }

    fn on_stream_end(&self, stream: StreamKind) {
        self.calls.lock().push(match stream {
            StreamKind::Stdout => "stdout-end",
            StreamKind::Stderr => "stderr-end",
        });
    }

    fn on_complete(&self, _result: &ExecutionResult) {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push("complete");
    }
}

fn sh(script: &str) -> ExecutionRequest {
    ExecutionRequest::new(["sh", "-c", script])
}

#[tokio::test]
async fn test_clean_exit_has_no_flags() {
    let output = Executor::default().execute(sh("exit 0"), None).await.unwrap();
    let result = output.result;

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.term_signal, 0);
    assert!(!result.timed_out);
    assert!(!result.memory_limit_exceeded);
    assert!(!result.cancelled);
    assert!(!result.spawn_failed);
    assert!(result.success());
}

#[tokio::test]
async fn test_nonzero_exit_code_reported() {
    let output = Executor::default()
        .execute(sh("echo oops >&2; exit 42"), None)
        .await
        .unwrap();

    assert_eq!(output.result.exit_code, Some(42));
    assert_eq!(output.stderr_lossy().trim(), "oops");
    assert!(!output.result.success());
}

#[tokio::test]
#[serial]
async fn test_cpu_spin_times_out() {
    let output = Executor::default()
        .execute(sh("while :; do :; done").timeout_ms(500), None)
        .await
        .unwrap();
    let result = output.result;

    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(result.elapsed_ms >= 400.0, "killed too early: {}", result.elapsed_ms);
    assert!(result.elapsed_ms < 2000.0, "killed too late: {}", result.elapsed_ms);
}

#[tokio::test]
#[serial]
async fn test_sleeper_hits_wall_clock_backstop() {
    let started = Instant::now();
    let output = Executor::default()
        .execute(ExecutionRequest::new(["sleep", "30"]).timeout_ms(300), None)
        .await
        .unwrap();

    assert!(output.result.timed_out);
    assert!(!output.result.memory_limit_exceeded);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
#[serial]
async fn test_memory_ceiling_enforced() {
    // tail buffers an endless line in memory
    let request = ExecutionRequest::new(["tail", "/dev/zero"])
        .memory_limit_mb(10)
        .timeout_ms(10_000);
    let output = Executor::default().execute(request, None).await.unwrap();
    let result = output.result;

    assert!(result.memory_limit_exceeded, "result: {:?}", result);
    assert!(!result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(result.peak_memory_bytes >= 9 * 1024 * 1024);
}

#[tokio::test]
async fn test_stdin_round_trip_through_handle() {
    let (observer, mut events) = ChannelObserver::new();
    let handle = Executor::default()
        .submit(ExecutionRequest::new(["cat"]), Arc::new(observer))
        .unwrap();

    handle.write_stdin(b"first ");
    handle.write_stdin(b"second");
    handle.end_stdin();
    handle.end_stdin();
    handle.write_stdin(b" ignored");

    let result = handle.wait().await.unwrap();
    assert_eq!(result.exit_code, Some(0));

    let mut stdout = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            ExecutionEvent::Stdout(chunk) => stdout.extend(chunk),
            ExecutionEvent::StreamEnd(StreamKind::Stdout) => break,
            _ => {}
        }
    }
    assert_eq!(stdout, b"first second");
}

#[tokio::test]
async fn test_large_output_is_complete() {
    let output = Executor::default()
        .execute(sh("head -c 1000000 /dev/zero"), None)
        .await
        .unwrap();

    assert_eq!(output.stdout.len(), 1_000_000);
    assert!(!output.output_truncated);
}

#[tokio::test]
async fn test_output_truncated_at_limit() {
    let config = ExecutorConfig {
        max_output_bytes: 1024,
        ..Default::default()
    };
    let output = Executor::new(config)
        .execute(sh("head -c 100000 /dev/zero"), None)
        .await
        .unwrap();

    assert_eq!(output.stdout.len(), 1024);
    assert!(output.output_truncated);
    assert_eq!(output.result.exit_code, Some(0));
}

#[tokio::test]
async fn test_missing_executable_is_spawn_failure() {
    let recorder = Arc::new(Recorder::default());
    let handle = Executor::default()
        .submit(
            ExecutionRequest::new(["procguard-no-such-program"]),
            recorder.clone(),
        )
        .unwrap();

    let result = handle.wait().await.unwrap();
    assert!(result.spawn_failed);
    assert_eq!(result.exit_code, None);
    assert!(result.spawn_error.is_some());
    assert_eq!(*recorder.calls.lock(), vec!["complete"]);
    assert_eq!(handle.pid(), None);
}

#[tokio::test]
async fn test_bad_working_directory_is_spawn_failure() {
    let output = Executor::default()
        .execute(sh("pwd").cwd("/procguard/does/not/exist"), None)
        .await
        .unwrap();

    assert!(output.result.spawn_failed);
    assert!(output.stdout.is_empty());
}

#[tokio::test]
async fn test_working_directory_applied() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let output = Executor::default()
        .execute(sh("pwd -P").cwd(dir.path()), None)
        .await
        .unwrap();

    assert_eq!(output.stdout_lossy().trim(), expected.display().to_string());
}

#[test]
fn test_empty_argv_rejected_synchronously() {
    let executor = Executor::default();
    let err = executor
        .submit(ExecutionRequest::new(Vec::<String>::new()), Arc::new(NullObserver))
        .err();
    assert_eq!(err, Some(SubmitError::EmptyArgv));

    let err = executor
        .submit(ExecutionRequest::new([""]), Arc::new(NullObserver))
        .err();
    assert_eq!(err, Some(SubmitError::EmptyProgram));
}

#[tokio::test]
async fn test_callback_order_and_single_completion() {
    let recorder = Arc::new(Recorder::default());
    let handle = Executor::default()
        .submit(sh("echo hi"), recorder.clone())
        .unwrap();
    handle.end_stdin();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(handle.state(), ProcessState::Finalized);
    assert!(handle.is_finished());

    let calls = recorder.calls.lock().clone();
    assert_eq!(calls.first(), Some(&"spawn"));
    assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn test_kill_running_process() {
    let handle = Executor::default()
        .submit(ExecutionRequest::new(["sleep", "30"]), Arc::new(NullObserver))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.kill();
    handle.kill();

    let result = handle.wait().await.unwrap();
    assert!(result.cancelled);
    assert!(!result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(result.elapsed_ms < 5000.0);
}

#[tokio::test]
async fn test_kill_before_spawn_cancels() {
    let handle = Executor::default()
        .submit(ExecutionRequest::new(["sleep", "30"]), Arc::new(NullObserver))
        .unwrap();
    handle.kill();

    let result = handle.wait().await.unwrap();
    assert!(result.cancelled);
    assert!(result.elapsed_ms < 5000.0);
}

#[tokio::test]
async fn test_kill_after_completion_is_noop() {
    let recorder = Arc::new(Recorder::default());
    let handle = Executor::default()
        .submit(sh("exit 0"), recorder.clone())
        .unwrap();

    let result = handle.wait().await.unwrap();
    assert!(!result.cancelled);

    handle.kill();
    handle.write_stdin(b"late");
    handle.end_stdin();
    assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
    assert_eq!(handle.wait().await, None);
}

#[tokio::test]
#[serial]
async fn test_concurrent_executions_are_isolated() {
    let executor = Executor::default();
    let mut tasks = Vec::new();

    for i in 0..50 {
        let executor = executor.clone();
        tasks.push(tokio::spawn(async move {
            let output = executor
                .execute(ExecutionRequest::new(vec!["echo".to_string(), i.to_string()]), None)
                .await
                .unwrap();
            (i, output)
        }));
    }

    for task in tasks {
        let (i, output) = task.await.unwrap();
        assert_eq!(output.result.exit_code, Some(0));
        assert_eq!(output.stdout_lossy().trim(), i.to_string());
    }
}

#[tokio::test]
#[serial]
async fn test_process_group_killed_on_timeout() {
    let started = Instant::now();
    // The shell's child sleeper must die with it
    let output = Executor::default()
        .execute(sh("sleep 30; echo survived").timeout_ms(200), None)
        .await
        .unwrap();

    assert!(output.result.timed_out);
    assert!(!output.stdout_lossy().contains("survived"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_named_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let out = dir.path().join("out.txt");
    let err = dir.path().join("err.txt");
    std::fs::write(&input, "from file\n").unwrap();
    std::fs::write(&out, "").unwrap();
    std::fs::write(&err, "").unwrap();

    let request = sh("cat; echo done >&2").stdio(StdioEndpoints::Named {
        stdin: input.display().to_string(),
        stdout: out.display().to_string(),
        stderr: err.display().to_string(),
    });
    let output = Executor::default().execute(request, None).await.unwrap();

    assert_eq!(output.result.exit_code, Some(0));
    assert!(output.stdout.is_empty());
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "from file\n");
    assert_eq!(std::fs::read_to_string(&err).unwrap(), "done\n");
}

#[test]
fn test_wait_blocking_outside_runtime() {
    let handle = Executor::default()
        .submit(sh("exit 7"), Arc::new(NullObserver))
        .unwrap();
    let result = handle.wait_blocking().unwrap();
    assert_eq!(result.exit_code, Some(7));
}

#[cfg(target_os = "linux")]
#[tokio::test]
#[serial]
async fn test_memory_burst_between_ticks_is_flagged() {
    // sort holds the whole newline-free input; only the reap accounting of
    // the shell (which includes its reaped children) sees the peak
    let request = sh("head -c 16000000 /dev/zero | sort > /dev/null")
        .memory_limit_mb(10)
        .timeout_ms(10_000);
    let output = Executor::default().execute(request, None).await.unwrap();
    let result = output.result;

    assert!(result.peak_memory_bytes > 10 * 1024 * 1024, "result: {:?}", result);
    assert!(result.memory_limit_exceeded, "result: {:?}", result);
    assert!(!result.timed_out);
    assert_eq!(result.exit_code, None);
}

#[tokio::test]
#[serial]
async fn test_kill_racing_natural_exit_yields_one_result() {
    let executor = Executor::default();

    for i in 0..30u64 {
        let recorder = Arc::new(Recorder::default());
        let handle = executor.submit(sh("exit 0"), recorder.clone()).unwrap();
        handle.end_stdin();

        // Land the kill around the moment the shell exits
        tokio::time::sleep(Duration::from_micros((i % 10) * 300)).await;
        handle.kill();

        let result = handle.wait().await.expect("result delivered");
        assert_eq!(handle.wait().await, None);
        assert!(
            !(result.cancelled && result.exit_code.is_some()),
            "cancelled result carries an exit code: {:?}",
            result
        );
        if !result.cancelled {
            assert_eq!(result.exit_code, Some(0));
        }

        handle.kill();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(recorder.completions.load(Ordering::SeqCst), 1);
        assert!(handle.is_finished());
    }
}

#[tokio::test]
async fn test_large_stdin_round_trip() {
    let input: Vec<u8> = (0..900 * 1024).map(|i| (i % 251) as u8).collect();

    let output = Executor::default()
        .execute(ExecutionRequest::new(["cat"]), Some(input.clone()))
        .await
        .unwrap();

    assert_eq!(output.result.exit_code, Some(0));
    assert_eq!(output.stdout.len(), input.len());
    assert!(output.stdout == input, "stdout differs from stdin");
}
