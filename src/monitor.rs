//! Monitor worker: one dedicated thread per process.
//!
//! The worker launches the child, then loops on the strategy's `wait`,
//! reacting to exit, cancellation wakes, and poll ticks (sample, enforce).
//! After any kill it keeps waiting until the OS confirms exit, then reaps,
//! assembles the single [`ExecutionResult`], closes the handle and delivers
//! the result. Every path through the worker ends in exactly one delivery.

use crate::bridge;
use crate::config::ExecutorConfig;
use crate::enforcer::{LimitEnforcer, Violation};
use crate::handle::ProcessControl;
use crate::launcher;
use crate::observer::{ExecutionObserver, StreamKind};
use crate::platform::{NativeStrategy, PlatformLimitStrategy, RawExit, ResourceSample, WaitEvent};
use crate::request::{ExecutionRequest, Limits};
use crate::result::{ExecutionResult, TerminationCause};
use crate::state::ProcessState;
use std::io;
use std::process::Child;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Consecutive wait failures tolerated before giving up on exit detection
const MAX_WAIT_FAILURES: u32 = 50;

/// Per-process monitoring state, owned by the worker thread
pub struct MonitorContext<S: PlatformLimitStrategy> {
    pid: u32,
    started: Instant,
    enforcer: LimitEnforcer,
    /// Never decreases
    peak_memory: u64,
    cpu_time: Duration,
    strategy: S,
    // Declared after the strategy so OS objects are released first
    _child: Child,
}

impl<S: PlatformLimitStrategy> MonitorContext<S> {
    pub fn new(child: Child, strategy: S, limits: Limits, config: &ExecutorConfig, started: Instant) -> Self {
        Self {
            pid: child.id(),
            started,
            enforcer: LimitEnforcer::new(limits, config),
            peak_memory: 0,
            cpu_time: Duration::ZERO,
            strategy,
            _child: child,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn record(&mut self, sample: ResourceSample) {
        self.peak_memory = self.peak_memory.max(sample.peak());
        self.cpu_time = self.cpu_time.max(sample.cpu_time);
    }

    fn sample_now(&mut self) {
        if let Some(sample) = self.strategy.sample() {
            self.record(sample);
        }
    }

    fn kill(&mut self, reason: &str) {
        if let Err(e) = self.strategy.kill() {
            warn!(pid = self.pid, "Kill ({}) failed: {}", reason, e);
        }
    }

    /// Run the wait loop until the process has exited.
    ///
    /// Returns the engine-initiated cause, if the engine killed it.
    fn supervise(&mut self, control: &ProcessControl, poll_interval: Duration) -> Option<TerminationCause> {
        let mut engine_cause: Option<TerminationCause> = None;
        let mut failures = 0u32;

        loop {
            let timeout = match engine_cause {
                // Killed: only waiting for the OS to confirm
                Some(_) => poll_interval,
                None => self.enforcer.next_wait(self.elapsed(), poll_interval),
            };

            let event = match self.strategy.wait(timeout) {
                Ok(event) => {
                    failures = 0;
                    event
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_WAIT_FAILURES {
                        warn!(pid = self.pid, "Giving up on exit detection: {}", e);
                        self.kill("wait failure");
                        return engine_cause;
                    }
                    debug!(pid = self.pid, "wait failed: {}", e);
                    thread::sleep(poll_interval);
                    WaitEvent::Tick
                }
            };

            match event {
                WaitEvent::Exited => return engine_cause,
                WaitEvent::Woken => {
                    if engine_cause.is_none() && control.cancel.is_cancelled() {
                        info!(pid = self.pid, "Cancelled by caller");
                        self.kill("cancel");
                        engine_cause = Some(TerminationCause::Cancelled);
                    }
                }
                WaitEvent::Tick => {
                    if engine_cause.is_some() {
                        continue;
                    }
                    // Strategies without a native wake see cancellation here
                    if control.cancel.is_cancelled() {
                        info!(pid = self.pid, "Cancelled by caller");
                        self.kill("cancel");
                        engine_cause = Some(TerminationCause::Cancelled);
                        continue;
                    }

                    self.sample_now();
                    let elapsed = self.elapsed();
                    if let Some(violation) = self.enforcer.check(self.cpu_time, self.peak_memory, elapsed) {
                        self.report_violation(violation, elapsed);
                        self.kill("limit");
                        engine_cause = Some(violation.cause());
                    }
                }
            }
        }
    }

    fn report_violation(&self, violation: Violation, elapsed: Duration) {
        let limits = self.enforcer.limits();
        info!(
            pid = self.pid,
            elapsed_ms = elapsed.as_millis() as u64,
            cpu_time_ms = self.cpu_time.as_millis() as u64,
            peak_memory_bytes = self.peak_memory,
            timeout_ms = limits.timeout_ms,
            memory_limit_bytes = limits.memory_limit_bytes,
            "Limit exceeded: {:?}",
            violation
        );
    }

    /// Reap the exited process and build its result
    fn finish(mut self, engine_cause: Option<TerminationCause>) -> ExecutionResult {
        // Last look before the accounting disappears
        self.sample_now();

        let raw = match self.strategy.reap() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(pid = self.pid, "Reap failed: {}", e);
                RawExit::default()
            }
        };
        if let Some(usage) = raw.usage {
            self.record(usage);
        }

        let cause = engine_cause.unwrap_or_else(|| {
            self.enforcer
                .attribute_exit(&raw, self.cpu_time, self.peak_memory)
                .map(|v| {
                    debug!(pid = self.pid, "Exit attributed to {:?}", v);
                    v.cause()
                })
                .unwrap_or(TerminationCause::Exited)
        });

        ExecutionResult {
            exit_code: match cause {
                TerminationCause::Exited => raw.exit_code,
                _ => None,
            },
            term_signal: raw.signal,
            elapsed_ms: self.elapsed().as_secs_f64() * 1000.0,
            peak_memory_bytes: self.peak_memory,
            cpu_time_ms: self.cpu_time.as_millis() as u64,
            timed_out: cause == TerminationCause::TimedOut,
            memory_limit_exceeded: cause == TerminationCause::MemoryExceeded,
            cancelled: cause == TerminationCause::Cancelled,
            spawn_failed: false,
            spawn_error: None,
        }
    }
}

/// Everything a worker needs, moved onto its thread
pub struct WorkerParts {
    pub request: ExecutionRequest,
    pub config: Arc<ExecutorConfig>,
    pub control: Arc<ProcessControl>,
    pub observer: Arc<dyn ExecutionObserver>,
    pub result_tx: oneshot::Sender<ExecutionResult>,
}

/// Start the monitor worker for one request.
///
/// If the thread cannot be created the spawn-failure result is delivered
/// right here instead.
pub fn spawn_worker(parts: WorkerParts) {
    let started = Instant::now();
    let shared = Arc::new(parking_lot::Mutex::new(Some(parts)));
    let for_thread = Arc::clone(&shared);

    let spawned = thread::Builder::new()
        .name("procguard-monitor".to_string())
        .spawn(move || {
            if let Some(parts) = for_thread.lock().take() {
                run_worker::<NativeStrategy>(parts, started);
            }
        });

    if let Err(e) = spawned {
        if let Some(parts) = shared.lock().take() {
            warn!("Cannot start monitor thread: {}", e);
            deliver_spawn_failure(parts, started, format!("monitor thread: {}", e));
        }
    }
}

fn deliver_spawn_failure(parts: WorkerParts, started: Instant, reason: String) {
    let result = ExecutionResult::spawn_failure(started.elapsed().as_secs_f64() * 1000.0, reason);
    parts.control.transition(ProcessState::SpawnFailed);
    deliver(parts, result);
}

fn deliver(parts: WorkerParts, result: ExecutionResult) {
    parts.control.close();
    parts.observer.on_complete(&result);
    // Receiver dropped means the caller only listens through the observer
    let _ = parts.result_tx.send(result);
}

fn start_pumps(
    child: &mut Child,
    control: &ProcessControl,
    observer: &Arc<dyn ExecutionObserver>,
    chunk_size: usize,
) -> io::Result<()> {
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        bridge::spawn_output_pump(stdout, StreamKind::Stdout, Arc::clone(observer), chunk_size, pid)?;
    }
    if let Some(stderr) = child.stderr.take() {
        bridge::spawn_output_pump(stderr, StreamKind::Stderr, Arc::clone(observer), chunk_size, pid)?;
    }
    match child.stdin.take() {
        Some(stdin) => {
            bridge::spawn_stdin_pump(Arc::clone(&control.stdin), stdin, pid)?;
        }
        // Named endpoints: nothing to pump into
        None => control.stdin.close(),
    }
    Ok(())
}

/// Body of the monitor thread
pub fn run_worker<S: PlatformLimitStrategy>(parts: WorkerParts, started: Instant) {
    let (mut child, strategy) = match launcher::launch::<S>(&parts.request, &parts.config) {
        Ok(launched) => launched,
        Err(e) => {
            warn!(program = parts.request.program(), "{}", e);
            deliver_spawn_failure(parts, started, e.to_string());
            return;
        }
    };

    let pid = child.id();
    parts.control.set_pid(pid);
    parts.control.transition(ProcessState::Running);
    info!(
        pid,
        program = parts.request.program(),
        strategy = S::NAME,
        timeout_ms = parts.request.limits.timeout_ms,
        memory_limit_bytes = parts.request.limits.memory_limit_bytes,
        "Process spawned"
    );
    parts.observer.on_spawn(pid);

    if let Err(e) = start_pumps(&mut child, &parts.control, &parts.observer, parts.config.read_chunk_size) {
        warn!(pid, "Cannot start stdio pumps: {}", e);
    }

    let waker = strategy.waker();
    let cancel_pending = parts.control.cancel.arm(waker);

    let mut ctx = MonitorContext::new(
        child,
        strategy,
        parts.request.limits,
        &parts.config,
        started,
    );

    let engine_cause = if cancel_pending {
        info!(pid, "Cancelled before start");
        ctx.kill("cancel");
        // Still wait for the OS to confirm the exit
        let rest = ctx.supervise(&parts.control, parts.config.poll_interval());
        Some(rest.unwrap_or(TerminationCause::Cancelled))
    } else {
        ctx.supervise(&parts.control, parts.config.poll_interval())
    };

    let result = ctx.finish(engine_cause);
    parts.control.transition(ProcessState::from(result.cause()));

    info!(
        pid,
        exit_code = ?result.exit_code,
        term_signal = result.term_signal,
        elapsed_ms = result.elapsed_ms as u64,
        peak_memory_bytes = result.peak_memory_bytes,
        cause = ?result.cause(),
        "Process finished"
    );

    deliver(parts, result);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, ExecutionEvent};

    fn run(request: ExecutionRequest) -> (ExecutionResult, Vec<ExecutionEvent>) {
        let (observer, mut events) = ChannelObserver::new();
        let control = Arc::new(ProcessControl::new());
        let (tx, mut rx) = oneshot::channel();

        control.stdin.end();
        run_worker::<NativeStrategy>(
            WorkerParts {
                request,
                config: Arc::new(ExecutorConfig::default()),
                control: Arc::clone(&control),
                observer: Arc::new(observer),
                result_tx: tx,
            },
            Instant::now(),
        );

        assert_eq!(control.state(), ProcessState::Finalized);
        let result = rx.try_recv().unwrap();

        let mut collected = Vec::new();
        while let Ok(event) = events.try_recv() {
            collected.push(event);
        }
        (result, collected)
    }

    #[test]
    fn test_worker_natural_exit() {
        let (result, events) = run(ExecutionRequest::new(["sh", "-c", "exit 3"]));

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.cause(), TerminationCause::Exited);
        assert!(matches!(events.first(), Some(ExecutionEvent::Spawned { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::Completed(r) if r == &result)));
    }

    #[test]
    fn test_worker_spawn_failure_skips_on_spawn() {
        let (result, events) = run(ExecutionRequest::new(["no-such-binary-procguard"]));

        assert!(result.spawn_failed);
        assert!(result.spawn_error.is_some());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ExecutionEvent::Completed(_)));
    }

    #[test]
    fn test_worker_backstop_kills_sleeper() {
        let (result, _) = run(ExecutionRequest::new(["sleep", "10"]).timeout_ms(200));

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.term_signal, libc::SIGKILL);
        assert!(result.elapsed_ms < 5000.0);
    }
}
