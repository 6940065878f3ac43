//! Caller-facing handle of a submitted execution
//!
//! The handle and the monitor worker share a [`ProcessControl`] block. Every
//! method here is non-blocking except the `wait` family, and every method is
//! safe to call after the process has finished: once finalized the control
//! block is closed and further calls are no-ops.

use crate::bridge::StdinChannel;
use crate::platform::WakeSignal;
use crate::result::ExecutionResult;
use crate::state::ProcessState;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Default)]
struct SignalState {
    requested: bool,
    closed: bool,
    waker: Option<Arc<dyn WakeSignal>>,
}

/// Kill request gate between caller threads and the monitor worker.
///
/// A request made before the worker armed the gate is remembered and
/// picked up when it arms. After `close` requests are ignored and the wake
/// primitive is never touched again, so a kill racing finalization cannot
/// signal a released OS object.
#[derive(Default)]
pub struct CancellationSignal {
    state: Mutex<SignalState>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` if this call made the request.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.requested {
            return false;
        }
        state.requested = true;
        if let Some(ref waker) = state.waker {
            waker.wake();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().requested
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Install the worker's wake primitive. Returns whether cancellation was
    /// already requested.
    pub(crate) fn arm(&self, waker: Arc<dyn WakeSignal>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return state.requested;
        }
        state.waker = Some(waker);
        state.requested
    }

    /// Stop accepting requests and drop the wake primitive
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waker = None;
    }
}

#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    state: ProcessState,
    pid: Option<u32>,
}

/// Control block shared by a [`ProcessHandle`] and its monitor worker
pub struct ProcessControl {
    pub(crate) cancel: CancellationSignal,
    pub(crate) stdin: Arc<StdinChannel>,
    lifecycle: Mutex<Lifecycle>,
}

impl ProcessControl {
    pub(crate) fn new() -> Self {
        Self {
            cancel: CancellationSignal::new(),
            stdin: Arc::new(StdinChannel::new()),
            lifecycle: Mutex::new(Lifecycle {
                state: ProcessState::Spawning,
                pid: None,
            }),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.lifecycle.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.lifecycle.lock().pid
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        self.lifecycle.lock().pid = Some(pid);
    }

    /// Advance the state machine; an impossible edge is logged and ignored
    pub(crate) fn transition(&self, next: ProcessState) {
        let mut lifecycle = self.lifecycle.lock();
        if let Err(e) = lifecycle.state.transition(next) {
            warn!(pid = ?lifecycle.pid, "{}", e);
        }
    }

    /// Make the handle inert: no more kills, no more stdin
    pub(crate) fn close(&self) {
        self.cancel.close();
        self.stdin.close();
        self.transition(ProcessState::Finalized);
    }
}

/// Handle to one submitted execution.
///
/// Dropping the handle does not stop the process; the result is still
/// produced and delivered to the observer.
pub struct ProcessHandle {
    control: Arc<ProcessControl>,
    result: Mutex<Option<oneshot::Receiver<ExecutionResult>>>,
}

impl ProcessHandle {
    pub(crate) fn new(control: Arc<ProcessControl>, result: oneshot::Receiver<ExecutionResult>) -> Self {
        Self {
            control,
            result: Mutex::new(Some(result)),
        }
    }

    /// Queue bytes for the child's stdin. Accepted before spawn; ignored
    /// after `end_stdin`, after completion, or with named stdio endpoints.
    pub fn write_stdin(&self, data: impl AsRef<[u8]>) {
        self.control.stdin.write(data.as_ref());
    }

    /// Close the child's stdin once queued bytes are flushed. Idempotent.
    pub fn end_stdin(&self) {
        self.control.stdin.end();
    }

    /// Request termination. Idempotent and a no-op once finalized.
    pub fn kill(&self) {
        if self.control.cancel.cancel() {
            debug!(pid = ?self.control.pid(), "Cancellation requested");
        }
    }

    /// OS process id, once spawned
    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.control.state()
    }

    pub fn is_finished(&self) -> bool {
        self.control.state().is_finalized()
    }

    /// Wait for the result.
    ///
    /// Returns `None` if the result was already taken by an earlier wait.
    pub async fn wait(&self) -> Option<ExecutionResult> {
        let rx = self.result.lock().take()?;
        rx.await.ok()
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from
    /// within an async runtime.
    pub fn wait_blocking(&self) -> Option<ExecutionResult> {
        let rx = self.result.lock().take()?;
        rx.blocking_recv().ok()
    }
}
