//! Callbacks through which a running execution reports to its caller
//!
//! Observer methods are invoked from engine threads: `on_stdout`/`on_stderr`
//! from the stream pumps, `on_spawn`/`on_complete` from the monitor worker.
//! For a given process `on_spawn` always precedes `on_complete`; stream
//! callbacks are independent of both.

use crate::result::ExecutionResult;
use tokio::sync::mpsc;

/// Output stream of the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives the live events of one execution
pub trait ExecutionObserver: Send + Sync {
    /// The OS confirmed process creation
    fn on_spawn(&self, _pid: u32) {}

    /// A chunk of stdout. Chunks do not align with lines.
    fn on_stdout(&self, _data: &[u8]) {}

    /// A chunk of stderr
    fn on_stderr(&self, _data: &[u8]) {}

    /// The child closed the stream; fires once per stream
    fn on_stream_end(&self, _stream: StreamKind) {}

    /// The final result; fires exactly once
    fn on_complete(&self, _result: &ExecutionResult) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ExecutionObserver for NullObserver {}

/// Event forwarded by [`ChannelObserver`]
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Spawned { pid: u32 },
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    StreamEnd(StreamKind),
    Completed(ExecutionResult),
}

/// Observer forwarding every event into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ExecutionEvent) {
        // Receiver gone means nobody listens anymore
        let _ = self.tx.send(event);
    }
}

impl ExecutionObserver for ChannelObserver {
    fn on_spawn(&self, pid: u32) {
        self.send(ExecutionEvent::Spawned { pid });
    }

    fn on_stdout(&self, data: &[u8]) {
        self.send(ExecutionEvent::Stdout(data.to_vec()));
    }

    fn on_stderr(&self, data: &[u8]) {
        self.send(ExecutionEvent::Stderr(data.to_vec()));
    }

    fn on_stream_end(&self, stream: StreamKind) {
        self.send(ExecutionEvent::StreamEnd(stream));
    }

    fn on_complete(&self, result: &ExecutionResult) {
        self.send(ExecutionEvent::Completed(result.clone()));
    }
}
