//! Stdio bridge between the caller and the child process
//!
//! - stdin: the caller writes into a locked queue at any time, even before
//!   the child exists. A pump thread flushes it into the pipe once spawned.
//!   Ending input is idempotent; writes after it are dropped.
//! - stdout/stderr: one pump thread per stream reads arbitrary-sized chunks
//!   and hands them to the observer, then reports end-of-stream once.
//!
//! Writes are pumped with `write_all` and never truncated here; very large
//! single writes are still bounded by what the child reads before exiting.

use crate::observer::{ExecutionObserver, StreamKind};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct StdinState {
    pending: VecDeque<Vec<u8>>,
    /// Caller ended input
    eof: bool,
    /// No further delivery possible (finalized, broken pipe, or not piped)
    closed: bool,
}

/// What the stdin pump should do next
#[derive(Debug, PartialEq, Eq)]
enum StdinBatch {
    Data(Vec<Vec<u8>>),
    Eof,
    Closed,
}

/// Caller-side stdin queue shared with the pump thread
#[derive(Debug, Default)]
pub struct StdinChannel {
    state: Mutex<StdinState>,
    ready: Condvar,
}

impl StdinChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the child. Silently ignored after `end` or `close`.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        if state.eof || state.closed {
            trace!("Dropping {} stdin bytes after end of input", data.len());
            return;
        }
        state.pending.push_back(data.to_vec());
        self.ready.notify_one();
    }

    /// Signal end of input once queued bytes are flushed
    pub fn end(&self) {
        let mut state = self.state.lock();
        if state.eof || state.closed {
            return;
        }
        state.eof = true;
        self.ready.notify_one();
    }

    /// Stop accepting and delivering input, discarding anything queued
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        self.ready.notify_all();
    }

    pub fn is_ended(&self) -> bool {
        let state = self.state.lock();
        state.eof || state.closed
    }

    /// Bytes queued but not yet handed to the pump
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().pending.iter().map(Vec::len).sum()
    }

    fn next_batch(&self) -> StdinBatch {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return StdinBatch::Closed;
            }
            if !state.pending.is_empty() {
                return StdinBatch::Data(state.pending.drain(..).collect());
            }
            if state.eof {
                return StdinBatch::Eof;
            }
            self.ready.wait(&mut state);
        }
    }
}

/// Start flushing `channel` into the child's stdin
pub fn spawn_stdin_pump<W>(channel: Arc<StdinChannel>, mut sink: W, pid: u32) -> io::Result<JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name(format!("procguard-stdin-{}", pid))
        .spawn(move || loop {
            match channel.next_batch() {
                StdinBatch::Data(chunks) => {
                    for chunk in chunks {
                        if let Err(e) = sink.write_all(&chunk).and_then(|_| sink.flush()) {
                            // Child closed its stdin or exited
                            debug!(pid, "stdin pipe closed: {}", e);
                            channel.close();
                            return;
                        }
                    }
                }
                // Dropping the sink closes the pipe
                StdinBatch::Eof | StdinBatch::Closed => return,
            }
        })
}

/// Start forwarding one output stream of the child to the observer
pub fn spawn_output_pump<R>(
    mut source: R,
    stream: StreamKind,
    observer: Arc<dyn ExecutionObserver>,
    chunk_size: usize,
    pid: u32,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let name = match stream {
        StreamKind::Stdout => format!("procguard-stdout-{}", pid),
        StreamKind::Stderr => format!("procguard-stderr-{}", pid),
    };

    thread::Builder::new().name(name).spawn(move || {
        let mut buf = vec![0u8; chunk_size];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => match stream {
                    StreamKind::Stdout => observer.on_stdout(&buf[..n]),
                    StreamKind::Stderr => observer.on_stderr(&buf[..n]),
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(pid, ?stream, "read failed, closing stream: {}", e);
                    break;
                }
            }
        }
        observer.on_stream_end(stream);
    })
}
