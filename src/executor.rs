//! Executor facade
//!
//! [`Executor::submit`] returns a [`ProcessHandle`] immediately and reports
//! through an observer. [`Executor::execute`] is the run-to-completion
//! convenience on top of it, collecting output in memory.

use crate::config::ExecutorConfig;
use crate::handle::{ProcessControl, ProcessHandle};
use crate::monitor::{self, WorkerParts};
use crate::observer::{ChannelObserver, ExecutionEvent, ExecutionObserver, StreamKind};
use crate::platform::Platform;
use crate::request::{ExecutionRequest, SubmitError};
use crate::result::ExecutionResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Output and outcome of [`Executor::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub result: ExecutionResult,
    /// Output beyond `max_output_bytes` was discarded
    pub output_truncated: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Process execution engine
#[derive(Debug, Clone)]
pub struct Executor {
    config: Arc<ExecutorConfig>,
    platform: Platform,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl Executor {
    /// Create new executor
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config: Arc::new(config),
            platform: Platform::current(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Start a process without waiting for it.
    ///
    /// Fails only for malformed requests. Everything that goes wrong later,
    /// including a missing executable, is reported in the result.
    pub fn submit(
        &self,
        request: ExecutionRequest,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Result<ProcessHandle, SubmitError> {
        request.validate()?;

        debug!(
            "Submitting {} with {} args",
            request.program(),
            request.args().len()
        );

        let control = Arc::new(ProcessControl::new());
        let (result_tx, result_rx) = oneshot::channel();

        monitor::spawn_worker(WorkerParts {
            request,
            config: Arc::clone(&self.config),
            control: Arc::clone(&control),
            observer,
            result_tx,
        });

        Ok(ProcessHandle::new(control, result_rx))
    }

    /// Run to completion, feeding `stdin` and collecting output
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        stdin: Option<Vec<u8>>,
    ) -> Result<CommandOutput, SubmitError> {
        self.execute_with_cancel(request, stdin, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute); cancelling `token` kills the process
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        stdin: Option<Vec<u8>>,
        token: CancellationToken,
    ) -> Result<CommandOutput, SubmitError> {
        let piped = request.stdio.is_piped();
        let (observer, events) = ChannelObserver::new();
        let handle = self.submit(request, Arc::new(observer))?;

        if let Some(input) = stdin {
            handle.write_stdin(input);
        }
        handle.end_stdin();

        let mut collector = OutputCollector::new(self.config.max_output_bytes, piped);
        let result = collector
            .until_complete(events, &handle, token, self.config.drain_timeout())
            .await;

        if result.success() {
            debug!("Command completed in {:.0} ms", result.elapsed_ms);
        } else {
            info!(cause = ?result.cause(), "Command did not complete normally");
        }

        Ok(collector.into_output(result))
    }
}

/// Accumulates streamed output up to `max_output_bytes`
struct OutputCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    max_bytes: usize,
    truncated: bool,
    stdout_open: bool,
    stderr_open: bool,
}

impl OutputCollector {
    fn new(max_bytes: usize, piped: bool) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            max_bytes,
            truncated: false,
            stdout_open: piped,
            stderr_open: piped,
        }
    }

    fn append(&mut self, stream: StreamKind, data: &[u8]) {
        let used = self.stdout.len() + self.stderr.len();
        let room = self.max_bytes.saturating_sub(used);
        let take = data.len().min(room);
        if take < data.len() {
            self.truncated = true;
        }

        let buf = match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        buf.extend_from_slice(&data[..take]);
    }

    fn streams_done(&self) -> bool {
        !self.stdout_open && !self.stderr_open
    }

    /// Apply one event; returns the result if it was the completion
    fn apply(&mut self, event: ExecutionEvent) -> Option<ExecutionResult> {
        match event {
            ExecutionEvent::Spawned { .. } => None,
            ExecutionEvent::Stdout(data) => {
                self.append(StreamKind::Stdout, &data);
                None
            }
            ExecutionEvent::Stderr(data) => {
                self.append(StreamKind::Stderr, &data);
                None
            }
            ExecutionEvent::StreamEnd(StreamKind::Stdout) => {
                self.stdout_open = false;
                None
            }
            ExecutionEvent::StreamEnd(StreamKind::Stderr) => {
                self.stderr_open = false;
                None
            }
            ExecutionEvent::Completed(result) => Some(result),
        }
    }

    async fn until_complete(
        &mut self,
        mut events: mpsc::UnboundedReceiver<ExecutionEvent>,
        handle: &ProcessHandle,
        token: CancellationToken,
        drain_timeout: Duration,
    ) -> ExecutionResult {
        let mut result = None;
        let mut cancel_sent = false;

        while result.is_none() {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => result = self.apply(event),
                    None => break,
                },
                _ = token.cancelled(), if !cancel_sent => {
                    handle.kill();
                    cancel_sent = true;
                }
            }
        }

        // Output pumps may still hold buffered data after the reap
        if result.as_ref().map_or(false, |r| !r.spawn_failed) && !self.streams_done() {
            let drain = async {
                while !self.streams_done() {
                    match events.recv().await {
                        Some(event) => {
                            self.apply(event);
                        }
                        None => break,
                    }
                }
            };
            if tokio::time::timeout(drain_timeout, drain)
                .await
                .is_err()
            {
                debug!("Output streams still open after drain timeout");
            }
        }

        match result {
            Some(result) => result,
            // Channel closed without completion: fall back to the handle
            None => handle
                .wait()
                .await
                .unwrap_or_else(|| ExecutionResult::spawn_failure(0.0, "monitor worker vanished")),
        }
    }

    fn into_output(self, result: ExecutionResult) -> CommandOutput {
        CommandOutput {
            stdout: self.stdout,
            stderr: self.stderr,
            result,
            output_truncated: self.truncated,
        }
    }
}
