//! The single structured outcome of an execution

use serde::{Deserialize, Serialize};

/// Why the process stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminationCause {
    /// Terminated on its own (any exit code or foreign signal)
    Exited,
    TimedOut,
    MemoryExceeded,
    Cancelled,
    SpawnFailed,
}

/// Outcome of one request, produced exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Exit code; `None` when termination was abnormal or engine-initiated
    pub exit_code: Option<i64>,

    /// Terminating signal, 0 if none
    pub term_signal: i32,

    /// Wall-clock time from spawn to reap (milliseconds)
    pub elapsed_ms: f64,

    /// Highest memory usage observed (bytes)
    pub peak_memory_bytes: u64,

    /// Accumulated CPU time, best effort (milliseconds)
    pub cpu_time_ms: u64,

    pub timed_out: bool,
    pub memory_limit_exceeded: bool,
    pub cancelled: bool,
    pub spawn_failed: bool,

    /// Diagnostic for spawn failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
}

impl ExecutionResult {
    /// Result for a process that never entered the running state
    pub fn spawn_failure(elapsed_ms: f64, reason: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            term_signal: 0,
            elapsed_ms,
            peak_memory_bytes: 0,
            cpu_time_ms: 0,
            timed_out: false,
            memory_limit_exceeded: false,
            cancelled: false,
            spawn_failed: true,
            spawn_error: Some(reason.into()),
        }
    }

    /// The primary termination cause
    pub fn cause(&self) -> TerminationCause {
        if self.spawn_failed {
            TerminationCause::SpawnFailed
        } else if self.cancelled {
            TerminationCause::Cancelled
        } else if self.timed_out {
            TerminationCause::TimedOut
        } else if self.memory_limit_exceeded {
            TerminationCause::MemoryExceeded
        } else {
            TerminationCause::Exited
        }
    }

    /// Exited on its own with code 0
    pub fn success(&self) -> bool {
        self.cause() == TerminationCause::Exited && self.exit_code == Some(0)
    }

    /// Serialize into the JSON payload delivered to callers
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
