//! Termination state machine for one monitored process
//!
//! ```text
//! Spawning -> Running -> {Exited | TimedOut | MemoryExceeded | Cancelled} -> Finalized
//! Spawning -> SpawnFailed -> Finalized
//! ```

use crate::result::TerminationCause;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ProcessState,
    pub to: ProcessState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    Spawning,
    Running,
    Exited,
    TimedOut,
    MemoryExceeded,
    Cancelled,
    SpawnFailed,
    Finalized,
}

impl ProcessState {
    /// Terminal states that still await finalization
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            ProcessState::Exited
                | ProcessState::TimedOut
                | ProcessState::MemoryExceeded
                | ProcessState::Cancelled
                | ProcessState::SpawnFailed
        )
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, ProcessState::Finalized)
    }

    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        use ProcessState::*;

        match (self, next) {
            (Spawning, Running) | (Spawning, SpawnFailed) => true,
            (Running, Exited | TimedOut | MemoryExceeded | Cancelled) => true,
            (from, Finalized) => from.is_terminating(),
            _ => false,
        }
    }

    /// Move to `next`, refusing edges the machine does not have
    pub fn transition(&mut self, next: ProcessState) -> Result<(), InvalidTransition> {
        if !self.can_transition_to(next) {
            return Err(InvalidTransition { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }
}

impl From<TerminationCause> for ProcessState {
    fn from(cause: TerminationCause) -> Self {
        match cause {
            TerminationCause::Exited => ProcessState::Exited,
            TerminationCause::TimedOut => ProcessState::TimedOut,
            TerminationCause::MemoryExceeded => ProcessState::MemoryExceeded,
            TerminationCause::Cancelled => ProcessState::Cancelled,
            TerminationCause::SpawnFailed => ProcessState::SpawnFailed,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Spawning => "spawning",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::TimedOut => "timed_out",
            ProcessState::MemoryExceeded => "memory_exceeded",
            ProcessState::Cancelled => "cancelled",
            ProcessState::SpawnFailed => "spawn_failed",
            ProcessState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}
