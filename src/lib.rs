//! procguard - Sandboxed process execution with resource-limit monitoring
//!
//! This crate runs untrusted programs as monitored child processes with:
//! - CPU-time and wall-clock timeouts
//! - Peak memory ceilings
//! - Live stdio bridging and caller cancellation
//! - Platform strategies (Linux pidfd, macOS kqueue, Windows job objects)
//!
//! Every submitted request yields exactly one [`ExecutionResult`].

pub mod bridge;
pub mod config;
pub mod enforcer;
pub mod executor;
pub mod handle;
pub mod launcher;
pub mod monitor;
pub mod observer;
pub mod platform;
pub mod request;
pub mod result;
pub mod state;

pub use config::{ConfigError, ExecutorConfig};
pub use enforcer::{LimitEnforcer, Violation};
pub use executor::{CommandOutput, Executor};
pub use handle::{CancellationSignal, ProcessHandle};
pub use observer::{ChannelObserver, ExecutionEvent, ExecutionObserver, NullObserver, StreamKind};
pub use platform::{Platform, PlatformInfo, PlatformLimitStrategy};
pub use request::{ExecutionRequest, Limits, StdioEndpoints, SubmitError};
pub use result::{ExecutionResult, TerminationCause};
pub use state::ProcessState;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_library_exports() {
        // Verify all main types are exported
        let _config = ExecutorConfig::default();
        let _executor = Executor::default();
        let _request = ExecutionRequest::new(["true"]);
        let _platform = Platform::current();
    }
}
