//! Execution requests and the limits attached to them

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Bytes in one megabyte, as used at the caller boundary
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Errors that reject a submission before any process is created
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Empty argv: at least the program name is required")]
    EmptyArgv,

    #[error("Empty program name in argv[0]")]
    EmptyProgram,
}

/// Resource ceilings for one execution. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    /// CPU/wall timeout (milliseconds)
    pub timeout_ms: u64,

    /// Memory ceiling (bytes)
    pub memory_limit_bytes: u64,
}

impl Limits {
    /// No ceilings at all
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Build limits from caller units: milliseconds and megabytes
    pub fn from_caller(timeout_ms: u64, memory_limit_mb: u64) -> Self {
        Self {
            timeout_ms,
            memory_limit_bytes: memory_limit_mb.saturating_mul(BYTES_PER_MB),
        }
    }

    pub fn has_timeout(&self) -> bool {
        self.timeout_ms > 0
    }

    pub fn has_memory_limit(&self) -> bool {
        self.memory_limit_bytes > 0
    }
}

/// Where the child's stdio is connected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum StdioEndpoints {
    /// Anonymous pipes pumped by the engine into the observer
    #[default]
    Piped,

    /// Caller-established named channels (FIFOs, unix sockets, named pipes).
    /// The paths are opaque to the engine and are opened as-is.
    Named {
        stdin: String,
        stdout: String,
        stderr: String,
    },
}

impl StdioEndpoints {
    pub fn is_piped(&self) -> bool {
        matches!(self, StdioEndpoints::Piped)
    }
}

/// A single request to run a program. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Program followed by its arguments
    pub argv: Vec<String>,

    /// Working directory for the child
    pub cwd: Option<PathBuf>,

    /// Resource ceilings
    #[serde(default)]
    pub limits: Limits,

    /// Stdio wiring
    #[serde(default)]
    pub stdio: StdioEndpoints,
}

impl ExecutionRequest {
    /// Create a request with no limits and piped stdio
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            limits: Limits::unlimited(),
            stdio: StdioEndpoints::Piped,
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.limits.timeout_ms = ms;
        self
    }

    /// Memory ceiling in megabytes, converted to bytes here
    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.limits.memory_limit_bytes = mb.saturating_mul(BYTES_PER_MB);
        self
    }

    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.limits.memory_limit_bytes = bytes;
        self
    }

    pub fn stdio(mut self, stdio: StdioEndpoints) -> Self {
        self.stdio = stdio;
        self
    }

    /// Program name (argv[0])
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// Arguments after the program name
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }

    /// Synchronous validation performed at submission.
    ///
    /// Only malformed input is rejected here. A missing executable or an
    /// invalid working directory is a spawn failure reported in the result.
    pub fn validate(&self) -> Result<(), SubmitError> {
        match self.argv.first() {
            None => Err(SubmitError::EmptyArgv),
            Some(program) if program.is_empty() => Err(SubmitError::EmptyProgram),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_argv_rejected() {
        let request = ExecutionRequest::new(Vec::<String>::new());
        assert_eq!(request.validate(), Err(SubmitError::EmptyArgv));

        let request = ExecutionRequest::new([""]);
        assert_eq!(request.validate(), Err(SubmitError::EmptyProgram));
    }

    #[test]
    fn test_missing_cwd_is_not_a_submit_error() {
        let request = ExecutionRequest::new(["true"]).cwd("/definitely/not/here");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_megabytes_converted_at_boundary() {
        let limits = Limits::from_caller(500, 10);
        assert_eq!(limits.timeout_ms, 500);
        assert_eq!(limits.memory_limit_bytes, 10 * 1024 * 1024);

        let request = ExecutionRequest::new(["cat"]).memory_limit_mb(256);
        assert_eq!(request.limits.memory_limit_bytes, 256 * BYTES_PER_MB);
    }

    #[test]
    fn test_zero_means_unlimited() {
        let limits = Limits::unlimited();
        assert!(!limits.has_timeout());
        assert!(!limits.has_memory_limit());
    }

    #[test]
    fn test_program_and_args() {
        let request = ExecutionRequest::new(["echo", "Hello", "World"]);
        assert_eq!(request.program(), "echo");
        assert_eq!(request.args(), &["Hello".to_string(), "World".to_string()]);
    }

    #[test]
    fn test_request_from_json() {
        let json = r#"{"argv":["cat"],"cwd":null,"limits":{"timeoutMs":1000,"memoryLimitBytes":0}}"#;
        let request: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.limits.timeout_ms, 1000);
        assert!(request.stdio.is_piped());
    }
}
