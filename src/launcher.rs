//! Process launcher: turns an [`ExecutionRequest`] into a running child
//! under the native strategy's control.

use crate::config::ExecutorConfig;
use crate::platform::PlatformLimitStrategy;
use crate::request::{ExecutionRequest, StdioEndpoints};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// Launch failures. Never surfaced to callers directly: the worker folds
/// them into a `spawnFailed` result.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Invalid working directory: {0}")]
    InvalidWorkingDirectory(String),

    #[error("Cannot open stdio endpoint {path}: {reason}")]
    StdioEndpoint { path: String, reason: String },

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Cannot attach to process: {0}")]
    AttachFailed(String),
}

/// Resolve `argv[0]`. Names without a path separator are searched in
/// `PATH`; anything else is used as given.
pub fn resolve_program(program: &str, cwd: Option<&Path>) -> Result<PathBuf, LaunchError> {
    let path = Path::new(program);
    if path.is_absolute() || path.components().count() > 1 {
        return Ok(path.to_path_buf());
    }

    let search_dir = match cwd {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    which::which_in(program, std::env::var_os("PATH"), search_dir)
        .map_err(|e| LaunchError::ProgramNotFound(format!("{}: {}", program, e)))
}

fn open_endpoint(path: &str, write: bool) -> Result<Stdio, LaunchError> {
    let fail = |e: std::io::Error| LaunchError::StdioEndpoint {
        path: path.to_string(),
        reason: e.to_string(),
    };

    #[cfg(unix)]
    {
        use std::os::fd::OwnedFd;
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::net::UnixStream;

        let meta = std::fs::metadata(path).map_err(fail)?;
        if meta.file_type().is_socket() {
            let stream = UnixStream::connect(path).map_err(fail)?;
            return Ok(Stdio::from(OwnedFd::from(stream)));
        }
    }

    // FIFO, regular file, or Windows named pipe (\\.\pipe\name)
    let file = OpenOptions::new()
        .read(!write)
        .write(write)
        .open(path)
        .map_err(fail)?;
    Ok(Stdio::from(file))
}

/// Build the command for `request` with the strategy's pre-spawn setup
pub fn build_command<S: PlatformLimitStrategy>(
    request: &ExecutionRequest,
    config: &ExecutorConfig,
) -> Result<Command, LaunchError> {
    if let Some(ref dir) = request.cwd {
        if !dir.is_dir() {
            return Err(LaunchError::InvalidWorkingDirectory(dir.display().to_string()));
        }
    }

    let program = resolve_program(request.program(), request.cwd.as_deref())?;
    debug!("Resolved program path: {}", program.display());

    let mut cmd = Command::new(&program);
    cmd.args(request.args());

    if let Some(ref dir) = request.cwd {
        cmd.current_dir(dir);
    }

    match request.stdio {
        StdioEndpoints::Piped => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
        StdioEndpoints::Named {
            ref stdin,
            ref stdout,
            ref stderr,
        } => {
            cmd.stdin(open_endpoint(stdin, false)?)
                .stdout(open_endpoint(stdout, true)?)
                .stderr(open_endpoint(stderr, true)?);
        }
    }

    S::configure(&mut cmd, &request.limits, config);
    Ok(cmd)
}

/// Spawn the child and hand it to the strategy.
///
/// If the strategy cannot attach, the child is killed and reaped before the
/// error is returned.
pub fn launch<S: PlatformLimitStrategy>(
    request: &ExecutionRequest,
    config: &ExecutorConfig,
) -> Result<(Child, S), LaunchError> {
    let mut cmd = build_command::<S>(request, config)?;

    let mut child = cmd
        .spawn()
        .map_err(|e| LaunchError::SpawnFailed(format!("{}: {}", request.program(), e)))?;

    match S::attach(&child, &request.limits, config) {
        Ok(strategy) => Ok((child, strategy)),
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(LaunchError::AttachFailed(e.to_string()))
        }
    }
}
