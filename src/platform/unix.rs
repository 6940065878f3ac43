//! Pieces shared by the POSIX strategies: pre-exec rlimits, group kill,
//! and reaping with kernel accounting.

use super::{RawExit, ResourceSample};
use crate::config::ExecutorConfig;
use crate::enforcer::Violation;
use crate::request::Limits;
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

/// Whole seconds of CPU for the kernel ceiling. RLIMIT_CPU has second
/// granularity, so the polling enforcer covers the sub-second part.
pub fn cpu_rlimit_secs(timeout_ms: u64) -> u64 {
    timeout_ms.div_ceil(1000).max(1)
}

/// Install process-group placement and rlimits on the command
pub fn configure_command(cmd: &mut Command, limits: &Limits, config: &ExecutorConfig) {
    if config.kill_process_group {
        cmd.process_group(0);
    }

    let cpu_secs = (config.kernel_cpu_limit && limits.has_timeout())
        .then(|| cpu_rlimit_secs(limits.timeout_ms));
    let address_space = (config.address_space_limit && limits.has_memory_limit())
        .then_some(limits.memory_limit_bytes);

    if cpu_secs.is_none() && address_space.is_none() {
        return;
    }

    // Runs in the forked child: only async-signal-safe calls below
    unsafe {
        cmd.pre_exec(move || {
            if let Some(secs) = cpu_secs {
                // SIGXCPU at the soft limit, SIGKILL one second later
                set_limit(Resource::RLIMIT_CPU, secs, secs + 1)?;
            }

            if let Some(bytes) = address_space {
                set_limit(Resource::RLIMIT_AS, bytes, bytes)?;
            }

            Ok(())
        });
    }
}

fn set_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;

    // An unprivileged process cannot raise its hard limit
    let hard = if current_hard == libc::RLIM_INFINITY {
        hard as libc::rlim_t
    } else {
        (hard as libc::rlim_t).min(current_hard)
    };
    let soft = (soft as libc::rlim_t).min(hard);

    setrlimit(resource, soft, hard)?;
    Ok(())
}

/// SIGKILL the process, or its whole group when it leads one.
///
/// Must only be called before the process is reaped: an unreaped leader
/// keeps both its pid and its process group id reserved.
pub fn kill_process(pid: i32, group: bool) -> io::Result<()> {
    let pid = Pid::from_raw(pid);

    if group {
        match killpg(pid, Signal::SIGKILL) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("killpg({}) failed, falling back to kill: {}", pid, e),
        }
    }

    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Reap `pid` with `wait4`, collecting rusage in the same call.
///
/// `maxrss_unit` converts `ru_maxrss` to bytes (KiB on Linux, bytes on macOS).
pub fn reap_with_rusage(pid: i32, maxrss_unit: u64) -> io::Result<RawExit> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret == pid {
            break;
        }
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    let sample = ResourceSample {
        current_memory_bytes: 0,
        peak_memory_bytes: (usage.ru_maxrss.max(0) as u64).saturating_mul(maxrss_unit),
        cpu_time: timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime),
    };

    Ok(decode_status(status, Some(sample)))
}

/// Translate a wait status into a [`RawExit`]
pub fn decode_status(status: libc::c_int, usage: Option<ResourceSample>) -> RawExit {
    if libc::WIFEXITED(status) {
        return RawExit {
            exit_code: Some(libc::WEXITSTATUS(status) as i64),
            signal: 0,
            usage,
            native_violation: None,
        };
    }

    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        let native_violation = (signal == libc::SIGXCPU).then_some(Violation::CpuTime);

        return RawExit {
            exit_code: None,
            signal,
            usage,
            native_violation,
        };
    }

    RawExit {
        usage,
        ..RawExit::default()
    }
}
