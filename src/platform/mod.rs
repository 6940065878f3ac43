//! Platform abstraction for OS-specific process control
//!
//! Every OS family provides one [`PlatformLimitStrategy`]. The monitor worker
//! is written once against the trait; [`NativeStrategy`] picks the
//! implementation at build time:
//!
//! - Linux: pidfd + eventfd wait, `/proc` sampling, pre-exec rlimits
//! - macOS: kqueue (`EVFILT_PROC` + `EVFILT_USER`), `proc_pidinfo` sampling,
//!   pre-exec rlimits
//! - Windows: suspended creation, job object limits, event object wait

use crate::config::ExecutorConfig;
use crate::enforcer::Violation;
use crate::request::Limits;
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
pub mod unix;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(windows)]
pub mod windows;

#[cfg(target_os = "linux")]
pub type NativeStrategy = linux::LinuxStrategy;

#[cfg(target_os = "macos")]
pub type NativeStrategy = macos::MacosStrategy;

#[cfg(windows)]
pub type NativeStrategy = windows::WindowsStrategy;

/// Point-in-time resource reading of a live process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    /// Resident memory right now (bytes)
    pub current_memory_bytes: u64,

    /// High-water mark as reported by the OS (bytes), 0 if unknown
    pub peak_memory_bytes: u64,

    /// Accumulated user + system CPU time
    pub cpu_time: Duration,
}

impl ResourceSample {
    /// Best peak estimate this sample carries
    pub fn peak(&self) -> u64 {
        self.peak_memory_bytes.max(self.current_memory_bytes)
    }
}

/// Why a blocking wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// The process exited and is ready to be reaped
    Exited,
    /// The cancellation signal fired
    Woken,
    /// The timeout elapsed
    Tick,
}

/// Exit status plus the final accounting collected while reaping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawExit {
    /// Voluntary exit code
    pub exit_code: Option<i64>,

    /// Terminating signal, 0 if none
    pub signal: i32,

    /// Kernel accounting at reap time
    pub usage: Option<ResourceSample>,

    /// Violation the OS itself unambiguously reported
    pub native_violation: Option<Violation>,
}

/// Cross-thread wake primitive of the cancellation signal
pub trait WakeSignal: Send + Sync {
    /// Interrupt the worker's current wait. Safe from any thread.
    fn wake(&self);
}

/// One implementation per OS family of launch-time limits, waiting,
/// sampling, killing and reaping.
pub trait PlatformLimitStrategy: Sized + Send {
    type Waker: WakeSignal + 'static;

    /// Short identifier for logs and `procguard info`
    const NAME: &'static str;

    /// Whether cancellation interrupts a wait without polling latency
    const NATIVE_WAKE: bool;

    /// Prepare the command before spawn (pre-exec limits, creation flags)
    fn configure(cmd: &mut Command, limits: &Limits, config: &ExecutorConfig);

    /// Take control of a freshly spawned child
    fn attach(child: &Child, limits: &Limits, config: &ExecutorConfig) -> io::Result<Self>;

    /// The wake primitive handed to the caller-facing handle
    fn waker(&self) -> Arc<Self::Waker>;

    /// Block until exit, wake, or `timeout` elapses
    fn wait(&mut self, timeout: Duration) -> io::Result<WaitEvent>;

    /// Read current usage; `None` if nothing could be read this tick
    fn sample(&mut self) -> Option<ResourceSample>;

    /// Hard-kill the process (and its group where supported)
    fn kill(&mut self) -> io::Result<()>;

    /// Collect the exit status; must be called once, after `Exited`
    fn reap(&mut self) -> io::Result<RawExit>;
}

/// Platform identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    MacOS,
    Windows,
    Unknown,
}

impl Platform {
    /// Get current platform
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Unknown
        }
    }

    /// Get platform name as string
    pub fn name(&self) -> &str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOS => "macos",
            Platform::Windows => "windows",
            Platform::Unknown => "unknown",
        }
    }

    /// Limits applied between fork and exec (rlimits)
    pub fn has_pre_exec_limits(&self) -> bool {
        matches!(self, Platform::Linux | Platform::MacOS)
    }

    /// Limits enforced by a kernel-level group (job objects)
    pub fn has_limit_groups(&self) -> bool {
        matches!(self, Platform::Windows)
    }
}

/// Platform information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Platform type
    pub platform: Platform,

    /// Operating system name
    pub os_name: String,

    /// Architecture
    pub arch: String,

    /// Number of CPUs
    pub cpu_count: usize,

    /// Total memory (MB)
    pub total_memory_mb: u64,

    /// Selected limit strategy
    pub strategy: String,

    /// Cancellation wakes the worker immediately
    pub native_wake: bool,

    /// pidfd available (Linux only)
    pub pidfd_supported: bool,
}

impl PlatformInfo {
    /// Get platform information
    pub fn detect() -> Self {
        Self {
            platform: Platform::current(),
            os_name: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            total_memory_mb: Self::get_total_memory(),
            strategy: NativeStrategy::NAME.to_string(),
            native_wake: NativeStrategy::NATIVE_WAKE,
            pidfd_supported: Self::check_pidfd(),
        }
    }

    fn get_total_memory() -> u64 {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|s| {
                    s.lines()
                        .find(|l| l.starts_with("MemTotal:"))
                        .and_then(|l| {
                            l.split_whitespace()
                                .nth(1)
                                .and_then(|n| n.parse::<u64>().ok())
                                .map(|kb| kb / 1024) // Convert KB to MB
                        })
                })
                .unwrap_or(0)
        }

        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    fn check_pidfd() -> bool {
        #[cfg(target_os = "linux")]
        {
            linux::pidfd_supported()
        }

        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }
}
