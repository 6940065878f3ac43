//! Limit enforcement policy
//!
//! Pure decision logic shared by every platform: whether a sample crosses a
//! ceiling, how simultaneous violations are attributed, and how an exit
//! caused by an ambiguous kill signal is classified afterwards. The monitor
//! worker owns the mechanics (sampling, killing).

use crate::config::ExecutorConfig;
use crate::platform::RawExit;
use crate::request::Limits;
use crate::result::TerminationCause;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Signal that both the kernel's own enforcement and our kill may produce
#[cfg(unix)]
const AMBIGUOUS_KILL_SIGNAL: i32 = libc::SIGKILL;

#[cfg(not(unix))]
const AMBIGUOUS_KILL_SIGNAL: i32 = -1;

/// A crossed ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Violation {
    /// Accumulated CPU time reached the timeout
    CpuTime,
    /// The wall-clock backstop elapsed
    WallClock,
    /// Peak memory went over the ceiling
    Memory,
}

impl Violation {
    pub fn cause(&self) -> TerminationCause {
        match self {
            Violation::CpuTime | Violation::WallClock => TerminationCause::TimedOut,
            Violation::Memory => TerminationCause::MemoryExceeded,
        }
    }
}

/// Per-process enforcement policy
#[derive(Debug, Clone)]
pub struct LimitEnforcer {
    limits: Limits,
    cpu_threshold: f64,
    backstop: Option<Duration>,
    address_space_limit: bool,
}

impl LimitEnforcer {
    pub fn new(limits: Limits, config: &ExecutorConfig) -> Self {
        let backstop = limits.has_timeout().then(|| {
            Duration::from_millis((limits.timeout_ms as f64 * config.wall_clock_multiplier).round() as u64)
        });

        Self {
            limits,
            cpu_threshold: config.cpu_attribution_threshold,
            backstop,
            address_space_limit: config.address_space_limit,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Wall-clock instant (relative to start) at which the process is killed
    /// regardless of CPU accounting
    pub fn backstop(&self) -> Option<Duration> {
        self.backstop
    }

    /// How long the worker may block before the next check
    pub fn next_wait(&self, elapsed: Duration, poll_interval: Duration) -> Duration {
        match self.backstop {
            Some(backstop) => poll_interval.min(backstop.saturating_sub(elapsed)),
            None => poll_interval,
        }
    }

    fn cpu_ratio(&self, cpu_time: Duration) -> f64 {
        if !self.limits.has_timeout() {
            return 0.0;
        }
        cpu_time.as_secs_f64() * 1000.0 / self.limits.timeout_ms as f64
    }

    fn memory_ratio(&self, peak_memory: u64) -> f64 {
        if !self.limits.has_memory_limit() {
            return 0.0;
        }
        peak_memory as f64 / self.limits.memory_limit_bytes as f64
    }

    /// Decide whether the running process must be killed.
    ///
    /// When memory is over its ceiling while CPU time is within the
    /// attribution threshold of its own, the violation counts as time.
    pub fn check(&self, cpu_time: Duration, peak_memory: u64, elapsed: Duration) -> Option<Violation> {
        let cpu_over = self.limits.has_timeout()
            && cpu_time >= Duration::from_millis(self.limits.timeout_ms);
        let wall_over = self.backstop.map_or(false, |b| elapsed >= b);
        let memory_over =
            self.limits.has_memory_limit() && peak_memory > self.limits.memory_limit_bytes;

        if memory_over {
            if self.cpu_ratio(cpu_time) >= self.cpu_threshold {
                return Some(Violation::CpuTime);
            }
            return Some(Violation::Memory);
        }

        if cpu_over {
            Some(Violation::CpuTime)
        } else if wall_over {
            Some(Violation::WallClock)
        } else {
            None
        }
    }

    /// Classify an exit the engine did not cause itself.
    ///
    /// A peak over the memory ceiling counts as a violation however the
    /// process ended, with the same tie-break as [`check`](Self::check).
    ///
    /// Best effort: a SIGKILL may come from the kernel's CPU rlimit, an
    /// OOM kill, or someone else entirely. It is attributed to whichever
    /// ceiling the process was close to, time first.
    pub fn attribute_exit(&self, exit: &RawExit, cpu_time: Duration, peak_memory: u64) -> Option<Violation> {
        if let Some(violation) = exit.native_violation {
            return Some(violation);
        }

        let cpu_close = self.cpu_ratio(cpu_time) >= self.cpu_threshold;
        let memory_close = self.memory_ratio(peak_memory) >= self.cpu_threshold;

        // A burst between two ticks only shows up in the reap accounting
        let memory_over =
            self.limits.has_memory_limit() && peak_memory > self.limits.memory_limit_bytes;
        if memory_over {
            if cpu_close {
                return Some(Violation::CpuTime);
            }
            return Some(Violation::Memory);
        }

        if exit.signal == AMBIGUOUS_KILL_SIGNAL {
            if cpu_close {
                return Some(Violation::CpuTime);
            }
            if memory_close {
                return Some(Violation::Memory);
            }
            return None;
        }

        // Under an address-space rlimit allocations fail instead of the
        // process being killed
        let abnormal = exit.signal != 0 || exit.exit_code.map_or(true, |c| c != 0);
        if self.address_space_limit && abnormal && memory_close {
            return Some(Violation::Memory);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn enforcer(timeout_ms: u64, memory_mb: u64) -> LimitEnforcer {
        LimitEnforcer::new(Limits::from_caller(timeout_ms, memory_mb), &ExecutorConfig::default())
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_within_limits() {
        let e = enforcer(1000, 64);
        assert_eq!(e.check(ms(100), 10 * MB, ms(200)), None);
    }

    #[test]
    fn test_unlimited_never_fires() {
        let e = enforcer(0, 0);
        assert_eq!(e.backstop(), None);
        assert_eq!(e.check(ms(1_000_000), u64::MAX, ms(1_000_000)), None);
    }

    #[test]
    fn test_cpu_time_violation() {
        let e = enforcer(500, 0);
        assert_eq!(e.check(ms(500), 0, ms(510)), Some(Violation::CpuTime));
    }

    #[test]
    fn test_wall_clock_backstop() {
        let e = enforcer(500, 0);
        assert_eq!(e.backstop(), Some(ms(750)));
        // Sleeping process: no CPU, wall time past the backstop
        assert_eq!(e.check(ms(1), 0, ms(749)), None);
        assert_eq!(e.check(ms(1), 0, ms(750)), Some(Violation::WallClock));
        assert_eq!(Violation::WallClock.cause(), TerminationCause::TimedOut);
    }

    #[test]
    fn test_memory_violation() {
        let e = enforcer(1000, 10);
        assert_eq!(e.check(ms(100), 11 * MB, ms(100)), Some(Violation::Memory));
        assert_eq!(e.check(ms(100), 10 * MB, ms(100)), None);
    }

    #[test]
    fn test_tie_break_prefers_cpu_when_close() {
        let e = enforcer(1000, 10);
        // Memory over, CPU at 95% of its ceiling
        assert_eq!(e.check(ms(950), 20 * MB, ms(960)), Some(Violation::CpuTime));
        // Memory over, CPU at 50%
        assert_eq!(e.check(ms(500), 20 * MB, ms(1600)), Some(Violation::Memory));
    }

    #[test]
    fn test_next_wait_bounded_by_backstop() {
        let e = enforcer(100, 0);
        assert_eq!(e.next_wait(ms(0), ms(20)), ms(20));
        assert_eq!(e.next_wait(ms(140), ms(20)), ms(10));
        assert_eq!(e.next_wait(ms(500), ms(20)), Duration::ZERO);
        assert_eq!(enforcer(0, 0).next_wait(ms(500), ms(20)), ms(20));
    }

    #[test]
    fn test_native_violation_wins() {
        let e = enforcer(1000, 10);
        let exit = RawExit {
            native_violation: Some(Violation::Memory),
            ..RawExit::default()
        };
        assert_eq!(e.attribute_exit(&exit, ms(0), 0), Some(Violation::Memory));
    }

    #[cfg(unix)]
    #[test]
    fn test_ambiguous_kill_attribution() {
        let e = enforcer(1000, 10);
        let killed = RawExit {
            exit_code: None,
            signal: libc::SIGKILL,
            ..RawExit::default()
        };

        assert_eq!(e.attribute_exit(&killed, ms(990), 10 * MB), Some(Violation::CpuTime));
        assert_eq!(e.attribute_exit(&killed, ms(100), 10 * MB), Some(Violation::Memory));
        // Far from both ceilings: somebody else killed it
        assert_eq!(e.attribute_exit(&killed, ms(100), MB), None);
    }

    #[test]
    fn test_overshoot_between_ticks_attributed_to_memory() {
        let e = enforcer(1000, 10);
        let clean = RawExit {
            exit_code: Some(0),
            ..RawExit::default()
        };

        assert_eq!(e.attribute_exit(&clean, ms(5), 17 * MB), Some(Violation::Memory));
        // At the ceiling is still within it
        assert_eq!(e.attribute_exit(&clean, ms(5), 10 * MB), None);
        // Close to the CPU ceiling: counts as time, as while running
        assert_eq!(e.attribute_exit(&clean, ms(950), 17 * MB), Some(Violation::CpuTime));
        // No ceiling configured
        assert_eq!(enforcer(1000, 0).attribute_exit(&clean, ms(5), 17 * MB), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_foreign_signal_not_attributed() {
        let e = enforcer(1000, 10);
        let segv = RawExit {
            exit_code: None,
            signal: libc::SIGSEGV,
            ..RawExit::default()
        };
        assert_eq!(e.attribute_exit(&segv, ms(990), 10 * MB), None);
    }

    #[test]
    fn test_address_space_failure_attributed_to_memory() {
        let config = ExecutorConfig {
            address_space_limit: true,
            ..Default::default()
        };
        let e = LimitEnforcer::new(Limits::from_caller(0, 10), &config);
        let failed = RawExit {
            exit_code: Some(1),
            ..RawExit::default()
        };
        assert_eq!(e.attribute_exit(&failed, ms(5), 10 * MB), Some(Violation::Memory));

        let clean = RawExit {
            exit_code: Some(0),
            ..RawExit::default()
        };
        assert_eq!(e.attribute_exit(&clean, ms(5), 10 * MB), None);
    }
}
