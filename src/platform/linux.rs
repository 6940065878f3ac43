//! Linux strategy: pidfd + eventfd multiplexed with `poll()`.
//!
//! The pidfd becomes readable when the child exits, without racing on pid
//! reuse. The eventfd is the cancellation wake. Kernels without
//! `pidfd_open` fall back to a `waitid(WNOWAIT)` check every tick.
//!
//! Memory comes from `/proc/<pid>/status` (`VmRSS`, `VmHWM`) while the
//! process lives and from `wait4` rusage (`ru_maxrss`) when it is reaped.

use super::unix;
use super::{PlatformLimitStrategy, RawExit, ResourceSample, WaitEvent, WakeSignal};
use crate::config::ExecutorConfig;
use crate::request::Limits;
use once_cell::sync::Lazy;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Clock ticks per second for `/proc/<pid>/stat` times
static CLOCK_TICKS: Lazy<u64> = Lazy::new(|| {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
});

/// Open a pidfd for `pid`
fn pidfd_open(pid: i32) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Whether this kernel supports `pidfd_open`
pub fn pidfd_supported() -> bool {
    pidfd_open(std::process::id() as i32).is_ok()
}

/// Cancellation wake backed by an eventfd
#[derive(Debug)]
pub struct EventFdWaker {
    fd: OwnedFd,
}

impl EventFdWaker {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Reset the counter after a wake was observed
    fn drain(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut value as *mut u64).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl WakeSignal for EventFdWaker {
    fn wake(&self) {
        let value: u64 = 1;
        // EAGAIN only when the counter would overflow: already signalled
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&value as *const u64).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

pub struct LinuxStrategy {
    pid: i32,
    pidfd: Option<OwnedFd>,
    waker: Arc<EventFdWaker>,
    kill_group: bool,
    reaped: bool,
}

impl LinuxStrategy {
    /// Exit check for kernels without pidfd. WNOWAIT leaves the zombie in
    /// place so the pid stays ours until `reap`.
    fn exited_without_reaping(&self) -> io::Result<bool> {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                self.pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { info.si_pid() } != 0)
    }
}

impl PlatformLimitStrategy for LinuxStrategy {
    type Waker = EventFdWaker;

    const NAME: &'static str = "linux-pidfd";
    const NATIVE_WAKE: bool = true;

    fn configure(cmd: &mut Command, limits: &Limits, config: &ExecutorConfig) {
        unix::configure_command(cmd, limits, config);
    }

    fn attach(child: &Child, _limits: &Limits, config: &ExecutorConfig) -> io::Result<Self> {
        let pid = child.id() as i32;

        let pidfd = match pidfd_open(pid) {
            Ok(fd) => Some(fd),
            Err(e) => {
                warn!("pidfd_open unavailable ({}), using waitid polling", e);
                None
            }
        };

        Ok(Self {
            pid,
            pidfd,
            waker: Arc::new(EventFdWaker::new()?),
            kill_group: config.kill_process_group,
            reaped: false,
        })
    }

    fn waker(&self) -> Arc<Self::Waker> {
        Arc::clone(&self.waker)
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<WaitEvent> {
        let wake_fd = self.waker.fd.as_raw_fd();
        let mut fds = vec![libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        if let Some(ref pidfd) = self.pidfd {
            fds.push(libc::pollfd {
                fd: pidfd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(WaitEvent::Tick);
            }
            return Err(err);
        }

        // Exit wins over a simultaneous wake
        let exited = match fds.get(1) {
            Some(pidfd) => pidfd.revents & libc::POLLIN != 0,
            None => self.exited_without_reaping()?,
        };
        if exited {
            return Ok(WaitEvent::Exited);
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.waker.drain();
            return Ok(WaitEvent::Woken);
        }

        Ok(WaitEvent::Tick)
    }

    fn sample(&mut self) -> Option<ResourceSample> {
        if self.reaped {
            return None;
        }

        let memory = read_status_memory(self.pid);
        let cpu_time = read_stat_cpu_time(self.pid);

        if memory.is_none() && cpu_time.is_none() {
            debug!(pid = self.pid, "No /proc sample available this tick");
            return None;
        }

        let (current, peak) = memory.unwrap_or((0, 0));
        Some(ResourceSample {
            current_memory_bytes: current,
            peak_memory_bytes: peak,
            cpu_time: cpu_time.unwrap_or_default(),
        })
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        unix::kill_process(self.pid, self.kill_group)
    }

    fn reap(&mut self) -> io::Result<RawExit> {
        let exit = unix::reap_with_rusage(self.pid, 1024)?;
        self.reaped = true;
        Ok(exit)
    }
}

/// `(VmRSS, VmHWM)` in bytes from `/proc/<pid>/status`.
/// Zombies no longer report these lines.
fn read_status_memory(pid: i32) -> Option<(u64, u64)> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_status_memory(&status)
}

fn parse_status_memory(status: &str) -> Option<(u64, u64)> {
    fn kb_field(line: &str, key: &str) -> Option<u64> {
        line.strip_prefix(key)?
            .split_whitespace()
            .next()?
            .parse::<u64>()
            .ok()
            .map(|kb| kb * 1024)
    }

    let mut rss = None;
    let mut hwm = None;
    for line in status.lines() {
        if let Some(v) = kb_field(line, "VmRSS:") {
            rss = Some(v);
        } else if let Some(v) = kb_field(line, "VmHWM:") {
            hwm = Some(v);
        }
    }

    let rss = rss?;
    Some((rss, hwm.unwrap_or(rss)))
}

/// utime + stime from `/proc/<pid>/stat`
fn read_stat_cpu_time(pid: i32) -> Option<Duration> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat_cpu_time(&stat, *CLOCK_TICKS)
}

fn parse_stat_cpu_time(stat: &str, ticks_per_sec: u64) -> Option<Duration> {
    // comm may contain spaces and parentheses: fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is state (field 3); utime is field 14, stime field 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;

    let ticks = utime + stime;
    Some(Duration::from_millis(ticks * 1000 / ticks_per_sec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_parse_status_memory() {
        let status = "Name:\tcat\nVmPeak:\t   9000 kB\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\n";
        assert_eq!(parse_status_memory(status), Some((1024 * 1024, 2048 * 1024)));

        // Zombie: no memory lines at all
        assert_eq!(parse_status_memory("Name:\tcat\nState:\tZ (zombie)\n"), None);
    }

    #[test]
    fn test_parse_stat_cpu_time() {
        let stat = "1234 (my (odd) prog) R 1 1234 1234 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0 1 1 1";
        assert_eq!(
            parse_stat_cpu_time(stat, 100),
            Some(Duration::from_millis(3000))
        );
        assert_eq!(parse_stat_cpu_time("garbage", 100), None);
    }

    #[test]
    fn test_sample_self_like_child() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let mut strategy =
            LinuxStrategy::attach(&child, &Limits::unlimited(), &ExecutorConfig::default())
                .unwrap();

        let sample = strategy.sample().expect("live process should be sampled");
        assert!(sample.current_memory_bytes > 0);
        assert!(sample.peak() >= sample.current_memory_bytes);

        strategy.kill().unwrap();
        assert_eq!(
            strategy.wait(Duration::from_secs(5)).unwrap(),
            WaitEvent::Exited
        );
        let exit = strategy.reap().unwrap();
        assert_eq!(exit.signal, libc::SIGKILL);
        assert!(strategy.sample().is_none());
    }

    /// Strategy as attached on a kernel without `pidfd_open`
    fn attach_without_pidfd(child: &std::process::Child) -> LinuxStrategy {
        LinuxStrategy {
            pid: child.id() as i32,
            pidfd: None,
            waker: Arc::new(EventFdWaker::new().unwrap()),
            kill_group: false,
            reaped: false,
        }
    }

    #[test]
    fn test_waitid_fallback_detects_exit() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let mut strategy = attach_without_pidfd(&child);

        assert_eq!(
            strategy.wait(Duration::from_millis(20)).unwrap(),
            WaitEvent::Tick
        );
        assert!(strategy.sample().is_some());

        strategy.kill().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while strategy.wait(Duration::from_millis(20)).unwrap() != WaitEvent::Exited {
            assert!(Instant::now() < deadline, "exit not detected without pidfd");
        }

        // WNOWAIT left the zombie for the real reap
        let exit = strategy.reap().unwrap();
        assert_eq!(exit.signal, libc::SIGKILL);
        assert_eq!(exit.exit_code, None);
    }

    #[test]
    fn test_waitid_fallback_still_woken() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let mut strategy = attach_without_pidfd(&child);

        strategy.waker().wake();
        assert_eq!(
            strategy.wait(Duration::from_secs(5)).unwrap(),
            WaitEvent::Woken
        );

        strategy.kill().unwrap();
        while strategy.wait(Duration::from_millis(20)).unwrap() != WaitEvent::Exited {}
        strategy.reap().unwrap();
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let mut strategy =
            LinuxStrategy::attach(&child, &Limits::unlimited(), &ExecutorConfig::default())
                .unwrap();

        let waker = strategy.waker();
        let started = Instant::now();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake();
            waker.wake();
        });

        assert_eq!(
            strategy.wait(Duration::from_secs(5)).unwrap(),
            WaitEvent::Woken
        );
        assert!(started.elapsed() < Duration::from_secs(2));

        // Drained: the next wait times out
        assert_eq!(
            strategy.wait(Duration::from_millis(10)).unwrap(),
            WaitEvent::Tick
        );

        strategy.kill().unwrap();
        while strategy.wait(Duration::from_millis(100)).unwrap() != WaitEvent::Exited {}
        strategy.reap().unwrap();
    }
}
