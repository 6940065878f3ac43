//! macOS strategy: one kqueue watching `EVFILT_PROC`/`NOTE_EXIT` for the
//! child and an `EVFILT_USER` event as the cancellation wake.
//!
//! Sampling uses `proc_pidinfo(PROC_PIDTASKINFO)`. The task info has no
//! high-water mark, so the peak is the running maximum of resident size
//! plus `ru_maxrss` (bytes on this platform) at reap.

use super::unix;
use super::{PlatformLimitStrategy, RawExit, ResourceSample, WaitEvent, WakeSignal};
use crate::config::ExecutorConfig;
use crate::request::Limits;
use once_cell::sync::Lazy;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Identifier of the user event inside the kqueue
const WAKE_IDENT: libc::uintptr_t = 1;

/// Mach absolute time to nanoseconds
static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| {
    let mut info = libc::mach_timebase_info { numer: 0, denom: 0 };
    #[allow(deprecated)]
    let ret = unsafe { libc::mach_timebase_info(&mut info) };
    if ret == 0 && info.denom != 0 {
        (info.numer as u64, info.denom as u64)
    } else {
        (1, 1)
    }
});

fn kevent_entry(ident: libc::uintptr_t, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags,
        fflags,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

fn apply_changes(kq: &OwnedFd, changes: &[libc::kevent]) -> io::Result<()> {
    let ret = unsafe {
        libc::kevent(
            kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as libc::c_int,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Cancellation wake triggering the kqueue's user event
#[derive(Debug)]
pub struct KqueueWaker {
    kq: Arc<OwnedFd>,
}

impl WakeSignal for KqueueWaker {
    fn wake(&self) {
        let trigger = kevent_entry(WAKE_IDENT, libc::EVFILT_USER, 0, libc::NOTE_TRIGGER);
        if let Err(e) = apply_changes(&self.kq, &[trigger]) {
            debug!("kqueue wake failed: {}", e);
        }
    }
}

pub struct MacosStrategy {
    pid: i32,
    kq: Arc<OwnedFd>,
    waker: Arc<KqueueWaker>,
    kill_group: bool,
    /// The child exited before NOTE_EXIT could be registered
    exited_early: bool,
    peak_resident: u64,
    reaped: bool,
}

impl PlatformLimitStrategy for MacosStrategy {
    type Waker = KqueueWaker;

    const NAME: &'static str = "macos-kqueue";
    const NATIVE_WAKE: bool = true;

    fn configure(cmd: &mut Command, limits: &Limits, config: &ExecutorConfig) {
        unix::configure_command(cmd, limits, config);
    }

    fn attach(child: &Child, _limits: &Limits, config: &ExecutorConfig) -> io::Result<Self> {
        let pid = child.id() as i32;

        let raw = unsafe { libc::kqueue() };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let kq = Arc::new(unsafe { OwnedFd::from_raw_fd(raw) });

        let user = kevent_entry(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
        );
        apply_changes(&kq, &[user])?;

        let proc_exit = kevent_entry(
            pid as libc::uintptr_t,
            libc::EVFILT_PROC,
            libc::EV_ADD | libc::EV_ONESHOT,
            libc::NOTE_EXIT,
        );
        let exited_early = match apply_changes(&kq, &[proc_exit]) {
            Ok(()) => false,
            // Already a zombie: nothing left to watch
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => true,
            Err(e) => return Err(e),
        };

        Ok(Self {
            pid,
            waker: Arc::new(KqueueWaker {
                kq: Arc::clone(&kq),
            }),
            kq,
            kill_group: config.kill_process_group,
            exited_early,
            peak_resident: 0,
            reaped: false,
        })
    }

    fn waker(&self) -> Arc<Self::Waker> {
        Arc::clone(&self.waker)
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<WaitEvent> {
        if self.exited_early {
            return Ok(WaitEvent::Exited);
        }

        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let mut events = [kevent_entry(0, 0, 0, 0), kevent_entry(0, 0, 0, 0)];

        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                &ts,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(WaitEvent::Tick);
            }
            return Err(err);
        }

        let fired = &events[..n as usize];
        if fired.iter().any(|ev| ev.filter == libc::EVFILT_PROC) {
            self.exited_early = true;
            return Ok(WaitEvent::Exited);
        }
        if fired.iter().any(|ev| ev.filter == libc::EVFILT_USER) {
            return Ok(WaitEvent::Woken);
        }

        Ok(WaitEvent::Tick)
    }

    fn sample(&mut self) -> Option<ResourceSample> {
        if self.reaped {
            return None;
        }

        let mut info: libc::proc_taskinfo = unsafe { std::mem::zeroed() };
        let size = std::mem::size_of::<libc::proc_taskinfo>() as libc::c_int;
        let ret = unsafe {
            libc::proc_pidinfo(
                self.pid,
                libc::PROC_PIDTASKINFO,
                0,
                (&mut info as *mut libc::proc_taskinfo).cast::<libc::c_void>(),
                size,
            )
        };
        if ret != size {
            debug!(pid = self.pid, "proc_pidinfo returned no task info this tick");
            return None;
        }

        let (numer, denom) = *TIMEBASE;
        let cpu_nanos = (info.pti_total_user + info.pti_total_system) * numer / denom;

        self.peak_resident = self.peak_resident.max(info.pti_resident_size);
        Some(ResourceSample {
            current_memory_bytes: info.pti_resident_size,
            peak_memory_bytes: self.peak_resident,
            cpu_time: Duration::from_nanos(cpu_nanos),
        })
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        unix::kill_process(self.pid, self.kill_group)
    }

    fn reap(&mut self) -> io::Result<RawExit> {
        let exit = unix::reap_with_rusage(self.pid, 1)?;
        self.reaped = true;
        Ok(exit)
    }
}
