//! Windows strategy: job objects.
//!
//! The child is created suspended, assigned to a job carrying the CPU-time
//! and memory ceilings, then resumed, so no user code runs outside the job.
//! The worker waits on the process handle and a cancellation event with
//! `WaitForMultipleObjects`. After exit the job's accounting tells whether
//! the kernel enforced a limit.

use super::{PlatformLimitStrategy, RawExit, ResourceSample, WaitEvent, WakeSignal};
use crate::config::ExecutorConfig;
use crate::enforcer::Violation;
use crate::request::Limits;
use std::io;
use std::mem;
use std::os::windows::io::AsRawHandle;
use std::os::windows::process::CommandExt;
use std::process::{Child, Command};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use winapi::shared::minwindef::{DWORD, FALSE, FILETIME};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::jobapi2::{
    AssignProcessToJobObject, CreateJobObjectW, QueryInformationJobObject,
    SetInformationJobObject, TerminateJobObject,
};
use winapi::um::processthreadsapi::{
    GetExitCodeProcess, GetProcessTimes, OpenThread, ResumeThread, TerminateProcess,
};
use winapi::um::psapi::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use winapi::um::synchapi::{CreateEventW, SetEvent, WaitForMultipleObjects};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winbase::{CREATE_SUSPENDED, INFINITE, WAIT_FAILED, WAIT_OBJECT_0};
use winapi::um::winnt::{
    JobObjectBasicAccountingInformation, JobObjectExtendedLimitInformation, HANDLE,
    JOBOBJECT_BASIC_ACCOUNTING_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOB_OBJECT_LIMIT_PROCESS_MEMORY,
    JOB_OBJECT_LIMIT_PROCESS_TIME, THREAD_SUSPEND_RESUME,
};

/// 100ns units per millisecond
const TICKS_PER_MS: u64 = 10_000;

/// Exit code given to processes terminated by this engine
const KILLED_EXIT_CODE: u32 = 1;

/// Owned kernel handle
#[derive(Debug)]
struct OwnedHandle(HANDLE);

// Kernel handles may be used and closed from any thread
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    fn new(handle: HANDLE) -> io::Result<Self> {
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// Process handle borrowed from `std::process::Child`, which outlives us
struct BorrowedProcess(HANDLE);

unsafe impl Send for BorrowedProcess {}

fn filetime_ticks(ft: &FILETIME) -> u64 {
    ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64
}

fn check(ok: i32) -> io::Result<()> {
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Cancellation wake backed by an auto-reset event object
#[derive(Debug)]
pub struct EventWaker {
    event: OwnedHandle,
}

impl WakeSignal for EventWaker {
    fn wake(&self) {
        if unsafe { SetEvent(self.event.0) } == 0 {
            debug!("SetEvent failed: {}", io::Error::last_os_error());
        }
    }
}

pub struct WindowsStrategy {
    pid: u32,
    process: BorrowedProcess,
    job: OwnedHandle,
    waker: Arc<EventWaker>,
    limits: Limits,
    reaped: bool,
}

impl WindowsStrategy {
    fn create_job(limits: &Limits) -> io::Result<OwnedHandle> {
        let job = OwnedHandle::new(unsafe { CreateJobObjectW(ptr::null_mut(), ptr::null()) })?;

        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

        if limits.has_timeout() {
            info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_TIME;
            unsafe {
                *info.BasicLimitInformation.PerProcessUserTimeLimit.QuadPart_mut() =
                    (limits.timeout_ms * TICKS_PER_MS) as i64;
            }
        }

        if limits.has_memory_limit() {
            info.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
            info.ProcessMemoryLimit = limits.memory_limit_bytes as usize;
        }

        check(unsafe {
            SetInformationJobObject(
                job.0,
                JobObjectExtendedLimitInformation,
                (&mut info as *mut JOBOBJECT_EXTENDED_LIMIT_INFORMATION).cast(),
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
            )
        })?;

        Ok(job)
    }

    /// Resume every thread of a process created with CREATE_SUSPENDED
    fn resume_threads(pid: u32) -> io::Result<()> {
        let snapshot = OwnedHandle::new(unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) })?;

        let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
        entry.dwSize = mem::size_of::<THREADENTRY32>() as DWORD;

        let mut resumed = 0;
        let mut more = unsafe { Thread32First(snapshot.0, &mut entry) };
        while more != 0 {
            if entry.th32OwnerProcessID == pid {
                let thread = OwnedHandle::new(unsafe {
                    OpenThread(THREAD_SUSPEND_RESUME, FALSE, entry.th32ThreadID)
                })?;
                if unsafe { ResumeThread(thread.0) } == u32::MAX {
                    return Err(io::Error::last_os_error());
                }
                resumed += 1;
            }
            more = unsafe { Thread32Next(snapshot.0, &mut entry) };
        }

        if resumed == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no threads found for suspended process {}", pid),
            ));
        }
        Ok(())
    }

    fn extended_info(&self) -> Option<JOBOBJECT_EXTENDED_LIMIT_INFORMATION> {
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
        let ok = unsafe {
            QueryInformationJobObject(
                self.job.0,
                JobObjectExtendedLimitInformation,
                (&mut info as *mut JOBOBJECT_EXTENDED_LIMIT_INFORMATION).cast(),
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
                ptr::null_mut(),
            )
        };
        (ok != 0).then_some(info)
    }

    fn accounting(&self) -> Option<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION> {
        let mut info: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION = unsafe { mem::zeroed() };
        let ok = unsafe {
            QueryInformationJobObject(
                self.job.0,
                JobObjectBasicAccountingInformation,
                (&mut info as *mut JOBOBJECT_BASIC_ACCOUNTING_INFORMATION).cast(),
                mem::size_of::<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION>() as DWORD,
                ptr::null_mut(),
            )
        };
        (ok != 0).then_some(info)
    }
}

impl PlatformLimitStrategy for WindowsStrategy {
    type Waker = EventWaker;

    const NAME: &'static str = "windows-job";
    const NATIVE_WAKE: bool = true;

    fn configure(cmd: &mut Command, _limits: &Limits, _config: &ExecutorConfig) {
        cmd.creation_flags(CREATE_SUSPENDED);
    }

    fn attach(child: &Child, limits: &Limits, _config: &ExecutorConfig) -> io::Result<Self> {
        let pid = child.id();
        let process = child.as_raw_handle() as HANDLE;

        let job = Self::create_job(limits)?;
        check(unsafe { AssignProcessToJobObject(job.0, process) })?;
        Self::resume_threads(pid)?;

        let event = OwnedHandle::new(unsafe {
            CreateEventW(ptr::null_mut(), FALSE, FALSE, ptr::null())
        })?;

        Ok(Self {
            pid,
            process: BorrowedProcess(process),
            job,
            waker: Arc::new(EventWaker { event }),
            limits: *limits,
            reaped: false,
        })
    }

    fn waker(&self) -> Arc<Self::Waker> {
        Arc::clone(&self.waker)
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<WaitEvent> {
        let handles = [self.process.0, self.waker.event.0];
        let millis = timeout.as_millis().min((INFINITE - 1) as u128) as DWORD;

        let ret = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), FALSE, millis) };
        match ret {
            r if r == WAIT_OBJECT_0 => Ok(WaitEvent::Exited),
            r if r == WAIT_OBJECT_0 + 1 => Ok(WaitEvent::Woken),
            WAIT_TIMEOUT => Ok(WaitEvent::Tick),
            WAIT_FAILED => Err(io::Error::last_os_error()),
            other => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected wait result {}", other),
            )),
        }
    }

    fn sample(&mut self) -> Option<ResourceSample> {
        if self.reaped {
            return None;
        }

        let mut counters: PROCESS_MEMORY_COUNTERS = unsafe { mem::zeroed() };
        counters.cb = mem::size_of::<PROCESS_MEMORY_COUNTERS>() as DWORD;
        let memory_ok =
            unsafe { GetProcessMemoryInfo(self.process.0, &mut counters, counters.cb) } != 0;

        let mut times: [FILETIME; 4] = unsafe { mem::zeroed() };
        let [creation, exit, kernel, user] = &mut times;
        let times_ok =
            unsafe { GetProcessTimes(self.process.0, creation, exit, kernel, user) } != 0;

        if !memory_ok && !times_ok {
            debug!(pid = self.pid, "No process counters available this tick");
            return None;
        }

        let cpu_ticks = if times_ok {
            filetime_ticks(&times[2]) + filetime_ticks(&times[3])
        } else {
            0
        };

        Some(ResourceSample {
            current_memory_bytes: if memory_ok { counters.WorkingSetSize as u64 } else { 0 },
            peak_memory_bytes: if memory_ok { counters.PeakWorkingSetSize as u64 } else { 0 },
            cpu_time: Duration::from_nanos(cpu_ticks * 100),
        })
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.reaped {
            return Ok(());
        }

        if unsafe { TerminateJobObject(self.job.0, KILLED_EXIT_CODE) } == 0 {
            warn!(
                "TerminateJobObject failed ({}), terminating process",
                io::Error::last_os_error()
            );
            check(unsafe { TerminateProcess(self.process.0, KILLED_EXIT_CODE) })?;
        }
        Ok(())
    }

    fn reap(&mut self) -> io::Result<RawExit> {
        let final_sample = self.sample();

        let mut code: DWORD = 0;
        check(unsafe { GetExitCodeProcess(self.process.0, &mut code) })?;
        self.reaped = true;

        let peak_job = self
            .extended_info()
            .map(|info| info.PeakProcessMemoryUsed as u64)
            .unwrap_or(0);
        let user_ms = self
            .accounting()
            .map(|info| unsafe { *info.TotalUserTime.QuadPart() } as u64 / TICKS_PER_MS)
            .unwrap_or(0);

        let mut usage = final_sample.unwrap_or_default();
        usage.peak_memory_bytes = usage.peak_memory_bytes.max(peak_job);

        // The job terminates over-time processes itself; over-memory
        // allocations fail and the process usually dies with an error code.
        let native_violation = if self.limits.has_timeout() && user_ms >= self.limits.timeout_ms {
            Some(Violation::CpuTime)
        } else if self.limits.has_memory_limit()
            && code != 0
            && peak_job >= self.limits.memory_limit_bytes * 9 / 10
        {
            Some(Violation::Memory)
        } else {
            None
        };

        Ok(RawExit {
            exit_code: Some(code as i64),
            signal: 0,
            usage: Some(usage),
            native_violation,
        })
    }
}
