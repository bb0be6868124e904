//! Spawned child processes.
//!
//! Both backends hand their freshly created child to [`Process`], so waiting
//! and termination are the same code path no matter how the child was
//! spawned. All methods take `&self`: one thread may be waiting while another
//! kills the process.

use std::fmt;
use std::io;
use std::time::Duration;

#[cfg(unix)]
use std::process::Child;
#[cfg(unix)]
use std::sync::Mutex;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
use nix::{
    errno::Errno,
    sys::wait::{waitid, Id, WaitPidFlag},
};
#[cfg(unix)]
use nix::unistd::Pid;

use super::error::ProcessDone;

#[cfg(windows)]
use super::error::win32_error;
#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
#[cfg(windows)]
use windows::Win32::System::Threading::{
    GetExitCodeProcess, TerminateProcess, WaitForSingleObject, INFINITE,
};

/// Polling interval for timed waits on POSIX children.
#[cfg(unix)]
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with a status code.
    Code(i32),
    /// Killed by a signal (POSIX only).
    Signal(i32),
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Code(code) => write!(f, "exit code {}", code),
            ExitKind::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Why a process terminated, when something other than the child decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The command's cancellation signal fired.
    Cancelled,
}

/// Exit state of a finished command. Captured once and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExitState {
    kind: ExitKind,
    cause: Option<TerminationCause>,
}

impl ProcessExitState {
    pub(crate) fn new(kind: ExitKind, cause: Option<TerminationCause>) -> Self {
        Self { kind, cause }
    }

    pub fn kind(&self) -> ExitKind {
        self.kind
    }

    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self.kind {
            ExitKind::Code(code) => Some(code),
            ExitKind::Signal(_) => None,
        }
    }

    /// Terminating signal, if the process was killed by one.
    pub fn signal(&self) -> Option<i32> {
        match self.kind {
            ExitKind::Signal(signal) => Some(signal),
            ExitKind::Code(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        self.kind == ExitKind::Code(0)
    }

    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause
    }

    pub fn was_cancelled(&self) -> bool {
        self.cause == Some(TerminationCause::Cancelled)
    }
}

impl fmt::Display for ProcessExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.was_cancelled() {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// A running or finished child process.
pub struct Process {
    pid: u32,
    #[cfg(unix)]
    child: Mutex<Child>,
    #[cfg(windows)]
    handle: HANDLE,
}

// Safety: the process handle is only used with thread-safe Win32 calls
#[cfg(windows)]
unsafe impl Send for Process {}
#[cfg(windows)]
unsafe impl Sync for Process {}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).finish()
    }
}

impl Process {
    /// OS process identifier.
    pub fn id(&self) -> u32 {
        self.pid
    }
}

#[cfg(unix)]
impl Process {
    pub(crate) fn from_child(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
        }
    }

    /// Exit state if the process has already exited, without blocking.
    pub fn try_wait(&self) -> io::Result<Option<ExitKind>> {
        let mut child = self.lock();
        Ok(child.try_wait()?.map(exit_kind))
    }

    /// Block until the process exits.
    ///
    /// Sleeps outside the lock until the child becomes a zombie, then reaps it
    /// under the lock. Other threads can signal the process meanwhile.
    pub fn wait(&self) -> io::Result<ExitKind> {
        self.block_until_exit()?;
        let mut child = self.lock();
        match child.try_wait()? {
            Some(status) => Ok(exit_kind(status)),
            None => child.wait().map(exit_kind),
        }
    }

    /// Wait for exit without reaping, so the pid stays reserved.
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn block_until_exit(&self) -> io::Result<()> {
        let pid = Pid::from_raw(self.pid as i32);
        loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                // Reaped by try_wait on another thread; the status is cached
                Err(Errno::ECHILD) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    fn block_until_exit(&self) -> io::Result<()> {
        while self.try_wait()?.is_none() {
            std::thread::sleep(REAP_INTERVAL);
        }
        Ok(())
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<Option<ExitKind>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(kind) = self.try_wait()? {
                return Ok(Some(kind));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(REAP_INTERVAL.min(deadline - now));
        }
    }

    /// Forcibly terminate the process and its process group.
    pub fn kill(&self) -> io::Result<()> {
        self.signal(Signal::SIGKILL)
    }

    /// Deliver `signal` to the child's process group.
    ///
    /// The child leads its own session, so the group also holds any jobs it
    /// started. Fails with [`ProcessDone`] once the child has exited.
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        // Held across the signal so the pid cannot be reaped and reused meanwhile
        let mut child = self.lock();
        if child.try_wait()?.is_some() {
            return Err(ProcessDone.into());
        }
        let pid = Pid::from_raw(self.pid as i32);
        match signal::killpg(pid, signal) {
            Ok(()) => Ok(()),
            Err(_) => signal::kill(pid, signal).map_err(io::Error::from),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Child> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(unix)]
fn exit_kind(status: std::process::ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ExitKind::Code(code),
        (None, Some(signal)) => ExitKind::Signal(signal),
        (None, None) => ExitKind::Code(-1),
    }
}

#[cfg(windows)]
impl Process {
    /// Take ownership of a process handle returned by process creation.
    pub(crate) fn from_raw_handle(handle: HANDLE, pid: u32) -> Self {
        Self { pid, handle }
    }

    /// Exit state if the process has already exited, without blocking.
    pub fn try_wait(&self) -> io::Result<Option<ExitKind>> {
        self.wait_millis(0)
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<Option<ExitKind>> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(INFINITE - 1);
        self.wait_millis(millis)
    }

    /// Block until the process exits.
    pub fn wait(&self) -> io::Result<ExitKind> {
        match self.wait_millis(INFINITE)? {
            Some(kind) => Ok(kind),
            None => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    /// Forcibly terminate the process. Fails with [`ProcessDone`] once it has exited.
    pub fn kill(&self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Err(ProcessDone.into());
        }
        let result = unsafe { TerminateProcess(self.handle, 1) };
        match result {
            Ok(()) => Ok(()),
            // Exited between the check and the call
            Err(_) if self.try_wait()?.is_some() => Err(ProcessDone.into()),
            Err(e) => Err(win32_error(e)),
        }
    }

    fn wait_millis(&self, millis: u32) -> io::Result<Option<ExitKind>> {
        let result = unsafe { WaitForSingleObject(self.handle, millis) };
        if result == WAIT_TIMEOUT {
            return Ok(None);
        }
        if result != WAIT_OBJECT_0 {
            return Err(io::Error::last_os_error());
        }

        let mut code: u32 = 0;
        unsafe { GetExitCodeProcess(self.handle, &mut code) }.map_err(win32_error)?;
        Ok(Some(ExitKind::Code(code as i32)))
    }
}

#[cfg(windows)]
impl Drop for Process {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}
