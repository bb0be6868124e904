//! POSIX pseudo-terminal backend.
//!
//! The master side stays in this process for read/write/resize. The
//! subordinate side becomes stdin, stdout and stderr of each child, which is
//! started as a session leader with the subordinate as its controlling
//! terminal so job control and `SIGWINCH` reach it.
//!
//! Reads and writes poll the master together with a wake pipe. `close`
//! writes to the wake pipe before releasing the devices, so a thread blocked
//! in `read` returns [`IoError::Closed`] instead of hanging. Both ends of the
//! wake pipe are released by `close` along with the devices.

use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command as StdCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use tracing::{debug, info};

use super::{Lease, Spawn, SpawnRequest, Terminal, WindowSize};
use crate::core::codec::{self, EnvCase};
use crate::core::error::{IoError, OpenError, ResizeError, StartError};
use crate::core::process::Process;

/// POSIX-only process attributes.
#[derive(Debug, Clone, Default)]
pub struct ProcAttr {
    /// Run the child as this user id.
    pub uid: Option<u32>,
    /// Run the child as this group id.
    pub gid: Option<u32>,
}

struct Devices {
    master: File,
    slave: File,
    wake_rx: File,
}

/// Master/subordinate terminal device pair.
pub struct PosixPty {
    devices: RwLock<Option<Devices>>,
    closed: AtomicBool,
    /// Serializes device-control calls on the master.
    control: Mutex<()>,
    /// Write end of the wake pipe; taken by `close`.
    wake_tx: Mutex<Option<File>>,
    lease: Lease,
    name: String,
}

impl PosixPty {
    pub(crate) fn open(size: WindowSize) -> Result<Self, OpenError> {
        let winsize = Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pair = openpty(Some(&winsize), None).map_err(|e| OpenError::Allocate(e.into()))?;

        set_cloexec(&pair.master).map_err(OpenError::Allocate)?;
        set_cloexec(&pair.slave).map_err(OpenError::Allocate)?;
        set_nonblocking(&pair.master).map_err(OpenError::Allocate)?;

        let (wake_rx, wake_tx) = nix::unistd::pipe().map_err(|e| OpenError::Allocate(e.into()))?;
        set_cloexec(&wake_rx).map_err(OpenError::Allocate)?;
        set_cloexec(&wake_tx).map_err(OpenError::Allocate)?;

        let name = device_name(pair.slave.as_raw_fd());
        info!("Opened pseudo-terminal {} ({}x{})", name, size.cols, size.rows);

        Ok(Self {
            devices: RwLock::new(Some(Devices {
                master: File::from(pair.master),
                slave: File::from(pair.slave),
                wake_rx: File::from(wake_rx),
            })),
            closed: AtomicBool::new(false),
            control: Mutex::new(()),
            wake_tx: Mutex::new(Some(File::from(wake_tx))),
            lease: Lease::default(),
            name,
        })
    }

    /// Run `f` with the raw master descriptor for a device-control call.
    ///
    /// Calls are serialized, and the terminal cannot be closed while `f` runs.
    ///
    /// # Safety
    ///
    /// `f` must not close the descriptor or keep it beyond the call.
    pub unsafe fn control<F, R>(&self, f: F) -> Result<R, ResizeError>
    where
        F: FnOnce(RawFd) -> R,
    {
        let devices = self.devices()?;
        let devices = devices.as_ref().ok_or(ResizeError::Closed)?;
        let _serial = lock(&self.control);
        Ok(f(devices.master.as_raw_fd()))
    }

    fn devices(&self) -> Result<RwLockReadGuard<'_, Option<Devices>>, ResizeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResizeError::Closed);
        }
        Ok(match self.devices.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    /// Wait until the master is ready for `events` or the terminal closes.
    ///
    /// Returns `false` if `timeout` passes first.
    fn ready(
        &self,
        devices: &Devices,
        events: PollFlags,
        timeout: PollTimeout,
        on_error: fn(io::Error) -> IoError,
    ) -> Result<bool, IoError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(IoError::Closed);
            }
            let mut fds = [
                PollFd::new(devices.master.as_fd(), events),
                PollFd::new(devices.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(on_error(e.into())),
            }
            if fds[1].revents().map_or(false, |r| !r.is_empty()) {
                return Err(IoError::Closed);
            }
            if fds[0].revents().map_or(false, |r| !r.is_empty()) {
                return Ok(true);
            }
        }
    }

    fn read_ready(
        &self,
        devices: &Devices,
        buf: &mut [u8],
        timeout: PollTimeout,
    ) -> Result<Option<usize>, IoError> {
        loop {
            if !self.ready(devices, PollFlags::POLLIN, timeout, IoError::Read)? {
                return Ok(None);
            }
            match (&devices.master).read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports EIO once no process holds the subordinate side open
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(Some(0)),
                Err(e) => return Err(IoError::Read(e)),
            }
        }
    }
}

impl Terminal for PosixPty {
    fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let devices = self.devices().map_err(|_| IoError::Closed)?;
        let devices = devices.as_ref().ok_or(IoError::Closed)?;
        let n = self.read_ready(devices, buf, PollTimeout::NONE)?;
        Ok(n.unwrap_or_default())
    }

    fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, IoError> {
        let devices = self.devices().map_err(|_| IoError::Closed)?;
        let devices = devices.as_ref().ok_or(IoError::Closed)?;
        if buf.is_empty() {
            return Ok(Some(0));
        }
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        self.read_ready(devices, buf, timeout)
    }

    fn write(&self, data: &[u8]) -> Result<usize, IoError> {
        let devices = self.devices().map_err(|_| IoError::Closed)?;
        let devices = devices.as_ref().ok_or(IoError::Closed)?;
        if data.is_empty() {
            return Ok(0);
        }

        loop {
            self.ready(devices, PollFlags::POLLOUT, PollTimeout::NONE, IoError::Write)?;
            match (&devices.master).write(data) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IoError::Write(e)),
            }
        }
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<(), ResizeError> {
        let size = WindowSize::new(rows, cols);
        if !size.is_valid() {
            return Err(ResizeError::InvalidSize { rows, cols });
        }
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: TIOCSWINSZ only reads the winsize struct and leaves the fd open
        let result = unsafe {
            self.control(|fd| {
                ioctl_result(libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsize as *const Winsize))
            })?
        };
        result.map_err(ResizeError::Device)?;

        info!("Resize {}: {}x{}", self.name, cols, rows);
        Ok(())
    }

    fn size(&self) -> Result<WindowSize, ResizeError> {
        let mut winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: TIOCGWINSZ fills the winsize struct and leaves the fd open
        let result = unsafe {
            self.control(|fd| {
                ioctl_result(libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut winsize as *mut Winsize))
            })?
        };
        result.map_err(ResizeError::Device)?;
        Ok(WindowSize::new(winsize.ws_row, winsize.ws_col))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Wake pollers first; they drop their read guards and let us in
        let wake_tx = lock(&self.wake_tx).take();
        if let Some(wake_tx) = &wake_tx {
            let _ = (&*wake_tx).write(&[1]);
        }

        let devices = match self.devices.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(devices);
        drop(wake_tx);
        info!("Closed pseudo-terminal {}", self.name);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Spawn for PosixPty {
    fn lease(&self) -> &Lease {
        &self.lease
    }

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<Process, StartError> {
        let devices = self.devices().map_err(|_| StartError::Closed)?;
        let devices = devices.as_ref().ok_or(StartError::Closed)?;

        let stdio = || -> Result<Stdio, StartError> {
            let slave = devices.slave.try_clone().map_err(StartError::Spawn)?;
            Ok(Stdio::from(slave))
        };

        let mut command = StdCommand::new(request.program);
        command
            .arg0(request.arg0)
            .args(request.args)
            .stdin(stdio()?)
            .stdout(stdio()?)
            .stderr(stdio()?);

        if let Some(env) = request.env {
            command
                .env_clear()
                .envs(codec::dedup_environment(env.iter().cloned(), EnvCase::Sensitive));
        }
        if let Some(dir) = request.dir {
            command.current_dir(dir);
        }
        if let Some(uid) = request.attrs.uid {
            command.uid(uid);
        }
        if let Some(gid) = request.attrs.gid {
            command.gid(gid);
        }

        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                // stdin is the subordinate device by now
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(StartError::Spawn)?;
        debug!("Spawned pid {} on {}", child.id(), self.name);
        Ok(Process::from_child(child))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Read errno right after the ioctl, before anything else can clobber it.
fn ioctl_result(result: libc::c_int) -> io::Result<()> {
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: &impl AsRawFd) -> io::Result<()> {
    // SAFETY: plain fcntl on a descriptor we own
    let result = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    // SAFETY: plain fcntl on a descriptor we own
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn device_name(fd: RawFd) -> String {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: buf outlives the call and its length is passed along
    let result = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if result != 0 {
        return format!("pty:{}", fd);
    }
    // SAFETY: ttyname_r NUL-terminates on success
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_device_name_looks_like_a_tty() {
        let pty = PosixPty::open(WindowSize::default()).unwrap();
        assert!(pty.name().starts_with("/dev/"), "unexpected name {}", pty.name());
        pty.close();
    }

    #[test]
    fn test_close_unblocks_pending_read() {
        let pty = Arc::new(PosixPty::open(WindowSize::default()).unwrap());
        let reader = {
            let pty = pty.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                pty.read(&mut buf)
            })
        };

        thread::sleep(Duration::from_millis(100));
        pty.close();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(IoError::Closed)));
    }

    #[test]
    fn test_control_fails_after_close() {
        let pty = PosixPty::open(WindowSize::default()).unwrap();
        pty.close();
        let result = unsafe { pty.control(|fd| fd) };
        assert!(matches!(result, Err(ResizeError::Closed)));
    }

    #[test]
    fn test_concurrent_close_is_safe() {
        for _ in 0..20 {
            let pty = Arc::new(PosixPty::open(WindowSize::default()).unwrap());
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let pty = pty.clone();
                    thread::spawn(move || pty.close())
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert!(pty.is_closed());
        }
    }
}
