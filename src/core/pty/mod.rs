//! Pseudo-terminal devices.
//!
//! Two backends satisfy the same [`Terminal`] contract and one of them is
//! compiled in as [`Pty`]:
//!
//! - **posix**: master/subordinate device pair from `openpty`
//! - **conpty**: Windows pseudo console bound to two pipe pairs
//!
//! ```text
//! Pty
//! ├── host side  (read / write / resize / close)
//! └── child side (stdio + controlling terminal of the spawned Command)
//! ```

use std::ffi::OsString;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::error::{IoError, OpenError, ResizeError};
use super::process::Process;

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub use self::posix::{PosixPty as Pty, ProcAttr};

#[cfg(windows)]
mod conpty;
#[cfg(windows)]
pub use self::conpty::{ConPty as Pty, ProcAttr};

/// Terminal window dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Behavior shared by every pseudo-terminal backend.
pub trait Terminal: Send + Sync {
    /// Blocking read of the child's output. `Ok(0)` means the peer closed.
    fn read(&self, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Like [`read`](Terminal::read), but gives up after `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time. Used to drain output that is
    /// still buffered after the child exits.
    fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, IoError>;

    /// Blocking write to the child's input.
    fn write(&self, data: &[u8]) -> Result<usize, IoError>;

    /// Change the window size and notify the child.
    fn resize(&self, rows: u16, cols: u16) -> Result<(), ResizeError>;

    /// Current window size.
    fn size(&self) -> Result<WindowSize, ResizeError>;

    /// Release every OS resource. Idempotent; unblocks pending reads and writes.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Device identity for diagnostics.
    fn name(&self) -> &str;

    /// Write the whole buffer.
    fn write_all(&self, mut data: &[u8]) -> Result<(), IoError> {
        while !data.is_empty() {
            match self.write(data)? {
                0 => {
                    return Err(IoError::Write(std::io::Error::from(
                        std::io::ErrorKind::WriteZero,
                    )))
                }
                n => data = &data[n..],
            }
        }
        Ok(())
    }
}

/// Open a terminal with the default window size.
pub fn open() -> Result<Pty, OpenError> {
    Pty::open(WindowSize::default())
}

/// Open a terminal with the given window size.
pub fn open_with_size(size: WindowSize) -> Result<Pty, OpenError> {
    if !size.is_valid() {
        return Err(OpenError::InvalidSize {
            rows: size.rows,
            cols: size.cols,
        });
    }
    Pty::open(size)
}

/// Everything a backend needs to spawn one child.
pub(crate) struct SpawnRequest<'a> {
    /// Resolved executable path.
    pub program: &'a Path,
    /// Program name as the caller gave it; becomes `argv[0]`.
    pub arg0: &'a std::ffi::OsStr,
    pub args: &'a [OsString],
    pub env: Option<&'a [(OsString, OsString)]>,
    pub dir: Option<&'a Path>,
    pub attrs: &'a ProcAttr,
}

/// Marks a terminal as having a live command.
#[derive(Debug, Default)]
pub(crate) struct Lease {
    busy: Arc<AtomicBool>,
}

impl Lease {
    pub fn acquire(&self) -> Option<LeaseGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| LeaseGuard {
                busy: self.busy.clone(),
            })
    }
}

/// Released when the command's process has been reaped.
pub(crate) struct LeaseGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Spawn hook the command coordinator calls on the selected backend.
pub(crate) trait Spawn {
    fn lease(&self) -> &Lease;

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<Process, super::error::StartError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let lease = Lease::default();
        let guard = lease.acquire().expect("first acquire");
        assert!(lease.acquire().is_none());
        drop(guard);
        assert!(lease.acquire().is_some());
    }

    #[test]
    fn test_open_rejects_zero_size() {
        assert!(matches!(
            open_with_size(WindowSize::new(0, 80)),
            Err(OpenError::InvalidSize { rows: 0, cols: 80 })
        ));
    }

    #[test]
    fn test_resize_then_size_reports_new_dimensions() {
        let pty = open().unwrap();
        for (rows, cols) in [(1, 1), (24, 80), (50, 132), (300, 1000)] {
            pty.resize(rows, cols).unwrap();
            assert_eq!(pty.size().unwrap(), WindowSize::new(rows, cols));
        }
        pty.close();
    }

    #[test]
    fn test_closed_terminal_rejects_operations() {
        let pty = open().unwrap();
        pty.close();
        pty.close();
        assert!(pty.is_closed());
        assert!(matches!(pty.resize(10, 10), Err(ResizeError::Closed)));
        assert!(matches!(pty.write(b"x"), Err(IoError::Closed)));
        let mut buf = [0u8; 8];
        assert!(matches!(pty.read(&mut buf), Err(IoError::Closed)));
        assert!(matches!(
            pty.read_timeout(&mut buf, Duration::from_millis(10)),
            Err(IoError::Closed)
        ));
    }

    #[test]
    fn test_read_timeout_on_idle_terminal() {
        let pty = open().unwrap();
        let mut buf = [0u8; 8];
        let started = std::time::Instant::now();
        assert_eq!(pty.read_timeout(&mut buf, Duration::from_millis(50)).unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(40));
        pty.close();
    }

    #[test]
    fn test_name_is_not_empty() {
        let pty = open().unwrap();
        assert!(!pty.name().is_empty());
        pty.close();
    }
}
