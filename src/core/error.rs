//! Error taxonomy for terminal and command operations.
//!
//! Backend failures are translated into these types before they leave the
//! core. OS-level causes travel as [`std::io::Error`] sources.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The terminal device pair could not be allocated.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Failed to allocate pseudo-terminal: {0}")]
    Allocate(#[source] io::Error),

    #[error("Failed to create pipe: {0}")]
    PipeCreation(#[source] io::Error),

    #[error("Failed to create pseudo console: {0}")]
    ConsoleCreation(#[source] io::Error),

    #[error("Invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },
}

/// A window size change was rejected.
#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("Pseudo-terminal is closed")]
    Closed,

    #[error("Invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },

    #[error("Failed to resize pseudo-terminal: {0}")]
    Device(#[source] io::Error),
}

/// A command could not be started. No OS resources survive this error.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("Command was already started")]
    AlreadyStarted,

    #[error("Pseudo-terminal is closed")]
    Closed,

    #[error("Pseudo-terminal already has a running command")]
    Busy,

    #[error("Command was cancelled before it started")]
    Cancelled,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] io::Error),
}

/// Waiting on a command failed.
#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Command was not started")]
    NotStarted,

    #[error("Command was already waited on")]
    AlreadyWaited,

    #[error("Failed to wait for process: {0}")]
    Os(#[source] io::Error),
}

/// A signal or termination request found the process already exited.
///
/// Travels inside an [`io::Error`]; a cancel action may return it to report
/// that the process finished on its own.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Process has already finished")]
pub struct ProcessDone;

impl ProcessDone {
    /// Whether `err` carries a [`ProcessDone`].
    pub fn matches(err: &io::Error) -> bool {
        err.get_ref().map_or(false, |inner| inner.is::<ProcessDone>())
    }
}

impl From<ProcessDone> for io::Error {
    fn from(done: ProcessDone) -> Self {
        io::Error::new(io::ErrorKind::Other, done)
    }
}

/// Reading or writing the terminal stream failed.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("Pseudo-terminal is closed")]
    Closed,

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Closed => io::Error::new(io::ErrorKind::NotConnected, IoError::Closed),
            IoError::Read(e) | IoError::Write(e) => e,
        }
    }
}

/// Any failure surfaced by the core.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Resize(#[from] ResizeError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Io(#[from] IoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Convert a Win32 API failure into an [`io::Error`].
#[cfg(windows)]
pub(crate) fn win32_error(err: windows::core::Error) -> io::Error {
    let code = err.code().0 as u32;
    // HRESULT_FROM_WIN32 wraps Win32 codes in facility 7
    if code & 0xFFFF_0000 == 0x8007_0000 {
        io::Error::from_raw_os_error((code & 0xFFFF) as i32)
    } else {
        io::Error::new(io::ErrorKind::Other, err)
    }
}
