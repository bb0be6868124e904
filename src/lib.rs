//! hostpty - pseudo-terminals and child processes for hosted sessions
//!
//! Runs a program attached to a real pseudo-terminal so shells and
//! full-screen applications get line discipline, window-size changes and job
//! control. POSIX hosts use an `openpty` device pair; Windows hosts use a
//! ConPTY pseudo console. Both sit behind the same [`Terminal`] contract.
//!
//! # Quick Start
//!
//! ```no_run
//! use hostpty::{Command, Terminal};
//!
//! let pty = hostpty::open()?;
//! let state = Command::new(&pty, "sh").args(["-c", "exit 7"]).run()?;
//! assert_eq!(state.code(), Some(7));
//! pty.close();
//! # Ok::<(), hostpty::Error>(())
//! ```

pub mod core;

pub use crate::core::cancel::CancelToken;
pub use crate::core::command::{resolve_executable, Command};
pub use crate::core::error::{
    Error, IoError, OpenError, ProcessDone, ResizeError, Result, StartError, WaitError,
};
pub use crate::core::process::{ExitKind, Process, ProcessExitState, TerminationCause};
pub use crate::core::pty::{open, open_with_size, ProcAttr, Pty, Terminal, WindowSize};
