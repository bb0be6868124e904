//! Pseudo-terminal and child-process lifecycle.
//!
//! - **pty**: terminal factory, the [`Terminal`](pty::Terminal) contract and the
//!   platform backend (`openpty` on POSIX, ConPTY on Windows)
//! - **command**: start/wait/run of one program attached to a terminal
//! - **cancel**: cancellation signal raced against process exit
//! - **process**: spawned child handle and exit state
//! - **codec**: command line quoting and environment blocks
//! - **error**: error taxonomy
//!
//! # Architecture
//!
//! ```text
//! Command ──borrows──> Pty
//! ├── Process (shared by reaper and watcher threads)
//! └── CancelToken (optional)
//! ```

pub mod cancel;
pub mod codec;
pub mod command;
pub mod error;
pub mod process;
pub mod pty;
