//! Command lifecycle on a pseudo-terminal.
//!
//! A [`Command`] borrows one terminal, is started at most once and waited on
//! at most once. Starting it spawns two helper threads:
//!
//! ```text
//! reaper  ── process.wait() ──────────────┐
//!                                          ├─> watcher ──> wait()
//! CancelToken::cancel() ── on_cancel ─────┘
//! ```
//!
//! The reaper is the only place the process is waited on. The watcher takes
//! whichever event arrives first: a cancellation runs the cancel action and
//! keeps waiting for the exit, an exit ends the race. A cancellation only
//! counts when its action reached a live process; one that finds the process
//! already exited leaves the natural exit state untouched.

use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::codec;
use super::error::{ProcessDone, Result, StartError, WaitError};
use super::process::{ExitKind, Process, ProcessExitState, TerminationCause};
use super::pty::{ProcAttr, Pty, Spawn, SpawnRequest, Terminal};

type CancelAction = Box<dyn FnOnce(&Process) -> io::Result<()> + Send>;

enum Event {
    Exited(io::Result<ExitKind>),
    Cancelled,
}

enum State {
    Idle,
    Running {
        watcher: JoinHandle<io::Result<ProcessExitState>>,
        reaper: JoinHandle<()>,
    },
    Exited,
}

/// A program to run attached to a pseudo-terminal.
pub struct Command<'a> {
    pty: &'a Pty,
    program: OsString,
    args: Vec<OsString>,
    env: Option<Vec<(OsString, OsString)>>,
    dir: Option<PathBuf>,
    attrs: ProcAttr,
    cancel: Option<CancelToken>,
    cancel_action: Option<CancelAction>,
    wait_delay: Option<Duration>,
    pid: Option<u32>,
    state: State,
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("dir", &self.dir)
            .field("pid", &self.pid)
            .finish()
    }
}

impl<'a> Command<'a> {
    /// Bind `program` to `pty`. Environment and working directory are inherited.
    pub fn new(pty: &'a Pty, program: impl AsRef<OsStr>) -> Self {
        Self {
            pty,
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            env: None,
            dir: None,
            attrs: ProcAttr::default(),
            cancel: None,
            cancel_action: None,
            wait_delay: None,
            pid: None,
            state: State::Idle,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Set one variable. The first call copies the host environment.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .get_or_insert_with(|| env::vars_os().collect())
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let env = self.env.get_or_insert_with(|| env::vars_os().collect());
        env.extend(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned())),
        );
        self
    }

    /// Start from an empty environment instead of the host's.
    pub fn env_clear(mut self) -> Self {
        self.env = Some(Vec::new());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Platform-specific process attributes.
    pub fn attrs(mut self, attrs: ProcAttr) -> Self {
        self.attrs = attrs;
        self
    }

    /// Terminate the command when `token` fires.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run `action` on cancellation instead of killing the process.
    ///
    /// An action that returns a [`ProcessDone`] error, as [`Process::signal`]
    /// does for an exited child, does not mark the command as cancelled.
    pub fn cancel_with<F>(mut self, action: F) -> Self
    where
        F: FnOnce(&Process) -> io::Result<()> + Send + 'static,
    {
        self.cancel_action = Some(Box::new(action));
        self
    }

    /// Force-kill a cancelled process still running after `delay`.
    pub fn wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = Some(delay);
        self
    }

    /// Process id once started.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the process on the bound terminal.
    ///
    /// Returns once the process exists. Fails with [`StartError::Busy`] while
    /// another command on the same terminal has not been reaped.
    pub fn start(&mut self) -> std::result::Result<(), StartError> {
        if !matches!(self.state, State::Idle) {
            return Err(StartError::AlreadyStarted);
        }
        if self.pty.is_closed() {
            return Err(StartError::Closed);
        }
        if self.cancel.as_ref().map_or(false, CancelToken::is_cancelled) {
            return Err(StartError::Cancelled);
        }

        let program = resolve_executable(&self.program, self.dir.as_deref())?;
        let lease = self.pty.lease().acquire().ok_or(StartError::Busy)?;

        let request = SpawnRequest {
            program: &program,
            arg0: &self.program,
            args: &self.args,
            env: self.env.as_deref(),
            dir: self.dir.as_deref(),
            attrs: &self.attrs,
        };
        let process = Arc::new(self.pty.spawn(&request)?);
        let pid = process.id();
        info!(
            "Started pid {} on {}: {}",
            pid,
            self.pty.name(),
            self.command_line()
        );

        let (events_tx, events_rx) = mpsc::channel();

        let reaper = {
            let process = process.clone();
            let events = events_tx.clone();
            thread::spawn(move || {
                let result = process.wait();
                // Reaped; the terminal may take another command
                drop(lease);
                let _ = events.send(Event::Exited(result));
            })
        };

        let registration = self.cancel.as_ref().map(|token| {
            let events = events_tx.clone();
            token.on_cancel(move || {
                let _ = events.send(Event::Cancelled);
            })
        });
        drop(events_tx);

        let action = self.cancel_action.take();
        let wait_delay = self.wait_delay;
        let watcher = thread::spawn(move || {
            let result = watch(&events_rx, &process, action, wait_delay);
            drop(registration);
            result
        });

        self.pid = Some(pid);
        self.state = State::Running { watcher, reaper };
        Ok(())
    }

    /// Block until the process exits and return its exit state.
    pub fn wait(&mut self) -> std::result::Result<ProcessExitState, WaitError> {
        let (watcher, reaper) = match std::mem::replace(&mut self.state, State::Exited) {
            State::Running { watcher, reaper } => (watcher, reaper),
            State::Idle => {
                self.state = State::Idle;
                return Err(WaitError::NotStarted);
            }
            State::Exited => return Err(WaitError::AlreadyWaited),
        };

        let result = watcher.join().unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "command watcher panicked",
            ))
        });
        let _ = reaper.join();

        let state = result.map_err(WaitError::Os)?;
        info!("Process {} finished: {}", self.pid.unwrap_or_default(), state);
        Ok(state)
    }

    /// Start the command and wait for it.
    pub fn run(&mut self) -> Result<ProcessExitState> {
        self.start()?;
        Ok(self.wait()?)
    }

    fn command_line(&self) -> String {
        codec::compose_command_line(
            std::iter::once(&self.program)
                .chain(&self.args)
                .map(|arg| arg.to_string_lossy()),
        )
    }
}

/// Race process exit against cancellation.
fn watch(
    events: &Receiver<Event>,
    process: &Process,
    mut action: Option<CancelAction>,
    wait_delay: Option<Duration>,
) -> io::Result<ProcessExitState> {
    let mut cause = None;
    let mut cancelled = false;
    let mut killed = false;
    let mut deadline: Option<Instant> = None;

    loop {
        let event = match deadline {
            Some(at) => match events.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Process {} outlived its wait delay, killing", process.id());
                    force_kill(process);
                    deadline = None;
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return Err(reaper_gone()),
            },
            None => events.recv().map_err(|_| reaper_gone())?,
        };

        match event {
            Event::Exited(result) => {
                let kind = result?;
                // SIGKILL never yields an exit code: the child finished before the kill landed
                if killed && cfg!(unix) && matches!(kind, ExitKind::Code(_)) {
                    cause = None;
                }
                debug!("Process {} exited: {}", process.id(), kind);
                return Ok(ProcessExitState::new(kind, cause));
            }
            Event::Cancelled => {
                if cancelled {
                    continue;
                }
                cancelled = true;

                let result = match action.take() {
                    Some(action) => action(process),
                    None => process.kill().map(|()| killed = true),
                };
                match result {
                    Ok(()) => {
                        info!("Cancelled process {}", process.id());
                        cause = Some(TerminationCause::Cancelled);
                        deadline = wait_delay.map(|delay| Instant::now() + delay);
                    }
                    Err(e) if ProcessDone::matches(&e) => {
                        debug!("Process {} finished before cancellation", process.id());
                    }
                    Err(e) => {
                        warn!("Cancel action for process {} failed: {}", process.id(), e);
                        if force_kill(process) {
                            cause = Some(TerminationCause::Cancelled);
                        }
                    }
                }
            }
        }
    }
}

/// Kill `process`; false if it had already exited.
fn force_kill(process: &Process) -> bool {
    match process.kill() {
        Ok(()) => true,
        Err(e) if ProcessDone::matches(&e) => false,
        Err(e) => {
            warn!("Failed to kill process {}: {}", process.id(), e);
            true
        }
    }
}

fn reaper_gone() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "process reaper exited without a status")
}

/// Find the executable `program` names.
///
/// Names with a directory part are taken relative to `dir` when given. Bare
/// names are searched in `PATH`. The result is always absolute.
pub fn resolve_executable(
    program: &OsStr,
    dir: Option<&Path>,
) -> std::result::Result<PathBuf, StartError> {
    if program.is_empty() {
        return Err(StartError::InvalidCommand("empty program name".to_string()));
    }

    let name = Path::new(program);
    let has_dir = name.is_absolute()
        || name
            .parent()
            .map_or(false, |parent| !parent.as_os_str().is_empty());

    if has_dir {
        let path = match dir {
            Some(dir) if name.is_relative() => dir.join(name),
            _ => name.to_path_buf(),
        };
        let path = absolute(path)?;
        return find_executable(&path).ok_or(StartError::NotFound(path));
    }

    if let Some(paths) = env::var_os("PATH") {
        for entry in env::split_paths(&paths) {
            if entry.as_os_str().is_empty() {
                continue;
            }
            let path = absolute(entry.join(name))?;
            if let Some(found) = find_executable(&path) {
                return Ok(found);
            }
        }
    }
    Err(StartError::NotFound(name.to_path_buf()))
}

fn absolute(path: PathBuf) -> std::result::Result<PathBuf, StartError> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = env::current_dir().map_err(StartError::Spawn)?;
    Ok(cwd.join(path))
}

#[cfg(unix)]
fn find_executable(path: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let meta = path.metadata().ok()?;
    if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
        Some(path.to_path_buf())
    } else {
        None
    }
}

#[cfg(windows)]
fn find_executable(path: &Path) -> Option<PathBuf> {
    let exts = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());

    if path.extension().is_some() && path.is_file() {
        return Some(path.to_path_buf());
    }
    exts.split(';')
        .filter(|ext| !ext.is_empty())
        .map(|ext| {
            let mut candidate = path.as_os_str().to_owned();
            candidate.push(ext);
            PathBuf::from(candidate)
        })
        .find(|candidate| candidate.is_file())
}
