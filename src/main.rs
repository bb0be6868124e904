//! hostpty - run a program on a pseudo-terminal from the local console
//!
//! A minimal session driver: the local console plays the part of the remote
//! peer. Keystrokes go to the program, its output comes back, and console
//! size changes are forwarded as terminal resizes.
//!
//! # Quick Start
//!
//! ```text
//! hostpty                     # Run the configured shell ($SHELL / cmd.exe)
//! hostpty -t 60 -- top        # Run top, cancel it after a minute
//! hostpty -d /tmp -e FOO=1    # Shell in /tmp with FOO set
//! ```

mod config;

use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossterm::terminal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hostpty::{CancelToken, Command, ProcessExitState, Pty, Terminal, WindowSize};

use crate::config::Config;

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Options {
    /// Program to run instead of the configured shell
    shell: Option<String>,
    dir: Option<PathBuf>,
    timeout: Option<u64>,
    /// Extra `KEY=VALUE` variables
    env: Vec<(String, String)>,
    /// Everything after `--`
    command: Vec<String>,
}

/// How long the output relay waits for data before checking for shutdown
const OUTPUT_POLL: Duration = Duration::from_millis(50);

/// Upper bound on draining output after the program exits
const DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("hostpty {}", VERSION);
}

fn print_help() {
    eprintln!("hostpty {} - Run a program on a pseudo-terminal", VERSION);
    eprintln!();
    eprintln!("Usage: hostpty [OPTIONS] [-- PROGRAM [ARGS...]]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Program to run (default: config or $SHELL)");
    eprintln!("  -d, --dir <DIR>       Working directory");
    eprintln!("  -t, --timeout <SECS>  Cancel the program after SECS seconds");
    eprintln!("  -e, --env <KEY=VAL>   Set an environment variable (repeatable)");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  hostpty                     Configured shell");
    eprintln!("  hostpty -t 60 -- top        top, cancelled after a minute");
    eprintln!("  hostpty -e TERM=vt100       Shell with TERM overridden");
    eprintln!();
    eprintln!("Configuration: ~/.hostpty/config.toml");
    eprintln!("Log file:      ~/.hostpty/hostpty.log (filter with RUST_LOG)");
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                options.shell = Some(value(args, &mut i, "shell")?.to_string());
            }
            "-d" | "--dir" => {
                options.dir = Some(PathBuf::from(value(args, &mut i, "directory")?));
            }
            "-t" | "--timeout" => {
                let secs = value(args, &mut i, "timeout")?;
                let secs = secs
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid timeout: {}", secs))?;
                options.timeout = Some(secs);
            }
            "-e" | "--env" => {
                let entry = value(args, &mut i, "environment")?;
                match entry.split_once('=') {
                    Some((key, val)) if !key.is_empty() => {
                        options.env.push((key.to_string(), val.to_string()));
                    }
                    _ => return Err(format!("Invalid environment entry: {}", entry)),
                }
            }
            "--" => {
                options.command = args[i + 1..].to_vec();
                if options.command.is_empty() {
                    return Err("Missing program after --".to_string());
                }
                break;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// The argument following option `args[*i]`.
fn value<'a>(args: &'a [String], i: &mut usize, what: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("Missing {} argument", what))
}

fn init_logging(config: &Config) {
    let log_path = config.log_path();

    // Create log directory if needed
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    // Open log file (append mode)
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let config = Config::load();
    init_logging(&config);
    info!("hostpty {} starting...", VERSION);

    let state = match run_session(&options, &config) {
        Ok(state) => state,
        Err(e) => {
            error!("Session failed: {:#}", e);
            return Err(e);
        }
    };

    if state.was_cancelled() {
        eprintln!("hostpty: program cancelled ({})", state);
    }
    std::process::exit(exit_code(&state));
}

/// Shell-style exit status for a finished program.
fn exit_code(state: &ProcessExitState) -> i32 {
    match (state.code(), state.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Initial terminal size: config overrides, then the local console.
fn initial_size(config: &Config) -> WindowSize {
    let (cols, rows) = match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => {
            let size = WindowSize::default();
            (size.cols, size.rows)
        }
    };
    WindowSize::new(
        config.session.rows.unwrap_or(rows),
        config.session.cols.unwrap_or(cols),
    )
}

fn run_session(options: &Options, config: &Config) -> anyhow::Result<ProcessExitState> {
    let (program, args) = match options.command.split_first() {
        Some((program, args)) => (program.clone(), args.to_vec()),
        None => match &options.shell {
            Some(shell) => (shell.clone(), Vec::new()),
            None => (config.default_shell(), config.args.clone()),
        },
    };

    let size = initial_size(config);
    let pty = Arc::new(hostpty::open_with_size(size).context("Failed to open pseudo-terminal")?);
    info!("Terminal {} ({}x{})", pty.name(), size.cols, size.rows);

    let token = match options.timeout.or(config.session.timeout_secs) {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };

    let mut command = Command::new(&*pty, &program)
        .args(&args)
        .cancel_token(token);
    if let Some(dir) = options.dir.as_ref().or(config.working_dir.as_ref()) {
        command = command.current_dir(dir);
    }
    if !config.env.is_empty() || !options.env.is_empty() {
        command = command
            .envs(config.env.iter())
            .envs(options.env.iter().map(|(k, v)| (k, v)));
    }
    if let Some(grace) = config.session.kill_grace_ms {
        command = command.wait_delay(Duration::from_millis(grace));
        #[cfg(unix)]
        {
            command = command.cancel_with(|process| {
                process.signal(nix::sys::signal::Signal::SIGHUP)
            });
        }
    }

    start_attached(&pty, &mut command, terminal::enable_raw_mode)
        .with_context(|| format!("Failed to start {}", program))?;
    let result = relay(&pty, &mut command, config);

    // Cleanup
    pty.close();
    let _ = terminal::disable_raw_mode();
    let _ = io::stdout().flush();

    let state = result?;
    info!("{} finished: {}", program, state);
    Ok(state)
}

/// Switch the console to raw mode, then start the program.
///
/// Raw mode comes first so a failure there leaves nothing running. Either
/// failure closes the terminal.
fn start_attached(
    pty: &Pty,
    command: &mut Command<'_>,
    raw_mode: impl FnOnce() -> io::Result<()>,
) -> anyhow::Result<()> {
    if let Err(e) = raw_mode() {
        pty.close();
        return Err(e).context("Failed to enable raw mode");
    }
    if let Err(e) = command.start() {
        pty.close();
        let _ = terminal::disable_raw_mode();
        return Err(e.into());
    }
    Ok(())
}

/// Copy terminal output to `out` until the terminal ends, or until `done`
/// is set and no more output is buffered.
fn pump_output(pty: &Pty, out: &mut impl Write, done: &AtomicBool) {
    let mut buffer = vec![0u8; 4096];
    let mut drain_until: Option<Instant> = None;
    loop {
        match pty.read_timeout(&mut buffer, OUTPUT_POLL) {
            Ok(Some(0)) => break,
            Ok(Some(n)) => {
                if out.write_all(&buffer[..n]).is_err() || out.flush().is_err() {
                    break;
                }
            }
            Ok(None) if done.load(Ordering::SeqCst) => break,
            Ok(None) => continue,
            Err(e) => {
                debug!("Output relay stopped: {}", e);
                break;
            }
        }

        // Leftover background jobs may keep writing
        if done.load(Ordering::SeqCst) {
            let until = *drain_until.get_or_insert_with(|| Instant::now() + DRAIN_LIMIT);
            if Instant::now() >= until {
                debug!("Output still arriving after exit, stopping relay");
                break;
            }
        }
    }
}

/// Shuttle bytes between the local console and the terminal until the
/// program exits.
fn relay(
    pty: &Arc<Pty>,
    command: &mut Command<'_>,
    config: &Config,
) -> anyhow::Result<ProcessExitState> {
    let done = Arc::new(AtomicBool::new(false));

    let output = {
        let pty = pty.clone();
        let done = done.clone();
        thread::spawn(move || pump_output(&pty, &mut io::stdout(), &done))
    };

    // Blocks on stdin until the process exits; never joined
    {
        let pty = pty.clone();
        thread::spawn(move || {
            let mut stdin = io::stdin();
            let mut buffer = [0u8; 1024];
            loop {
                match stdin.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Err(e) = pty.write_all(&buffer[..n]) {
                            debug!("Input relay stopped: {}", e);
                            break;
                        }
                    }
                }
            }
        });
    }

    let resizer = {
        let pty = pty.clone();
        let done = done.clone();
        let interval = Duration::from_millis(config.session.resize_poll_ms.max(10));
        let mut last = terminal::size().ok();
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                thread::sleep(interval);
                let current = terminal::size().ok();
                if current == last {
                    continue;
                }
                last = current;
                if let Some((cols, rows)) = current {
                    if let Err(e) = pty.resize(rows, cols) {
                        warn!("Failed to forward resize: {}", e);
                    }
                }
            }
        })
    };

    let result = command.wait();
    done.store(true, Ordering::SeqCst);

    // Output still buffered in the terminal is relayed before it closes
    let _ = output.join();
    pty.close();
    let _ = resizer.join();

    Ok(result?)
}
