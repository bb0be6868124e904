#![cfg(unix)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hostpty::{
    CancelToken, Command, ExitKind, IoError, StartError, TerminationCause, Terminal, WaitError,
};

/// Read until `needle` shows up; returns everything read so far.
fn read_until(pty: &hostpty::Pty, needle: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    while !out.windows(needle.len()).any(|w| w == needle) {
        let n = pty.read(&mut buf).expect("read");
        assert!(n > 0, "terminal closed before {:?}", String::from_utf8_lossy(needle));
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn read_line(pty: &hostpty::Pty) -> String {
    let out = read_until(pty, b"\n");
    String::from_utf8_lossy(&out).trim().to_string()
}

fn echo_round_trip(len: usize) {
    let pty = Arc::new(hostpty::open().unwrap());
    let mut cmd = Command::new(&*pty, "sh").args(["-c", "stty raw -echo; printf READY; exec cat"]);
    cmd.start().unwrap();
    read_until(&pty, b"READY");

    let data: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
    let writer = {
        let pty = pty.clone();
        let data = data.clone();
        thread::spawn(move || pty.write_all(&data))
    };

    let mut echoed = Vec::with_capacity(len);
    let mut buf = vec![0u8; 8192];
    while echoed.len() < len {
        let n = pty.read(&mut buf).unwrap();
        assert!(n > 0, "terminal closed after {} bytes", echoed.len());
        echoed.extend_from_slice(&buf[..n]);
    }
    writer.join().unwrap().unwrap();
    assert_eq!(echoed.len(), len);
    assert!(echoed == data, "echo differs for {} bytes", len);

    // Hangup ends cat
    pty.close();
    let state = cmd.wait().unwrap();
    assert!(!state.was_cancelled());
}

#[test]
fn test_echo_empty() {
    echo_round_trip(0);
}

#[test]
fn test_echo_one_byte() {
    echo_round_trip(1);
}

#[test]
fn test_echo_page() {
    echo_round_trip(4096);
}

#[test]
fn test_echo_megabyte() {
    echo_round_trip(1 << 20);
}

#[test]
fn test_run_exit_code() {
    let pty = hostpty::open().unwrap();
    let state = Command::new(&pty, "sh").args(["-c", "exit 7"]).run().unwrap();
    assert_eq!(state.code(), Some(7));
    assert_eq!(state.kind(), ExitKind::Code(7));
    assert_eq!(state.cause(), None);
    pty.close();
}

#[test]
fn test_wait_twice() {
    let pty = hostpty::open().unwrap();
    let mut cmd = Command::new(&pty, "true");
    assert!(matches!(cmd.wait(), Err(WaitError::NotStarted)));
    cmd.start().unwrap();
    assert!(cmd.wait().unwrap().success());
    assert!(matches!(cmd.wait(), Err(WaitError::AlreadyWaited)));
    pty.close();
}

#[test]
fn test_cancel_kills_running_command() {
    let pty = hostpty::open().unwrap();
    let token = CancelToken::new();
    let mut cmd = Command::new(&pty, "sleep").arg("30").cancel_token(token.clone());
    cmd.start().unwrap();
    assert!(cmd.id().is_some());

    let started = Instant::now();
    token.cancel();
    let state = cmd.wait().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(state.cause(), Some(TerminationCause::Cancelled));
    assert_eq!(state.signal(), Some(9));
    pty.close();
}

#[test]
fn test_timeout_token_cancels() {
    let pty = hostpty::open().unwrap();
    let token = CancelToken::with_timeout(Duration::from_millis(100));
    let state = Command::new(&pty, "sleep")
        .arg("30")
        .cancel_token(token)
        .run()
        .unwrap();
    assert!(state.was_cancelled());
    pty.close();
}

#[test]
fn test_already_cancelled_token_starts_nothing() {
    let pty = hostpty::open().unwrap();
    let token = CancelToken::new();
    token.cancel();

    let mut cmd = Command::new(&pty, "sleep").arg("30").cancel_token(token);
    assert!(matches!(cmd.start(), Err(StartError::Cancelled)));
    assert_eq!(cmd.id(), None);
    assert!(matches!(cmd.wait(), Err(WaitError::NotStarted)));

    // Nothing holds the terminal
    assert!(Command::new(&pty, "true").run().unwrap().success());
    pty.close();
}

#[test]
fn test_natural_exit_ignores_later_cancel() {
    let pty = hostpty::open().unwrap();
    let token = CancelToken::new();
    let mut cmd = Command::new(&pty, "true").cancel_token(token.clone());
    let state = cmd.run().unwrap();
    token.cancel();
    assert!(state.success());
    assert_eq!(state.cause(), None);
    pty.close();
}

#[test]
fn test_cancel_racing_natural_exit_is_not_recorded() {
    let pty = hostpty::open().unwrap();
    for i in 0..100u64 {
        let token = CancelToken::new();
        let mut cmd = Command::new(&pty, "true").cancel_token(token.clone());
        cmd.start().unwrap();
        thread::sleep(Duration::from_millis(i % 10));
        token.cancel();

        let state = cmd.wait().unwrap();
        match state.kind() {
            ExitKind::Code(code) => {
                assert_eq!(code, 0);
                assert_eq!(state.cause(), None, "natural exit reported as cancelled on run {}", i);
            }
            ExitKind::Signal(signal) => {
                assert_eq!(signal, 9);
                assert_eq!(state.cause(), Some(TerminationCause::Cancelled));
            }
        }
    }
    pty.close();
}

#[test]
fn test_custom_cancel_action_with_wait_delay() {
    let pty = hostpty::open().unwrap();
    let token = CancelToken::new();
    let mut cmd = Command::new(&pty, "sh")
        .args(["-c", "trap '' TERM; printf READY; while :; do sleep 1; done"])
        .cancel_token(token.clone())
        .cancel_with(|process| process.signal(nix::sys::signal::Signal::SIGTERM))
        .wait_delay(Duration::from_millis(200));
    cmd.start().unwrap();
    read_until(&pty, b"READY");

    token.cancel();
    let state = cmd.wait().unwrap();
    assert!(state.was_cancelled());
    assert_eq!(state.signal(), Some(9));
    pty.close();
}

#[test]
fn test_second_command_is_busy_until_first_exits() {
    let pty = hostpty::open().unwrap();
    let token = CancelToken::new();
    let mut first = Command::new(&pty, "sleep").arg("30").cancel_token(token.clone());
    first.start().unwrap();

    let mut second = Command::new(&pty, "true");
    assert!(matches!(second.start(), Err(StartError::Busy)));

    token.cancel();
    first.wait().unwrap();
    assert!(second.run().unwrap().success());
    pty.close();
}

#[test]
fn test_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let pty = hostpty::open().unwrap();
    let mut cmd = Command::new(&pty, "sh")
        .args(["-c", "pwd -P"])
        .current_dir(dir.path());
    cmd.start().unwrap();
    assert_eq!(read_line(&pty), expected.to_string_lossy());
    assert!(cmd.wait().unwrap().success());
    pty.close();
}

#[test]
fn test_relative_program_uses_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let sh = hostpty::resolve_executable(std::ffi::OsStr::new("sh"), None).unwrap();
    std::fs::create_dir(dir.path().join("bin")).unwrap();
    std::os::unix::fs::symlink(&sh, dir.path().join("bin").join("sh")).unwrap();

    let pty = hostpty::open().unwrap();
    let state = Command::new(&pty, "./bin/sh")
        .args(["-c", "exit 4"])
        .current_dir(dir.path())
        .run()
        .unwrap();
    assert_eq!(state.code(), Some(4));
    pty.close();
}

#[test]
fn test_environment_last_write_wins() {
    let pty = hostpty::open().unwrap();
    let mut cmd = Command::new(&pty, "sh")
        .args(["-c", "printf '%s\\n' \"$HOSTPTY_VALUE\""])
        .env("HOSTPTY_VALUE", "first")
        .env("HOSTPTY_VALUE", "second");
    cmd.start().unwrap();
    assert_eq!(read_line(&pty), "second");
    cmd.wait().unwrap();
    pty.close();
}

#[test]
fn test_resize_reaches_child() {
    let pty = hostpty::open().unwrap();
    pty.resize(33, 101).unwrap();
    let mut cmd = Command::new(&pty, "stty").arg("size");
    cmd.start().unwrap();
    assert_eq!(read_line(&pty), "33 101");
    cmd.wait().unwrap();
    pty.close();
}

#[test]
fn test_missing_program() {
    let pty = hostpty::open().unwrap();
    let mut cmd = Command::new(&pty, "hostpty-definitely-missing");
    assert!(matches!(cmd.start(), Err(StartError::NotFound(_))));
    pty.close();
}

#[test]
fn test_close_during_command() {
    let pty = Arc::new(hostpty::open().unwrap());
    let mut cmd = Command::new(&*pty, "sleep").arg("30");
    cmd.start().unwrap();

    let reader = {
        let pty = pty.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            pty.read(&mut buf)
        })
    };
    thread::sleep(Duration::from_millis(100));
    pty.close();

    assert!(matches!(reader.join().unwrap(), Err(IoError::Closed) | Ok(0)));
    // The session leader gets a hangup
    let state = cmd.wait().unwrap();
    assert!(!state.success());
}

#[test]
fn test_close_stress() {
    for _ in 0..50 {
        let pty = Arc::new(hostpty::open().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pty = pty.clone();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        let mut buf = [0u8; 16];
                        let _ = pty.read(&mut buf);
                    }
                    pty.close();
                })
            })
            .collect();
        pty.close();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pty.is_closed());
        assert!(matches!(pty.write(b"x"), Err(IoError::Closed)));
    }
}
