//! ConPTY backend for Windows.
//!
//! Two anonymous pipe pairs are bound to a pseudo console. We keep the write
//! end of the input pipe and the read end of the output pipe; the console
//! owns the other two. Children are attached to the console through a
//! process/thread attribute list passed to `CreateProcessW` (or
//! `CreateProcessAsUserW` when an impersonation token is supplied).

use std::ffi::{c_void, OsStr, OsString};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, ERROR_BROKEN_PIPE, HANDLE};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::Pipes::{CreatePipe, PeekNamedPipe};
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, DeleteProcThreadAttributeList,
    InitializeProcThreadAttributeList, UpdateProcThreadAttribute, CREATE_UNICODE_ENVIRONMENT,
    EXTENDED_STARTUPINFO_PRESENT, LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_CREATION_FLAGS,
    PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOEXW,
};
use windows::Win32::System::IO::CancelIoEx;

use super::{Lease, Spawn, SpawnRequest, Terminal, WindowSize};
use crate::core::codec::{self, EnvCase};
use crate::core::error::{win32_error, IoError, OpenError, ResizeError, StartError};
use crate::core::process::Process;

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

/// Anonymous pipes cannot be polled; timed reads peek at this interval.
const PEEK_INTERVAL: Duration = Duration::from_millis(5);

/// Windows-only process attributes.
#[derive(Debug, Clone, Default)]
pub struct ProcAttr {
    /// Start the child as the user this token belongs to.
    pub token: Option<HANDLE>,
    pub process_attributes: Option<SECURITY_ATTRIBUTES>,
    pub thread_attributes: Option<SECURITY_ATTRIBUTES>,
    /// Extra `CREATE_*` flags, or'ed into the ones the backend needs.
    pub creation_flags: u32,
}

// Safety: the token handle and security descriptors are only read during spawn
unsafe impl Send for ProcAttr {}
unsafe impl Sync for ProcAttr {}

/// Owned Win32 handle, closed on drop.
struct Handle(HANDLE);

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

struct Pipes {
    /// We write, the console reads.
    input: Handle,
    /// The console writes, we read.
    output: Handle,
}

/// Pseudo console bound to two pipe pairs.
pub struct ConPty {
    console: Mutex<Option<HPCON>>,
    pipes: RwLock<Option<Pipes>>,
    closed: AtomicBool,
    /// The console has no size query; remember what we applied.
    size: Mutex<WindowSize>,
    /// Attribute lists are not safe for concurrent mutation.
    attr_lock: Mutex<()>,
    lease: Lease,
    name: String,
}

// Safety: every handle is guarded by a lock or only used with thread-safe calls
unsafe impl Send for ConPty {}
unsafe impl Sync for ConPty {}

impl ConPty {
    pub(crate) fn open(size: WindowSize) -> Result<Self, OpenError> {
        if !fits_coord(size) {
            return Err(OpenError::InvalidSize {
                rows: size.rows,
                cols: size.cols,
            });
        }

        let (input_read, input_write) = create_pipe().map_err(OpenError::PipeCreation)?;
        let (output_read, output_write) = create_pipe().map_err(OpenError::PipeCreation)?;

        let hpc = unsafe { CreatePseudoConsole(coord(size), input_read.0, output_write.0, 0) }
            .map_err(|e| OpenError::ConsoleCreation(win32_error(e)))?;

        // The console duplicated its ends
        drop(input_read);
        drop(output_write);

        let name = format!("conpty:{:#x}", hpc.0);
        info!("Opened pseudo console {} ({}x{})", name, size.cols, size.rows);

        Ok(Self {
            console: Mutex::new(Some(hpc)),
            pipes: RwLock::new(Some(Pipes {
                input: input_write,
                output: output_read,
            })),
            closed: AtomicBool::new(false),
            size: Mutex::new(size),
            attr_lock: Mutex::new(()),
            lease: Lease::default(),
            name,
        })
    }

    fn pipes(&self) -> Result<RwLockReadGuard<'_, Option<Pipes>>, IoError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IoError::Closed);
        }
        Ok(match self.pipes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    fn console(&self) -> MutexGuard<'_, Option<HPCON>> {
        match self.console.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Cancel synchronous I/O any thread has pending on our pipe ends.
    fn cancel_io(&self) {
        let pipes = match self.pipes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(pipes) = pipes.as_ref() {
            unsafe {
                let _ = CancelIoEx(pipes.output.0, None);
                let _ = CancelIoEx(pipes.input.0, None);
            }
        }
    }

    fn stream_error(&self, err: windows::core::Error, wrap: fn(io::Error) -> IoError) -> IoError {
        if self.closed.load(Ordering::SeqCst) {
            return IoError::Closed;
        }
        wrap(win32_error(err))
    }

    /// Environment handed to the child before deduplication.
    fn environment(&self, request: &SpawnRequest<'_>) -> io::Result<Vec<(OsString, OsString)>> {
        if let Some(env) = request.env {
            return Ok(env.to_vec());
        }
        match request.attrs.token {
            Some(token) => token_environment(token),
            None => Ok(std::env::vars_os().collect()),
        }
    }
}

impl Terminal for ConPty {
    fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let pipes = self.pipes()?;
        let pipes = pipes.as_ref().ok_or(IoError::Closed)?;

        let len = buf.len().min(u32::MAX as usize);
        let mut read: u32 = 0;
        match unsafe { ReadFile(pipes.output.0, Some(&mut buf[..len]), Some(&mut read), None) } {
            Ok(()) => Ok(read as usize),
            // The console went away; report end of stream
            Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() && !self.is_closed() => Ok(0),
            Err(e) => Err(self.stream_error(e, IoError::Read)),
        }
    }

    fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, IoError> {
        let pipes = self.pipes()?;
        let pipes = pipes.as_ref().ok_or(IoError::Closed)?;
        if buf.is_empty() {
            return Ok(Some(0));
        }

        let deadline = Instant::now() + timeout;
        let available = loop {
            if self.is_closed() {
                return Err(IoError::Closed);
            }
            let mut available: u32 = 0;
            let peeked =
                unsafe { PeekNamedPipe(pipes.output.0, None, 0, None, Some(&mut available), None) };
            match peeked {
                Ok(()) if available > 0 => break available,
                Ok(()) => {}
                Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => return Ok(Some(0)),
                Err(e) => return Err(self.stream_error(e, IoError::Read)),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(PEEK_INTERVAL.min(deadline - now));
        };

        // Only what is already buffered, so ReadFile cannot block
        let len = buf.len().min(available as usize);
        let mut read: u32 = 0;
        match unsafe { ReadFile(pipes.output.0, Some(&mut buf[..len]), Some(&mut read), None) } {
            Ok(()) => Ok(Some(read as usize)),
            Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() && !self.is_closed() => Ok(Some(0)),
            Err(e) => Err(self.stream_error(e, IoError::Read)),
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, IoError> {
        let pipes = self.pipes()?;
        let pipes = pipes.as_ref().ok_or(IoError::Closed)?;
        if data.is_empty() {
            return Ok(0);
        }

        let len = data.len().min(u32::MAX as usize);
        let mut written: u32 = 0;
        unsafe { WriteFile(pipes.input.0, Some(&data[..len]), Some(&mut written), None) }
            .map_err(|e| self.stream_error(e, IoError::Write))?;
        Ok(written as usize)
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<(), ResizeError> {
        let size = WindowSize::new(rows, cols);
        if !size.is_valid() || !fits_coord(size) {
            return Err(ResizeError::InvalidSize { rows, cols });
        }

        let console = self.console();
        let hpc = console.ok_or(ResizeError::Closed)?;
        unsafe { ResizePseudoConsole(hpc, coord(size)) }
            .map_err(|e| ResizeError::Device(win32_error(e)))?;

        match self.size.lock() {
            Ok(mut current) => *current = size,
            Err(poisoned) => *poisoned.into_inner() = size,
        }
        info!("Resize {}: {}x{}", self.name, cols, rows);
        Ok(())
    }

    fn size(&self) -> Result<WindowSize, ResizeError> {
        if self.is_closed() {
            return Err(ResizeError::Closed);
        }
        Ok(match self.size.lock() {
            Ok(size) => *size,
            Err(poisoned) => *poisoned.into_inner(),
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Unblock pending reads and writes before the handles go away
        self.cancel_io();

        // A call that entered ReadFile or WriteFile after the first cancel is
        // released by closing the console, which breaks both pipes. Cancel
        // again for any call still pending before the write lock is taken.
        if let Some(hpc) = self.console().take() {
            unsafe { ClosePseudoConsole(hpc) };
        }
        self.cancel_io();

        let pipes = match self.pipes.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(pipes);
        info!("Closed pseudo console {}", self.name);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Spawn for ConPty {
    fn lease(&self) -> &Lease {
        &self.lease
    }

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<Process, StartError> {
        if self.is_closed() {
            return Err(StartError::Closed);
        }

        // CreateProcessW resolves a relative application name against our own
        // directory, not the child's
        let program: PathBuf = match request.dir {
            Some(dir) if request.program.is_relative() => dir.join(request.program),
            _ => request.program.to_path_buf(),
        };
        let application = wide_nul(program.as_os_str())?;

        let mut argv = Vec::with_capacity(request.args.len() + 1);
        argv.push(utf8_arg(request.arg0)?);
        for arg in request.args {
            argv.push(utf8_arg(arg)?);
        }
        let line = codec::compose_command_line(&argv);
        let mut command_line = wide_nul(OsStr::new(&line))?;

        let directory = match request.dir {
            Some(dir) => Some(wide_nul(dir.as_os_str())?),
            None => None,
        };

        let env = self.environment(request).map_err(StartError::Spawn)?;
        let mut env = codec::dedup_environment(env, EnvCase::Insensitive);
        codec::ensure_system_root(&mut env, std::env::var_os("SYSTEMROOT"));
        let block = codec::environment_block(&env);
        debug!("Environment block: {} entries, {} units", env.len(), block.len());

        let console = self.console();
        let hpc = console.ok_or(StartError::Closed)?;
        let _attr = match self.attr_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut attributes = AttributeList::new(1).map_err(StartError::Spawn)?;
        attributes.set_pseudo_console(hpc).map_err(StartError::Spawn)?;

        let mut startup = STARTUPINFOEXW::default();
        startup.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
        // No std handles: the child must not inherit ours instead of the console's
        startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        startup.lpAttributeList = attributes.as_raw();

        let flags = EXTENDED_STARTUPINFO_PRESENT
            | CREATE_UNICODE_ENVIRONMENT
            | PROCESS_CREATION_FLAGS(request.attrs.creation_flags);
        let process_attributes = request
            .attrs
            .process_attributes
            .as_ref()
            .map(|a| a as *const SECURITY_ATTRIBUTES);
        let thread_attributes = request
            .attrs
            .thread_attributes
            .as_ref()
            .map(|a| a as *const SECURITY_ATTRIBUTES);
        let current_dir = directory
            .as_ref()
            .map_or(PCWSTR::null(), |d| PCWSTR(d.as_ptr()));
        let environment = Some(block.as_ptr() as *const c_void);

        let mut info = PROCESS_INFORMATION::default();
        let result = unsafe {
            match request.attrs.token {
                Some(token) => CreateProcessAsUserW(
                    token,
                    PCWSTR(application.as_ptr()),
                    PWSTR(command_line.as_mut_ptr()),
                    process_attributes,
                    thread_attributes,
                    false,
                    flags,
                    environment,
                    current_dir,
                    &startup.StartupInfo,
                    &mut info,
                ),
                None => CreateProcessW(
                    PCWSTR(application.as_ptr()),
                    PWSTR(command_line.as_mut_ptr()),
                    process_attributes,
                    thread_attributes,
                    false,
                    flags,
                    environment,
                    current_dir,
                    &startup.StartupInfo,
                    &mut info,
                ),
            }
        };
        result.map_err(|e| StartError::Spawn(win32_error(e)))?;

        unsafe {
            let _ = CloseHandle(info.hThread);
        }
        debug!("Spawned pid {} on {}: {}", info.dwProcessId, self.name, line);
        Ok(Process::from_raw_handle(info.hProcess, info.dwProcessId))
    }
}

/// Process/thread attribute list with room for `count` entries.
struct AttributeList {
    _buffer: Vec<usize>,
    list: LPPROC_THREAD_ATTRIBUTE_LIST,
}

impl AttributeList {
    fn new(count: u32) -> io::Result<Self> {
        let mut size: usize = 0;
        // Sizing call; always fails with ERROR_INSUFFICIENT_BUFFER
        let _ = unsafe {
            InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST::default(),
                count,
                0,
                &mut size,
            )
        };

        // usize elements keep the list pointer-aligned
        let words = (size + std::mem::size_of::<usize>() - 1) / std::mem::size_of::<usize>();
        let mut buffer = vec![0usize; words.max(1)];
        let list = LPPROC_THREAD_ATTRIBUTE_LIST(buffer.as_mut_ptr() as *mut c_void);
        unsafe { InitializeProcThreadAttributeList(list, count, 0, &mut size) }
            .map_err(win32_error)?;
        debug!("Attribute list initialized ({} bytes)", size);

        Ok(Self {
            _buffer: buffer,
            list,
        })
    }

    fn set_pseudo_console(&mut self, hpc: HPCON) -> io::Result<()> {
        unsafe {
            UpdateProcThreadAttribute(
                self.list,
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(hpc.0 as *const c_void),
                std::mem::size_of::<HPCON>(),
                None,
                None,
            )
        }
        .map_err(win32_error)
    }

    fn as_raw(&self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.list
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        unsafe { DeleteProcThreadAttributeList(self.list) };
    }
}

fn create_pipe() -> io::Result<(Handle, Handle)> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    unsafe { CreatePipe(&mut read, &mut write, None, 0) }.map_err(win32_error)?;
    Ok((Handle(read), Handle(write)))
}

fn coord(size: WindowSize) -> COORD {
    COORD {
        X: size.cols as i16,
        Y: size.rows as i16,
    }
}

fn fits_coord(size: WindowSize) -> bool {
    size.rows <= i16::MAX as u16 && size.cols <= i16::MAX as u16
}

/// The default environment of the user behind `token`.
fn token_environment(token: HANDLE) -> io::Result<Vec<(OsString, OsString)>> {
    let mut block: *mut c_void = std::ptr::null_mut();
    unsafe { CreateEnvironmentBlock(&mut block, token, false) }.map_err(win32_error)?;

    // SAFETY: the block is a double-NUL terminated UTF-16 sequence
    let entries = unsafe {
        let start = block as *const u16;
        let mut len = 0usize;
        while !(*start.add(len) == 0 && *start.add(len + 1) == 0) {
            len += 1;
        }
        codec::parse_environment_block(std::slice::from_raw_parts(start, len + 2))
    };

    unsafe {
        let _ = DestroyEnvironmentBlock(block);
    }
    debug!("Token environment: {} entries", entries.len());
    Ok(entries)
}

fn utf8_arg(arg: &OsStr) -> Result<&str, StartError> {
    arg.to_str()
        .ok_or_else(|| StartError::InvalidCommand(format!("argument is not valid Unicode: {:?}", arg)))
}

/// NUL-terminated UTF-16, rejecting interior NULs.
fn wide_nul(s: &OsStr) -> Result<Vec<u16>, StartError> {
    let mut wide = codec::to_wide(s);
    if wide.contains(&0) {
        return Err(StartError::InvalidCommand(format!(
            "embedded NUL in {:?}",
            s
        )));
    }
    wide.push(0);
    Ok(wide)
}
