use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use crate::lock;

/// Errors from PTY operations.
#[derive(Debug)]
pub enum PtyError {
    SpawnFailed(String),
    IoError(std::io::Error),
    ResizeFailed(String),
    NotSpawned,
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::SpawnFailed(msg) => write!(f, "PTY spawn failed: {msg}"),
            PtyError::IoError(err) => write!(f, "PTY I/O error: {err}"),
            PtyError::ResizeFailed(msg) => write!(f, "PTY resize failed: {msg}"),
            PtyError::NotSpawned => write!(f, "PTY has no spawned process"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PtyError {
    fn from(err: std::io::Error) -> Self {
        PtyError::IoError(err)
    }
}

/// Everything a backend needs to start a process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub command: String,
    pub args: Vec<String>,
    /// Complete environment for the child. `None` inherits the host process's.
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
}

/// Capability interface of a native pseudo-terminal.
///
/// All methods take `&self`: the reader thread, the monitor thread and the
/// caller's thread use the same backend concurrently, so implementations
/// guard their own state.
pub trait PlatformPty: Send + Sync {
    /// Start `options.command` attached to a fresh PTY.
    fn spawn(&self, options: &SpawnOptions) -> Result<(), PtyError>;

    /// Send text to the process (user input -> shell).
    fn write(&self, data: &str) -> Result<(), PtyError>;

    /// Take up to `max` bytes of pending output. Returns an empty buffer when
    /// nothing is available; never blocks indefinitely.
    fn read(&self, max: usize) -> Result<Vec<u8>, PtyError>;

    fn set_size(&self, rows: u16, cols: u16) -> Result<(), PtyError>;

    /// Current `(rows, cols)`.
    fn get_size(&self) -> Result<(u16, u16), PtyError>;

    fn is_alive(&self) -> bool;

    /// End the process. Safe to call on a process that already exited.
    fn terminate(&self) -> Result<(), PtyError>;

    /// Exit code of the process, reaping it if needed.
    ///
    /// Returns `None` when nothing was ever spawned or the platform reported
    /// no code.
    fn wait(&self) -> Result<Option<i32>, PtyError>;
}

/// Child process plus its cached exit code once reaped.
#[derive(Default)]
struct ChildSlot {
    child: Option<Box<dyn Child + Send + Sync>>,
    exit_code: Option<i32>,
}

impl ChildSlot {
    /// Poll the child without blocking and cache its exit code.
    fn poll_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        let child = self.child.as_mut()?;
        if let Ok(Some(status)) = child.try_wait() {
            self.exit_code = Some(status.exit_code() as i32);
        }
        self.exit_code
    }
}

/// Output forwarded by the pump thread, plus bytes left over from a read
/// that was capped at `max`.
#[derive(Default)]
struct OutputQueue {
    rx: Option<Receiver<Vec<u8>>>,
    carry: Vec<u8>,
}

/// portable-pty plumbing shared by the per-OS adapters.
///
/// portable-pty readers block, so a pump thread does the blocking reads and
/// forwards chunks over a channel; [`PtyCore::read`] only drains the channel.
#[derive(Default)]
pub struct PtyCore {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<ChildSlot>,
    output: Mutex<OutputQueue>,
}

impl PtyCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate spawn options into a portable-pty command.
    pub fn build_command(options: &SpawnOptions) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&options.command);
        cmd.args(&options.args);
        if let Some(env) = &options.env {
            cmd.env_clear();
            for (key, value) in env {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = &options.cwd {
            cmd.cwd(dir);
        }
        cmd
    }

    /// Open a PTY of the given size and spawn `cmd` on its slave side.
    pub fn spawn_command(&self, cmd: CommandBuilder, rows: u16, cols: u16) -> Result<(), PtyError> {
        let mut slot = lock(&self.child);
        if slot.child.is_some() {
            return Err(PtyError::SpawnFailed("a process was already spawned".to_string()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn command: {e}")))?;
        // Our copy of the slave must go, otherwise the reader never sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let (tx, rx) = mpsc::channel();
        start_pump(reader, tx)?;

        *lock(&self.output) = OutputQueue {
            rx: Some(rx),
            carry: Vec::new(),
        };
        *lock(&self.writer) = Some(writer);
        *lock(&self.master) = Some(pair.master);
        slot.child = Some(child);
        slot.exit_code = None;
        Ok(())
    }

    pub fn write(&self, data: &str) -> Result<(), PtyError> {
        let mut writer = lock(&self.writer);
        let writer = writer.as_mut().ok_or(PtyError::NotSpawned)?;
        writer.write_all(data.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        let mut guard = lock(&self.output);
        let queue = &mut *guard;
        let rx = queue.rx.as_ref().ok_or(PtyError::NotSpawned)?;

        // A disconnected channel just means the pump hit EOF; liveness
        // checks report the exit, not the read path.
        while queue.carry.len() < max {
            match rx.try_recv() {
                Ok(chunk) => queue.carry.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }

        let take = queue.carry.len().min(max);
        Ok(queue.carry.drain(..take).collect())
    }

    pub fn set_size(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(PtyError::NotSpawned)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    pub fn get_size(&self) -> Result<(u16, u16), PtyError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(PtyError::NotSpawned)?;
        let size = master
            .get_size()
            .map_err(|e| PtyError::IoError(std::io::Error::other(e.to_string())))?;
        Ok((size.rows, size.cols))
    }

    pub fn is_alive(&self) -> bool {
        let mut slot = lock(&self.child);
        slot.child.is_some() && slot.poll_exit().is_none()
    }

    /// Kill the child if it is still running and reap it.
    ///
    /// On Unix portable-pty sends SIGHUP first and escalates to SIGKILL after
    /// a short grace period.
    pub fn terminate(&self) -> Result<(), PtyError> {
        let mut slot = lock(&self.child);
        if slot.child.is_none() || slot.poll_exit().is_some() {
            return Ok(());
        }
        let Some(child) = slot.child.as_mut() else {
            return Ok(());
        };

        child.kill()?;
        let status = child.wait()?;
        slot.exit_code = Some(status.exit_code() as i32);
        drop(slot);

        // Closing our input side lets anything still reading stdin give up.
        lock(&self.writer).take();
        Ok(())
    }

    pub fn wait(&self) -> Result<Option<i32>, PtyError> {
        let mut slot = lock(&self.child);
        if let Some(code) = slot.poll_exit() {
            return Ok(Some(code));
        }
        let Some(child) = slot.child.as_mut() else {
            return Ok(None);
        };
        let status = child.wait()?;
        let code = status.exit_code() as i32;
        slot.exit_code = Some(code);
        Ok(Some(code))
    }

    /// Drop the master and writer handles.
    pub fn release(&self) {
        lock(&self.writer).take();
        lock(&self.master).take();
    }
}

impl Drop for PtyCore {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            // ESRCH (no such process) is expected if it exited in between.
            log::debug!("Kill PTY child on drop: {e}");
        }
    }
}

/// Forward blocking PTY reads to `tx` until EOF or the receiver goes away.
fn start_pump(mut reader: Box<dyn Read + Send>, tx: Sender<Vec<u8>>) -> Result<(), PtyError> {
    thread::Builder::new()
        .name("pty-pump".to_string())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => return, // EOF, PTY closed
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => return, // EIO once the child side is gone
                }
            }
        })
        .map(|_| ())
        .map_err(|e| PtyError::SpawnFailed(format!("failed to start PTY pump: {e}")))
}
