//! Per-OS [`PlatformPty`] adapters and the factory that picks one.
//!
//! Both adapters sit on the same portable-pty core; they differ in how the
//! child environment is prepared and how a terminated PTY is released.

use crate::pty::{PlatformPty, PtyCore, PtyError, SpawnOptions};

/// Create the PTY backend for the host OS.
pub fn create_platform_pty() -> Box<dyn PlatformPty> {
    #[cfg(unix)]
    {
        Box::new(UnixPty::new())
    }
    #[cfg(windows)]
    {
        Box::new(WindowsPty::new())
    }
}

/// Short name of the backend [`create_platform_pty`] returns.
pub fn platform_name() -> &'static str {
    #[cfg(unix)]
    {
        "unix"
    }
    #[cfg(windows)]
    {
        "windows"
    }
}

/// Unix PTY (openpty + fork/exec).
#[cfg(unix)]
#[derive(Default)]
pub struct UnixPty {
    core: PtyCore,
}

#[cfg(unix)]
impl UnixPty {
    /// Value used for `TERM` when the caller's environment does not set one.
    pub const DEFAULT_TERM: &'static str = "xterm-256color";

    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(unix)]
impl PlatformPty for UnixPty {
    fn spawn(&self, options: &SpawnOptions) -> Result<(), PtyError> {
        let mut cmd = PtyCore::build_command(options);
        if cmd.get_env("TERM").is_none() {
            cmd.env("TERM", Self::DEFAULT_TERM);
        }
        self.core.spawn_command(cmd, options.rows, options.cols)
    }

    fn write(&self, data: &str) -> Result<(), PtyError> {
        self.core.write(data)
    }

    fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        self.core.read(max)
    }

    fn set_size(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.core.set_size(rows, cols)
    }

    fn get_size(&self) -> Result<(u16, u16), PtyError> {
        self.core.get_size()
    }

    fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    fn terminate(&self) -> Result<(), PtyError> {
        self.core.terminate()
    }

    fn wait(&self) -> Result<Option<i32>, PtyError> {
        self.core.wait()
    }
}

/// Windows pseudo console (ConPTY).
#[cfg(windows)]
#[derive(Default)]
pub struct WindowsPty {
    core: PtyCore,
}

#[cfg(windows)]
impl WindowsPty {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(windows)]
impl PlatformPty for WindowsPty {
    fn spawn(&self, options: &SpawnOptions) -> Result<(), PtyError> {
        // ConPTY does its own terminal emulation; TERM is left alone.
        let cmd = PtyCore::build_command(options);
        self.core.spawn_command(cmd, options.rows, options.cols)
    }

    fn write(&self, data: &str) -> Result<(), PtyError> {
        self.core.write(data)
    }

    fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        self.core.read(max)
    }

    fn set_size(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.core.set_size(rows, cols)
    }

    fn get_size(&self) -> Result<(u16, u16), PtyError> {
        self.core.get_size()
    }

    fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    fn terminate(&self) -> Result<(), PtyError> {
        let result = self.core.terminate();
        // The pump only sees EOF once the pseudo console itself is closed.
        self.core.release();
        result
    }

    fn wait(&self) -> Result<Option<i32>, PtyError> {
        self.core.wait()
    }
}
