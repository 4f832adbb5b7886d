//! Polling and sizing knobs for terminal instances.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors from loading a [`TerminalConfig`].
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read config: {err}"),
            ConfigError::Parse(err) => write!(f, "invalid config: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}

/// Runtime settings shared by a manager and the instances it creates.
///
/// Every field has a default, so a config file only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Sleep between reader loop iterations.
    pub reader_interval_ms: u64,
    /// Non-blocking reads attempted per reader iteration.
    pub read_attempts: u32,
    /// Base backoff between read attempts; grows linearly per attempt.
    pub read_backoff_ms: u64,
    /// Upper bound on bytes taken from the backend per read.
    pub read_chunk_size: usize,
    /// Sleep between liveness checks in the monitor loop.
    pub monitor_interval_ms: u64,
    /// How long `terminate` waits for each worker thread.
    pub join_timeout_ms: u64,
    pub default_rows: u16,
    pub default_cols: u16,
    /// Replaces the built-in default-shell candidate list when set.
    pub shell_candidates: Option<Vec<String>>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            reader_interval_ms: 20,
            read_attempts: 3,
            read_backoff_ms: 5,
            read_chunk_size: 64 * 1024,
            monitor_interval_ms: 200,
            join_timeout_ms: 1000,
            default_rows: 24,
            default_cols: 80,
            shell_candidates: None,
        }
    }
}

impl TerminalConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn reader_interval(&self) -> Duration {
        Duration::from_millis(self.reader_interval_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Reads per iteration, never less than one.
    pub(crate) fn read_attempts(&self) -> u32 {
        self.read_attempts.max(1)
    }

    pub(crate) fn read_chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }
}
