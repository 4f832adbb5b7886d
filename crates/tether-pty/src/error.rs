use crate::events::ProcessState;
use crate::pty::PtyError;

/// Errors from terminal instance and manager operations.
#[derive(Debug)]
pub enum TerminalError {
    /// No terminal is registered under the id.
    NotFound(String),
    /// A terminal with the requested explicit id is already registered.
    AlreadyExists(String),
    /// The operation needs a live process.
    NotRunning(String),
    /// `spawn` was called while the instance was not stopped.
    InvalidState(ProcessState),
    /// Instances are single-use; this one already ran a process.
    AlreadySpawned(String),
    /// The process was gone right after spawning.
    ExitedOnStart {
        command: String,
        exit_code: Option<i32>,
    },
    /// The PTY backend failed.
    OperationFailed {
        operation: &'static str,
        source: PtyError,
    },
}

impl TerminalError {
    pub(crate) fn operation(operation: &'static str, source: PtyError) -> Self {
        TerminalError::OperationFailed { operation, source }
    }
}

impl std::fmt::Display for TerminalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalError::NotFound(id) => write!(f, "terminal {id} not found"),
            TerminalError::AlreadyExists(id) => write!(f, "terminal {id} already exists"),
            TerminalError::NotRunning(id) => write!(f, "terminal {id} is not running"),
            TerminalError::InvalidState(state) => {
                write!(f, "cannot spawn: terminal is {state}, expected stopped")
            }
            TerminalError::AlreadySpawned(id) => {
                write!(f, "terminal {id} already ran a process and cannot be reused")
            }
            TerminalError::ExitedOnStart { command, exit_code } => match exit_code {
                Some(code) => write!(f, "{command} exited immediately with code {code}"),
                None => write!(f, "{command} exited immediately"),
            },
            TerminalError::OperationFailed { operation, source } => {
                write!(f, "{operation} failed: {source}")
            }
        }
    }
}

impl std::error::Error for TerminalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TerminalError::OperationFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
