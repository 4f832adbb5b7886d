//! Event and state types, and the listener registry that fans events out.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock;

/// Lifecycle of the process behind a terminal instance.
///
/// Strictly linear: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
        }
    }

    /// Whether a process is attached and accepting input.
    pub fn is_live(self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    NaturalExit,
    TerminatedByUser,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::NaturalExit => "natural_exit",
            ExitReason::TerminatedByUser => "terminated_by_user",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which operation an [`PtyEventKind::Error`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Spawn,
    Write,
    Resize,
    Terminate,
    Monitor,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Spawn => "spawn",
            FailureKind::Write => "write",
            FailureKind::Resize => "resize",
            FailureKind::Terminate => "terminate",
            FailureKind::Monitor => "monitor",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a [`PtyEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtyEventKind {
    /// Text read from the process.
    Output { text: String },
    StateChanged {
        old: ProcessState,
        new: ProcessState,
    },
    Error {
        kind: FailureKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },
    ProcessExited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        reason: ExitReason,
    },
    SizeChanged { rows: u16, cols: u16 },
}

/// A timestamped notification about one terminal instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtyEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: PtyEventKind,
}

impl PtyEvent {
    /// Stamp `kind` with the current time.
    pub fn new(kind: PtyEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn output(text: impl Into<String>) -> Self {
        Self::new(PtyEventKind::Output { text: text.into() })
    }

    pub fn state_changed(old: ProcessState, new: ProcessState) -> Self {
        Self::new(PtyEventKind::StateChanged { old, new })
    }

    pub fn error(kind: FailureKind, message: impl Into<String>, operation: Option<&str>) -> Self {
        Self::new(PtyEventKind::Error {
            kind,
            message: message.into(),
            operation: operation.map(str::to_string),
        })
    }

    pub fn process_exited(exit_code: Option<i32>, reason: ExitReason) -> Self {
        Self::new(PtyEventKind::ProcessExited { exit_code, reason })
    }

    pub fn size_changed(rows: u16, cols: u16) -> Self {
        Self::new(PtyEventKind::SizeChanged { rows, cols })
    }
}

/// A registered event callback.
pub type Listener = Arc<dyn Fn(&PtyEvent) + Send + Sync>;

/// Identifier of a listener registration.
pub type ListenerId = String;

struct Registration {
    id: ListenerId,
    callback: Listener,
}

/// Thread-safe publish/subscribe registry for [`PtyEvent`]s.
///
/// [`emit`](Self::emit) copies the listener list under the lock and calls
/// every listener after releasing it, so a listener may add or remove
/// listeners (or emit) without deadlocking. A panicking listener is logged
/// and skipped; the rest still run.
pub struct EventManager {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback`, returning its id.
    ///
    /// With `id == None` a fresh `listener-<n>` id is generated. An explicit
    /// id that is already registered replaces the old registration.
    pub fn add_listener(&self, callback: Listener, id: Option<ListenerId>) -> ListenerId {
        let id = id.unwrap_or_else(|| {
            format!("listener-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
        });

        let mut listeners = lock(&self.listeners);
        listeners.retain(|r| r.id != id);
        listeners.push(Registration {
            id: id.clone(),
            callback,
        });
        id
    }

    /// Remove every registration of `callback`. Returns whether any existed.
    pub fn remove_listener(&self, callback: &Listener) -> bool {
        let target = Arc::as_ptr(callback) as *const ();
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|r| Arc::as_ptr(&r.callback) as *const () != target);
        listeners.len() != before
    }

    pub fn remove_listener_by_id(&self, id: &str) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn clear(&self) {
        lock(&self.listeners).clear();
    }

    /// Deliver `event` to every listener registered at the time of the call.
    pub fn emit(&self, event: &PtyEvent) {
        let snapshot: Vec<(ListenerId, Listener)> = lock(&self.listeners)
            .iter()
            .map(|r| (r.id.clone(), Arc::clone(&r.callback)))
            .collect();

        for (id, callback) in snapshot {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                log::error!(
                    "Event listener {id} panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
