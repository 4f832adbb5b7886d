//! Wire types for the JSON-lines protocol spoken over stdin/stdout.
//!
//! Every line on stdin is one [`RequestEnvelope`]; every line on stdout is
//! one [`Outgoing`] message, either the reply to a request or an event from
//! a terminal. Both are tagged by `"type"`.

use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tether_pty::{ExitReason, FailureKind, ProcessState, TerminalSpec};

/// A request line. `request_id` is opaque and echoed in the reply.
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub request_id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Create(TerminalSpec),
    Write { instance_id: String, data: String },
    Resize { instance_id: String, rows: u16, cols: u16 },
    Close { instance_id: String },
    Info { instance_id: String },
    List,
    Shutdown,
}

/// Messages written to stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outgoing {
    Response(Response),
    Event(EventMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub request_id: Option<serde_json::Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn from_result(
        request_id: Option<serde_json::Value>,
        result: Result<serde_json::Value, String>,
    ) -> Self {
        match result {
            Ok(value) => Self {
                request_id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(error) => Self {
                request_id,
                ok: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// One terminal event, tagged with the terminal it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMessage {
    pub instance_id: String,
    #[serde(flatten)]
    pub event: TerminalEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TerminalEvent {
    Output {
        text: String,
    },
    StateChanged {
        old: ProcessState,
        new: ProcessState,
    },
    ProcessExited {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        reason: ExitReason,
    },
    Error {
        kind: FailureKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },
    SizeChanged {
        rows: u16,
        cols: u16,
    },
}

/// Serializes [`Outgoing`] messages onto a shared writer, one per line.
///
/// Replies come from the main thread and events from terminal worker
/// threads; the lock keeps their lines from interleaving.
pub struct Outbox {
    out: Mutex<Box<dyn Write + Send>>,
}

impl Outbox {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn send(&self, message: &Outgoing) {
        let line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to serialize outgoing message: {e}");
                return;
            }
        };

        let mut out = self
            .out
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            log::warn!("Failed to write to stdout: {e}");
        }
    }
}
