//! Request handlers.
//!
//! Each handler delegates to the [`TerminalManager`] and maps its errors to
//! strings for the wire, the way the reply carries them.

use serde::Serialize;
use tether_pty::{TerminalManager, TerminalSpec};

use crate::ipc::Request;

/// Run one request and produce the `result` payload of its reply.
///
/// `shutdown` is handled by the caller, which also owns the read loop.
pub fn dispatch(manager: &TerminalManager, request: Request) -> Result<serde_json::Value, String> {
    match request {
        Request::Create(spec) => create_terminal(manager, spec),
        Request::Write { instance_id, data } => write_input(manager, &instance_id, &data),
        Request::Resize {
            instance_id,
            rows,
            cols,
        } => resize_terminal(manager, &instance_id, rows, cols),
        Request::Close { instance_id } => close_terminal(manager, &instance_id),
        Request::Info { instance_id } => terminal_info(manager, &instance_id),
        Request::List => to_value(&manager.list_terminals()),
        Request::Shutdown => Ok(serde_json::Value::Null),
    }
}

fn create_terminal(manager: &TerminalManager, spec: TerminalSpec) -> Result<serde_json::Value, String> {
    let created = manager
        .new_terminal(spec)
        .map_err(|e| format!("Failed to create terminal: {e}"))?;
    to_value(&created)
}

fn write_input(manager: &TerminalManager, id: &str, data: &str) -> Result<serde_json::Value, String> {
    manager
        .write_to_terminal(id, data)
        .map_err(|e| format!("Write error: {e}"))?;
    Ok(serde_json::Value::Null)
}

fn resize_terminal(
    manager: &TerminalManager,
    id: &str,
    rows: u16,
    cols: u16,
) -> Result<serde_json::Value, String> {
    manager
        .set_terminal_size(id, rows, cols)
        .map_err(|e| format!("Resize error: {e}"))?;
    Ok(serde_json::Value::Null)
}

fn close_terminal(manager: &TerminalManager, id: &str) -> Result<serde_json::Value, String> {
    manager
        .close_terminal(id)
        .map_err(|e| format!("Close error: {e}"))?;
    Ok(serde_json::Value::Null)
}

fn terminal_info(manager: &TerminalManager, id: &str) -> Result<serde_json::Value, String> {
    let info = manager.terminal_info(id).map_err(|e| e.to_string())?;
    to_value(&info)
}

fn to_value(value: &impl Serialize) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Serialization error: {e}"))
}
