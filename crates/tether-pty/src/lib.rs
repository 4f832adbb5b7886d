//! tether-pty: event-driven terminal process lifecycle for Tether.
//!
//! This crate spawns shells (or arbitrary commands) behind a pseudo-terminal,
//! watches them from background threads, and turns raw PTY activity into a
//! typed event stream. Terminal content is opaque text; nothing here parses
//! escape sequences.
//!
//! # Architecture
//!
//! - [`PlatformPty`]: Backend contract (spawn, read, write, resize, wait).
//!   [`create_platform_pty`] picks the adapter for the host OS.
//! - [`EventManager`]: Snapshot-then-deliver listener registry for [`PtyEvent`]s.
//! - [`TerminalInstance`]: One process, one state machine, a reader and a
//!   monitor thread.
//! - [`TerminalManager`]: Registry of instances that forwards every event to a
//!   single [`TerminalEventListener`].

pub mod config;
pub mod error;
pub mod events;
pub mod instance;
pub mod manager;
pub mod platform;
pub mod pty;
pub mod shell;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, TerminalConfig};
pub use error::TerminalError;
pub use events::{
    EventManager, ExitReason, FailureKind, Listener, ListenerId, ProcessState, PtyEvent,
    PtyEventKind,
};
pub use instance::{ProcessInfo, TerminalInstance};
pub use manager::{
    CreatedTerminal, PtyFactory, TerminalEventListener, TerminalManager, TerminalSize,
    TerminalSpec,
};
pub use platform::{create_platform_pty, platform_name};
pub use pty::{PlatformPty, PtyError, SpawnOptions};
pub use shell::default_shell;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Listener callbacks and backends run user code on worker threads; a panic
/// there must not wedge every later operation on the same instance.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
