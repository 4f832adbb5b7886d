//! One PTY-backed process plus the worker threads that watch it.
//!
//! A [`TerminalInstance`] owns a [`PlatformPty`], a [`ProcessState`] machine
//! and an [`EventManager`]. After [`spawn`](TerminalInstance::spawn) two
//! threads run until the process ends:
//!
//! - the **reader** polls the backend for output, emits `Output` events and
//!   performs the `Starting -> Running` transition on the first bytes;
//! - the **monitor** polls liveness and drives the exit sequence
//!   `Running -> Stopping -> Stopped` when the process dies on its own.
//!
//! Both observe a shared stop flag; nothing is ever force-killed.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::TerminalConfig;
use crate::error::TerminalError;
use crate::events::{
    panic_message, EventManager, ExitReason, FailureKind, ProcessState, PtyEvent,
};
use crate::lock;
use crate::pty::{PlatformPty, PtyError, SpawnOptions};

/// Point-in-time view of an instance, taken under its state lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub state: ProcessState,
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: Option<i32>,
    pub exit_reason: Option<ExitReason>,
    pub is_alive: bool,
    pub listener_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Mutable per-instance state, guarded by one lock.
struct Status {
    state: ProcessState,
    command: String,
    args: Vec<String>,
    exit_code: Option<i32>,
    exit_reason: Option<ExitReason>,
    last_activity: DateTime<Utc>,
}

/// Progress of the monitor's exit sequence after it sees the process die.
///
/// Each step is entered at most once, so a backend that panics midway costs
/// that step only and the next monitor iteration carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitPhase {
    Watching,
    Draining,
    Claiming,
    Reaping,
    Finishing(Option<i32>),
    Done,
}

/// State shared between the instance handle and its worker threads.
struct Shared {
    id: String,
    created_at: DateTime<Utc>,
    metadata: HashMap<String, serde_json::Value>,
    config: TerminalConfig,
    pty: Box<dyn PlatformPty>,
    events: EventManager,
    /// Set once, never cleared: tells both workers to wind down. The monitor
    /// keeps going past it until an exit it has started reporting is done.
    stop: AtomicBool,
    spawned: AtomicBool,
    status: Mutex<Status>,
    /// Bytes that do not yet form complete UTF-8. Held across a read and the
    /// emission of its output so chunks reach listeners in read order.
    pending: Mutex<Vec<u8>>,
    exit_phase: Mutex<ExitPhase>,
}

/// An event-driven terminal: one process behind one PTY.
pub struct TerminalInstance {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TerminalInstance {
    /// Create a stopped instance. A UUID is generated when `id` is `None`.
    pub fn new(id: Option<String>, pty: Box<dyn PlatformPty>, config: TerminalConfig) -> Self {
        Self::with_metadata(id, HashMap::new(), pty, config)
    }

    /// Like [`new`](Self::new), attaching free-form caller metadata.
    pub fn with_metadata(
        id: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
        pty: Box<dyn PlatformPty>,
        config: TerminalConfig,
    ) -> Self {
        let now = Utc::now();
        let shared = Shared {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            created_at: now,
            metadata,
            config,
            pty,
            events: EventManager::new(),
            stop: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
            status: Mutex::new(Status {
                state: ProcessState::Stopped,
                command: String::new(),
                args: Vec::new(),
                exit_code: None,
                exit_reason: None,
                last_activity: now,
            }),
            pending: Mutex::new(Vec::new()),
            exit_phase: Mutex::new(ExitPhase::Watching),
        };

        Self {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ProcessState {
        lock(&self.shared.status).state
    }

    /// `true` while a process is attached (starting or running).
    pub fn is_running(&self) -> bool {
        self.state().is_live()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        lock(&self.shared.status).last_activity
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.shared.metadata
    }

    /// The instance's listener registry.
    pub fn events(&self) -> &EventManager {
        &self.shared.events
    }

    /// Start `command` behind the PTY and launch the worker threads.
    ///
    /// Returns once the process is up; the `Running` transition arrives
    /// later, with the first output.
    pub fn spawn(
        &self,
        command: &str,
        args: &[String],
        env: Option<&HashMap<String, String>>,
        cwd: Option<&Path>,
    ) -> Result<(), TerminalError> {
        let shared = &self.shared;
        {
            let mut status = lock(&shared.status);
            if status.state != ProcessState::Stopped {
                return Err(TerminalError::InvalidState(status.state));
            }
            if shared.spawned.swap(true, Ordering::AcqRel) {
                return Err(TerminalError::AlreadySpawned(shared.id.clone()));
            }
            status.state = ProcessState::Starting;
            status.command = command.to_string();
            status.args = args.to_vec();
            status.exit_code = None;
            status.exit_reason = None;
        }
        lock(&shared.pending).clear();
        shared
            .events
            .emit(&PtyEvent::state_changed(ProcessState::Stopped, ProcessState::Starting));

        let options = SpawnOptions {
            command: command.to_string(),
            args: args.to_vec(),
            env: env.cloned(),
            cwd: cwd.map(Path::to_path_buf),
            rows: shared.config.default_rows,
            cols: shared.config.default_cols,
        };
        log::info!("Terminal {}: spawning {command} {args:?}", shared.id);

        if let Err(e) = shared.pty.spawn(&options) {
            return Err(shared.fail_spawn(e));
        }

        if !shared.pty.is_alive() {
            let exit_code = shared.pty.wait().ok().flatten();
            lock(&shared.status).exit_code = exit_code;
            shared.advance(&[ProcessState::Starting], ProcessState::Stopped);
            return Err(TerminalError::ExitedOnStart {
                command: command.to_string(),
                exit_code,
            });
        }

        self.start_workers()
    }

    fn start_workers(&self) -> Result<(), TerminalError> {
        let id = &self.shared.id;

        let reader = Arc::clone(&self.shared);
        let reader = thread::Builder::new()
            .name(format!("pty-reader-{id}"))
            .spawn(move || reader.reader_loop())
            .map_err(PtyError::from);
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => return Err(self.shared.fail_spawn(e)),
        };
        lock(&self.workers).push(reader);

        let monitor = Arc::clone(&self.shared);
        let monitor = thread::Builder::new()
            .name(format!("pty-monitor-{id}"))
            .spawn(move || monitor.monitor_loop())
            .map_err(PtyError::from);
        match monitor {
            Ok(handle) => {
                lock(&self.workers).push(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.stop.store(true, Ordering::Release);
                if let Err(kill_err) = self.shared.pty.terminate() {
                    log::warn!("Terminal {id}: cleanup after failed start: {kill_err}");
                }
                self.join_workers();
                Err(self.shared.fail_spawn(e))
            }
        }
    }

    /// Send text to the process.
    ///
    /// Allowed while starting: input written before the first output is
    /// queued by the OS.
    pub fn write(&self, data: &str) -> Result<(), TerminalError> {
        self.require_live()?;
        let shared = &self.shared;
        shared.touch();
        shared.pty.write(data).map_err(|e| {
            shared.emit_error(FailureKind::Write, e.to_string(), Some("write"));
            TerminalError::operation("write", e)
        })
    }

    pub fn set_size(&self, rows: u16, cols: u16) -> Result<(), TerminalError> {
        self.require_live()?;
        let shared = &self.shared;
        shared.pty.set_size(rows, cols).map_err(|e| {
            shared.emit_error(FailureKind::Resize, e.to_string(), Some("set_size"));
            TerminalError::operation("set_size", e)
        })?;
        shared.events.emit(&PtyEvent::size_changed(rows, cols));
        Ok(())
    }

    /// Current `(rows, cols)`.
    pub fn get_size(&self) -> Result<(u16, u16), TerminalError> {
        self.require_live()?;
        self.shared
            .pty
            .get_size()
            .map_err(|e| TerminalError::operation("get_size", e))
    }

    /// Stop the process and wait (bounded) for the worker threads.
    ///
    /// A no-op when already stopped or stopping. Backend failures are
    /// reported as an `Error` event and returned, but the instance still
    /// ends up `Stopped`.
    pub fn terminate(&self) -> Result<(), TerminalError> {
        let shared = &self.shared;
        if !shared.advance(
            &[ProcessState::Starting, ProcessState::Running],
            ProcessState::Stopping,
        ) {
            return Ok(());
        }
        log::info!("Terminal {}: terminating", shared.id);
        shared.stop.store(true, Ordering::Release);

        let mut failure = None;
        if shared.pty.is_alive() {
            if let Err(e) = shared.pty.terminate() {
                log::warn!("Terminal {}: terminate failed: {e}", shared.id);
                shared.emit_error(FailureKind::Terminate, e.to_string(), Some("terminate"));
                failure = Some(e);
            }
        }

        self.join_workers();

        // Waiting on a process that refused to die would block forever.
        let exit_code = if shared.pty.is_alive() {
            None
        } else {
            shared.pty.wait().unwrap_or_else(|e| {
                log::warn!("Terminal {}: could not collect exit code: {e}", shared.id);
                None
            })
        };
        shared.complete_exit(exit_code, ExitReason::TerminatedByUser);

        match failure {
            Some(e) => Err(TerminalError::operation("terminate", e)),
            None => Ok(()),
        }
    }

    pub fn process_info(&self) -> ProcessInfo {
        let shared = &self.shared;
        let status = lock(&shared.status);
        ProcessInfo {
            id: shared.id.clone(),
            state: status.state,
            command: status.command.clone(),
            args: status.args.clone(),
            exit_code: status.exit_code,
            exit_reason: status.exit_reason,
            is_alive: shared.pty.is_alive(),
            listener_count: shared.events.listener_count(),
            created_at: shared.created_at,
            last_activity: status.last_activity,
            metadata: shared.metadata.clone(),
        }
    }

    fn require_live(&self) -> Result<(), TerminalError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TerminalError::NotRunning(self.shared.id.clone()))
        }
    }

    /// Join both workers, giving each up to `join_timeout`.
    ///
    /// A worker that does not finish in time is abandoned. The calling
    /// thread is never joined: a listener may call `terminate` from a worker.
    fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let timeout = self.shared.config.join_timeout();
        let current = thread::current().id();

        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }

            let name = handle.thread().name().unwrap_or("pty-worker").to_string();
            if !handle.is_finished() {
                log::warn!("{name} did not stop within {timeout:?}; abandoning it");
                continue;
            }
            if handle.join().is_err() {
                log::error!("{name} panicked");
            }
        }
    }
}

impl Drop for TerminalInstance {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.terminate() {
                log::warn!("Terminal {}: terminate on drop failed: {e}", self.shared.id);
            }
        }
    }
}

impl std::fmt::Debug for TerminalInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalInstance")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    /// Move to `to` if the current state is one of `from`, then emit the
    /// change. Returns whether the transition happened.
    fn advance(&self, from: &[ProcessState], to: ProcessState) -> bool {
        let old = {
            let mut status = lock(&self.status);
            if !from.contains(&status.state) {
                return false;
            }
            let old = status.state;
            status.state = to;
            old
        };
        self.events.emit(&PtyEvent::state_changed(old, to));
        true
    }

    fn touch(&self) {
        lock(&self.status).last_activity = Utc::now();
    }

    fn emit_error(&self, kind: FailureKind, message: String, operation: Option<&str>) {
        self.events.emit(&PtyEvent::error(kind, message, operation));
    }

    /// Report a failed spawn and fall back to `Stopped`.
    fn fail_spawn(&self, err: PtyError) -> TerminalError {
        log::warn!("Terminal {}: spawn failed: {err}", self.id);
        self.emit_error(FailureKind::Spawn, err.to_string(), Some("spawn"));
        self.advance(
            &[ProcessState::Starting, ProcessState::Running],
            ProcessState::Stopped,
        );
        TerminalError::operation("spawn", err)
    }

    /// Record how the process ended and finish `Stopping -> Stopped`.
    fn complete_exit(&self, exit_code: Option<i32>, reason: ExitReason) {
        {
            let mut status = lock(&self.status);
            status.exit_code = exit_code;
            status.exit_reason = Some(reason);
        }
        log::info!("Terminal {}: process exited ({reason}, code {exit_code:?})", self.id);
        self.events.emit(&PtyEvent::process_exited(exit_code, reason));
        self.advance(&[ProcessState::Stopping], ProcessState::Stopped);
    }

    fn reader_loop(&self) {
        let interval = self.config.reader_interval();
        while !self.stop.load(Ordering::Acquire) {
            // The monitor drains what is left and reports the exit.
            if !self.pty.is_alive() {
                break;
            }
            self.poll_output();
            thread::sleep(interval);
        }
        log::debug!("Terminal {}: reader stopped", self.id);
    }

    /// Up to `read_attempts` reads with linear backoff; stops at the first
    /// non-empty one. Read errors are expected while polling and dropped.
    fn poll_output(&self) {
        let Some(mut pending) = self.lock_pending() else {
            return;
        };
        let attempts = self.config.read_attempts();
        for attempt in 1..=attempts {
            match self.pty.read(self.config.read_chunk_size()) {
                Ok(bytes) if !bytes.is_empty() => {
                    self.handle_output(&mut pending, &bytes);
                    return;
                }
                Ok(_) => {}
                Err(e) => log::trace!("Terminal {}: read failed: {e}", self.id),
            }
            if attempt < attempts {
                thread::sleep(self.config.read_backoff() * attempt);
            }
        }
    }

    fn handle_output(&self, pending: &mut Vec<u8>, bytes: &[u8]) {
        pending.extend_from_slice(bytes);
        let text = take_utf8(pending);
        self.touch();
        self.advance(&[ProcessState::Starting], ProcessState::Running);
        if !text.is_empty() {
            self.events.emit(&PtyEvent::output(text));
        }
    }

    /// Read whatever the backend still buffers after the process died.
    fn drain_output(&self) {
        let Some(mut pending) = self.lock_pending() else {
            return;
        };
        let deadline = Instant::now() + self.config.join_timeout();
        let mut idle = 0;
        while idle < self.config.read_attempts() && Instant::now() < deadline {
            match self.pty.read(self.config.read_chunk_size()) {
                Ok(bytes) if !bytes.is_empty() => {
                    idle = 0;
                    self.handle_output(&mut pending, &bytes);
                }
                _ => {
                    idle += 1;
                    thread::sleep(self.config.read_backoff());
                }
            }
        }

        // A truncated multi-byte sequence will never be completed now.
        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).into_owned();
            pending.clear();
            self.events.emit(&PtyEvent::output(text));
        }
    }

    /// Wait for the other worker to release the pending buffer, unless
    /// `terminate` takes over meanwhile: the holder may be inside a listener
    /// that is joining this thread.
    fn lock_pending(&self) -> Option<MutexGuard<'_, Vec<u8>>> {
        loop {
            match self.pending.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if !lock(&self.status).state.is_live() {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn set_exit_phase(&self, phase: ExitPhase) {
        *lock(&self.exit_phase) = phase;
    }

    fn monitor_loop(&self) {
        let interval = self.config.monitor_interval();
        loop {
            // After a stop request terminate() owns the exit, unless this
            // thread already started reporting one.
            if self.stop.load(Ordering::Acquire) && *lock(&self.exit_phase) == ExitPhase::Watching
            {
                break;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| self.check_liveness())) {
                Ok(true) => break,
                Ok(false) => {}
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!("Terminal {}: monitor check panicked: {message}", self.id);
                    self.emit_error(
                        FailureKind::Monitor,
                        format!("liveness check panicked: {message}"),
                        Some("monitor"),
                    );
                }
            }
            thread::sleep(interval);
        }
        log::debug!("Terminal {}: monitor stopped", self.id);
    }

    /// Returns `true` once the process is gone and its exit was handled.
    ///
    /// Resumes from the recorded [`ExitPhase`] when an earlier call panicked.
    fn check_liveness(&self) -> bool {
        loop {
            let phase = *lock(&self.exit_phase);
            match phase {
                ExitPhase::Watching => {
                    if self.pty.is_alive() {
                        return false;
                    }
                    if self.stop.load(Ordering::Acquire) {
                        // terminate() killed it and reports the exit itself.
                        return true;
                    }
                    self.stop.store(true, Ordering::Release);
                    self.set_exit_phase(ExitPhase::Draining);
                }
                ExitPhase::Draining => {
                    self.set_exit_phase(ExitPhase::Claiming);
                    self.drain_output();
                }
                ExitPhase::Claiming => {
                    // Starting counts too: a process can die before printing anything.
                    if !self.advance(
                        &[ProcessState::Starting, ProcessState::Running],
                        ProcessState::Stopping,
                    ) {
                        // terminate() got there first and reports the exit itself.
                        self.set_exit_phase(ExitPhase::Done);
                        return true;
                    }
                    self.set_exit_phase(ExitPhase::Reaping);
                }
                ExitPhase::Reaping => {
                    self.set_exit_phase(ExitPhase::Finishing(None));
                    let exit_code = match self.pty.wait() {
                        Ok(code) => code,
                        Err(e) => {
                            self.emit_error(
                                FailureKind::Monitor,
                                format!("failed to collect exit code: {e}"),
                                Some("wait"),
                            );
                            None
                        }
                    };
                    self.set_exit_phase(ExitPhase::Finishing(exit_code));
                }
                ExitPhase::Finishing(exit_code) => {
                    self.set_exit_phase(ExitPhase::Done);
                    self.complete_exit(exit_code, ExitReason::NaturalExit);
                    return true;
                }
                ExitPhase::Done => return true,
            }
        }
    }
}

/// Decode the complete UTF-8 prefix of `pending`, leaving a trailing
/// incomplete sequence in place. Invalid bytes become U+FFFD.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::with_capacity(pending.len());
    let mut consumed = 0;
    loop {
        match std::str::from_utf8(&pending[consumed..]) {
            Ok(valid) => {
                text.push_str(valid);
                consumed = pending.len();
                break;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                text.push_str(&String::from_utf8_lossy(
                    &pending[consumed..consumed + valid_up_to],
                ));
                consumed += valid_up_to;
                match err.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        consumed += len;
                    }
                    None => break,
                }
            }
        }
    }
    pending.drain(..consumed);
    text
}
