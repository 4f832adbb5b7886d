//! Registry of terminal instances and the single external event consumer.
//!
//! Every instance gets a routing callback that maps its [`PtyEvent`]s onto the
//! installed [`TerminalEventListener`], tagged with the instance id. The
//! registry lock only guards the map: instances are cloned out before any
//! call into them, so listeners may call back into the manager.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::TerminalConfig;
use crate::error::TerminalError;
use crate::events::{ExitReason, FailureKind, Listener, ProcessState, PtyEvent, PtyEventKind};
use crate::instance::{ProcessInfo, TerminalInstance};
use crate::lock;
use crate::platform::create_platform_pty;
use crate::pty::PlatformPty;
use crate::shell::default_shell;

/// Builds a fresh backend for each new instance.
pub type PtyFactory = Arc<dyn Fn() -> Box<dyn PlatformPty> + Send + Sync>;

/// Receives every event from every managed terminal.
///
/// Called on the emitting instance's worker thread (or the caller's thread
/// for state changes made by manager operations). Implementations must not
/// block for long.
pub trait TerminalEventListener: Send + Sync {
    fn on_terminal_output(&self, instance_id: &str, text: &str);

    fn on_terminal_state_changed(&self, instance_id: &str, old: ProcessState, new: ProcessState);

    fn on_terminal_process_exited(
        &self,
        instance_id: &str,
        exit_code: Option<i32>,
        reason: ExitReason,
    );

    fn on_terminal_error(
        &self,
        instance_id: &str,
        kind: FailureKind,
        message: &str,
        operation: Option<&str>,
    );

    fn on_terminal_size_changed(&self, instance_id: &str, rows: u16, cols: u16);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

/// Parameters for [`TerminalManager::new_terminal`]. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSpec {
    /// Explicit id; generated when absent.
    pub terminal_id: Option<String>,
    /// Program to run; the default shell when absent.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// Merged over the current process environment.
    pub env: HashMap<String, String>,
    /// Applied after spawn; a failure here is logged, not returned.
    pub size: Option<TerminalSize>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Result of a successful [`TerminalManager::new_terminal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedTerminal {
    pub instance_id: String,
    pub status: ProcessState,
}

type ListenerSlot = Arc<RwLock<Option<Arc<dyn TerminalEventListener>>>>;

/// Owns every live [`TerminalInstance`], keyed by id.
pub struct TerminalManager {
    terminals: Mutex<HashMap<String, Arc<TerminalInstance>>>,
    listener: ListenerSlot,
    factory: PtyFactory,
    config: TerminalConfig,
}

impl TerminalManager {
    /// A manager whose instances use the host OS backend.
    pub fn new(config: TerminalConfig) -> Self {
        Self::with_pty_factory(config, Arc::new(create_platform_pty))
    }

    pub fn with_pty_factory(config: TerminalConfig, factory: PtyFactory) -> Self {
        Self {
            terminals: Mutex::new(HashMap::new()),
            listener: Arc::new(RwLock::new(None)),
            factory,
            config,
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    /// Install the external consumer, replacing any previous one.
    ///
    /// Takes effect for terminals that already exist. Events emitted while no
    /// listener is installed are dropped.
    pub fn set_event_listener(&self, listener: Arc<dyn TerminalEventListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn clear_event_listener(&self) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Create, register and spawn a terminal.
    pub fn new_terminal(&self, spec: TerminalSpec) -> Result<CreatedTerminal, TerminalError> {
        let id = spec
            .terminal_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let command = spec
            .command
            .unwrap_or_else(|| default_shell(self.config.shell_candidates.as_deref()));

        let instance = Arc::new(TerminalInstance::with_metadata(
            Some(id.clone()),
            spec.metadata,
            (self.factory)(),
            self.config.clone(),
        ));
        // Registered before spawn so the Starting transition is routed.
        instance
            .events()
            .add_listener(self.routing_listener(&id), Some(routing_id(&id)));

        match lock(&self.terminals).entry(id.clone()) {
            Entry::Occupied(_) => return Err(TerminalError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&instance));
            }
        }

        let env = child_env(std::env::vars_os(), spec.env);

        if let Err(e) = instance.spawn(&command, &spec.args, Some(&env), spec.work_dir.as_deref())
        {
            log::warn!("Terminal {id}: failed to start {command}: {e}");
            self.unregister(&id, &instance);
            return Err(e);
        }

        if let Some(size) = spec.size {
            if let Err(e) = instance.set_size(size.rows, size.cols) {
                log::warn!("Terminal {id}: could not apply initial size: {e}");
            }
        }

        log::info!("Created terminal {id} running {command}");
        Ok(CreatedTerminal {
            instance_id: id,
            status: instance.state(),
        })
    }

    pub fn write_to_terminal(&self, id: &str, data: &str) -> Result<(), TerminalError> {
        self.get(id)?.write(data)
    }

    pub fn set_terminal_size(&self, id: &str, rows: u16, cols: u16) -> Result<(), TerminalError> {
        self.get(id)?.set_size(rows, cols)
    }

    pub fn get_terminal_size(&self, id: &str) -> Result<(u16, u16), TerminalError> {
        self.get(id)?.get_size()
    }

    /// Detach routing, stop the process and drop the terminal from the
    /// registry.
    ///
    /// The entry is removed even when terminating fails; that failure is
    /// still returned.
    pub fn close_terminal(&self, id: &str) -> Result<(), TerminalError> {
        let instance = self.get(id)?;

        if !instance.events().remove_listener_by_id(&routing_id(id)) {
            log::warn!("Terminal {id}: routing listener was already detached");
        }

        let result = if instance.is_running() {
            instance.terminate()
        } else {
            Ok(())
        };

        self.unregister(id, &instance);
        log::info!("Closed terminal {id}");
        result
    }

    /// Close every terminal. Individual failures are logged and skipped.
    pub fn cleanup(&self) {
        let ids: Vec<String> = lock(&self.terminals).keys().cloned().collect();
        log::info!("Cleaning up {} terminal(s)", ids.len());
        for id in ids {
            if let Err(e) = self.close_terminal(&id) {
                log::warn!("Terminal {id}: close during cleanup failed: {e}");
            }
        }
    }

    pub fn terminal_info(&self, id: &str) -> Result<ProcessInfo, TerminalError> {
        Ok(self.get(id)?.process_info())
    }

    /// Snapshots of every registered terminal, oldest first.
    pub fn list_terminals(&self) -> Vec<ProcessInfo> {
        let instances: Vec<Arc<TerminalInstance>> =
            lock(&self.terminals).values().cloned().collect();
        let mut infos: Vec<ProcessInfo> = instances.iter().map(|t| t.process_info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    pub fn len(&self) -> usize {
        lock(&self.terminals).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.terminals).contains_key(id)
    }

    fn get(&self, id: &str) -> Result<Arc<TerminalInstance>, TerminalError> {
        lock(&self.terminals)
            .get(id)
            .cloned()
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))
    }

    /// Remove `id` only if it still maps to `instance`.
    fn unregister(&self, id: &str, instance: &Arc<TerminalInstance>) {
        let removed = {
            let mut terminals = lock(&self.terminals);
            match terminals.get(id) {
                Some(current) if Arc::ptr_eq(current, instance) => terminals.remove(id),
                _ => None,
            }
        };
        // Dropped outside the registry lock.
        drop(removed);
    }

    fn routing_listener(&self, id: &str) -> Listener {
        let slot = Arc::clone(&self.listener);
        let id = id.to_string();
        Arc::new(move |event: &PtyEvent| {
            let listener = slot
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(listener) = listener {
                route(listener.as_ref(), &id, event);
            }
        })
    }
}

impl Default for TerminalManager {
    fn default() -> Self {
        Self::new(TerminalConfig::default())
    }
}

/// This process's environment with `overrides` on top. The PTY layer takes
/// UTF-8 only, so inherited variables that are not valid UTF-8 are left out.
fn child_env(
    inherited: impl IntoIterator<Item = (OsString, OsString)>,
    overrides: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for (key, value) in inherited {
        match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => {
                env.insert(key, value);
            }
            (Ok(key), Err(_)) if overrides.contains_key(&key) => {}
            (key, _) => {
                let name = key.map_or_else(|k| k.to_string_lossy().into_owned(), |k| k);
                log::warn!("Not passing environment variable {name:?} to terminal: not valid UTF-8");
            }
        }
    }
    env.extend(overrides);
    env
}

fn routing_id(instance_id: &str) -> String {
    format!("manager-route-{instance_id}")
}

/// Deliver one event to exactly one listener callback.
fn route(listener: &dyn TerminalEventListener, id: &str, event: &PtyEvent) {
    match &event.kind {
        PtyEventKind::Output { text } => listener.on_terminal_output(id, text),
        PtyEventKind::StateChanged { old, new } => {
            listener.on_terminal_state_changed(id, *old, *new)
        }
        PtyEventKind::ProcessExited { exit_code, reason } => {
            listener.on_terminal_process_exited(id, *exit_code, *reason)
        }
        PtyEventKind::Error {
            kind,
            message,
            operation,
        } => listener.on_terminal_error(id, *kind, message, operation.as_deref()),
        PtyEventKind::SizeChanged { rows, cols } => {
            listener.on_terminal_size_changed(id, *rows, *cols)
        }
    }
}
