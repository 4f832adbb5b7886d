//! Shared helpers for unit tests: a scripted PTY backend and an event recorder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::TerminalConfig;
use crate::events::{Listener, ProcessState, PtyEvent, PtyEventKind};
use crate::lock;
use crate::pty::{PlatformPty, PtyError, SpawnOptions};

/// Short intervals so worker threads react within a few milliseconds.
pub fn fast_config() -> TerminalConfig {
    TerminalConfig {
        reader_interval_ms: 5,
        read_backoff_ms: 1,
        monitor_interval_ms: 20,
        join_timeout_ms: 500,
        ..TerminalConfig::default()
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Records every event delivered to the listeners it hands out.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<PtyEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> Listener {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &PtyEvent| lock(&events).push(event.clone()))
    }

    pub fn kinds(&self) -> Vec<PtyEventKind> {
        lock(&self.events).iter().map(|e| e.kind.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(old, new)` pairs of every state change, in order.
    pub fn transitions(&self) -> Vec<(ProcessState, ProcessState)> {
        self.kinds()
            .into_iter()
            .filter_map(|k| match k {
                PtyEventKind::StateChanged { old, new } => Some((old, new)),
                _ => None,
            })
            .collect()
    }

    pub fn output(&self) -> String {
        self.kinds()
            .into_iter()
            .filter_map(|k| match k {
                PtyEventKind::Output { text } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&PtyEventKind) -> bool) -> usize {
        self.kinds().iter().filter(|k| matches(k)).count()
    }
}

/// Scripted [`PlatformPty`] with controllable liveness, output and failures.
#[derive(Default)]
pub struct FakePty {
    pub alive: AtomicBool,
    pub output: Mutex<VecDeque<Vec<u8>>>,
    pub written: Mutex<Vec<String>>,
    pub size: Mutex<(u16, u16)>,
    pub exit_code: Mutex<Option<i32>>,
    pub spawned_with: Mutex<Option<SpawnOptions>>,
    pub fail_spawn: AtomicBool,
    /// Report the process dead as soon as spawn returns.
    pub die_on_spawn: AtomicBool,
    pub fail_write: AtomicBool,
    pub fail_resize: AtomicBool,
    pub fail_terminate: AtomicBool,
    pub fail_wait: AtomicBool,
    pub panic_on_wait: AtomicBool,
    /// Panic on reads once the process is dead.
    pub panic_on_read_after_exit: AtomicBool,
    pub terminate_calls: AtomicUsize,
}

impl FakePty {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_output(&self, data: &[u8]) {
        lock(&self.output).push_back(data.to_vec());
    }

    /// Simulate the process exiting on its own.
    pub fn exit(&self, code: i32) {
        *lock(&self.exit_code) = Some(code);
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<String> {
        lock(&self.written).clone()
    }
}

fn fake_failure(operation: &str) -> PtyError {
    PtyError::IoError(std::io::Error::other(format!("fake {operation} failure")))
}

impl PlatformPty for FakePty {
    fn spawn(&self, options: &SpawnOptions) -> Result<(), PtyError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(PtyError::SpawnFailed("fake spawn failure".to_string()));
        }
        *lock(&self.spawned_with) = Some(options.clone());
        *lock(&self.size) = (options.rows, options.cols);
        let dead = self.die_on_spawn.load(Ordering::SeqCst);
        self.alive.store(!dead, Ordering::SeqCst);
        Ok(())
    }

    fn write(&self, data: &str) -> Result<(), PtyError> {
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(fake_failure("write"));
        }
        lock(&self.written).push(data.to_string());
        Ok(())
    }

    fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        if self.panic_on_read_after_exit.load(Ordering::SeqCst) && !self.is_alive() {
            panic!("fake read panic");
        }
        let mut output = lock(&self.output);
        let Some(mut chunk) = output.pop_front() else {
            return Ok(Vec::new());
        };
        if chunk.len() > max {
            let rest = chunk.split_off(max);
            output.push_front(rest);
        }
        Ok(chunk)
    }

    fn set_size(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if self.fail_resize.load(Ordering::SeqCst) {
            return Err(PtyError::ResizeFailed("fake resize failure".to_string()));
        }
        *lock(&self.size) = (rows, cols);
        Ok(())
    }

    fn get_size(&self) -> Result<(u16, u16), PtyError> {
        Ok(*lock(&self.size))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> Result<(), PtyError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(fake_failure("terminate"));
        }
        let mut code = lock(&self.exit_code);
        if code.is_none() {
            *code = Some(-1);
        }
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&self) -> Result<Option<i32>, PtyError> {
        if self.panic_on_wait.load(Ordering::SeqCst) {
            panic!("fake wait panic");
        }
        if self.fail_wait.load(Ordering::SeqCst) {
            return Err(fake_failure("wait"));
        }
        Ok(*lock(&self.exit_code))
    }
}

/// Lets a test keep a handle on the fake after the instance takes ownership.
pub struct SharedFake(pub Arc<FakePty>);

impl PlatformPty for SharedFake {
    fn spawn(&self, options: &SpawnOptions) -> Result<(), PtyError> {
        self.0.spawn(options)
    }

    fn write(&self, data: &str) -> Result<(), PtyError> {
        self.0.write(data)
    }

    fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        self.0.read(max)
    }

    fn set_size(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.0.set_size(rows, cols)
    }

    fn get_size(&self) -> Result<(u16, u16), PtyError> {
        self.0.get_size()
    }

    fn is_alive(&self) -> bool {
        self.0.is_alive()
    }

    fn terminate(&self) -> Result<(), PtyError> {
        self.0.terminate()
    }

    fn wait(&self) -> Result<Option<i32>, PtyError> {
        self.0.wait()
    }
}
