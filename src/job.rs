use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::events::{Event, EventChannel, EventKind};

/// Final state of a job, as decided by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// One submitted render request and its execution state.
#[derive(Debug)]
pub struct Job {
    id: String,
    events: EventChannel,
    done: AtomicBool,
    /// Held while the terminal event is enqueued and `done` published, and
    /// by `emit_while_running`.
    finishing: Mutex<()>,
    error: OnceLock<String>,
    stop: CancellationToken,
    cancelled: AtomicBool,
    process: Mutex<Option<ProcessHandle>>,
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

impl Job {
    pub fn new() -> Self {
        Job {
            id: Uuid::new_v4().simple().to_string(),
            events: EventChannel::new(),
            done: AtomicBool::new(false),
            finishing: Mutex::new(()),
            error: OnceLock::new(),
            stop: CancellationToken::new(),
            cancelled: AtomicBool::new(false),
            process: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn emit(&self, kind: EventKind, payload: Value) {
        let event = Event::new(kind, payload);
        if kind == EventKind::Log {
            trace!(job_id = %self.id, event = %record(&event));
        } else {
            debug!(job_id = %self.id, event = %record(&event));
        }
        self.events.put(event);
    }

    /// Emits unless the job has already been finished. Returns whether the
    /// event was enqueued; it is always ahead of the terminal event.
    pub fn emit_while_running(&self, kind: EventKind, payload: Value) -> bool {
        let _finishing = self.finishing_lock();
        if self.is_done() {
            return false;
        }
        self.emit(kind, payload);
        true
    }

    /// Enqueues the terminal event and publishes `done`.
    pub(crate) fn finish(&self, kind: EventKind, payload: Value) {
        let _finishing = self.finishing_lock();
        self.emit(kind, payload);
        self.mark_done();
    }

    pub fn emit_log(&self, line: impl Into<String>) {
        self.emit(EventKind::Log, json!({ "line": line.into() }));
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    pub(crate) fn set_error(&self, message: String) {
        let _ = self.error.set(message);
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub(crate) async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Whether the job actually ended because of cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn active_process(&self) -> Option<ProcessHandle> {
        self.process_slot().clone()
    }

    /// Registers `handle` as this job's running process until the returned
    /// guard is dropped.
    pub(crate) fn attach_process(&self, handle: ProcessHandle) -> ProcessGuard<'_> {
        *self.process_slot() = Some(handle.clone());
        ProcessGuard { job: self, handle }
    }

    fn finishing_lock(&self) -> MutexGuard<'_, ()> {
        self.finishing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process_slot(&self) -> MutexGuard<'_, Option<ProcessHandle>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

/// Clears the job's process slot and marks the process exited on drop.
pub(crate) struct ProcessGuard<'a> {
    job: &'a Job,
    handle: ProcessHandle,
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        self.job.process_slot().take();
        self.handle.mark_exited();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// The process had already exited.
    NotRunning,
    /// The process exited within the grace period.
    Terminated,
    /// The grace period ran out and the process was killed.
    Killed,
}

/// Shared view of a running external process, used by the cancel path to
/// stop it while the supervisor keeps ownership of the child.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exited: CancellationToken,
    kill: CancellationToken,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>) -> Self {
        ProcessHandle {
            pid,
            exited: CancellationToken::new(),
            kill: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.cancel();
    }

    pub(crate) async fn kill_requested(&self) {
        self.kill.cancelled().await
    }

    /// Asks the process to terminate, then kills it if it is still alive
    /// after `grace`.
    pub async fn terminate(&self, grace: Duration) -> StopResult {
        if self.has_exited() {
            return StopResult::NotRunning;
        }
        if !self.send_terminate() {
            self.kill.cancel();
            self.exited.cancelled().await;
            return StopResult::Killed;
        }
        match tokio::time::timeout(grace, self.exited.cancelled()).await {
            Ok(()) => StopResult::Terminated,
            Err(_) => {
                debug!(pid = ?self.pid, "Grace period elapsed, killing render process");
                self.kill.cancel();
                self.exited.cancelled().await;
                StopResult::Killed
            }
        }
    }

    /// Returns false when no graceful signal could be delivered.
    #[cfg(unix)]
    fn send_terminate(&self) -> bool {
        match self.pid {
            Some(pid) => crate::supervisor::signal_group(pid, libc::SIGTERM),
            None => false,
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&self) -> bool {
        false
    }
}
