//! coordinator::worker
//!
//! State shared between the coordinator handle and its worker threads, and
//! the worker loop itself.
//!
//! # Worker loop
//!
//! 1. Dequeue with a bounded wait; on nothing, pause and recheck shutdown
//! 2. Admission: memory pressure, memory headroom, lock contention
//! 3. Rejected operations are requeued and the worker backs off
//! 4. Admitted operations take their locks in path order, run, and release
//!
//! # Invariants
//!
//! - A running-map entry exists only while its worker holds or is taking the
//!   operation's locks
//! - Locks are released before the running-map entry is removed
//! - Running-map changes and the counters they imply share one critical
//!   section, so a status snapshot never sees one without the other
//! - Callback panics never escape the worker

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde_json::json;
use tracing::{debug, error, warn};

use super::status::Metrics;
use crate::core::config::CoordinatorConfig;
use crate::core::memory::{MemoryMonitor, PressureLevel};
use crate::core::operation::{panic_message, Operation, OperationSummary};
use crate::core::ops::lock::{LockManager, LockMode};
use crate::core::ops::queue::OperationQueue;
use crate::core::sink::StepStatus;
use crate::core::types::{OperationId, Priority, UtcTimestamp};

/// Bookkeeping guarded by one mutex so counters and the running map agree.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub running: HashMap<OperationId, OperationSummary>,
    pub metrics: Metrics,
}

/// Why admission turned an operation away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Memory,
    Conflict,
}

pub(crate) struct Shared {
    pub config: CoordinatorConfig,
    pub queue: OperationQueue,
    pub monitor: MemoryMonitor,
    pub locks: LockManager,
    pub state: Mutex<RunState>,
    stopping: Mutex<bool>,
    stop_signal: Condvar,
}

impl Shared {
    pub fn new(
        config: CoordinatorConfig,
        queue: OperationQueue,
        monitor: MemoryMonitor,
        locks: LockManager,
    ) -> Self {
        Self {
            config,
            queue,
            monitor,
            locks,
            state: Mutex::new(RunState::default()),
            stopping: Mutex::new(false),
            stop_signal: Condvar::new(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.lock()
    }

    /// Raise the stop flag. Returns false if it was already raised.
    pub fn request_stop(&self) -> bool {
        let mut stopping = self.stopping.lock();
        if *stopping {
            return false;
        }
        *stopping = true;
        drop(stopping);
        self.stop_signal.notify_all();
        true
    }

    /// Sleep for `interval`, waking early if a stop is requested.
    fn pause(&self, interval: Duration) {
        let mut stopping = self.stopping.lock();
        if !*stopping {
            self.stop_signal.wait_for(&mut stopping, interval);
        }
    }

    fn count(&self, update: impl FnOnce(&mut Metrics)) {
        update(&mut self.state.lock().metrics);
    }

    /// Put an operation back in the queue after a rejected admission.
    ///
    /// A refused requeue drops the operation; the drop is counted and
    /// reported through the operation's sink.
    fn requeue(&self, operation: Operation) {
        if let Err(e) = self.queue.enqueue(operation) {
            let reason = e.to_string();
            let operation = e.into_operation();
            warn!(operation = %operation.id, %reason, "dropping operation on requeue");
            operation.sink().log_error(
                "requeue_failed",
                &format!("Operation dropped: {}", reason),
                Some(json!({ "priority": operation.priority.name() })),
            );
            self.count(|m| m.operations_dropped += 1);
        }
    }

    /// Memory and lock checks for an operation about to start.
    fn check_admission(&self, operation: &Operation) -> Result<(), Rejection> {
        let sink = operation.sink();

        match self.monitor.get_memory_pressure_level() {
            PressureLevel::Critical => {
                sink.log_warning(
                    "Critical memory pressure, throttling operations",
                    Some(json!({ "available_mb": self.monitor.get_available_memory_mb() })),
                );
                self.count(|m| m.memory_throttles += 1);
                return Err(Rejection::Memory);
            }
            PressureLevel::Warning if operation.priority < Priority::High => {
                sink.log_warning(
                    &format!("Memory pressure, skipping {} priority", operation.priority),
                    None,
                );
                self.count(|m| m.memory_throttles += 1);
                return Err(Rejection::Memory);
            }
            _ => {}
        }

        let required_mb = operation.resource_req.memory_mb;
        if !self.monitor.can_allocate_memory(required_mb) {
            sink.log_warning(
                &format!("Insufficient memory for {}MB requirement", required_mb),
                Some(json!({ "available_mb": self.monitor.get_available_memory_mb() })),
            );
            self.count(|m| m.memory_throttles += 1);
            return Err(Rejection::Memory);
        }

        if let Some(path) = operation.paths.iter().find(|p| self.locks.check_locked(p)) {
            sink.log_warning(&format!("Resource already in use: {}", path), None);
            self.count(|m| m.resource_conflicts += 1);
            return Err(Rejection::Conflict);
        }

        Ok(())
    }

    /// Take every lock the operation names, in order, or none of them.
    ///
    /// A path held by another operation of this coordinator counts as taken.
    fn acquire_locks(&self, operation: &Operation) -> Option<Vec<String>> {
        let mut acquired = Vec::with_capacity(operation.paths.len());
        for path in &operation.paths {
            if acquired.contains(path) {
                continue;
            }
            if !self.locks.acquire_unheld(path, LockMode::Exclusive) {
                debug!(operation = %operation.id, path = %path, "lock acquisition failed");
                for held in &acquired {
                    self.locks.release_lock(held);
                }
                return None;
            }
            acquired.push(path.clone());
        }
        Some(acquired)
    }
}

/// How an admitted operation's callback finished.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Failed,
}

/// Releases an admitted operation's locks and running-map entry, even if the
/// worker unwinds. The outcome is counted in the same critical section that
/// removes the entry.
struct Admitted<'a> {
    shared: &'a Shared,
    id: OperationId,
    locks: Vec<String>,
    outcome: Option<Outcome>,
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        for path in &self.locks {
            self.shared.locks.release_lock(path);
        }
        let mut state = self.shared.state.lock();
        state.running.remove(&self.id);
        match self.outcome {
            Some(Outcome::Completed) => state.metrics.operations_completed += 1,
            Some(Outcome::Failed) => state.metrics.operations_failed += 1,
            None => {}
        }
    }
}

/// Body of one worker thread.
pub(crate) fn run(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "worker started");

    while !shared.is_stopping() {
        let Some(operation) = shared.queue.dequeue() else {
            shared.pause(shared.config.idle_sleep());
            continue;
        };

        let id = operation.id.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| process(&shared, operation)));
        if let Err(payload) = outcome {
            error!(
                worker = index,
                operation = %id,
                panic = %panic_message(&payload),
                "worker recovered from panic"
            );
        }
        shared.queue.task_done();
    }

    debug!(worker = index, "worker stopped");
}

/// Admit, lock, and execute one dequeued operation.
fn process(shared: &Shared, mut operation: Operation) {
    if let Err(rejection) = shared.check_admission(&operation) {
        debug!(operation = %operation.id, ?rejection, "admission rejected");
        shared.requeue(operation);
        shared.pause(shared.config.admission_backoff());
        return;
    }

    operation.started_at = Some(UtcTimestamp::now());
    let locks = {
        let mut state = shared.state.lock();
        state.running.insert(operation.id.clone(), operation.summary());
        let locks = shared.acquire_locks(&operation);
        match locks {
            Some(_) => state.metrics.operations_started += 1,
            None => {
                state.running.remove(&operation.id);
                state.metrics.resource_conflicts += 1;
            }
        }
        locks
    };

    let Some(locks) = locks else {
        operation.started_at = None;
        operation.sink().log_warning(
            "Could not acquire resource locks, requeueing",
            Some(json!({ "paths": operation.paths })),
        );
        shared.requeue(operation);
        shared.pause(shared.config.lock_backoff());
        return;
    };

    let mut admitted = Admitted {
        shared,
        id: operation.id.clone(),
        locks,
        outcome: None,
    };

    operation.sink().log_step(
        "execution",
        StepStatus::Started,
        &format!("Starting {} operation", operation.op_type),
    );

    let result = operation.run();
    operation.completed_at = Some(UtcTimestamp::now());
    let duration = operation.duration().unwrap_or_default();
    let sink = operation.sink();

    match result {
        Ok(()) => {
            sink.log_step_timed(
                "execution",
                StepStatus::Completed,
                &format!("Completed {} operation", operation.op_type),
                duration,
            );
            admitted.outcome = Some(Outcome::Completed);
            debug!(operation = %operation.id, ?duration, "operation completed");
        }
        Err(message) => {
            sink.log_error(
                "execution_failed",
                &message,
                Some(json!({
                    "operation_type": operation.op_type.as_str(),
                    "duration_seconds": duration.as_secs_f64(),
                })),
            );
            admitted.outcome = Some(Outcome::Failed);
            warn!(operation = %operation.id, error = %message, "operation failed");
        }
    }
}
