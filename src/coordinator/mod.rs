//! coordinator
//!
//! Resource-aware scheduler for long-running maintenance operations.
//!
//! # Architecture
//!
//! An [`OperationManager`] owns a bounded [`OperationQueue`], a
//! [`MemoryMonitor`], a [`LockManager`], and a fixed pool of worker threads.
//! Callers submit operations; workers dequeue them in priority order, admit
//! them against memory pressure and lock contention, take their path locks,
//! and run their callbacks. Rejected operations go back to the queue.
//!
//! Every lifecycle event is reported through the operation's own
//! [`OperationSink`](crate::core::sink::OperationSink). Coordinator-level
//! diagnostics go to `tracing`.
//!
//! # Invariants
//!
//! - At most `max_concurrent` callbacks run at once
//! - Two operations sharing a path never run concurrently
//! - A lock is released before its operation leaves the running map
//! - `shutdown` is idempotent and bounded in time
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use opcoord::coordinator::{OperationManager, SubmitRequest};
//! use opcoord::core::config::CoordinatorConfig;
//! use opcoord::core::operation::runnable;
//! use opcoord::core::sink::TracingSink;
//! use opcoord::core::types::{OperationType, Priority};
//!
//! let manager = OperationManager::new(CoordinatorConfig::default()).unwrap();
//! let accepted = manager.submit_operation(
//!     SubmitRequest::new(
//!         "scrub-1",
//!         OperationType::Scrub,
//!         runnable(|| Ok(())),
//!         Arc::new(TracingSink::new("scrub-1")),
//!     )
//!     .with_priority(Priority::High)
//!     .with_paths(["/srv/photos"]),
//! );
//! assert!(accepted);
//! manager.wait_until_idle(None);
//! manager.shutdown();
//! ```

pub mod status;
mod worker;

pub use status::{ManagerStatus, Metrics, ResourceUsage};

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::config::{ConfigError, CoordinatorConfig};
use crate::core::memory::MemoryMonitor;
use crate::core::operation::{Operation, OperationSummary, Runnable};
use crate::core::ops::lock::{LockError, LockManager};
use crate::core::ops::queue::{EnqueueError, OperationQueue};
use crate::core::sink::{OperationSink, StepStatus};
use crate::core::types::{OperationId, OperationType, Priority, ResourceRequirement};
use worker::Shared;

/// Interval at which `shutdown` checks whether a worker has exited.
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Errors from coordinator construction.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Everything needed to submit one operation.
pub struct SubmitRequest {
    pub id: String,
    pub op_type: OperationType,
    pub priority: Priority,
    pub resource_req: ResourceRequirement,
    pub paths: Vec<String>,
    pub callback: Arc<dyn Runnable>,
    pub sink: Arc<dyn OperationSink>,
}

impl SubmitRequest {
    /// Request with normal priority, no resource needs, and no paths.
    pub fn new(
        id: impl Into<String>,
        op_type: OperationType,
        callback: Arc<dyn Runnable>,
        sink: Arc<dyn OperationSink>,
    ) -> Self {
        Self {
            id: id.into(),
            op_type,
            priority: Priority::Normal,
            resource_req: ResourceRequirement::default(),
            paths: Vec::new(),
            callback,
            sink,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resources(mut self, resource_req: ResourceRequirement) -> Self {
        self.resource_req = resource_req;
        self
    }

    /// Lock keys, acquired in the given order.
    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

/// Coordinator handle. Dropping it shuts the worker pool down.
pub struct OperationManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for OperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationManager")
            .field("max_concurrent", &self.shared.config.max_concurrent)
            .field("queue", &self.shared.queue)
            .field("monitor", &self.shared.monitor)
            .finish_non_exhaustive()
    }
}

impl OperationManager {
    /// Start a coordinator that reads system memory from `/proc/meminfo`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the lock directory cannot be
    /// created, or a worker thread cannot be spawned.
    pub fn new(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let monitor = MemoryMonitor::new(config.memory_warning_mb, config.memory_critical_mb);
        Self::with_monitor(config, monitor)
    }

    /// Start a coordinator with an explicit memory monitor.
    pub fn with_monitor(
        config: CoordinatorConfig,
        monitor: MemoryMonitor,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let locks = LockManager::new(&config.lock_dir)?;
        let queue = OperationQueue::with_wait(config.queue_capacity, config.dequeue_wait());
        let shared = Arc::new(Shared::new(config, queue, monitor, locks));

        let manager = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::new()),
        };

        for index in 0..shared.config.max_concurrent {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("op-worker-{}", index))
                .spawn(move || worker::run(worker_shared, index))
                .map_err(CoordinatorError::Spawn)?;
            manager.workers.lock().push(handle);
        }

        info!(
            workers = shared.config.max_concurrent,
            queue_capacity = shared.config.queue_capacity,
            lock_dir = %shared.config.lock_dir.display(),
            "operation manager started"
        );
        Ok(manager)
    }

    /// Queue an operation for execution.
    ///
    /// Returns `false` if the id is invalid or already queued, the queue is
    /// full, or the manager is shut down. Acceptance or rejection is reported
    /// through the request's sink.
    pub fn submit_operation(&self, request: SubmitRequest) -> bool {
        let SubmitRequest {
            id,
            op_type,
            priority,
            resource_req,
            paths,
            callback,
            sink,
        } = request;

        let id = match OperationId::new(id) {
            Ok(id) => id,
            Err(e) => {
                sink.log_error("invalid_operation_id", &e.to_string(), None);
                return false;
            }
        };

        let operation = Operation::new(
            id,
            op_type,
            priority,
            resource_req,
            paths,
            callback,
            Arc::clone(&sink),
        );

        match self.shared.queue.enqueue(operation) {
            Ok(()) => {
                sink.log_step(
                    "queued",
                    StepStatus::Completed,
                    &format!("Operation queued with {} priority", priority),
                );
                true
            }
            Err(e) => {
                let message = match &e {
                    EnqueueError::Full(_) => "Operation queue is full",
                    EnqueueError::Duplicate(_) => "Operation id is already queued",
                    EnqueueError::Shutdown(_) => "Operation manager is shut down",
                };
                let operation = e.into_operation();
                sink.log_warning(
                    message,
                    Some(json!({
                        "operation_id": operation.id.as_str(),
                        "queue_size": self.shared.queue.size(),
                        "max_size": self.shared.queue.max_size(),
                    })),
                );
                debug!(operation = %operation.id, reason = message, "submission rejected");
                false
            }
        }
    }

    /// Block until nothing is queued or running.
    ///
    /// `None`, a zero timeout, or one too large to represent waits
    /// indefinitely. Returns `false` if the timeout elapsed first.
    pub fn wait_until_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .and_then(|t| Instant::now().checked_add(t));

        loop {
            if self.is_idle() {
                return true;
            }
            let mut poll = self.shared.config.idle_poll();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                poll = poll.min(deadline - now);
            }
            thread::sleep(poll);
        }
    }

    fn is_idle(&self) -> bool {
        self.shared.state.lock().running.is_empty() && self.shared.queue.is_drained()
    }

    pub fn get_status(&self) -> ManagerStatus {
        let (running_operations, current_usage, metrics) = {
            let state = self.shared.state.lock();
            let usage = state
                .running
                .values()
                .fold(ResourceUsage::default(), |mut usage, op| {
                    usage.memory_mb += op.resource_req.memory_mb;
                    usage.cpu_percent += op.resource_req.cpu_percent;
                    usage
                });
            (state.running.len(), usage, state.metrics.clone())
        };

        let monitor = &self.shared.monitor;
        ManagerStatus {
            running_operations,
            max_concurrent: self.shared.config.max_concurrent,
            queue_info: self.shared.queue.get_queue_info(),
            memory_pressure: monitor.get_memory_pressure_level(),
            available_memory_mb: monitor.get_available_memory_mb(),
            current_usage,
            metrics,
        }
    }

    /// Remove a queued operation. Running operations are not interrupted.
    pub fn cancel_operation(&self, id: &str) -> bool {
        let Ok(id) = OperationId::new(id) else {
            return false;
        };
        match self.shared.queue.remove(&id) {
            Some(operation) => {
                operation
                    .sink()
                    .log_step("cancelled", StepStatus::Completed, "Operation cancelled");
                debug!(operation = %id, "operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Subset of `paths` currently locked, by this manager or anyone else.
    pub fn get_resource_conflicts<S: AsRef<str>>(&self, paths: &[S]) -> Vec<String> {
        paths
            .iter()
            .map(AsRef::as_ref)
            .filter(|path| self.shared.locks.check_locked(path))
            .map(str::to_string)
            .collect()
    }

    /// Snapshots of running operations, oldest start first.
    pub fn running_operations(&self) -> Vec<OperationSummary> {
        let mut running: Vec<_> = self.shared.state.lock().running.values().cloned().collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        running
    }

    pub fn metrics(&self) -> Metrics {
        self.shared.state.lock().metrics.clone()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.shared.queue
    }

    pub fn memory_monitor(&self) -> &MemoryMonitor {
        &self.shared.monitor
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.shared.locks
    }

    /// Stop the workers.
    ///
    /// Queued operations that have not started are not run. Each worker gets
    /// a bounded time to finish its current operation; one that overruns is
    /// detached. Calling this again is a no-op.
    pub fn shutdown(&self) {
        if self.shared.request_stop() {
            info!("operation manager shutting down");
        }
        self.shared.queue.shutdown();

        let handles = std::mem::take(&mut *self.workers.lock());
        let budget = self.shared.config.shutdown_join();
        for handle in handles {
            join_bounded(handle, budget);
        }
    }
}

impl Drop for OperationManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_bounded(handle: JoinHandle<()>, budget: Duration) {
    let deadline = Instant::now().checked_add(budget);
    while !handle.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            warn!(worker = %name, ?budget, "worker did not stop in time, detaching");
            return;
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        warn!("worker thread panicked");
    }
}
