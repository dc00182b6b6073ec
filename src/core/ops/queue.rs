//! core::ops::queue
//!
//! Bounded, thread-safe priority queue of pending operations.
//!
//! # Ordering
//!
//! Strictly higher priority is served first. Within one priority band the
//! queue is FIFO: a new entry is inserted immediately before the first entry
//! of strictly lower priority, or appended if there is none. An entry that is
//! re-enqueued joins the back of its band.
//!
//! # Invariants
//!
//! - Ids are unique among queued entries
//! - Size never exceeds `max_size`
//! - After `shutdown`, enqueue is rejected and dequeue never blocks
//!
//! # Checked-out entries
//!
//! Every successful `dequeue` counts the entry as checked out until the
//! consumer calls [`OperationQueue::task_done`]. A consumer that re-enqueues an
//! entry enqueues first and then calls `task_done`, so
//! [`OperationQueue::is_drained`] never observes the entry in neither place.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;

use crate::core::operation::{Operation, OperationSummary};
use crate::core::types::{OperationId, Priority, UtcTimestamp};

/// Default capacity.
pub const DEFAULT_MAX_SIZE: usize = 50;

/// Default bound on how long `dequeue` waits for an entry.
pub const DEFAULT_DEQUEUE_WAIT: Duration = Duration::from_secs(1);

/// Rejected enqueue. The operation is handed back to the caller.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("queue is shut down")]
    Shutdown(Box<Operation>),

    #[error("operation id already queued")]
    Duplicate(Box<Operation>),

    #[error("queue is full")]
    Full(Box<Operation>),
}

impl EnqueueError {
    /// Recover the rejected operation.
    pub fn into_operation(self) -> Operation {
        match self {
            EnqueueError::Shutdown(op) | EnqueueError::Duplicate(op) | EnqueueError::Full(op) => {
                *op
            }
        }
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueInfo {
    pub size: usize,
    pub max_size: usize,
    /// Count of queued entries per priority name. Empty bands are omitted.
    pub priorities: BTreeMap<String, usize>,
    /// Age of the longest-waiting entry, zero when empty.
    pub oldest_age_secs: f64,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Operation>,
    ids: HashSet<OperationId>,
    checked_out: usize,
    shutdown: bool,
}

/// Bounded priority queue with blocking, time-limited dequeue.
pub struct OperationQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    max_size: usize,
    dequeue_wait: Duration,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("size", &self.size())
            .field("max_size", &self.max_size)
            .field("dequeue_wait", &self.dequeue_wait)
            .finish()
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl OperationQueue {
    pub fn new(max_size: usize) -> Self {
        Self::with_wait(max_size, DEFAULT_DEQUEUE_WAIT)
    }

    /// Queue whose `dequeue` waits at most `dequeue_wait` for an entry.
    pub fn with_wait(max_size: usize, dequeue_wait: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            max_size,
            dequeue_wait,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Insert an operation in priority order.
    ///
    /// # Errors
    ///
    /// Rejects with the operation handed back if the queue is shut down, the
    /// id is already queued, or the queue is full.
    pub fn enqueue(&self, operation: Operation) -> Result<(), EnqueueError> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(EnqueueError::Shutdown(Box::new(operation)));
        }
        if state.ids.contains(&operation.id) {
            return Err(EnqueueError::Duplicate(Box::new(operation)));
        }
        if state.entries.len() >= self.max_size {
            return Err(EnqueueError::Full(Box::new(operation)));
        }

        let position = state
            .entries
            .iter()
            .position(|existing| operation.priority > existing.priority)
            .unwrap_or(state.entries.len());

        state.ids.insert(operation.id.clone());
        state.entries.insert(position, operation);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Take the head of the queue, waiting up to the configured interval.
    ///
    /// Returns `None` if nothing arrived in time, or once the queue is shut
    /// down and empty. Shutdown wakes waiters immediately.
    pub fn dequeue(&self) -> Option<Operation> {
        // A wait too long to represent as an instant has no deadline.
        let deadline = Instant::now().checked_add(self.dequeue_wait);
        let mut state = self.state.lock();

        while state.entries.is_empty() && !state.shutdown {
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.available.wait(&mut state),
            }
        }

        let operation = state.entries.pop_front()?;
        state.ids.remove(&operation.id);
        state.checked_out += 1;
        Some(operation)
    }

    /// Mark one dequeued entry as finished with.
    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
    }

    /// No entries queued and none checked out.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.entries.is_empty() && state.checked_out == 0
    }

    /// Remove a queued operation by id.
    pub fn remove(&self, id: &OperationId) -> Option<Operation> {
        let mut state = self.state.lock();
        let index = state.entries.iter().position(|op| &op.id == id)?;
        let operation = state.entries.remove(index)?;
        state.ids.remove(id);
        Some(operation)
    }

    /// Summary of the entry that would be dequeued next.
    pub fn peek(&self) -> Option<OperationSummary> {
        self.state.lock().entries.front().map(Operation::summary)
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.state.lock().ids.contains(id)
    }

    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Queued ids in dequeue order.
    pub fn ids(&self) -> Vec<OperationId> {
        self.state.lock().entries.iter().map(|op| op.id.clone()).collect()
    }

    pub fn get_queue_info(&self) -> QueueInfo {
        let state = self.state.lock();

        let mut priorities = BTreeMap::new();
        for op in &state.entries {
            *priorities.entry(op.priority.name().to_string()).or_insert(0) += 1;
        }

        let now = UtcTimestamp::now();
        let oldest_age = state
            .entries
            .iter()
            .map(|op| op.created_at.duration_until(&now))
            .max()
            .unwrap_or(Duration::ZERO);

        QueueInfo {
            size: state.entries.len(),
            max_size: self.max_size,
            priorities,
            oldest_age_secs: oldest_age.as_secs_f64(),
        }
    }

    /// Count of queued entries at `priority`.
    pub fn band_size(&self, priority: Priority) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|op| op.priority == priority)
            .count()
    }

    /// Reject further enqueues and wake every blocked `dequeue`. Idempotent.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }
}
