//! core::ops
//!
//! Scheduling primitives: path locks and the pending-operation queue.
//!
//! # Modules
//!
//! - [`lock`] - Cross-process, path-keyed advisory locks
//! - [`queue`] - Bounded priority queue with blocking dequeue
//!
//! # Architecture
//!
//! A coordinator worker:
//! 1. Dequeues the highest-priority operation
//! 2. Probes its paths with `check_locked`
//! 3. Takes every path lock, or releases the ones it got and requeues
//! 4. Runs the operation and releases its locks
//!
//! # Example
//!
//! ```
//! use opcoord::core::ops::{LockManager, LockMode, OperationQueue};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let locks = LockManager::new(dir.path()).unwrap();
//! let queue = OperationQueue::new(10);
//!
//! assert!(queue.is_empty());
//! assert!(locks.acquire_lock("/srv/media", LockMode::Exclusive));
//! locks.release_all();
//! ```

pub mod lock;
pub mod queue;

pub use lock::{LockError, LockManager, LockMode};
pub use queue::{EnqueueError, OperationQueue, QueueInfo};
