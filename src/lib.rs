//! opcoord - resource-aware coordination of long-running maintenance work
//!
//! opcoord schedules operations such as sync, scrub, and backup jobs against a
//! fixed worker pool, admitting each one only when memory allows and no other
//! holder has its paths locked. Multi-step work can be wrapped in
//! transactions that undo completed steps on failure.
//!
//! # Architecture
//!
//! - [`core`] - Domain types, memory monitoring, locking, queueing, sinks, config
//! - [`coordinator`] - Worker pool with admission control
//! - [`transaction`] - Reversible step sequences and their registry
//!
//! # Correctness Invariants
//!
//! 1. Two operations sharing a path never run at the same time
//! 2. No operation is started under critical memory pressure
//! 3. Callback and step failures are recorded, never propagated
//! 4. Rollback attempts every eligible step, even after a failure

pub mod coordinator;
pub mod core;
pub mod transaction;

pub use coordinator::{ManagerStatus, Metrics, OperationManager, SubmitRequest};
pub use transaction::{Transaction, TransactionManager, TransactionState};
