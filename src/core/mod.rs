//! core
//!
//! Building blocks shared by the coordinator and transactions.
//!
//! # Modules
//!
//! - [`types`] - Strong types: OperationId, Priority, ResourceRequirement
//! - [`operation`] - The schedulable unit of work and its callback
//! - [`sink`] - Per-operation audit logging
//! - [`memory`] - Available-memory monitoring and pressure levels
//! - [`ops`] - Path locking and the priority queue
//! - [`config`] - Configuration schema and loading
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid ids from reaching the queue
//! - Nothing here blocks without a bound
//! - Cleanup never fails; errors are logged and swallowed

pub mod config;
pub mod memory;
pub mod operation;
pub mod ops;
pub mod sink;
pub mod types;
