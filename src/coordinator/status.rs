//! coordinator::status
//!
//! Read-only snapshots reported by the coordinator.

use serde::Serialize;

use crate::core::memory::PressureLevel;
use crate::core::ops::queue::QueueInfo;

/// Monotonic counters kept by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    /// Operations whose callback was invoked.
    pub operations_started: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    /// Admission rejections caused by memory.
    pub memory_throttles: u64,
    /// Admission rejections caused by held locks.
    pub resource_conflicts: u64,
    /// Operations lost because the queue refused a requeue.
    pub operations_dropped: u64,
}

/// Sum of the declared requirements of running operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_mb: u64,
    pub cpu_percent: f64,
}

/// Full coordinator snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub running_operations: usize,
    pub max_concurrent: usize,
    pub queue_info: QueueInfo,
    pub memory_pressure: PressureLevel,
    pub available_memory_mb: u64,
    pub current_usage: ResourceUsage,
    pub metrics: Metrics,
}
