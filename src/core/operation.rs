//! core::operation
//!
//! The unit of work scheduled by the coordinator.
//!
//! An [`Operation`] pairs scheduling metadata (priority, resource needs, lock
//! keys) with an opaque [`Runnable`] callback and the [`OperationSink`] that
//! receives its audit trail. The coordinator never looks inside the callback.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::core::sink::OperationSink;
use crate::core::types::{OperationId, OperationType, Priority, ResourceRequirement, UtcTimestamp};

/// A zero-argument unit of work.
///
/// Implemented for any `Fn() -> anyhow::Result<()>` closure that can be
/// shared across threads.
pub trait Runnable: Send + Sync {
    fn invoke(&self) -> anyhow::Result<()>;
}

impl<F> Runnable for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    fn invoke(&self) -> anyhow::Result<()> {
        self()
    }
}

/// Wrap a closure as a shareable [`Runnable`].
///
/// The closure's return type is inferred from the bound, so
/// `runnable(|| Ok(()))` needs no annotations.
pub fn runnable<F>(f: F) -> Arc<dyn Runnable>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A queued or running operation.
pub struct Operation {
    pub id: OperationId,
    pub op_type: OperationType,
    pub priority: Priority,
    pub resource_req: ResourceRequirement,
    /// Mutual-exclusion keys. No I/O is performed on them.
    pub paths: Vec<String>,
    pub created_at: UtcTimestamp,
    /// Set after dequeue and admission, cleared again if locking fails.
    pub started_at: Option<UtcTimestamp>,
    pub completed_at: Option<UtcTimestamp>,
    callback: Arc<dyn Runnable>,
    sink: Arc<dyn OperationSink>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("op_type", &self.op_type)
            .field("priority", &self.priority)
            .field("resource_req", &self.resource_req)
            .field("paths", &self.paths)
            .field("created_at", &self.created_at)
            .field("started_at", &self.started_at)
            .field("completed_at", &self.completed_at)
            .finish_non_exhaustive()
    }
}

impl Operation {
    pub fn new(
        id: OperationId,
        op_type: OperationType,
        priority: Priority,
        resource_req: ResourceRequirement,
        paths: Vec<String>,
        callback: Arc<dyn Runnable>,
        sink: Arc<dyn OperationSink>,
    ) -> Self {
        Self {
            id,
            op_type,
            priority,
            resource_req,
            paths,
            created_at: UtcTimestamp::now(),
            started_at: None,
            completed_at: None,
            callback,
            sink,
        }
    }

    /// The operation's audit sink.
    pub fn sink(&self) -> &dyn OperationSink {
        self.sink.as_ref()
    }

    /// Time between start and completion, once both are known.
    pub fn duration(&self) -> Option<Duration> {
        match (&self.started_at, &self.completed_at) {
            (Some(started), Some(completed)) => Some(started.duration_until(completed)),
            _ => None,
        }
    }

    /// Invoke the callback, converting errors and panics into a message.
    pub fn run(&self) -> Result<(), String> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.callback.invoke())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(payload) => Err(format!("callback panicked: {}", panic_message(&payload))),
        }
    }

    /// Read-only snapshot for status queries.
    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            id: self.id.clone(),
            op_type: self.op_type,
            priority: self.priority,
            resource_req: self.resource_req.clone(),
            paths: self.paths.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
        }
    }
}

/// Snapshot of an operation, without its callback or sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub id: OperationId,
    pub op_type: OperationType,
    pub priority: Priority,
    pub resource_req: ResourceRequirement,
    pub paths: Vec<String>,
    pub created_at: UtcTimestamp,
    pub started_at: Option<UtcTimestamp>,
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sink::MemorySink;

    fn operation(callback: Arc<dyn Runnable>) -> Operation {
        Operation::new(
            OperationId::new("op-1").unwrap(),
            OperationType::Sync,
            Priority::Normal,
            ResourceRequirement::new(64, 10.0),
            vec!["/data/a".to_string()],
            callback,
            Arc::new(MemorySink::new("op-1")),
        )
    }

    #[test]
    fn duration_requires_both_timestamps() {
        let mut op = operation(runnable(|| Ok(())));
        assert!(op.duration().is_none());

        op.started_at = Some(UtcTimestamp::now());
        assert!(op.duration().is_none());

        op.completed_at = op.started_at;
        assert_eq!(op.duration(), Some(Duration::ZERO));
    }

    #[test]
    fn run_reports_success() {
        let op = operation(runnable(|| Ok(())));
        assert!(op.run().is_ok());
    }

    #[test]
    fn run_reports_error_with_context() {
        let op = operation(runnable(|| {
            Err(anyhow::anyhow!("disk full").context("copy failed"))
        }));
        let err = op.run().unwrap_err();
        assert!(err.contains("copy failed"));
        assert!(err.contains("disk full"));
    }

    #[test]
    fn run_catches_panics() {
        let op = operation(runnable(|| panic!("boom")));
        let err = op.run().unwrap_err();
        assert!(err.contains("panicked"));
        assert!(err.contains("boom"));
    }

    #[test]
    fn summary_omits_callback() {
        let op = operation(runnable(|| Ok(())));
        let summary = op.summary();
        assert_eq!(summary.id, op.id);
        assert_eq!(summary.paths, vec!["/data/a".to_string()]);
        assert!(summary.started_at.is_none());
    }
}
