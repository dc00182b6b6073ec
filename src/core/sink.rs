//! core::sink
//!
//! Per-operation audit channel.
//!
//! # Design
//!
//! Every submitted operation carries an [`OperationSink`]. The coordinator
//! reports queueing, admission rejections, execution outcome, and transaction
//! progress through it. Sinks must never fail the caller: implementations
//! that can hit I/O errors log them via `tracing` and carry on.
//!
//! # Implementations
//!
//! - [`TracingSink`] - Forwards events to `tracing` with the operation id as a field
//! - [`JournalSink`] - Appends JSON lines to a file, fsync per event
//! - [`MemorySink`] - Keeps events in memory (useful for callers and tests)
//!
//! # Example
//!
//! ```
//! use opcoord::core::sink::{MemorySink, OperationSink, StepStatus};
//!
//! let sink = MemorySink::new("op-1");
//! sink.log_step("queued", StepStatus::Completed, "Operation queued");
//! assert_eq!(sink.events().len(), 1);
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::types::UtcTimestamp;

/// Errors from sink construction and journal reads.
#[derive(Debug, Error)]
pub enum SinkError {
    /// I/O error opening or reading a journal file.
    #[error("sink i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("sink json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Status of a logged stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
    Warning,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Warning => "warning",
        };
        f.write_str(s)
    }
}

/// Logging sink supplied with every operation.
///
/// The three required methods are the submitter contract. Checkpoint and
/// rollback events have provided defaults that fold them into `log_step`.
pub trait OperationSink: Send + Sync {
    /// Record progress of a named stage.
    fn log_step(&self, stage: &str, status: StepStatus, message: &str);

    /// Record an error of the given kind.
    fn log_error(&self, kind: &str, message: &str, details: Option<Value>);

    /// Record a warning.
    fn log_warning(&self, message: &str, details: Option<Value>);

    /// Record progress of a stage together with how long it took.
    fn log_step_timed(&self, stage: &str, status: StepStatus, message: &str, _duration: Duration) {
        self.log_step(stage, status, message);
    }

    /// Record a named checkpoint with a snapshot of progress.
    fn create_checkpoint(&self, name: &str, _state: Value) {
        self.log_step(
            &format!("checkpoint_{}", name),
            StepStatus::Completed,
            "checkpoint created",
        );
    }

    /// Record that a rollback to `checkpoint` was started.
    fn log_rollback(&self, checkpoint: &str, reason: &str) {
        self.log_step(
            &format!("rollback_{}", checkpoint),
            StepStatus::Started,
            reason,
        );
    }
}

/// One recorded sink event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEventKind {
    Step {
        step: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<f64>,
    },
    Error {
        error_type: String,
        error_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    Warning {
        warning_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    Checkpoint {
        checkpoint_name: String,
        state: Value,
    },
    Rollback {
        from_checkpoint: String,
        reason: String,
    },
}

/// A sink event stamped with time and operation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkEvent {
    pub timestamp: UtcTimestamp,
    pub operation_id: String,
    #[serde(flatten)]
    pub kind: SinkEventKind,
}

impl SinkEvent {
    fn new(operation_id: &str, kind: SinkEventKind) -> Self {
        Self {
            timestamp: UtcTimestamp::now(),
            operation_id: operation_id.to_string(),
            kind,
        }
    }
}

/// Shared event construction for the recording sinks.
fn step_event(
    stage: &str,
    status: StepStatus,
    message: &str,
    duration: Option<Duration>,
) -> SinkEventKind {
    SinkEventKind::Step {
        step: stage.to_string(),
        status,
        details: (!message.is_empty()).then(|| message.to_string()),
        duration_seconds: duration.map(|d| (d.as_secs_f64() * 100.0).round() / 100.0),
    }
}

// =============================================================================
// TracingSink
// =============================================================================

/// Sink that forwards every event to `tracing`.
#[derive(Debug, Clone)]
pub struct TracingSink {
    operation_id: String,
}

impl TracingSink {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
        }
    }
}

impl OperationSink for TracingSink {
    fn log_step(&self, stage: &str, status: StepStatus, message: &str) {
        tracing::info!(operation_id = %self.operation_id, stage, %status, "{}", message);
    }

    fn log_error(&self, kind: &str, message: &str, details: Option<Value>) {
        match details {
            Some(details) => tracing::error!(
                operation_id = %self.operation_id,
                kind,
                %details,
                "{}",
                message
            ),
            None => tracing::error!(operation_id = %self.operation_id, kind, "{}", message),
        }
    }

    fn log_warning(&self, message: &str, details: Option<Value>) {
        match details {
            Some(details) => {
                tracing::warn!(operation_id = %self.operation_id, %details, "{}", message)
            }
            None => tracing::warn!(operation_id = %self.operation_id, "{}", message),
        }
    }

    fn log_step_timed(&self, stage: &str, status: StepStatus, message: &str, duration: Duration) {
        tracing::info!(
            operation_id = %self.operation_id,
            stage,
            %status,
            duration_ms = duration.as_millis() as u64,
            "{}",
            message
        );
    }
}

// =============================================================================
// JournalSink
// =============================================================================

/// Sink that appends one JSON object per event to a file.
///
/// Each append is flushed and fsynced before returning. Write failures are
/// reported through `tracing` and otherwise ignored.
#[derive(Debug)]
pub struct JournalSink {
    operation_id: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalSink {
    /// Open (or create) a journal file for appending.
    ///
    /// Creates parent directories if needed.
    pub fn create(
        operation_id: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            operation_id: operation_id.into(),
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all events from a journal file.
    pub fn read(path: &Path) -> Result<Vec<SinkEvent>, SinkError> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    fn append(&self, kind: SinkEventKind) {
        let event = SinkEvent::new(&self.operation_id, kind);
        if let Err(e) = self.try_append(&event) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to append journal event"
            );
        }
    }

    fn try_append(&self, event: &SinkEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl OperationSink for JournalSink {
    fn log_step(&self, stage: &str, status: StepStatus, message: &str) {
        self.append(step_event(stage, status, message, None));
    }

    fn log_error(&self, kind: &str, message: &str, details: Option<Value>) {
        self.append(SinkEventKind::Error {
            error_type: kind.to_string(),
            error_message: message.to_string(),
            context: details,
        });
    }

    fn log_warning(&self, message: &str, details: Option<Value>) {
        self.append(SinkEventKind::Warning {
            warning_message: message.to_string(),
            context: details,
        });
    }

    fn log_step_timed(&self, stage: &str, status: StepStatus, message: &str, duration: Duration) {
        self.append(step_event(stage, status, message, Some(duration)));
    }

    fn create_checkpoint(&self, name: &str, state: Value) {
        self.append(SinkEventKind::Checkpoint {
            checkpoint_name: name.to_string(),
            state,
        });
    }

    fn log_rollback(&self, checkpoint: &str, reason: &str) {
        self.append(SinkEventKind::Rollback {
            from_checkpoint: checkpoint.to_string(),
            reason: reason.to_string(),
        });
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    operation_id: String,
    events: Mutex<Vec<SinkEvent>>,
}

impl MemorySink {
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of recorded events, oldest first.
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// Recorded error kinds, oldest first.
    pub fn error_kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match &e.kind {
                SinkEventKind::Error { error_type, .. } => Some(error_type.clone()),
                _ => None,
            })
            .collect()
    }

    /// Recorded warning messages, oldest first.
    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match &e.kind {
                SinkEventKind::Warning {
                    warning_message, ..
                } => Some(warning_message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether a step event with this stage and status was recorded.
    pub fn has_step(&self, stage: &str, status: StepStatus) -> bool {
        self.events.lock().iter().any(|e| {
            matches!(
                &e.kind,
                SinkEventKind::Step { step, status: s, .. } if step == stage && *s == status
            )
        })
    }

    fn push(&self, kind: SinkEventKind) {
        self.events.lock().push(SinkEvent::new(&self.operation_id, kind));
    }
}

impl OperationSink for MemorySink {
    fn log_step(&self, stage: &str, status: StepStatus, message: &str) {
        self.push(step_event(stage, status, message, None));
    }

    fn log_error(&self, kind: &str, message: &str, details: Option<Value>) {
        self.push(SinkEventKind::Error {
            error_type: kind.to_string(),
            error_message: message.to_string(),
            context: details,
        });
    }

    fn log_warning(&self, message: &str, details: Option<Value>) {
        self.push(SinkEventKind::Warning {
            warning_message: message.to_string(),
            context: details,
        });
    }

    fn log_step_timed(&self, stage: &str, status: StepStatus, message: &str, duration: Duration) {
        self.push(step_event(stage, status, message, Some(duration)));
    }

    fn create_checkpoint(&self, name: &str, state: Value) {
        self.push(SinkEventKind::Checkpoint {
            checkpoint_name: name.to_string(),
            state,
        });
    }

    fn log_rollback(&self, checkpoint: &str, reason: &str) {
        self.push(SinkEventKind::Rollback {
            from_checkpoint: checkpoint.to_string(),
            reason: reason.to_string(),
        });
    }
}
