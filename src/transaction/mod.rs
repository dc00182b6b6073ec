//! transaction
//!
//! Ordered, reversible step sequences with checkpoints.
//!
//! # Architecture
//!
//! A [`Transaction`] holds an ordered list of [`TransactionStep`]s, each an
//! execute action paired with a rollback action. `execute` runs the steps in
//! order; `rollback` reverses completed steps newest first. Named checkpoints
//! mark a step index so a caller can undo only the tail of the sequence.
//!
//! Every transition is reported through the transaction's
//! [`OperationSink`].
//!
//! # Invariants
//!
//! - Only completed, not-yet-rolled-back steps are rolled back
//! - A rollback failure is recorded but never stops the sweep
//! - The timeout is checked before each step, never mid-step
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use opcoord::core::sink::MemorySink;
//! use opcoord::core::types::OperationId;
//! use opcoord::transaction::{Transaction, TransactionState};
//!
//! let sink = Arc::new(MemorySink::new("backup-7"));
//! let id = OperationId::new("backup-7").unwrap();
//! let mut tx = Transaction::new(id, sink, Duration::from_secs(60));
//!
//! tx.add_step(|| Ok(()), || Ok(()), "snapshot volume", Some("snapshot"));
//! tx.add_validation_step(|| Ok(()), "verify snapshot", None);
//!
//! assert!(tx.execute(false));
//! assert_eq!(tx.state(), TransactionState::Completed);
//! ```

pub mod registry;
pub mod step;

pub use registry::{SharedTransaction, TransactionManager, DEFAULT_STALL_MAX_AGE};
pub use step::{StepDetail, StepFn, TransactionStep};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::core::sink::{OperationSink, StepStatus};
use crate::core::types::{OperationId, UtcTimestamp};

/// Default wall-clock budget for a transaction.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Errors reported by transactions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("Checkpoint '{0}' not found")]
    UnknownCheckpoint(String),

    #[error("Transaction timed out after {}s", .timeout.as_secs())]
    Timeout { elapsed: Duration, timeout: Duration },

    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Rollback failed for step '{step}': {message}")]
    RollbackFailed { step: String, message: String },
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Executing,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl TransactionState {
    /// Executing or rolling back.
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Executing | TransactionState::RollingBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Executing => "executing",
            TransactionState::Completed => "completed",
            TransactionState::Failed => "failed",
            TransactionState::RollingBack => "rolling_back",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::RollbackFailed => "rollback_failed",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable transaction summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionStatus {
    pub operation_id: OperationId,
    pub status: TransactionState,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub current_step_index: usize,
    pub elapsed_time_seconds: f64,
    /// Checkpoint names in creation order.
    pub checkpoints: Vec<String>,
}

#[derive(Debug, Clone)]
struct Checkpoint {
    name: String,
    step_index: usize,
}

/// A reversible sequence of steps for one operation.
pub struct Transaction {
    operation_id: OperationId,
    sink: Arc<dyn OperationSink>,
    timeout: Duration,
    steps: Vec<TransactionStep>,
    checkpoints: Vec<Checkpoint>,
    current_step_index: usize,
    started_at: UtcTimestamp,
    started: Instant,
    state: TransactionState,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("operation_id", &self.operation_id)
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .field("steps", &self.steps)
            .field("checkpoints", &self.checkpoints)
            .field("current_step_index", &self.current_step_index)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Start a transaction. The timeout clock starts now.
    pub fn new(operation_id: OperationId, sink: Arc<dyn OperationSink>, timeout: Duration) -> Self {
        sink.log_step(
            "transaction_initiated",
            StepStatus::Started,
            &format!("Transaction initialized with {}s timeout", timeout.as_secs()),
        );

        Self {
            operation_id,
            sink,
            timeout,
            steps: Vec::new(),
            checkpoints: Vec::new(),
            current_step_index: 0,
            started_at: UtcTimestamp::now(),
            started: Instant::now(),
            state: TransactionState::Pending,
        }
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn started_at(&self) -> UtcTimestamp {
        self.started_at
    }

    /// Time since the transaction was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn steps(&self) -> &[TransactionStep] {
        &self.steps
    }

    /// Append a step. Unnamed steps are called `step_<n>`, 1-based.
    pub fn add_step<E, R>(
        &mut self,
        execute: E,
        rollback: R,
        description: impl Into<String>,
        name: Option<&str>,
    ) where
        E: FnMut() -> anyhow::Result<()> + Send + 'static,
        R: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("step_{}", self.steps.len() + 1));
        self.push(TransactionStep::new(name, description, execute, rollback));
    }

    /// Append a check with nothing to undo. Unnamed checks are called
    /// `validation_<n>`, 1-based.
    pub fn add_validation_step<V>(
        &mut self,
        validate: V,
        description: impl Into<String>,
        name: Option<&str>,
    ) where
        V: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("validation_{}", self.steps.len() + 1));
        self.push(TransactionStep::new(name, description, validate, || Ok(())));
    }

    fn push(&mut self, step: TransactionStep) {
        self.sink.log_step(
            "step_added",
            StepStatus::Completed,
            &format!("Added step '{}': {}", step.name(), step.description()),
        );
        self.steps.push(step);
    }

    /// Run every step in order.
    ///
    /// Stops at the first failing step unless `continue_on_error`, in which
    /// case failures are recorded on their steps and the sequence still
    /// completes. Returns `false` on abort or timeout.
    pub fn execute(&mut self, continue_on_error: bool) -> bool {
        self.state = TransactionState::Executing;
        self.sink.log_step(
            "transaction_execution",
            StepStatus::Started,
            &format!("Starting execution of {} steps", self.steps.len()),
        );
        for step in &mut self.steps {
            step.reset();
        }

        for index in 0..self.steps.len() {
            self.current_step_index = index;

            if let Err(e) = self.check_timeout() {
                self.sink.log_error(
                    "timeout",
                    &e.to_string(),
                    Some(json!({
                        "elapsed_seconds": self.elapsed().as_secs_f64(),
                        "timeout_seconds": self.timeout.as_secs(),
                        "step": self.steps[index].name(),
                    })),
                );
                self.state = TransactionState::Failed;
                return false;
            }

            let step = &mut self.steps[index];
            self.sink
                .log_step(step.name(), StepStatus::Started, step.description());

            match step.run() {
                Ok(()) => {
                    self.sink.log_step_timed(
                        step.name(),
                        StepStatus::Completed,
                        step.description(),
                        step.execution_time().unwrap_or_default(),
                    );
                }
                Err(message) => {
                    let err = TransactionError::StepFailed {
                        step: step.name().to_string(),
                        message,
                    };
                    self.sink.log_error(
                        "step_execution_error",
                        &err.to_string(),
                        Some(json!({ "step": step.name() })),
                    );
                    if !continue_on_error {
                        self.state = TransactionState::Failed;
                        return false;
                    }
                }
            }
        }

        self.state = TransactionState::Completed;
        self.sink.log_step(
            "transaction_execution",
            StepStatus::Completed,
            &format!("All {} steps completed successfully", self.steps.len()),
        );
        true
    }

    fn check_timeout(&self) -> Result<(), TransactionError> {
        let elapsed = self.elapsed();
        if elapsed > self.timeout {
            return Err(TransactionError::Timeout {
                elapsed,
                timeout: self.timeout,
            });
        }
        Ok(())
    }

    /// Undo every completed step, newest first.
    ///
    /// Returns `true` if every eligible rollback succeeded.
    pub fn rollback(&mut self, reason: &str) -> bool {
        self.state = TransactionState::RollingBack;
        self.sink.log_step(
            "transaction_rollback",
            StepStatus::Started,
            &format!("Rolling back due to: {}", reason),
        );

        let mut all_ok = true;
        for step in self.steps.iter_mut().rev() {
            if !step.is_rollback_eligible() {
                continue;
            }

            let stage = format!("{}_rollback", step.name());
            self.sink.log_step(
                &stage,
                StepStatus::Started,
                &format!("Rolling back: {}", step.description()),
            );

            match step.undo() {
                Ok(()) => self.sink.log_step(
                    &stage,
                    StepStatus::Completed,
                    &format!("Successfully rolled back: {}", step.description()),
                ),
                Err(message) => {
                    all_ok = false;
                    let err = TransactionError::RollbackFailed {
                        step: step.name().to_string(),
                        message,
                    };
                    self.sink.log_error(
                        "rollback_error",
                        &err.to_string(),
                        Some(json!({ "step": step.name() })),
                    );
                }
            }
        }

        if all_ok {
            self.state = TransactionState::RolledBack;
            self.sink.log_step(
                "transaction_rollback",
                StepStatus::Completed,
                "All steps rolled back successfully",
            );
        } else {
            self.state = TransactionState::RollbackFailed;
            self.sink.log_step(
                "transaction_rollback",
                StepStatus::Failed,
                "Some rollback steps failed",
            );
        }
        all_ok
    }

    /// Mark the current step index under `name`, replacing any checkpoint of
    /// the same name.
    pub fn create_checkpoint(&mut self, name: &str) {
        let step_index = self.current_step_index;
        let existing = self.checkpoints.iter().position(|c| c.name == name);
        match existing {
            Some(i) => self.checkpoints[i].step_index = step_index,
            None => self.checkpoints.push(Checkpoint {
                name: name.to_string(),
                step_index,
            }),
        }

        let completed: Vec<&str> = self.steps[..step_index.min(self.steps.len())]
            .iter()
            .filter(|s| s.is_completed())
            .map(TransactionStep::name)
            .collect();
        let pending: Vec<&str> = self
            .steps
            .iter()
            .skip(step_index)
            .map(TransactionStep::name)
            .collect();

        self.sink.create_checkpoint(
            name,
            json!({
                "step_index": step_index,
                "completed_steps": completed,
                "pending_steps": pending,
                "transaction_status": self.state.as_str(),
            }),
        );
    }

    /// Step index recorded for a checkpoint.
    pub fn checkpoint_index(&self, name: &str) -> Result<usize, TransactionError> {
        self.checkpoints
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.step_index)
            .ok_or_else(|| TransactionError::UnknownCheckpoint(name.to_string()))
    }

    /// Undo, newest first, every completed step at or after the checkpoint.
    ///
    /// Leaves the transaction state unchanged. Returns `false` for an unknown
    /// checkpoint or if any rollback failed.
    pub fn rollback_to_checkpoint(&mut self, name: &str, reason: Option<&str>) -> bool {
        let from = match self.checkpoint_index(name) {
            Ok(index) => index,
            Err(e) => {
                self.sink.log_error("checkpoint_not_found", &e.to_string(), None);
                return false;
            }
        };

        let reason = reason
            .map(str::to_string)
            .unwrap_or_else(|| format!("Rollback to checkpoint '{}'", name));
        self.sink.log_rollback(name, &reason);

        let mut all_ok = true;
        for step in self.steps.iter_mut().skip(from).rev() {
            if !step.is_rollback_eligible() {
                continue;
            }
            if let Err(message) = step.undo() {
                all_ok = false;
                let err = TransactionError::RollbackFailed {
                    step: step.name().to_string(),
                    message,
                };
                self.sink.log_error(
                    "checkpoint_rollback_error",
                    &err.to_string(),
                    Some(json!({ "step": step.name(), "checkpoint": name })),
                );
            }
        }
        all_ok
    }

    pub fn get_status(&self) -> TransactionStatus {
        TransactionStatus {
            operation_id: self.operation_id.clone(),
            status: self.state,
            total_steps: self.steps.len(),
            completed_steps: self.steps.iter().filter(|s| s.is_completed()).count(),
            failed_steps: self.steps.iter().filter(|s| s.error().is_some()).count(),
            current_step_index: self.current_step_index,
            elapsed_time_seconds: self.elapsed().as_secs_f64(),
            checkpoints: self.checkpoints.iter().map(|c| c.name.clone()).collect(),
        }
    }

    pub fn get_step_details(&self) -> Vec<StepDetail> {
        self.steps.iter().map(TransactionStep::detail).collect()
    }
}
