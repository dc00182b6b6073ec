//! transaction::step
//!
//! One reversible unit inside a transaction.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::operation::panic_message;

/// Boxed step or rollback action.
pub type StepFn = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// A named execute/rollback pair and its recorded outcome.
pub struct TransactionStep {
    name: String,
    description: String,
    execute: StepFn,
    rollback: StepFn,
    completed: bool,
    rollback_completed: bool,
    error: Option<String>,
    execution_time: Option<Duration>,
}

impl std::fmt::Debug for TransactionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStep")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("completed", &self.completed)
            .field("rollback_completed", &self.rollback_completed)
            .field("error", &self.error)
            .field("execution_time", &self.execution_time)
            .finish_non_exhaustive()
    }
}

impl TransactionStep {
    pub fn new<E, R>(
        name: impl Into<String>,
        description: impl Into<String>,
        execute: E,
        rollback: R,
    ) -> Self
    where
        E: FnMut() -> anyhow::Result<()> + Send + 'static,
        R: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            execute: Box::new(execute),
            rollback: Box::new(rollback),
            completed: false,
            rollback_completed: false,
            error: None,
            execution_time: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_rollback_completed(&self) -> bool {
        self.rollback_completed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn execution_time(&self) -> Option<Duration> {
        self.execution_time
    }

    /// Completed and not yet rolled back.
    pub fn is_rollback_eligible(&self) -> bool {
        self.completed && !self.rollback_completed
    }

    /// Forget the outcome of any earlier run.
    pub(crate) fn reset(&mut self) {
        self.completed = false;
        self.rollback_completed = false;
        self.error = None;
        self.execution_time = None;
    }

    /// Run the execute action, recording timing and outcome.
    ///
    /// The previous outcome is discarded first, so a failed rerun leaves
    /// the step neither completed nor eligible for rollback.
    pub(crate) fn run(&mut self) -> Result<(), String> {
        self.reset();
        let start = Instant::now();
        let outcome = invoke(&mut self.execute);
        self.execution_time = Some(start.elapsed());

        match outcome {
            Ok(()) => {
                self.completed = true;
                self.error = None;
                Ok(())
            }
            Err(message) => {
                self.error = Some(message.clone());
                Err(message)
            }
        }
    }

    /// Run the rollback action, marking the step rolled back on success.
    pub(crate) fn undo(&mut self) -> Result<(), String> {
        invoke(&mut self.rollback)?;
        self.rollback_completed = true;
        Ok(())
    }

    pub fn detail(&self) -> StepDetail {
        StepDetail {
            name: self.name.clone(),
            description: self.description.clone(),
            completed: self.completed,
            rollback_completed: self.rollback_completed,
            error: self.error.clone(),
            execution_time: self.execution_time.map(|d| d.as_secs_f64()),
        }
    }
}

fn invoke(action: &mut StepFn) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| action())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("step panicked: {}", panic_message(&payload))),
    }
}

/// Serializable view of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepDetail {
    pub name: String,
    pub description: String,
    pub completed: bool,
    pub rollback_completed: bool,
    pub error: Option<String>,
    /// Seconds spent in the execute action.
    pub execution_time: Option<f64>,
}
