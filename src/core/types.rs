//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`OperationId`] - Validated, caller-assigned operation identifier
//! - [`OperationType`] - Kind of maintenance work (sync, scrub, backup)
//! - [`Priority`] - Totally ordered scheduling priority
//! - [`ResourceRequirement`] - Declared resource needs of an operation
//! - [`UtcTimestamp`] - RFC3339 timestamp
//!
//! # Examples
//!
//! ```
//! use opcoord::core::types::{OperationId, Priority};
//!
//! let id = OperationId::new("sync-photos").unwrap();
//! assert_eq!(id.as_str(), "sync-photos");
//!
//! assert!(Priority::Critical > Priority::High);
//! assert!(OperationId::new("").is_err());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid operation id: {0}")]
    InvalidOperationId(String),
}

/// A caller-assigned operation identifier.
///
/// Ids must be non-empty and free of control characters. Uniqueness is
/// enforced by the queue, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationId(String);

impl OperationId {
    /// Create a new validated operation id.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidOperationId` if the id is empty, all
    /// whitespace, or contains control characters.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(TypeError::InvalidOperationId(
                "operation id cannot be empty".into(),
            ));
        }
        if id.chars().any(|c| c.is_control()) {
            return Err(TypeError::InvalidOperationId(format!(
                "operation id cannot contain control characters: {:?}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperationId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OperationId> for String {
    fn from(id: OperationId) -> Self {
        id.0
    }
}

impl std::borrow::Borrow<str> for OperationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of work an operation performs.
///
/// Informational only: the coordinator treats every type identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Sync,
    Scrub,
    Backup,
}

impl OperationType {
    /// Lowercase name used in log messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Sync => "sync",
            OperationType::Scrub => "scrub",
            OperationType::Backup => "backup",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority.
///
/// Variants are declared lowest first so the derived `Ord` gives
/// `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All priorities, lowest first.
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// Uppercase name used in queue summaries and log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resources an operation declares it needs.
///
/// Only `memory_mb` takes part in admission control. `cpu_percent` is
/// aggregated for status reporting, `io_weight` and `can_share` are reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub memory_mb: u64,
    pub cpu_percent: f64,
    pub io_weight: u32,
    pub can_share: bool,
}

impl ResourceRequirement {
    /// Create a requirement with the default io weight and sharing flag.
    pub fn new(memory_mb: u64, cpu_percent: f64) -> Self {
        Self {
            memory_mb,
            cpu_percent,
            io_weight: 1,
            can_share: true,
        }
    }

    /// Set the io weight.
    pub fn with_io_weight(mut self, io_weight: u32) -> Self {
        self.io_weight = io_weight;
        self
    }
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self::new(0, 0.0)
    }
}

/// A UTC timestamp, serialized as RFC3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcTimestamp(chrono::DateTime<chrono::Utc>);

impl UtcTimestamp {
    /// Create a timestamp for the current moment.
    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    /// Create a timestamp from a chrono DateTime.
    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self(dt)
    }

    /// Get the underlying datetime.
    pub fn as_datetime(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }

    /// Time elapsed from `self` until `later`, or zero if `later` is earlier.
    pub fn duration_until(&self, later: &UtcTimestamp) -> Duration {
        (later.0 - self.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time elapsed since this timestamp.
    pub fn elapsed(&self) -> Duration {
        self.duration_until(&UtcTimestamp::now())
    }
}

impl std::fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
