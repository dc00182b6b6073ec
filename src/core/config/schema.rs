//! core::config::schema
//!
//! Configuration schema types.
//!
//! # Example
//!
//! ```toml
//! [coordinator]
//! max_concurrent = 4
//! queue_capacity = 100
//! memory_warning_mb = 1024
//! memory_critical_mb = 512
//! lock_dir = "/run/opcoord/locks"
//!
//! [transactions]
//! timeout_secs = 1800
//! stall_max_age_secs = 7200
//! ```
//!
//! # Validation
//!
//! Values are validated after parsing: pools and queues must be non-empty,
//! the critical memory threshold must sit below the warning threshold, and
//! no interval may exceed [`MAX_INTERVAL_MS`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Upper bound for every `*_ms` interval: one day.
pub const MAX_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoordConfig {
    pub coordinator: CoordinatorConfig,
    pub transactions: TransactionConfig,
}

impl CoordConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;
        self.transactions.validate()
    }
}

/// Worker pool, queue, memory, and lock settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Number of worker threads.
    pub max_concurrent: usize,

    /// Maximum number of queued operations.
    pub queue_capacity: usize,

    /// Below this much available memory only High/Critical work is admitted.
    pub memory_warning_mb: u64,

    /// Below this much available memory nothing is admitted.
    pub memory_critical_mb: u64,

    /// Directory for lock files.
    pub lock_dir: PathBuf,

    /// Upper bound on a single blocking dequeue.
    pub dequeue_wait_ms: u64,

    /// Worker sleep after an empty dequeue.
    pub idle_sleep_ms: u64,

    /// Worker back-off after an admission rejection.
    pub admission_backoff_ms: u64,

    /// Worker back-off after failing to take an operation's locks.
    pub lock_backoff_ms: u64,

    /// Poll interval of `wait_until_idle`.
    pub idle_poll_ms: u64,

    /// Per-worker bound when joining on shutdown.
    pub shutdown_join_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            queue_capacity: 50,
            memory_warning_mb: 512,
            memory_critical_mb: 256,
            lock_dir: std::env::temp_dir().join("operation_locks"),
            dequeue_wait_ms: 1000,
            idle_sleep_ms: 1000,
            admission_backoff_ms: 1000,
            lock_backoff_ms: 2000,
            idle_poll_ms: 500,
            shutdown_join_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.memory_critical_mb >= self.memory_warning_mb {
            return Err(ConfigError::InvalidValue(format!(
                "memory_critical_mb ({}) must be below memory_warning_mb ({})",
                self.memory_critical_mb, self.memory_warning_mb
            )));
        }
        if self.lock_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue(
                "lock_dir cannot be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("dequeue_wait_ms", self.dequeue_wait_ms),
            ("idle_sleep_ms", self.idle_sleep_ms),
            ("admission_backoff_ms", self.admission_backoff_ms),
            ("lock_backoff_ms", self.lock_backoff_ms),
            ("idle_poll_ms", self.idle_poll_ms),
            ("shutdown_join_ms", self.shutdown_join_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(ConfigError::InvalidValue(format!(
                    "{} ({}) exceeds the maximum of {}",
                    name, value, MAX_INTERVAL_MS
                )));
            }
        }
        Ok(())
    }

    /// Same settings with every interval shortened to `interval`.
    ///
    /// Handy for embedding in tests and short-lived tools.
    pub fn with_intervals(mut self, interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        self.dequeue_wait_ms = ms;
        self.idle_sleep_ms = ms;
        self.admission_backoff_ms = ms;
        self.lock_backoff_ms = ms;
        self.idle_poll_ms = ms;
        self
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_millis(self.dequeue_wait_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn admission_backoff(&self) -> Duration {
        Duration::from_millis(self.admission_backoff_ms)
    }

    pub fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn shutdown_join(&self) -> Duration {
        Duration::from_millis(self.shutdown_join_ms)
    }
}

/// Transaction defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionConfig {
    /// Wall-clock budget for a transaction's step sequence.
    pub timeout_secs: u64,

    /// Age after which idle registry entries are considered stalled.
    pub stall_max_age_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            stall_max_age_secs: 3600,
        }
    }
}

impl TransactionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "transaction timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stall_max_age(&self) -> Duration {
        Duration::from_secs(self.stall_max_age_secs)
    }
}
