//! core::memory
//!
//! Available-memory monitoring and pressure classification.
//!
//! # Architecture
//!
//! [`MemoryMonitor`] reads a single "available memory" counter through a
//! [`MemorySource`]. On Linux the counter is `MemAvailable` from
//! `/proc/meminfo`. A source that cannot be read reports zero, which
//! classifies as critical pressure: the monitor errs towards throttling.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use opcoord::core::memory::{FixedMemory, MemoryMonitor, PressureLevel};
//!
//! let source = Arc::new(FixedMemory::from_mb(400));
//! let monitor = MemoryMonitor::with_source(512, 256, source.clone());
//! assert_eq!(monitor.get_memory_pressure_level(), PressureLevel::Warning);
//!
//! source.set_mb(2000);
//! assert_eq!(monitor.get_memory_pressure_level(), PressureLevel::Normal);
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Bytes per megabyte.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Bytes per kilobyte.
pub const BYTES_PER_KB: u64 = 1024;

/// Coarse classification of available memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A reader of the system's available-memory counter.
pub trait MemorySource: Send + Sync {
    /// Available memory in bytes, or zero if it cannot be determined.
    fn available_bytes(&self) -> u64;
}

/// Reads `MemAvailable` from a meminfo-format file.
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl ProcMeminfo {
    /// Source backed by `/proc/meminfo`.
    pub fn new() -> Self {
        Self::at("/proc/meminfo")
    }

    /// Source backed by an arbitrary meminfo-format file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse the `MemAvailable:` line (value in kB) into bytes.
    pub fn parse(contents: &str) -> Option<u64> {
        contents
            .lines()
            .find(|line| line.starts_with("MemAvailable:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb.saturating_mul(BYTES_PER_KB))
    }
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for ProcMeminfo {
    fn available_bytes(&self) -> u64 {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|| {
                tracing::debug!(path = %self.path.display(), "MemAvailable not found, assuming 0");
                0
            }),
            Err(e) => {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %e,
                    "meminfo unreadable, assuming 0"
                );
                0
            }
        }
    }
}

/// A settable memory reading, for simulation and tests.
#[derive(Debug, Default)]
pub struct FixedMemory {
    bytes: AtomicU64,
}

impl FixedMemory {
    pub fn from_bytes(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn from_mb(mb: u64) -> Self {
        Self::from_bytes(mb.saturating_mul(BYTES_PER_MB))
    }

    pub fn set_bytes(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn set_mb(&self, mb: u64) {
        self.set_bytes(mb.saturating_mul(BYTES_PER_MB));
    }
}

impl MemorySource for FixedMemory {
    fn available_bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Classifies memory pressure against warning and critical thresholds.
#[derive(Clone)]
pub struct MemoryMonitor {
    warning_threshold: u64,
    critical_threshold: u64,
    source: Arc<dyn MemorySource>,
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("warning_threshold", &self.warning_threshold)
            .field("critical_threshold", &self.critical_threshold)
            .finish_non_exhaustive()
    }
}

impl MemoryMonitor {
    /// Monitor reading `/proc/meminfo`, thresholds in MB.
    pub fn new(warning_threshold_mb: u64, critical_threshold_mb: u64) -> Self {
        Self::with_source(
            warning_threshold_mb,
            critical_threshold_mb,
            Arc::new(ProcMeminfo::new()),
        )
    }

    /// Monitor reading from `source`, thresholds in MB.
    pub fn with_source(
        warning_threshold_mb: u64,
        critical_threshold_mb: u64,
        source: Arc<dyn MemorySource>,
    ) -> Self {
        Self {
            warning_threshold: warning_threshold_mb.saturating_mul(BYTES_PER_MB),
            critical_threshold: critical_threshold_mb.saturating_mul(BYTES_PER_MB),
            source,
        }
    }

    /// Warning threshold in bytes.
    pub fn warning_threshold(&self) -> u64 {
        self.warning_threshold
    }

    /// Critical threshold in bytes.
    pub fn critical_threshold(&self) -> u64 {
        self.critical_threshold
    }

    /// Available memory in bytes.
    pub fn get_available_memory(&self) -> u64 {
        self.source.available_bytes()
    }

    /// Available memory in whole megabytes.
    pub fn get_available_memory_mb(&self) -> u64 {
        self.get_available_memory() / BYTES_PER_MB
    }

    pub fn get_memory_pressure_level(&self) -> PressureLevel {
        self.classify(self.get_available_memory())
    }

    /// Whether `required_mb` can be taken while staying strictly above the
    /// critical threshold.
    pub fn can_allocate_memory(&self, required_mb: u64) -> bool {
        let required = required_mb.saturating_mul(BYTES_PER_MB);
        match self.get_available_memory().checked_sub(required) {
            Some(remaining) => remaining > self.critical_threshold,
            None => false,
        }
    }

    fn classify(&self, available: u64) -> PressureLevel {
        if available < self.critical_threshold {
            PressureLevel::Critical
        } else if available < self.warning_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}
