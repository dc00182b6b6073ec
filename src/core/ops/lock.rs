//! core::ops::lock
//!
//! Path-keyed advisory locks shared across processes.
//!
//! # Architecture
//!
//! Each resource string (typically a filesystem path) maps to one lock file
//! under the manager's lock directory. The file name is the first 16 hex
//! characters of the SHA-256 digest of the resource, so arbitrarily long or
//! nested paths map to flat, fixed-length names.
//!
//! Locks are OS-level (`flock` on Unix via `fs2`), so they exclude other
//! processes as well as other `LockManager` instances in this process.
//!
//! # Storage
//!
//! - `<lock_dir>/<hash16>.lock` - Created on acquire, removed on release
//!
//! # Invariants
//!
//! - Acquisition is non-blocking (fails fast if locked)
//! - Acquiring a resource this manager already holds succeeds immediately
//! - Release never fails; errors are logged and swallowed
//! - All held locks are released on drop
//!
//! # Example
//!
//! ```
//! use opcoord::core::ops::lock::{LockManager, LockMode};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let locks = LockManager::new(dir.path()).unwrap();
//!
//! assert!(locks.acquire_lock("/srv/photos", LockMode::Exclusive));
//! assert!(locks.check_locked("/srv/photos"));
//!
//! locks.release_lock("/srv/photos");
//! assert!(!locks.check_locked("/srv/photos"));
//! ```

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from lock manager construction.
#[derive(Debug, Error)]
pub enum LockError {
    /// Failed to create the lock directory.
    #[error("failed to create lock directory: {0}")]
    CreateFailed(String),

    /// I/O error during lock operations.
    #[error("lock i/o error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Kind of OS lock to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Number of hex characters of the resource digest used for file names.
const LOCK_NAME_LEN: usize = 16;

/// Manager for path-keyed, non-blocking, cross-process locks.
///
/// The lock table is internally synchronized: one manager is shared by
/// every worker in a coordinator.
#[derive(Debug)]
pub struct LockManager {
    lock_dir: PathBuf,
    /// Open handles for locks held by this instance.
    /// Holding the handle is what keeps the OS lock.
    held: Mutex<HashMap<String, File>>,
}

impl LockManager {
    /// Create a manager rooted at `lock_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::CreateFailed`] if the directory cannot be created.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let lock_dir = lock_dir.into();
        fs::create_dir_all(&lock_dir).map_err(|e| {
            LockError::CreateFailed(format!("cannot create {}: {}", lock_dir.display(), e))
        })?;

        Ok(Self {
            lock_dir,
            held: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the lock files.
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Lock file path for a resource.
    pub fn lock_path(&self, resource: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(resource.as_bytes()));
        self.lock_dir
            .join(format!("{}.lock", &digest[..LOCK_NAME_LEN]))
    }

    /// Try to lock `resource` without blocking.
    ///
    /// Returns `true` if the lock is now held by this manager (including when
    /// it already was), `false` if another holder has it or the lock file
    /// could not be opened.
    pub fn acquire_lock(&self, resource: &str, mode: LockMode) -> bool {
        self.acquire(resource, mode, true)
    }

    /// Like [`acquire_lock`](Self::acquire_lock), but fails if this manager
    /// already holds `resource`.
    ///
    /// Callers that share one manager between threads use this to exclude
    /// each other as well as other processes.
    pub fn acquire_unheld(&self, resource: &str, mode: LockMode) -> bool {
        self.acquire(resource, mode, false)
    }

    fn acquire(&self, resource: &str, mode: LockMode, reentrant: bool) -> bool {
        let mut held = self.held.lock();
        if held.contains_key(resource) {
            return reentrant;
        }

        let path = self.lock_path(resource);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(
                    resource,
                    path = %path.display(),
                    error = %e,
                    "cannot open lock file"
                );
                return false;
            }
        };

        let attempt = match mode {
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            LockMode::Shared => FileExt::try_lock_shared(&file),
        };

        match attempt {
            Ok(()) => {
                held.insert(resource.to_string(), file);
                true
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    tracing::debug!(resource, error = %e, "lock attempt failed");
                }
                // Dropping `file` closes the handle.
                false
            }
        }
    }

    /// Release `resource` if held by this manager, and remove its lock file.
    ///
    /// Never fails. Unknown resources are ignored.
    pub fn release_lock(&self, resource: &str) {
        let Some(file) = self.held.lock().remove(resource) else {
            return;
        };
        self.release_handle(resource, file);
    }

    /// Release every lock held by this manager.
    pub fn release_all(&self) {
        let drained: Vec<(String, File)> = self.held.lock().drain().collect();
        for (resource, file) in drained {
            self.release_handle(&resource, file);
        }
    }

    /// Whether `resource` is locked by anyone.
    ///
    /// Locks held by this manager count as locked. Otherwise a non-blocking
    /// exclusive probe is taken and immediately dropped: if the probe
    /// succeeds the resource is free.
    pub fn check_locked(&self, resource: &str) -> bool {
        if self.is_held(resource) {
            return true;
        }

        let path = self.lock_path(resource);
        let probe = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
            Err(e) => {
                tracing::debug!(resource, error = %e, "cannot open lock file for probe");
                return true;
            }
        };

        match FileExt::try_lock_exclusive(&probe) {
            Ok(()) => {
                let _ = FileExt::unlock(&probe);
                false
            }
            Err(_) => true,
        }
    }

    /// Whether this manager holds `resource`.
    pub fn is_held(&self, resource: &str) -> bool {
        self.held.lock().contains_key(resource)
    }

    /// Resources held by this manager, sorted.
    pub fn held_locks(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.held.lock().keys().cloned().collect();
        resources.sort();
        resources
    }

    /// Unlock, close, and remove the lock file. Each step logs and continues.
    fn release_handle(&self, resource: &str, file: File) {
        if let Err(e) = FileExt::unlock(&file) {
            tracing::debug!(resource, error = %e, "unlock failed during release");
        }
        drop(file);

        let path = self.lock_path(resource);
        if let Err(e) = fs::remove_file(&path) {
            tracing::debug!(
                resource,
                path = %path.display(),
                error = %e,
                "lock file removal failed"
            );
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
