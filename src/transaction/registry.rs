//! transaction::registry
//!
//! Registry of live transactions keyed by operation id.
//!
//! Transactions are handed out as `Arc<Mutex<Transaction>>` so a worker can
//! drive one while status queries and stall cleanup run from other threads.
//! Entries leave the registry only through `complete_transaction` or the
//! stall sweeps (`cleanup_stalled`, `cleanup_stalled_transactions`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{Transaction, DEFAULT_TIMEOUT};
use crate::core::config::TransactionConfig;
use crate::core::sink::OperationSink;
use crate::core::types::OperationId;

/// Age after which an idle entry counts as stalled, unless configured.
pub const DEFAULT_STALL_MAX_AGE: Duration = Duration::from_secs(3600);

/// Shared handle to a registered transaction.
pub type SharedTransaction = Arc<Mutex<Transaction>>;

/// Thread-safe map of active transactions.
#[derive(Debug)]
pub struct TransactionManager {
    transactions: Mutex<HashMap<OperationId, SharedTransaction>>,
    default_timeout: Duration,
    stall_max_age: Duration,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TransactionManager {
    /// Registry whose transactions default to `default_timeout`.
    ///
    /// The stall age used by `cleanup_stalled` defaults to one hour.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            transactions: Mutex::new(HashMap::new()),
            default_timeout,
            stall_max_age: DEFAULT_STALL_MAX_AGE,
        }
    }

    pub fn from_config(config: &TransactionConfig) -> Self {
        Self::new(config.timeout()).with_stall_max_age(config.stall_max_age())
    }

    pub fn with_stall_max_age(mut self, stall_max_age: Duration) -> Self {
        self.stall_max_age = stall_max_age;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn stall_max_age(&self) -> Duration {
        self.stall_max_age
    }

    /// Sweep with the configured stall age.
    pub fn cleanup_stalled(&self) -> usize {
        self.cleanup_stalled_transactions(self.stall_max_age)
    }

    /// Create and register a transaction, replacing any entry with the same id.
    pub fn create_transaction(
        &self,
        operation_id: OperationId,
        sink: Arc<dyn OperationSink>,
        timeout: Option<Duration>,
    ) -> SharedTransaction {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let transaction = Arc::new(Mutex::new(Transaction::new(
            operation_id.clone(),
            sink,
            timeout,
        )));

        let replaced = self
            .transactions
            .lock()
            .insert(operation_id.clone(), Arc::clone(&transaction));
        if replaced.is_some() {
            debug!(operation = %operation_id, "replaced registered transaction");
        }
        transaction
    }

    pub fn get_transaction(&self, operation_id: &str) -> Option<SharedTransaction> {
        self.transactions.lock().get(operation_id).cloned()
    }

    /// Retire a transaction. Returns whether it was registered.
    pub fn complete_transaction(&self, operation_id: &str) -> bool {
        self.transactions.lock().remove(operation_id).is_some()
    }

    pub fn get_active_transaction_count(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Ids of registered transactions, sorted.
    pub fn transaction_ids(&self) -> Vec<OperationId> {
        let mut ids: Vec<_> = self.transactions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop entries older than `max_age` that are not executing or rolling
    /// back. A transaction locked by another thread is treated as busy and
    /// kept. Returns how many entries were removed.
    pub fn cleanup_stalled_transactions(&self, max_age: Duration) -> usize {
        let mut transactions = self.transactions.lock();
        let before = transactions.len();

        transactions.retain(|id, transaction| {
            let Some(tx) = transaction.try_lock() else {
                return true;
            };
            let stalled = tx.elapsed() > max_age && !tx.state().is_active();
            if stalled {
                debug!(operation = %id, state = %tx.state(), "removing stalled transaction");
            }
            !stalled
        });

        before - transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sink::MemorySink;
    use crate::transaction::TransactionState;

    fn id(s: &str) -> OperationId {
        OperationId::new(s).unwrap()
    }

    fn sink(s: &str) -> Arc<dyn OperationSink> {
        Arc::new(MemorySink::new(s))
    }

    #[test]
    fn create_get_complete() {
        let manager = TransactionManager::default();
        let tx = manager.create_transaction(id("tx-1"), sink("tx-1"), None);
        assert_eq!(tx.lock().timeout(), DEFAULT_TIMEOUT);
        assert_eq!(manager.get_active_transaction_count(), 1);

        let fetched = manager.get_transaction("tx-1").unwrap();
        assert!(Arc::ptr_eq(&tx, &fetched));
        assert!(manager.get_transaction("tx-2").is_none());

        assert!(manager.complete_transaction("tx-1"));
        assert!(!manager.complete_transaction("tx-1"));
        assert_eq!(manager.get_active_transaction_count(), 0);
    }

    #[test]
    fn explicit_timeout_overrides_default() {
        let manager = TransactionManager::new(Duration::from_secs(10));
        let tx = manager.create_transaction(id("tx-1"), sink("tx-1"), Some(Duration::from_secs(2)));
        assert_eq!(tx.lock().timeout(), Duration::from_secs(2));
    }

    #[test]
    fn recreate_replaces_entry() {
        let manager = TransactionManager::default();
        let first = manager.create_transaction(id("tx-1"), sink("tx-1"), None);
        let second = manager.create_transaction(id("tx-1"), sink("tx-1"), None);

        assert_eq!(manager.get_active_transaction_count(), 1);
        let current = manager.get_transaction("tx-1").unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert!(!Arc::ptr_eq(&current, &first));
    }

    #[test]
    fn cleanup_removes_only_old_idle_entries() {
        let manager = TransactionManager::default();
        manager.create_transaction(id("done"), sink("done"), None);
        let executing = manager.create_transaction(id("busy"), sink("busy"), None);
        executing.lock().state = TransactionState::Executing;

        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(manager.cleanup_stalled_transactions(Duration::from_secs(3600)), 0);
        assert_eq!(manager.cleanup_stalled_transactions(Duration::ZERO), 1);
        assert_eq!(manager.transaction_ids(), vec![id("busy")]);
    }

    #[test]
    fn configured_stall_age_drives_cleanup() {
        let config = TransactionConfig {
            timeout_secs: 30,
            stall_max_age_secs: 0,
        };
        let manager = TransactionManager::from_config(&config);
        assert_eq!(manager.default_timeout(), Duration::from_secs(30));
        assert_eq!(manager.stall_max_age(), Duration::ZERO);

        manager.create_transaction(id("old"), sink("old"), None);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.cleanup_stalled(), 1);
        assert_eq!(manager.get_active_transaction_count(), 0);

        let patient = TransactionManager::default();
        assert_eq!(patient.stall_max_age(), DEFAULT_STALL_MAX_AGE);
        patient.create_transaction(id("young"), sink("young"), None);
        assert_eq!(patient.cleanup_stalled(), 0);
    }

    #[test]
    fn cleanup_skips_locked_entries() {
        let manager = TransactionManager::default();
        let tx = manager.create_transaction(id("held"), sink("held"), None);
        std::thread::sleep(Duration::from_millis(10));

        let guard = tx.lock();
        assert_eq!(manager.cleanup_stalled_transactions(Duration::ZERO), 0);
        drop(guard);

        assert_eq!(manager.cleanup_stalled_transactions(Duration::ZERO), 1);
    }
}
