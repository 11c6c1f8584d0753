use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::error::Error;
use crate::{Result, lock};

/// Bookkeeping for caller supplied transaction ids.
///
/// Several operations may run under the same id; registering a new one
/// marks every older instance cancelled. Cancellation is advisory: an
/// operation notices it only when it polls.
pub trait TransactionRegistry: Send + Sync {
    fn register_transaction(&self, transaction_id: &str) -> u64;

    fn cancel_transaction(&self, transaction_id: &str);

    /// Unknown or already cleared instances count as cancelled.
    fn is_transaction_cancelled(&self, transaction_id: &str, internal_id: u64) -> bool;

    fn clear_transaction(&self, transaction_id: &str, internal_id: u64);

    fn clear_all_transactions(&self);
}

#[derive(Debug)]
struct Transaction {
    cancelled: bool,
}

#[derive(Debug, Default)]
pub struct TransactionMonitor {
    next_internal_id: AtomicU64,
    transactions: Mutex<HashMap<String, BTreeMap<u64, Transaction>>>,
}

impl TransactionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_instances(&self, transaction_id: &str) -> usize {
        lock(&self.transactions)
            .get(transaction_id)
            .map_or(0, BTreeMap::len)
    }
}

impl TransactionRegistry for TransactionMonitor {
    fn register_transaction(&self, transaction_id: &str) -> u64 {
        let internal_id = self.next_internal_id.fetch_add(1, Ordering::Relaxed);
        let mut transactions = lock(&self.transactions);
        let shared = transactions.entry(transaction_id.to_string()).or_default();
        for transaction in shared.values_mut() {
            transaction.cancelled = true;
        }
        shared.insert(internal_id, Transaction { cancelled: false });
        trace!("register_transaction {} -> {}", transaction_id, internal_id);
        internal_id
    }

    fn cancel_transaction(&self, transaction_id: &str) {
        trace!("cancel_transaction {}", transaction_id);
        if let Some(shared) = lock(&self.transactions).get_mut(transaction_id) {
            for transaction in shared.values_mut() {
                transaction.cancelled = true;
            }
        }
    }

    fn is_transaction_cancelled(&self, transaction_id: &str, internal_id: u64) -> bool {
        lock(&self.transactions)
            .get(transaction_id)
            .and_then(|shared| shared.get(&internal_id))
            .is_none_or(|transaction| transaction.cancelled)
    }

    fn clear_transaction(&self, transaction_id: &str, internal_id: u64) {
        let mut transactions = lock(&self.transactions);
        if let Some(shared) = transactions.get_mut(transaction_id) {
            shared.remove(&internal_id);
            if shared.is_empty() {
                transactions.remove(transaction_id);
            }
        }
    }

    fn clear_all_transactions(&self) {
        lock(&self.transactions).clear();
    }
}

/// One registered operation. Clears itself from the registry when dropped,
/// so every exit path of an operation releases its transaction.
pub(crate) struct TransactionGuard {
    registry: Arc<dyn TransactionRegistry>,
    transaction_id: String,
    internal_id: u64,
}

impl TransactionGuard {
    pub(crate) fn register(registry: Arc<dyn TransactionRegistry>, transaction_id: &str) -> Self {
        let internal_id = registry.register_transaction(transaction_id);
        TransactionGuard {
            registry,
            transaction_id: transaction_id.to_string(),
            internal_id,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.registry
            .is_transaction_cancelled(&self.transaction_id, self.internal_id)
    }

    pub(crate) fn ensure_not_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.registry
            .clear_transaction(&self.transaction_id, self.internal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_registration_cancels_the_first() {
        let monitor = TransactionMonitor::new();
        let first = monitor.register_transaction("t");
        let second = monitor.register_transaction("t");
        assert!(monitor.is_transaction_cancelled("t", first));
        assert!(!monitor.is_transaction_cancelled("t", second));
        assert_eq!(monitor.live_instances("t"), 2);
    }

    #[test]
    fn other_ids_are_untouched() {
        let monitor = TransactionMonitor::new();
        let a = monitor.register_transaction("a");
        monitor.register_transaction("b");
        monitor.cancel_transaction("b");
        assert!(!monitor.is_transaction_cancelled("a", a));
    }

    #[test]
    fn explicit_cancel_marks_every_instance() {
        let monitor = TransactionMonitor::new();
        let first = monitor.register_transaction("t");
        let second = monitor.register_transaction("t");
        monitor.cancel_transaction("t");
        assert!(monitor.is_transaction_cancelled("t", first));
        assert!(monitor.is_transaction_cancelled("t", second));
    }

    #[test]
    fn cleared_instances_read_as_cancelled() {
        let monitor = TransactionMonitor::new();
        let first = monitor.register_transaction("t");
        let second = monitor.register_transaction("t");
        monitor.clear_transaction("t", first);
        assert_eq!(monitor.live_instances("t"), 1);
        assert!(monitor.is_transaction_cancelled("t", first));
        monitor.clear_transaction("t", second);
        assert_eq!(monitor.live_instances("t"), 0);
        assert!(monitor.is_transaction_cancelled("unknown", 42));
    }

    #[test]
    fn clear_all_drops_everything() {
        let monitor = TransactionMonitor::new();
        monitor.register_transaction("a");
        monitor.register_transaction("b");
        monitor.clear_all_transactions();
        assert_eq!(monitor.live_instances("a"), 0);
        assert_eq!(monitor.live_instances("b"), 0);
    }

    #[test]
    fn guard_clears_on_drop() {
        let monitor = Arc::new(TransactionMonitor::new());
        {
            let guard = TransactionGuard::register(monitor.clone(), "t");
            assert!(!guard.is_cancelled());
            assert_eq!(monitor.live_instances("t"), 1);
            monitor.register_transaction("t");
            assert!(guard.ensure_not_cancelled().unwrap_err().is_cancellation());
        }
        assert_eq!(monitor.live_instances("t"), 1);
    }
}
