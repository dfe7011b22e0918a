use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use log::{debug, warn};

use crate::{
    error::{ErrorKind, SmallError},
    types::{StorageResult, TransactionID},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct TableLock {
    shared_holders: HashSet<TransactionID>,
    exclusive_holder: Option<TransactionID>,
}

impl TableLock {
    fn new() -> Self {
        Self {
            shared_holders: HashSet::new(),
            exclusive_holder: None,
        }
    }

    fn is_free(&self) -> bool {
        self.shared_holders.is_empty() && self.exclusive_holder.is_none()
    }
}

/// Table-granularity two-phase lock manager with a non-blocking,
/// no-wait conflict policy: a request that cannot be granted
/// immediately fails with `LockConflict` rather than blocking the
/// caller or being queued. There is no wait-for graph and no deadlock
/// detection -- the absence of blocking makes deadlock impossible by
/// construction.
pub struct LockManager {
    inner: Mutex<Inner>,
}

struct Inner {
    tables: HashMap<String, TableLock>,
    held_by_tx: HashMap<TransactionID, HashSet<String>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tables: HashMap::new(),
                held_by_tx: HashMap::new(),
            }),
        }
    }

    /// Attempt to acquire `mode` on `table` for `tx`. Upgrading an
    /// already-held shared lock to exclusive is allowed when `tx` is
    /// the table's only shared holder; otherwise this call either
    /// succeeds immediately or fails with `LockConflict`.
    pub fn acquire(&self, tx: TransactionID, table: &str, mode: LockMode) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let lock = inner
            .tables
            .entry(table.to_string())
            .or_insert_with(TableLock::new);

        match mode {
            LockMode::Shared => {
                if let Some(holder) = lock.exclusive_holder {
                    if holder != tx {
                        warn!("tx {} denied S-lock on '{}': held X by tx {}", tx, table, holder);
                        return Err(SmallError::with_kind(
                            ErrorKind::LockConflict,
                            &format!("table '{}' is exclusively locked by another transaction", table),
                        ));
                    }
                } else {
                    lock.shared_holders.insert(tx);
                }
            }
            LockMode::Exclusive => {
                let holds_exclusive_already = lock.exclusive_holder == Some(tx);
                let only_shared_holder = lock.shared_holders.len() <= 1
                    && lock.shared_holders.iter().all(|h| *h == tx);

                if !holds_exclusive_already {
                    if lock.exclusive_holder.is_some() {
                        warn!("tx {} denied X-lock on '{}': held by another X-holder", tx, table);
                        return Err(SmallError::with_kind(
                            ErrorKind::LockConflict,
                            &format!("table '{}' is already exclusively locked", table),
                        ));
                    }
                    if !only_shared_holder {
                        warn!("tx {} denied X-lock on '{}': other shared holders present", tx, table);
                        return Err(SmallError::with_kind(
                            ErrorKind::LockConflict,
                            &format!("table '{}' is shared-locked by another transaction", table),
                        ));
                    }
                    lock.shared_holders.remove(&tx);
                    lock.exclusive_holder = Some(tx);
                }
            }
        }

        inner
            .held_by_tx
            .entry(tx)
            .or_insert_with(HashSet::new)
            .insert(table.to_string());

        debug!("tx {} granted {:?} lock on '{}'", tx, mode, table);
        Ok(())
    }

    /// Release every lock `tx` holds. Called once at commit/abort --
    /// this engine follows strict two-phase locking, so locks are
    /// never released mid-transaction.
    pub fn release_all(&self, tx: TransactionID) {
        let mut inner = self.inner.lock().unwrap();
        let tables = match inner.held_by_tx.remove(&tx) {
            Some(tables) => tables,
            None => return,
        };

        for table in tables {
            if let Some(lock) = inner.tables.get_mut(&table) {
                lock.shared_holders.remove(&tx);
                if lock.exclusive_holder == Some(tx) {
                    lock.exclusive_holder = None;
                }
                if lock.is_free() {
                    inner.tables.remove(&table);
                }
            }
        }

        debug!("released all locks for tx {}", tx);
    }

    pub fn holds_lock(&self, tx: TransactionID, table: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .held_by_tx
            .get(&tx)
            .map(|tables| tables.contains(table))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::init_log;

    #[test]
    fn test_two_transactions_share_a_read_lock() {
        init_log();
        let lm = LockManager::new();

        lm.acquire(1, "t", LockMode::Shared).unwrap();
        lm.acquire(2, "t", LockMode::Shared).unwrap();
    }

    #[test]
    fn test_exclusive_excludes_other_shared() {
        init_log();
        let lm = LockManager::new();

        lm.acquire(1, "t", LockMode::Exclusive).unwrap();
        let err = lm.acquire(2, "t", LockMode::Shared).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
    }

    #[test]
    fn test_conflicting_exclusive_request_fails_immediately_no_wait() {
        init_log();
        let lm = LockManager::new();

        lm.acquire(1, "t", LockMode::Shared).unwrap();
        lm.acquire(2, "t", LockMode::Shared).unwrap();

        // tx 1 cannot upgrade: tx 2 is also a shared holder.
        let err = lm.acquire(1, "t", LockMode::Exclusive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
    }

    #[test]
    fn test_sole_shared_holder_can_upgrade_to_exclusive() {
        init_log();
        let lm = LockManager::new();

        lm.acquire(1, "t", LockMode::Shared).unwrap();
        lm.acquire(1, "t", LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_release_all_frees_table_for_others() {
        init_log();
        let lm = LockManager::new();

        lm.acquire(1, "t", LockMode::Exclusive).unwrap();
        lm.release_all(1);

        lm.acquire(2, "t", LockMode::Exclusive).unwrap();
        assert!(lm.holds_lock(2, "t"));
        assert!(!lm.holds_lock(1, "t"));
    }
}
