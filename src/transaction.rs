use core::fmt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use crate::{types::TransactionID, wal::WalRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

/// A lightweight handle to a running transaction. All real state lives
/// in [`TransactionManager`]; this is just the id callers pass back
/// into [`crate::storage_engine::StorageEngine`] methods.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transaction {
    id: TransactionID,
}

impl Transaction {
    pub fn id(&self) -> TransactionID {
        self.id
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

struct TxState {
    status: TransactionStatus,
    /// The WAL records this transaction has appended so far, kept in
    /// memory in append order so `abort` can walk them in reverse and
    /// apply the logical inverse of each, without re-reading the log
    /// file.
    writes: Vec<WalRecord>,
}

/// Tracks every transaction's status and its write-set, the in-memory
/// analogue of PostgreSQL's transaction status structure: given an id,
/// it answers whether that transaction is running, committed, or
/// aborted.
pub struct TransactionManager {
    next_id: AtomicU64,
    states: Mutex<HashMap<TransactionID, TxState>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.states.lock().unwrap().insert(
            id,
            TxState {
                status: TransactionStatus::Active,
                writes: Vec::new(),
            },
        );
        Transaction { id }
    }

    pub fn record_write(&self, tx: Transaction, record: WalRecord) {
        if let Some(state) = self.states.lock().unwrap().get_mut(&tx.id) {
            state.writes.push(record);
        }
    }

    pub fn writes_of(&self, tx: Transaction) -> Vec<WalRecord> {
        self.states
            .lock()
            .unwrap()
            .get(&tx.id)
            .map(|s| s.writes.clone())
            .unwrap_or_default()
    }

    pub fn status(&self, id: TransactionID) -> Option<TransactionStatus> {
        self.states.lock().unwrap().get(&id).map(|s| s.status)
    }

    pub fn mark_committed(&self, tx: Transaction) {
        if let Some(state) = self.states.lock().unwrap().get_mut(&tx.id) {
            state.status = TransactionStatus::Committed;
        }
    }

    pub fn mark_aborted(&self, tx: Transaction) {
        if let Some(state) = self.states.lock().unwrap().get_mut(&tx.id) {
            state.status = TransactionStatus::Aborted;
        }
    }

    /// Register a transaction id observed in the WAL during recovery so
    /// `status` can distinguish "never seen" from "active but no
    /// longer reachable through begin()". Recovery calls this before
    /// deciding which ids are winners (committed) and which are losers
    /// (still active at crash time, to be undone).
    pub fn note_recovered(&self, id: TransactionID, status: TransactionStatus) {
        self.states.lock().unwrap().insert(
            id,
            TxState {
                status,
                writes: Vec::new(),
            },
        );
    }

    pub fn clear(&self) {
        self.states.lock().unwrap().clear();
    }

    /// Advance the id counter so the next `begin()` never reuses an id
    /// already present in a recovered log -- called once after recovery
    /// with one past the highest transaction id the log mentioned.
    pub fn advance_next_id(&self, min_next: TransactionID) {
        self.next_id.fetch_max(min_next, Ordering::Relaxed);
    }
}
