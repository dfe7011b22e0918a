use std::sync::{Arc, RwLock};

use crate::error::SmallError;

/// Type alias, not a new type, cannot define methods on it.
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, SmallError>;
pub type SmallResult = Result<(), SmallError>;
pub type StorageResult<T> = Result<T, SmallError>;

pub type TransactionID = u64;

/// A stable handle to one record inside a table heap: the page it lives
/// on and its slot within that page's slotted layout. Stable across
/// compaction because deletes leave a tombstone rather than shifting
/// slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordID {
    pub page_no: u32,
    pub slot_no: u32,
}

impl RecordID {
    pub fn new(page_no: u32, slot_no: u32) -> Self {
        Self { page_no, slot_no }
    }
}
