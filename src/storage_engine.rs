use std::{collections::HashMap, sync::Arc, sync::RwLock};

use log::{debug, info, warn};

use crate::{
    btree::BPlusTree,
    buffer_pool::BufferManager,
    config::StorageConfig,
    error::{ErrorKind, SmallError},
    file_manager::FileManager,
    heap::TableHeap,
    lock_manager::{LockManager, LockMode},
    record::Record,
    schema::{Schema, Value},
    transaction::{Transaction, TransactionManager, TransactionStatus},
    types::{RecordID, StorageResult},
    wal::{WalManager, WalRecord},
};

struct Table {
    heap: TableHeap,
    index: BPlusTree,
}

/// The façade every caller above the storage core talks to. Owns every
/// other component and is responsible for the order they are built in:
/// file manager, then buffer pool, then the (initially empty) table
/// registry, then the lock manager, then the WAL, then the transaction
/// manager. There is no process-wide singleton anywhere in this chain --
/// every `StorageEngine` is an independent, fully isolated instance
/// constructed from a [`StorageConfig`].
pub struct StorageEngine {
    config: StorageConfig,
    buffer_pool: Arc<BufferManager>,
    tables: RwLock<HashMap<String, Table>>,
    lock_manager: LockManager,
    wal: WalManager,
    tx_manager: TransactionManager,
}

impl StorageEngine {
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let file_manager = FileManager::new();
        let buffer_pool = BufferManager::new(file_manager, config.buffer_pool_capacity);
        let wal = WalManager::new(config.wal_path())?;

        info!("storage engine opened at {:?}", config.data_dir);

        Ok(Self {
            config,
            buffer_pool,
            tables: RwLock::new(HashMap::new()),
            lock_manager: LockManager::new(),
            wal,
            tx_manager: TransactionManager::new(),
        })
    }

    /// Register a table under `name` with the given `schema`, opening
    /// (or creating) its heap and index files. Tables must be
    /// registered before [`Self::recover`] is called -- recovery only
    /// ever touches tables the caller has already told this engine
    /// about, it does not discover tables from the WAL or from a
    /// catalog file.
    pub fn register_table(&self, name: &str, schema: Schema) -> StorageResult<()> {
        let heap_file_id = self.buffer_pool.open_file(self.config.heap_path(name))?;
        let index_file_id = self.buffer_pool.open_file(self.config.index_path(name))?;

        let heap = TableHeap::new(heap_file_id, schema, self.buffer_pool.clone());
        let index = BPlusTree::new(self.buffer_pool.clone(), index_file_id, self.config.btree_max_keys)?;

        self.tables
            .write()
            .unwrap()
            .insert(name.to_string(), Table { heap, index });

        debug!("registered table '{}'", name);
        Ok(())
    }

    fn with_table<R>(&self, name: &str, f: impl FnOnce(&Table) -> StorageResult<R>) -> StorageResult<R> {
        let tables = self.tables.read().unwrap();
        let table = tables.get(name).ok_or_else(|| {
            SmallError::with_kind(ErrorKind::NotFound, &format!("no such table '{}'", name))
        })?;
        f(table)
    }

    pub fn begin(&self) -> Transaction {
        self.tx_manager.begin()
    }

    /// Commit `tx`: force its dirty pages to disk, durably record the
    /// commit in the WAL, then release its locks. Pages are flushed
    /// before the COMMIT record is written so that, under the `force`
    /// policy, a crash can never observe a COMMIT record for data that
    /// didn't make it to disk.
    pub fn commit(&self, tx: Transaction) -> StorageResult<()> {
        if self.tx_manager.status(tx.id()) != Some(TransactionStatus::Active) {
            return Err(SmallError::with_kind(
                ErrorKind::InvalidState,
                &format!("{} is not active", tx),
            ));
        }

        self.buffer_pool.flush_all()?;
        self.wal.log_commit(tx.id())?;
        self.tx_manager.mark_committed(tx);
        self.lock_manager.release_all(tx.id());

        debug!("committed {}", tx);
        Ok(())
    }

    /// Abort `tx`: walk its write-set in reverse and apply the logical
    /// inverse of each record directly to the heap and index, then log
    /// the abort and release locks.
    pub fn abort(&self, tx: Transaction) -> StorageResult<()> {
        if self.tx_manager.status(tx.id()) != Some(TransactionStatus::Active) {
            return Err(SmallError::with_kind(
                ErrorKind::InvalidState,
                &format!("{} is not active", tx),
            ));
        }

        for record in self.tx_manager.writes_of(tx).into_iter().rev() {
            self.undo_record(&record)?;
        }

        self.wal.log_abort(tx.id())?;
        self.tx_manager.mark_aborted(tx);
        self.lock_manager.release_all(tx.id());

        debug!("aborted {}", tx);
        Ok(())
    }

    pub fn insert(&self, tx: Transaction, table: &str, record: Record) -> StorageResult<RecordID> {
        self.lock_manager.acquire(tx.id(), table, LockMode::Exclusive)?;
        let key = record.key()?;

        let rid = self.with_table(table, |t| {
            if t.index.search(key)?.is_some() {
                return Err(SmallError::with_kind(
                    ErrorKind::InvalidState,
                    &format!("duplicate primary key {} in table '{}'", key, table),
                ));
            }
            let rid = t.heap.insert(&record)?;
            t.index.insert(key, rid)?;
            Ok(rid)
        })?;

        self.wal
            .log_insert(tx.id(), table, rid.page_no, rid.slot_no, &record.values)?;
        self.tx_manager.record_write(
            tx,
            WalRecord::Insert {
                tx: tx.id(),
                table: table.to_string(),
                page_no: rid.page_no,
                slot_no: rid.slot_no,
                values: record.values,
            },
        );

        Ok(rid)
    }

    pub fn get(&self, tx: Transaction, table: &str, key: i32) -> StorageResult<Option<Record>> {
        self.lock_manager.acquire(tx.id(), table, LockMode::Shared)?;

        self.with_table(table, |t| match t.index.search(key)? {
            Some(rid) => Ok(Some(t.heap.get(rid)?)),
            None => Ok(None),
        })
    }

    pub fn update(&self, tx: Transaction, table: &str, key: i32, new_record: Record) -> StorageResult<()> {
        self.lock_manager.acquire(tx.id(), table, LockMode::Exclusive)?;

        let (rid, old_record) = self.with_table(table, |t| {
            let rid = t.index.search(key)?.ok_or_else(|| {
                SmallError::with_kind(ErrorKind::NotFound, &format!("no row with key {}", key))
            })?;
            let old = t.heap.get(rid)?;
            t.heap.update(rid, &new_record)?;
            Ok((rid, old))
        })?;

        self.wal.log_update(
            tx.id(),
            table,
            rid.page_no,
            rid.slot_no,
            &old_record.values,
            &new_record.values,
        )?;
        self.tx_manager.record_write(
            tx,
            WalRecord::Update {
                tx: tx.id(),
                table: table.to_string(),
                page_no: rid.page_no,
                slot_no: rid.slot_no,
                old_values: old_record.values,
                new_values: new_record.values,
            },
        );

        Ok(())
    }

    pub fn delete(&self, tx: Transaction, table: &str, key: i32) -> StorageResult<()> {
        self.lock_manager.acquire(tx.id(), table, LockMode::Exclusive)?;

        let (rid, old_record) = self.with_table(table, |t| {
            let rid = t.index.search(key)?.ok_or_else(|| {
                SmallError::with_kind(ErrorKind::NotFound, &format!("no row with key {}", key))
            })?;
            let old = t.heap.get(rid)?;
            t.heap.delete(rid)?;
            t.index.delete(key)?;
            Ok((rid, old))
        })?;

        self.wal
            .log_delete(tx.id(), table, rid.page_no, rid.slot_no, &old_record.values)?;
        self.tx_manager.record_write(
            tx,
            WalRecord::Delete {
                tx: tx.id(),
                table: table.to_string(),
                page_no: rid.page_no,
                slot_no: rid.slot_no,
                values: old_record.values,
            },
        );

        Ok(())
    }

    /// Return every live record's [`RecordID`] in `table`, in page/slot
    /// order. The external scan primitive named alongside
    /// `redo_insert`/`redo_delete`/`redo_update`: callers that need the
    /// actual row fetch it afterwards through [`Self::get`] or
    /// [`TableHeap::get`].
    pub fn scan_table(&self, tx: Transaction, table: &str) -> StorageResult<Vec<RecordID>> {
        self.lock_manager.acquire(tx.id(), table, LockMode::Shared)?;
        self.with_table(table, |t| Ok(t.heap.scan()?.into_iter().map(|(rid, _)| rid).collect()))
    }

    /// Physically place `values` at the exact `rid`, bypassing the
    /// normal first-fit insert path, and restore its index entry. Used
    /// by recovery's redo pass, and exposed directly so callers
    /// replaying a log of their own (e.g. replication) can reuse the
    /// same primitive.
    pub fn redo_insert(&self, table: &str, rid: RecordID, values: &[Value]) -> StorageResult<()> {
        self.place_at(table, rid, values)
    }

    /// Physically tombstone the record at `rid` and remove its index
    /// entry. Idempotent: deleting an already-tombstoned slot, or a key
    /// already absent from the index, is not an error.
    pub fn redo_delete(&self, table: &str, rid: RecordID, values: &[Value]) -> StorageResult<()> {
        self.remove_at(table, rid, values)
    }

    /// Physically overwrite the record at `rid` with `new_values`. The
    /// primary key is assumed unchanged by an update, so the index entry
    /// is left alone.
    pub fn redo_update(&self, table: &str, rid: RecordID, new_values: &[Value]) -> StorageResult<()> {
        self.with_table(table, |t| {
            t.heap.put_at(rid, &Record::new(new_values.to_vec()))
        })
    }

    fn place_at(&self, table: &str, rid: RecordID, values: &[Value]) -> StorageResult<()> {
        self.with_table(table, |t| {
            let key = values[0].as_int()?;
            t.heap.put_at(rid, &Record::new(values.to_vec()))?;
            t.index.insert(key, rid)?;
            Ok(())
        })
    }

    fn remove_at(&self, table: &str, rid: RecordID, values: &[Value]) -> StorageResult<()> {
        self.with_table(table, |t| {
            let key = values[0].as_int()?;
            match t.heap.delete(rid) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            match t.index.delete(key) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            Ok(())
        })
    }

    /// Replay the WAL: winners (transactions with a COMMIT record) are
    /// redone forward, losers (active at crash, with neither COMMIT nor
    /// ABORT) are undone in reverse. Both passes place data at the exact
    /// [`RecordID`] the log recorded, bypassing the normal insert path,
    /// matching this WAL's physical addressing even though its record
    /// content is logical. A table referenced by the log that was never
    /// registered is skipped with a warning rather than failing recovery
    /// outright. Once both passes are applied the log is truncated and
    /// the transaction id counter is advanced past every id recovery
    /// saw, so a freshly begun transaction can never collide with one
    /// whose COMMIT/ABORT record the (now-truncated) log used to hold.
    pub fn recover(&self) -> StorageResult<()> {
        let records = self.wal.read_all()?;

        let mut committed = std::collections::HashSet::new();
        let mut finished = std::collections::HashSet::new();
        let mut max_tx: crate::types::TransactionID = 0;
        for record in &records {
            max_tx = max_tx.max(record_tx(record));
            match record {
                WalRecord::Commit { tx } => {
                    committed.insert(*tx);
                    finished.insert(*tx);
                }
                WalRecord::Abort { tx } => {
                    finished.insert(*tx);
                }
                _ => {}
            }
        }

        for record in &records {
            let tx = record_tx(record);
            self.tx_manager.note_recovered(
                tx,
                if committed.contains(&tx) {
                    TransactionStatus::Committed
                } else {
                    TransactionStatus::Aborted
                },
            );
        }

        for record in &records {
            let tx = record_tx(record);
            if committed.contains(&tx) {
                if let Err(e) = self.redo_record(record) {
                    warn!("skipping redo of {:?}: {}", record, e);
                }
            }
        }

        for record in records.iter().rev() {
            let tx = record_tx(record);
            if !committed.contains(&tx) {
                if let Err(e) = self.undo_record(record) {
                    warn!("skipping undo of {:?}: {}", record, e);
                }
            }
        }

        self.buffer_pool.flush_all()?;

        if !records.is_empty() {
            self.wal.reset()?;
            self.tx_manager.advance_next_id(max_tx + 1);
        }

        info!(
            "recovery complete: {} committed tx redone, {} loser tx undone, log truncated",
            committed.len(),
            finished.len() - committed.len().min(finished.len())
        );
        Ok(())
    }

    fn redo_record(&self, record: &WalRecord) -> StorageResult<()> {
        match record {
            WalRecord::Insert { table, page_no, slot_no, values, .. } => {
                self.redo_insert(table, RecordID::new(*page_no, *slot_no), values)
            }
            WalRecord::Update { table, page_no, slot_no, new_values, .. } => {
                self.redo_update(table, RecordID::new(*page_no, *slot_no), new_values)
            }
            WalRecord::Delete { table, page_no, slot_no, values, .. } => {
                self.redo_delete(table, RecordID::new(*page_no, *slot_no), values)
            }
            WalRecord::Commit { .. } | WalRecord::Abort { .. } => Ok(()),
        }
    }

    fn undo_record(&self, record: &WalRecord) -> StorageResult<()> {
        match record {
            WalRecord::Insert { table, page_no, slot_no, values, .. } => {
                self.remove_at(table, RecordID::new(*page_no, *slot_no), values)
            }
            WalRecord::Delete { table, page_no, slot_no, values, .. } => {
                self.place_at(table, RecordID::new(*page_no, *slot_no), values)
            }
            WalRecord::Update { table, page_no, slot_no, old_values, .. } => {
                self.with_table(table, |t| {
                    t.heap.put_at(RecordID::new(*page_no, *slot_no), &Record::new(old_values.clone()))
                })
            }
            WalRecord::Commit { .. } | WalRecord::Abort { .. } => Ok(()),
        }
    }
}

fn record_tx(record: &WalRecord) -> crate::types::TransactionID {
    match record {
        WalRecord::Insert { tx, .. }
        | WalRecord::Delete { tx, .. }
        | WalRecord::Update { tx, .. }
        | WalRecord::Commit { tx }
        | WalRecord::Abort { tx } => *tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, DataType};

    fn test_config(name: &str) -> StorageConfig {
        let mut dir = std::env::temp_dir();
        dir.push(format!("wren_db_engine_test_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        StorageConfig::default()
            .with_data_dir(dir)
            .with_buffer_pool_capacity(32)
            .with_btree_max_keys(4)
    }

    fn users_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", DataType::Int).unwrap(),
            Column::new("name", DataType::Str(16)).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn test_commit_makes_writes_durable_and_visible() {
        crate::utils::init_log();
        let engine = StorageEngine::new(test_config("commit_visible")).unwrap();
        engine.register_table("users", users_schema()).unwrap();

        let tx = engine.begin();
        engine
            .insert(tx, "users", Record::new(vec![Value::Int(1), Value::Str(b"alice".to_vec())]))
            .unwrap();
        engine.commit(tx).unwrap();

        let tx2 = engine.begin();
        let row = engine.get(tx2, "users", 1).unwrap().unwrap();
        assert_eq!(row.key().unwrap(), 1);
        engine.commit(tx2).unwrap();
    }

    #[test]
    fn test_abort_undoes_insert() {
        crate::utils::init_log();
        let engine = StorageEngine::new(test_config("abort_invisible")).unwrap();
        engine.register_table("users", users_schema()).unwrap();

        let tx = engine.begin();
        engine
            .insert(tx, "users", Record::new(vec![Value::Int(1), Value::Str(b"alice".to_vec())]))
            .unwrap();
        engine.abort(tx).unwrap();

        let tx2 = engine.begin();
        assert!(engine.get(tx2, "users", 1).unwrap().is_none());
        engine.commit(tx2).unwrap();
    }

    #[test]
    fn test_conflicting_writers_get_lock_conflict_not_a_block() {
        crate::utils::init_log();
        let engine = StorageEngine::new(test_config("lock_conflict")).unwrap();
        engine.register_table("users", users_schema()).unwrap();

        let tx1 = engine.begin();
        engine
            .insert(tx1, "users", Record::new(vec![Value::Int(1), Value::Str(b"a".to_vec())]))
            .unwrap();

        let tx2 = engine.begin();
        let err = engine
            .insert(tx2, "users", Record::new(vec![Value::Int(2), Value::Str(b"b".to_vec())]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);

        engine.commit(tx1).unwrap();
    }

    #[test]
    fn test_recover_redoes_committed_and_undoes_loser() {
        crate::utils::init_log();
        let config = test_config("recovery");

        {
            let engine = StorageEngine::new(config.clone()).unwrap();
            engine.register_table("users", users_schema()).unwrap();

            let tx1 = engine.begin();
            engine
                .insert(tx1, "users", Record::new(vec![Value::Int(1), Value::Str(b"winner".to_vec())]))
                .unwrap();
            engine.commit(tx1).unwrap();

            // tx2 is left active, simulating a crash before commit/abort.
            let tx2 = engine.begin();
            engine
                .insert(tx2, "users", Record::new(vec![Value::Int(2), Value::Str(b"loser".to_vec())]))
                .unwrap();
        }

        let engine = StorageEngine::new(config).unwrap();
        engine.register_table("users", users_schema()).unwrap();
        engine.recover().unwrap();

        let tx = engine.begin();
        assert!(engine.get(tx, "users", 1).unwrap().is_some());
        assert!(engine.get(tx, "users", 2).unwrap().is_none());
        engine.commit(tx).unwrap();
    }

    #[test]
    fn test_recover_truncates_wal_and_advances_tx_ids() {
        crate::utils::init_log();
        let config = test_config("recovery_truncate");

        {
            let engine = StorageEngine::new(config.clone()).unwrap();
            engine.register_table("users", users_schema()).unwrap();

            let tx1 = engine.begin();
            engine
                .insert(tx1, "users", Record::new(vec![Value::Int(1), Value::Str(b"a".to_vec())]))
                .unwrap();
            engine.commit(tx1).unwrap();
        }

        let engine = StorageEngine::new(config).unwrap();
        engine.register_table("users", users_schema()).unwrap();
        assert!(engine.wal.read_all().unwrap().len() > 0, "WAL should hold pre-recovery records");

        engine.recover().unwrap();
        assert_eq!(engine.wal.read_all().unwrap().len(), 0, "recover() must truncate the WAL");

        // tx1 had id 1 above; begin() after recovery must not reissue it,
        // or a later crash could conflate the new tx's state with tx1's
        // stale COMMIT semantics.
        let tx = engine.begin();
        assert!(tx.id() > 1);
        engine.commit(tx).unwrap();
    }

    #[test]
    fn test_scan_table_lists_every_live_record_id() {
        crate::utils::init_log();
        let engine = StorageEngine::new(test_config("scan_table")).unwrap();
        engine.register_table("users", users_schema()).unwrap();

        let tx = engine.begin();
        let id1 = engine
            .insert(tx, "users", Record::new(vec![Value::Int(1), Value::Str(b"a".to_vec())]))
            .unwrap();
        let id2 = engine
            .insert(tx, "users", Record::new(vec![Value::Int(2), Value::Str(b"b".to_vec())]))
            .unwrap();
        engine.commit(tx).unwrap();

        let tx2 = engine.begin();
        let mut rids = engine.scan_table(tx2, "users").unwrap();
        rids.sort();
        let mut expected = vec![id1, id2];
        expected.sort();
        assert_eq!(rids, expected);
        engine.commit(tx2).unwrap();
    }

    #[test]
    fn test_redo_insert_places_record_at_exact_rid() {
        crate::utils::init_log();
        let engine = StorageEngine::new(test_config("redo_insert_rid")).unwrap();
        engine.register_table("users", users_schema()).unwrap();

        let rid = RecordID::new(0, 0);
        engine
            .redo_insert("users", rid, &[Value::Int(7), Value::Str(b"direct".to_vec())])
            .unwrap();

        let tx = engine.begin();
        let row = engine.get(tx, "users", 7).unwrap().unwrap();
        assert_eq!(row.key().unwrap(), 7);
        engine.commit(tx).unwrap();
    }
}
