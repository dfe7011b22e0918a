use std::path::PathBuf;

/// Explicit construction context for a [`crate::storage_engine::StorageEngine`],
/// replacing the process-wide singletons the original engine relied on.
/// Every component is built from this one struct, in the order File ->
/// Buffer -> (table registry) -> Lock -> WAL -> Storage.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding one `<table>.heap` / `<table>.idx` pair per
    /// registered table, plus the WAL file.
    pub data_dir: PathBuf,
    /// Number of frames in the buffer pool.
    pub buffer_pool_capacity: usize,
    /// Maximum keys per B+ tree node before a split. Kept configurable
    /// (rather than a compile-time constant) so tests can exercise small
    /// fan-outs without building huge trees.
    pub btree_max_keys: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data").join("default_db"),
            buffer_pool_capacity: 128,
            btree_max_keys: 128,
        }
    }
}

impl StorageConfig {
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_buffer_pool_capacity(mut self, capacity: usize) -> Self {
        self.buffer_pool_capacity = capacity;
        self
    }

    pub fn with_btree_max_keys(mut self, max_keys: usize) -> Self {
        self.btree_max_keys = max_keys;
        self
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wal.log")
    }

    pub fn heap_path(&self, table: &str) -> PathBuf {
        self.data_dir.join(format!("{}.heap", table))
    }

    pub fn index_path(&self, table: &str) -> PathBuf {
        self.data_dir.join(format!("{}.idx", table))
    }
}
