pub mod btree;
pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod file_manager;
pub mod heap;
pub mod lock_manager;
pub mod page;
pub mod record;
pub mod schema;
pub mod storage_engine;
pub mod transaction;
pub mod types;
pub mod utils;
pub mod wal;

pub use config::StorageConfig;
pub use error::{ErrorKind, SmallError};
pub use storage_engine::StorageEngine;
pub use transaction::Transaction;
pub use types::{RecordID, StorageResult};
