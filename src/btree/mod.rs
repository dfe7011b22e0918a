//! Clustered primary-key B+ tree index: maps an `i32` key to the
//! [`crate::types::RecordID`] of the matching row in a table's heap
//! file.

pub mod node;
pub mod tree;

pub use node::Node;
pub use tree::BPlusTree;
