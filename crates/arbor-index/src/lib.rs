//! Disk-resident concurrent B+ tree index for ArborDB.
//!
//! This crate provides:
//! - A B+ tree mapping fixed-width keys to record identifiers (unique keys)
//! - Point lookup, insertion, deletion, and ordered range iteration
//! - Latch crabbing with safe-ancestor release over the buffer pool
//! - A header-page directory persisting each index's root page id

mod header;
mod internal;
mod iterator;
mod leaf;
mod node;
mod transaction;
mod tree;
mod types;

pub use header::{HeaderRef, MAX_INDEX_NAME_LEN};
pub use internal::InternalRef;
pub use iterator::IndexIterator;
pub use leaf::LeafRef;
pub use node::NodeType;
pub use transaction::{LatchTarget, Transaction};
pub use tree::{BPlusTree, TreeOp, TreeStats};
pub use types::{IndexKey, IndexValue, RecordId};
