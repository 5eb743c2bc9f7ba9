//! Buffer pool management for ArborDB.
//!
//! This crate provides disk-backed in-memory page caching with:
//! - Fixed-size buffer pool with configurable frame count
//! - Clock eviction policy with dirty write-back
//! - Pin counting for concurrent access
//! - Per-page reader/writer latches for index latch crabbing

mod disk;
mod frame;
mod page_table;
mod pool;
mod replacer;

pub use disk::{DiskManager, DiskManagerConfig};
pub use frame::{BufferFrame, FrameId, PageLatch};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats};
pub use replacer::{ClockReplacer, Replacer};
