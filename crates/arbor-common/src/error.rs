//! Error types for ArborDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in ArborDB operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // B+ tree errors
    #[error("B+ tree corrupted: {0}")]
    TreeCorrupted(String),

    #[error("Invalid node size {size} for {kind} node (allowed {min}..={max})")]
    InvalidNodeSize {
        kind: &'static str,
        size: u32,
        min: u32,
        max: u32,
    },

    // Index directory errors
    #[error("Index name too long: {len} bytes (max {max})")]
    IndexNameTooLong { len: usize, max: usize },

    #[error("Index directory full, cannot register another index")]
    HeaderDirectoryFull,
}
