//! Index directory stored in the header page.
//!
//! Page 0 of the data file holds a flat directory of
//! `(index name, root page id)` records so that every index can find its
//! root again after the pool is reopened. Layout:
//!
//! ```text
//! +------------------+ 0
//! | record_count: u32|
//! +------------------+ 4
//! | name: [u8; 32]   |  record 0
//! | root: u32        |
//! +------------------+ 40
//! | ...              |
//! ```

use crate::node::{read_u32, write_u32};
use arbor_buffer::BufferFrame;
use arbor_common::page::{PageId, PAGE_SIZE};
use arbor_common::{ArborError, Result};

/// Maximum index name length in bytes.
pub const MAX_INDEX_NAME_LEN: usize = 32;

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const RECORD_SIZE: usize = MAX_INDEX_NAME_LEN + 4;

/// Maximum number of index records the directory can hold.
pub const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// View of the header page's index directory.
pub struct HeaderRef<'a> {
    frame: &'a BufferFrame,
}

impl<'a> HeaderRef<'a> {
    /// Wraps the header page.
    pub fn new(frame: &'a BufferFrame) -> Self {
        Self { frame }
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn name_matches(data: &[u8], index: usize, name: &[u8]) -> bool {
        let offset = Self::record_offset(index);
        let stored = &data[offset..offset + MAX_INDEX_NAME_LEN];
        stored[..name.len()] == *name && stored[name.len()..].iter().all(|&b| b == 0)
    }

    /// Number of registered indexes.
    pub fn record_count(&self) -> u32 {
        read_u32(&self.frame.read_data()[..], RECORD_COUNT_OFFSET)
    }

    /// Looks up the persisted root page id for `name`.
    pub fn get_root(&self, name: &str) -> Option<PageId> {
        let name = name.as_bytes();
        if name.len() > MAX_INDEX_NAME_LEN {
            return None;
        }

        let data = self.frame.read_data();
        let count = read_u32(&data[..], RECORD_COUNT_OFFSET) as usize;
        (0..count).find_map(|i| {
            if Self::name_matches(&data[..], i, name) {
                Some(PageId(read_u32(
                    &data[..],
                    Self::record_offset(i) + MAX_INDEX_NAME_LEN,
                )))
            } else {
                None
            }
        })
    }

    /// Inserts or updates the record for `name`.
    pub fn set_root(&self, name: &str, root: PageId) -> Result<()> {
        let name_bytes = name.as_bytes();
        if name_bytes.len() > MAX_INDEX_NAME_LEN {
            return Err(ArborError::IndexNameTooLong {
                len: name_bytes.len(),
                max: MAX_INDEX_NAME_LEN,
            });
        }

        let mut data = self.frame.write_data();
        let count = read_u32(&data[..], RECORD_COUNT_OFFSET) as usize;

        for i in 0..count {
            if Self::name_matches(&data[..], i, name_bytes) {
                write_u32(&mut data[..], Self::record_offset(i) + MAX_INDEX_NAME_LEN, root.0);
                return Ok(());
            }
        }

        if count >= MAX_RECORDS {
            return Err(ArborError::HeaderDirectoryFull);
        }

        let offset = Self::record_offset(count);
        data[offset..offset + MAX_INDEX_NAME_LEN].fill(0);
        data[offset..offset + name_bytes.len()].copy_from_slice(name_bytes);
        write_u32(&mut data[..], offset + MAX_INDEX_NAME_LEN, root.0);
        write_u32(&mut data[..], RECORD_COUNT_OFFSET, (count + 1) as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_buffer::FrameId;
    use arbor_common::page::INVALID_PAGE_ID;

    #[test]
    fn test_empty_directory() {
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        assert_eq!(dir.record_count(), 0);
        assert_eq!(dir.get_root("missing"), None);
    }

    #[test]
    fn test_insert_and_get() {
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        dir.set_root("orders_pk", PageId::new(5)).unwrap();
        assert_eq!(dir.record_count(), 1);
        assert_eq!(dir.get_root("orders_pk"), Some(PageId::new(5)));
        assert_eq!(dir.get_root("other"), None);
    }

    #[test]
    fn test_update_existing() {
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        dir.set_root("idx", PageId::new(5)).unwrap();
        dir.set_root("idx", PageId::new(9)).unwrap();

        assert_eq!(dir.record_count(), 1);
        assert_eq!(dir.get_root("idx"), Some(PageId::new(9)));
    }

    #[test]
    fn test_multiple_indexes() {
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        dir.set_root("a", PageId::new(1)).unwrap();
        dir.set_root("b", PageId::new(2)).unwrap();
        dir.set_root("c", PageId::new(3)).unwrap();

        assert_eq!(dir.record_count(), 3);
        assert_eq!(dir.get_root("a"), Some(PageId::new(1)));
        assert_eq!(dir.get_root("b"), Some(PageId::new(2)));
        assert_eq!(dir.get_root("c"), Some(PageId::new(3)));
    }

    #[test]
    fn test_prefix_names_do_not_collide() {
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        dir.set_root("users", PageId::new(1)).unwrap();
        dir.set_root("users_email", PageId::new(2)).unwrap();

        assert_eq!(dir.get_root("users"), Some(PageId::new(1)));
        assert_eq!(dir.get_root("users_email"), Some(PageId::new(2)));
    }

    #[test]
    fn test_invalid_root_roundtrip() {
        // An emptied tree persists INVALID_PAGE_ID.
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        dir.set_root("idx", PageId::new(4)).unwrap();
        dir.set_root("idx", INVALID_PAGE_ID).unwrap();
        assert_eq!(dir.get_root("idx"), Some(INVALID_PAGE_ID));
    }

    #[test]
    fn test_name_too_long() {
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        let long = "x".repeat(MAX_INDEX_NAME_LEN + 1);
        let result = dir.set_root(&long, PageId::new(1));
        assert!(matches!(result, Err(ArborError::IndexNameTooLong { .. })));
    }

    #[test]
    fn test_directory_full() {
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        for i in 0..MAX_RECORDS {
            dir.set_root(&format!("idx_{i}"), PageId::new(i as u32)).unwrap();
        }
        let result = dir.set_root("one_more", PageId::new(0));
        assert!(matches!(result, Err(ArborError::HeaderDirectoryFull)));
    }

    #[test]
    fn test_max_name_length_accepted() {
        let frame = BufferFrame::new(FrameId(0));
        let dir = HeaderRef::new(&frame);

        let name = "y".repeat(MAX_INDEX_NAME_LEN);
        dir.set_root(&name, PageId::new(8)).unwrap();
        assert_eq!(dir.get_root(&name), Some(PageId::new(8)));
    }
}
