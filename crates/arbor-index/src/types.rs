//! Key, value, and record identifier types for the B+ tree index.

use arbor_common::codec::FixedCodec;
use arbor_common::page::PageId;

/// Bound for types usable as index keys.
///
/// Keys are fixed-width, totally ordered, and cheap to copy; one tree is
/// instantiated per key width (e.g. `i64` row keys, `u32` hash prefixes).
pub trait IndexKey:
    FixedCodec + Ord + Copy + Send + Sync + std::fmt::Debug + 'static
{
}

impl<T> IndexKey for T where
    T: FixedCodec + Ord + Copy + Send + Sync + std::fmt::Debug + 'static
{
}

/// Bound for types usable as index values.
pub trait IndexValue:
    FixedCodec + Copy + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
}

impl<T> IndexValue for T where
    T: FixedCodec + Copy + PartialEq + Send + Sync + std::fmt::Debug + 'static
{
}

/// Identifier of a record in the storage layer: the page holding it plus its
/// slot within that page.
///
/// This is the value type stored in index leaves; the index never interprets
/// it beyond moving it around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    /// Page containing the record.
    pub page_id: PageId,
    /// Slot number within the page.
    pub slot_id: u16,
}

impl RecordId {
    /// Creates a new RecordId.
    pub const fn new(page_id: PageId, slot_id: u16) -> Self {
        Self { page_id, slot_id }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot_id)
    }
}

impl FixedCodec for RecordId {
    // page_id (4) + slot_id (2) + 2 reserved
    const ENCODED_LEN: usize = 8;

    #[inline]
    fn encode_into(&self, buf: &mut [u8]) {
        self.page_id.encode_into(&mut buf[0..4]);
        buf[4..6].copy_from_slice(&self.slot_id.to_le_bytes());
        buf[6..8].fill(0);
    }

    #[inline]
    fn decode_from(buf: &[u8]) -> Self {
        Self {
            page_id: PageId::decode_from(&buf[0..4]),
            slot_id: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }
}
