//! Forward range iterator over the leaf sibling chain.

use crate::leaf::LeafRef;
use crate::types::{IndexKey, IndexValue};
use arbor_buffer::BufferPool;
use arbor_common::page::PageId;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Cursor over the leaf chain in ascending key order.
///
/// The iterator owns exactly one pin: the pin on its current leaf. Moving
/// the iterator transfers that pin; the iterator is deliberately not
/// cloneable (a copy would unpin the leaf twice on drop). A finished
/// iterator holds no pin.
///
/// The iterator takes no latches while traversing; callers must ensure no
/// concurrent mutation while a scan is alive, or wrap scans under a
/// higher-level read latch.
pub struct IndexIterator<K, V> {
    pool: Arc<BufferPool>,
    /// Current leaf, pinned. None means the iterator is exhausted.
    leaf_page_id: Option<PageId>,
    /// Current slot within the leaf.
    slot: u32,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> IndexIterator<K, V> {
    /// Creates an iterator positioned at `(leaf, slot)`.
    ///
    /// Takes over the caller's pin on `leaf`. The position is normalized
    /// forward past exhausted leaves.
    pub(crate) fn new(pool: Arc<BufferPool>, leaf: Option<PageId>, slot: u32) -> Self {
        let mut iter = Self {
            pool,
            leaf_page_id: leaf,
            slot,
            _marker: PhantomData,
        };
        iter.skip_exhausted();
        iter
    }

    /// Creates an exhausted iterator.
    pub fn end(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            leaf_page_id: None,
            slot: 0,
            _marker: PhantomData,
        }
    }

    /// Returns true when the iterator has passed the last entry.
    pub fn is_end(&self) -> bool {
        self.leaf_page_id.is_none()
    }

    /// The entry at the current position, if any.
    pub fn entry(&self) -> Option<(K, V)> {
        let page_id = self.leaf_page_id?;
        let frame = self.pool.frame(page_id)?;
        Some(LeafRef::<K, V>::new(frame).item(self.slot))
    }

    /// Hops to the next leaf while the current position is past the end of
    /// its leaf.
    fn skip_exhausted(&mut self) {
        while let Some(page_id) = self.leaf_page_id {
            let Some(frame) = self.pool.frame(page_id) else {
                // The pinned leaf must be resident; treat anything else as
                // the end of the scan.
                warn!(%page_id, "iterator leaf not resident, ending scan");
                self.leaf_page_id = None;
                return;
            };
            let leaf = LeafRef::<K, V>::new(frame);
            if self.slot < leaf.size() {
                return;
            }

            let next = leaf.next_page_id();
            self.pool.unpin_page(page_id, false);
            self.slot = 0;
            if !next.is_valid() {
                self.leaf_page_id = None;
                return;
            }
            match self.pool.fetch_page(next) {
                Ok(_) => self.leaf_page_id = Some(next),
                Err(e) => {
                    warn!(%next, error = %e, "failed to fetch next leaf, ending scan");
                    self.leaf_page_id = None;
                }
            }
        }
    }

    /// Advances past the current entry.
    fn advance(&mut self) {
        if self.leaf_page_id.is_some() {
            self.slot += 1;
            self.skip_exhausted();
        }
    }
}

impl<K: IndexKey, V: IndexValue> Iterator for IndexIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let entry = self.entry()?;
        self.advance();
        Some(entry)
    }
}

impl<K, V> Drop for IndexIterator<K, V> {
    fn drop(&mut self) {
        if let Some(page_id) = self.leaf_page_id.take() {
            self.pool.unpin_page(page_id, false);
        }
    }
}

impl<K, V> PartialEq for IndexIterator<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.leaf_page_id == other.leaf_page_id && self.slot == other.slot
    }
}

impl<K, V> std::fmt::Debug for IndexIterator<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexIterator")
            .field("leaf_page_id", &self.leaf_page_id)
            .field("slot", &self.slot)
            .finish()
    }
}
