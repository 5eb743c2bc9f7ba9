//! Leaf node operations.
//!
//! A `LeafRef` is a typed view over a pinned buffer frame holding a leaf
//! page. Entries are `(key, value)` pairs stored sorted by key at a fixed
//! stride after the leaf header; `next_page_id` links leaves in ascending
//! key order for range scans.
//!
//! Views do not cache page state: every accessor goes through the frame's
//! data lock, so several views of the same frame may coexist. Exclusion
//! across whole operations is the caller's job (page latches).

use crate::node::{
    self, init_header, read_u32, write_u32, NodeType, LEAF_HEADER_SIZE, NEXT_LEAF_OFFSET,
    SIZE_OFFSET,
};
use crate::types::{IndexKey, IndexValue};
use arbor_buffer::BufferFrame;
use arbor_common::page::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use std::marker::PhantomData;

/// Typed view of a leaf page.
pub struct LeafRef<'a, K, V> {
    frame: &'a BufferFrame,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: IndexKey, V: IndexValue> LeafRef<'a, K, V> {
    /// Byte stride of one (key, value) slot.
    const STRIDE: usize = K::ENCODED_LEN + V::ENCODED_LEN;

    /// Number of slots that physically fit in a leaf page.
    pub fn capacity() -> u32 {
        ((PAGE_SIZE - LEAF_HEADER_SIZE) / Self::STRIDE) as u32
    }

    /// Wraps an existing leaf page.
    pub fn new(frame: &'a BufferFrame) -> Self {
        debug_assert!(node::is_leaf(frame));
        Self {
            frame,
            _marker: PhantomData,
        }
    }

    /// Initializes `frame` as an empty leaf and returns a view of it.
    pub fn init(frame: &'a BufferFrame, page_id: PageId, parent: PageId, max_size: u32) -> Self {
        {
            let mut data = frame.write_data();
            init_header(&mut data[..], NodeType::Leaf, page_id, parent, max_size);
            write_u32(&mut data[..], NEXT_LEAF_OFFSET, INVALID_PAGE_ID.0);
        }
        Self {
            frame,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn entry_offset(slot: u32) -> usize {
        LEAF_HEADER_SIZE + slot as usize * Self::STRIDE
    }

    #[inline]
    fn key_in(data: &[u8], slot: u32) -> K {
        K::decode_from(&data[Self::entry_offset(slot)..])
    }

    #[inline]
    fn value_in(data: &[u8], slot: u32) -> V {
        V::decode_from(&data[Self::entry_offset(slot) + K::ENCODED_LEN..])
    }

    /// First slot whose key is >= `key` (lower bound over `data`).
    fn lower_bound_in(data: &[u8], key: &K) -> u32 {
        let n = read_u32(data, SIZE_OFFSET);
        let (mut lo, mut hi) = (0u32, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if Self::key_in(data, mid) < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Current entry count.
    pub fn size(&self) -> u32 {
        node::size(self.frame)
    }

    /// Configured capacity.
    pub fn max_size(&self) -> u32 {
        node::max_size(self.frame)
    }

    /// Minimum legal entry count for a non-root leaf.
    pub fn min_size(&self) -> u32 {
        node::min_size(self.frame)
    }

    /// This page's id.
    pub fn page_id(&self) -> PageId {
        node::self_page_id(self.frame)
    }

    /// Parent page id (INVALID_PAGE_ID for the root).
    pub fn parent_page_id(&self) -> PageId {
        node::parent_page_id(self.frame)
    }

    /// Next leaf in ascending key order (INVALID_PAGE_ID at the tail).
    pub fn next_page_id(&self) -> PageId {
        PageId(read_u32(&self.frame.read_data()[..], NEXT_LEAF_OFFSET))
    }

    /// Updates the sibling link.
    pub fn set_next_page_id(&self, next: PageId) {
        write_u32(&mut self.frame.write_data()[..], NEXT_LEAF_OFFSET, next.0);
    }

    /// Key stored at `slot`.
    pub fn key_at(&self, slot: u32) -> K {
        let data = self.frame.read_data();
        debug_assert!(slot < read_u32(&data[..], SIZE_OFFSET));
        Self::key_in(&data[..], slot)
    }

    /// (key, value) pair stored at `slot`.
    pub fn item(&self, slot: u32) -> (K, V) {
        let data = self.frame.read_data();
        debug_assert!(slot < read_u32(&data[..], SIZE_OFFSET));
        (Self::key_in(&data[..], slot), Self::value_in(&data[..], slot))
    }

    /// First slot whose key is >= `key`; equals `size` when all keys are
    /// smaller.
    pub fn key_index(&self, key: &K) -> u32 {
        Self::lower_bound_in(&self.frame.read_data()[..], key)
    }

    /// Point lookup. Returns the value stored under `key`, if any.
    pub fn lookup(&self, key: &K) -> Option<V> {
        let data = self.frame.read_data();
        let slot = Self::lower_bound_in(&data[..], key);
        if slot < read_u32(&data[..], SIZE_OFFSET) && Self::key_in(&data[..], slot) == *key {
            Some(Self::value_in(&data[..], slot))
        } else {
            None
        }
    }

    /// Inserts `(key, value)` keeping slots sorted. Returns the new size.
    ///
    /// The key must not already be present; callers check with `lookup`
    /// first. The page must have physical room for one more slot.
    pub fn insert(&self, key: &K, value: &V) -> u32 {
        let mut data = self.frame.write_data();
        let n = read_u32(&data[..], SIZE_OFFSET);
        let slot = Self::lower_bound_in(&data[..], key);
        debug_assert!(n < Self::capacity());
        debug_assert!(slot == n || Self::key_in(&data[..], slot) != *key);

        let start = Self::entry_offset(slot);
        let end = Self::entry_offset(n);
        data.copy_within(start..end, start + Self::STRIDE);
        key.encode_into(&mut data[start..]);
        value.encode_into(&mut data[start + K::ENCODED_LEN..]);
        write_u32(&mut data[..], SIZE_OFFSET, n + 1);
        n + 1
    }

    /// Removes `key` if present. Returns the new size (unchanged when the
    /// key was absent).
    pub fn remove(&self, key: &K) -> u32 {
        let mut data = self.frame.write_data();
        let n = read_u32(&data[..], SIZE_OFFSET);
        let slot = Self::lower_bound_in(&data[..], key);
        if slot >= n || Self::key_in(&data[..], slot) != *key {
            return n;
        }

        let start = Self::entry_offset(slot);
        let end = Self::entry_offset(n);
        data.copy_within(start + Self::STRIDE..end, start);
        write_u32(&mut data[..], SIZE_OFFSET, n - 1);
        n - 1
    }

    /// Moves the upper half of this leaf's entries into `recipient`.
    ///
    /// The recipient must be a freshly initialized, empty leaf.
    pub fn move_half_to(&self, recipient: &LeafRef<'_, K, V>) {
        let mut src = self.frame.write_data();
        let mut dst = recipient.frame.write_data();
        let n = read_u32(&src[..], SIZE_OFFSET);
        debug_assert_eq!(read_u32(&dst[..], SIZE_OFFSET), 0);

        let split = n / 2;
        let moved = n - split;
        let from = Self::entry_offset(split);
        let len = moved as usize * Self::STRIDE;
        dst[LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + len].copy_from_slice(&src[from..from + len]);
        write_u32(&mut src[..], SIZE_OFFSET, split);
        write_u32(&mut dst[..], SIZE_OFFSET, moved);
    }

    /// Appends all of this leaf's entries to `recipient` and empties this
    /// leaf. The recipient must be the left sibling (all its keys smaller).
    pub fn move_all_to(&self, recipient: &LeafRef<'_, K, V>) {
        let mut src = self.frame.write_data();
        let mut dst = recipient.frame.write_data();
        let n = read_u32(&src[..], SIZE_OFFSET);
        let m = read_u32(&dst[..], SIZE_OFFSET);

        let len = n as usize * Self::STRIDE;
        let dst_start = Self::entry_offset(m);
        dst[dst_start..dst_start + len]
            .copy_from_slice(&src[LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + len]);
        write_u32(&mut dst[..], SIZE_OFFSET, m + n);
        write_u32(&mut src[..], SIZE_OFFSET, 0);
    }

    /// Moves this leaf's first entry to the end of `recipient` (the left
    /// sibling).
    pub fn move_first_to_end_of(&self, recipient: &LeafRef<'_, K, V>) {
        let mut src = self.frame.write_data();
        let mut dst = recipient.frame.write_data();
        let n = read_u32(&src[..], SIZE_OFFSET);
        let m = read_u32(&dst[..], SIZE_OFFSET);
        debug_assert!(n > 0);

        let dst_start = Self::entry_offset(m);
        let (first, rest) = (LEAF_HEADER_SIZE, LEAF_HEADER_SIZE + Self::STRIDE);
        dst[dst_start..dst_start + Self::STRIDE].copy_from_slice(&src[first..rest]);
        src.copy_within(rest..Self::entry_offset(n), first);
        write_u32(&mut dst[..], SIZE_OFFSET, m + 1);
        write_u32(&mut src[..], SIZE_OFFSET, n - 1);
    }

    /// Moves this leaf's last entry to the front of `recipient` (the right
    /// sibling).
    pub fn move_last_to_front_of(&self, recipient: &LeafRef<'_, K, V>) {
        let mut src = self.frame.write_data();
        let mut dst = recipient.frame.write_data();
        let n = read_u32(&src[..], SIZE_OFFSET);
        let m = read_u32(&dst[..], SIZE_OFFSET);
        debug_assert!(n > 0);

        dst.copy_within(
            LEAF_HEADER_SIZE..Self::entry_offset(m),
            LEAF_HEADER_SIZE + Self::STRIDE,
        );
        let last = Self::entry_offset(n - 1);
        let (dst_first, dst_rest) = (LEAF_HEADER_SIZE, LEAF_HEADER_SIZE + Self::STRIDE);
        dst[dst_first..dst_rest].copy_from_slice(&src[last..last + Self::STRIDE]);
        write_u32(&mut dst[..], SIZE_OFFSET, m + 1);
        write_u32(&mut src[..], SIZE_OFFSET, n - 1);
    }
}
