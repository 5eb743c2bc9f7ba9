//! Internal node operations.
//!
//! An `InternalRef` is a typed view over a pinned buffer frame holding an
//! internal page. Slot `i` stores `(key_i, child_i)`; the key in slot 0 is a
//! sentinel separator and is never compared. For `i >= 1`, all keys in the
//! subtree of `child_{i-1}` are `< key_i` and all keys in the subtree of
//! `child_i` are `>= key_i`.
//!
//! Operations that move children between pages also re-point the moved
//! children's `parent_page_id` through the buffer pool.

use crate::node::{
    self, init_header, read_u32, write_u32, NodeType, NODE_HEADER_SIZE, PAGE_ID_OFFSET,
    SIZE_OFFSET,
};
use crate::types::IndexKey;
use arbor_buffer::{BufferFrame, BufferPool};
use arbor_common::page::{PageId, PAGE_SIZE};
use arbor_common::Result;
use std::marker::PhantomData;

/// Typed view of an internal page.
pub struct InternalRef<'a, K> {
    frame: &'a BufferFrame,
    _marker: PhantomData<fn() -> K>,
}

impl<'a, K: IndexKey> InternalRef<'a, K> {
    /// Byte stride of one (key, child) slot.
    const STRIDE: usize = K::ENCODED_LEN + 4;

    /// Number of slots that physically fit in an internal page.
    pub fn capacity() -> u32 {
        ((PAGE_SIZE - NODE_HEADER_SIZE) / Self::STRIDE) as u32
    }

    /// Wraps an existing internal page.
    pub fn new(frame: &'a BufferFrame) -> Self {
        debug_assert_eq!(node::node_type(frame), Some(NodeType::Internal));
        Self {
            frame,
            _marker: PhantomData,
        }
    }

    /// Initializes `frame` as an empty internal node and returns a view.
    pub fn init(frame: &'a BufferFrame, page_id: PageId, parent: PageId, max_size: u32) -> Self {
        {
            let mut data = frame.write_data();
            init_header(&mut data[..], NodeType::Internal, page_id, parent, max_size);
        }
        Self {
            frame,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn entry_offset(slot: u32) -> usize {
        NODE_HEADER_SIZE + slot as usize * Self::STRIDE
    }

    #[inline]
    fn key_in(data: &[u8], slot: u32) -> K {
        K::decode_from(&data[Self::entry_offset(slot)..])
    }

    #[inline]
    fn child_in(data: &[u8], slot: u32) -> PageId {
        PageId(read_u32(data, Self::entry_offset(slot) + K::ENCODED_LEN))
    }

    #[inline]
    fn write_entry(data: &mut [u8], slot: u32, key: &K, child: PageId) {
        let offset = Self::entry_offset(slot);
        key.encode_into(&mut data[offset..]);
        write_u32(data, offset + K::ENCODED_LEN, child.0);
    }

    /// Current child count.
    pub fn size(&self) -> u32 {
        node::size(self.frame)
    }

    /// Configured capacity.
    pub fn max_size(&self) -> u32 {
        node::max_size(self.frame)
    }

    /// Minimum legal child count for a non-root internal node.
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

    /// Separator key stored at `slot` (slot 0 is a sentinel).
    pub fn key_at(&self, slot: u32) -> K {
        let data = self.frame.read_data();
        debug_assert!(slot < read_u32(&data[..], SIZE_OFFSET));
        Self::key_in(&data[..], slot)
    }

    /// Overwrites the separator key at `slot`.
    pub fn set_key_at(&self, slot: u32, key: &K) {
        let mut data = self.frame.write_data();
        debug_assert!(slot >= 1 && slot < read_u32(&data[..], SIZE_OFFSET));
        key.encode_into(&mut data[Self::entry_offset(slot)..]);
    }

    /// Child page id stored at `slot`.
    pub fn value_at(&self, slot: u32) -> PageId {
        let data = self.frame.read_data();
        debug_assert!(slot < read_u32(&data[..], SIZE_OFFSET));
        Self::child_in(&data[..], slot)
    }

    /// Slot holding the given child page id, if present.
    pub fn value_index(&self, child: PageId) -> Option<u32> {
        let data = self.frame.read_data();
        let n = read_u32(&data[..], SIZE_OFFSET);
        (0..n).find(|&i| Self::child_in(&data[..], i) == child)
    }

    /// Returns the child that covers `key` (binary search over the
    /// separators in slots `1..size`).
    pub fn lookup(&self, key: &K) -> PageId {
        let data = self.frame.read_data();
        let n = read_u32(&data[..], SIZE_OFFSET);
        debug_assert!(n >= 1);

        // First separator strictly greater than key; its left neighbor
        // covers the key.
        let (mut lo, mut hi) = (1u32, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if Self::key_in(&data[..], mid) <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Self::child_in(&data[..], lo - 1)
    }

    /// Fills an empty internal node with its first two children.
    ///
    /// Used when a root split grows the tree by one level: slot 0 carries
    /// the old root (sentinel key), slot 1 the separator and the new
    /// sibling.
    pub fn populate_new_root(&self, left: PageId, key: &K, right: PageId) {
        let mut data = self.frame.write_data();
        debug_assert_eq!(read_u32(&data[..], SIZE_OFFSET), 0);
        write_u32(&mut data[..], Self::entry_offset(0) + K::ENCODED_LEN, left.0);
        Self::write_entry(&mut data[..], 1, key, right);
        write_u32(&mut data[..], SIZE_OFFSET, 2);
    }

    /// Inserts `(key, new_child)` immediately after the slot holding
    /// `old_child`. Returns the new size.
    pub fn insert_node_after(&self, old_child: PageId, key: &K, new_child: PageId) -> u32 {
        let mut data = self.frame.write_data();
        let n = read_u32(&data[..], SIZE_OFFSET);
        let old_slot = (0..n)
            .find(|&i| Self::child_in(&data[..], i) == old_child)
            .expect("old child must be present in parent");

        let slot = old_slot + 1;
        let start = Self::entry_offset(slot);
        let end = Self::entry_offset(n);
        data.copy_within(start..end, start + Self::STRIDE);
        Self::write_entry(&mut data[..], slot, key, new_child);
        write_u32(&mut data[..], SIZE_OFFSET, n + 1);
        n + 1
    }

    /// Removes the slot at `slot`, shifting later slots left. Returns the
    /// new size.
    pub fn remove(&self, slot: u32) -> u32 {
        let mut data = self.frame.write_data();
        let n = read_u32(&data[..], SIZE_OFFSET);
        debug_assert!(slot < n);

        let start = Self::entry_offset(slot);
        let end = Self::entry_offset(n);
        data.copy_within(start + Self::STRIDE..end, start);
        write_u32(&mut data[..], SIZE_OFFSET, n - 1);
        n - 1
    }

    /// Moves the upper half of this node's slots into `recipient` and
    /// re-points the moved children at it.
    ///
    /// The recipient must be a freshly initialized, empty internal node.
    /// After the move, the recipient's slot-0 key holds the separator to
    /// push up into the parent.
    pub fn move_half_to(&self, recipient: &InternalRef<'_, K>, pool: &BufferPool) -> Result<()> {
        let (recipient_id, moved_children) = {
            let mut src = self.frame.write_data();
            let mut dst = recipient.frame.write_data();
            let n = read_u32(&src[..], SIZE_OFFSET);
            debug_assert_eq!(read_u32(&dst[..], SIZE_OFFSET), 0);

            let split = n / 2;
            let moved = n - split;
            let from = Self::entry_offset(split);
            let len = moved as usize * Self::STRIDE;
            dst[NODE_HEADER_SIZE..NODE_HEADER_SIZE + len].copy_from_slice(&src[from..from + len]);
            write_u32(&mut src[..], SIZE_OFFSET, split);
            write_u32(&mut dst[..], SIZE_OFFSET, moved);

            let children = (0..moved).map(|i| Self::child_in(&dst[..], i)).collect::<Vec<_>>();
            (PageId(read_u32(&dst[..], PAGE_ID_OFFSET)), children)
        };

        for child in moved_children {
            reparent(pool, child, recipient_id)?;
        }
        Ok(())
    }

    /// Appends all of this node's slots to `recipient` (the left sibling)
    /// and empties this node.
    ///
    /// `middle_key` is the parent separator between the two nodes; it
    /// becomes the key of this node's first child in the recipient.
    pub fn move_all_to(
        &self,
        recipient: &InternalRef<'_, K>,
        middle_key: &K,
        pool: &BufferPool,
    ) -> Result<()> {
        let (recipient_id, moved_children) = {
            let mut src = self.frame.write_data();
            let mut dst = recipient.frame.write_data();
            let n = read_u32(&src[..], SIZE_OFFSET);
            let m = read_u32(&dst[..], SIZE_OFFSET);

            let len = n as usize * Self::STRIDE;
            let dst_start = Self::entry_offset(m);
            dst[dst_start..dst_start + len]
                .copy_from_slice(&src[NODE_HEADER_SIZE..NODE_HEADER_SIZE + len]);
            // The absorbed node's sentinel slot-0 key takes the parent
            // separator so the recipient stays fully ordered.
            middle_key.encode_into(&mut dst[dst_start..]);
            write_u32(&mut dst[..], SIZE_OFFSET, m + n);
            write_u32(&mut src[..], SIZE_OFFSET, 0);

            let children = (m..m + n).map(|i| Self::child_in(&dst[..], i)).collect::<Vec<_>>();
            (PageId(read_u32(&dst[..], PAGE_ID_OFFSET)), children)
        };

        for child in moved_children {
            reparent(pool, child, recipient_id)?;
        }
        Ok(())
    }

    /// Moves this node's first slot to the end of `recipient` (the left
    /// sibling). `middle_key` is the parent separator between the two
    /// nodes; it becomes the moved child's key in the recipient.
    pub fn move_first_to_end_of(
        &self,
        recipient: &InternalRef<'_, K>,
        middle_key: &K,
        pool: &BufferPool,
    ) -> Result<()> {
        let (recipient_id, moved_child) = {
            let mut src = self.frame.write_data();
            let mut dst = recipient.frame.write_data();
            let n = read_u32(&src[..], SIZE_OFFSET);
            let m = read_u32(&dst[..], SIZE_OFFSET);
            debug_assert!(n > 0);

            let child = Self::child_in(&src[..], 0);
            Self::write_entry(&mut dst[..], m, middle_key, child);
            src.copy_within(
                Self::entry_offset(1)..Self::entry_offset(n),
                Self::entry_offset(0),
            );
            write_u32(&mut dst[..], SIZE_OFFSET, m + 1);
            write_u32(&mut src[..], SIZE_OFFSET, n - 1);

            (PageId(read_u32(&dst[..], PAGE_ID_OFFSET)), child)
        };

        reparent(pool, moved_child, recipient_id)
    }

    /// Moves this node's last slot to the front of `recipient` (the right
    /// sibling). `middle_key` is the parent separator between the two
    /// nodes; it becomes the key of the recipient's previously-first child.
    pub fn move_last_to_front_of(
        &self,
        recipient: &InternalRef<'_, K>,
        middle_key: &K,
        pool: &BufferPool,
    ) -> Result<()> {
        let (recipient_id, moved_child) = {
            let mut src = self.frame.write_data();
            let mut dst = recipient.frame.write_data();
            let n = read_u32(&src[..], SIZE_OFFSET);
            let m = read_u32(&dst[..], SIZE_OFFSET);
            debug_assert!(n > 0);

            let moved_key = Self::key_in(&src[..], n - 1);
            let child = Self::child_in(&src[..], n - 1);

            dst.copy_within(
                Self::entry_offset(0)..Self::entry_offset(m),
                Self::entry_offset(1),
            );
            // The old first child (now in slot 1) is separated from the
            // moved child by the former parent separator.
            middle_key.encode_into(&mut dst[Self::entry_offset(1)..]);
            Self::write_entry(&mut dst[..], 0, &moved_key, child);
            write_u32(&mut dst[..], SIZE_OFFSET, m + 1);
            write_u32(&mut src[..], SIZE_OFFSET, n - 1);

            (PageId(read_u32(&dst[..], PAGE_ID_OFFSET)), child)
        };

        reparent(pool, moved_child, recipient_id)
    }
}

/// Re-points a child's parent pointer after it moved between internal
/// nodes.
fn reparent(pool: &BufferPool, child: PageId, parent: PageId) -> Result<()> {
    let frame = pool.fetch_page(child)?;
    node::set_parent_page_id(frame, parent);
    pool.unpin_page(child, true);
    Ok(())
}
