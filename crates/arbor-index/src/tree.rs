//! B+ tree engine: point operations, structural maintenance, and the latch
//! crabbing protocol.
//!
//! The tree maps fixed-width keys to record identifiers (unique keys only).
//! Nodes live in buffer-pool pages; the tree engine drives the leaf and
//! internal page views, requests pages from the pool, and maintains the
//! pin/latch discipline:
//!
//! - Latches are acquired top-down. A mutating descent releases all ancestor
//!   latches as soon as the newly latched child is *safe* (cannot split or
//!   underflow), and otherwise holds them until the structural change
//!   completes.
//! - A per-operation [`Transaction`] records held latches (oldest first) and
//!   pages scheduled for deletion; `release` drains it once at the end of
//!   the operation.
//! - Every page fetched from the pool is unpinned exactly once per fetch.
//! - Changes to the root page id are serialized by a virtual root latch and
//!   persisted through the header-page directory.

use crate::header::HeaderRef;
use crate::internal::InternalRef;
use crate::leaf::LeafRef;
use crate::node::{self, NodeType};
use crate::transaction::{LatchTarget, Transaction};
use crate::types::{IndexKey, IndexValue};
use crate::IndexIterator;
use arbor_buffer::{BufferFrame, BufferPool, PageLatch};
use arbor_common::page::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};
use arbor_common::{ArborError, Result};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Kind of tree operation, deciding latch modes and safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOp {
    /// Point or range read.
    Search,
    /// Insertion.
    Insert,
    /// Deletion.
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchMode {
    Shared,
    Exclusive,
}

impl TreeOp {
    fn latch_mode(self) -> LatchMode {
        match self {
            TreeOp::Search => LatchMode::Shared,
            TreeOp::Insert | TreeOp::Delete => LatchMode::Exclusive,
        }
    }
}

/// Statistics gathered by [`BPlusTree::validate`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels (0 for an empty tree, 1 for a single leaf root).
    pub height: u32,
    /// Total number of keys.
    pub key_count: usize,
    /// Number of leaf pages.
    pub leaf_count: usize,
}

/// A disk-resident B+ tree index over a buffer pool.
///
/// One instance per index; several instances (with distinct names) may share
/// a pool. All mutating operations and latched reads take a per-operation
/// [`Transaction`].
pub struct BPlusTree<K, V> {
    /// Name under which the root page id is persisted in the header page.
    index_name: String,
    /// Current root page id; INVALID_PAGE_ID means the tree is empty.
    /// Changes only under the virtual root latch.
    root_page_id: AtomicU32,
    /// Page cache owning all tree pages.
    pool: Arc<BufferPool>,
    /// Capacity of leaf nodes.
    leaf_max_size: u32,
    /// Capacity (child count) of internal nodes.
    internal_max_size: u32,
    /// Virtual root: serializes every change of `root_page_id` against any
    /// latched descent.
    root_latch: PageLatch,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: IndexKey, V: IndexValue> BPlusTree<K, V> {
    /// Opens or creates the index `name` with explicit node capacities.
    ///
    /// If the header directory already has a record for `name`, the
    /// persisted root is adopted. Node capacities must be at least 3 and fit
    /// the page size; a node holds at most `max_size - 1` entries at rest
    /// (the spare slot lets an insert land in-place before the split).
    pub fn new(
        name: impl Into<String>,
        pool: Arc<BufferPool>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        let index_name = name.into();
        if index_name.len() > crate::header::MAX_INDEX_NAME_LEN {
            return Err(ArborError::IndexNameTooLong {
                len: index_name.len(),
                max: crate::header::MAX_INDEX_NAME_LEN,
            });
        }

        if leaf_max_size < 3 || leaf_max_size > LeafRef::<K, V>::capacity() {
            return Err(ArborError::InvalidNodeSize {
                kind: "leaf",
                size: leaf_max_size,
                min: 3,
                max: LeafRef::<K, V>::capacity(),
            });
        }
        if internal_max_size < 3 || internal_max_size > InternalRef::<K>::capacity() {
            return Err(ArborError::InvalidNodeSize {
                kind: "internal",
                size: internal_max_size,
                min: 3,
                max: InternalRef::<K>::capacity(),
            });
        }

        // Adopt a persisted root if this index is already registered.
        let header = pool.fetch_page(HEADER_PAGE_ID)?;
        let root = HeaderRef::new(header)
            .get_root(&index_name)
            .unwrap_or(INVALID_PAGE_ID);
        pool.unpin_page(HEADER_PAGE_ID, false);

        Ok(Self {
            index_name,
            root_page_id: AtomicU32::new(root.0),
            pool,
            leaf_max_size,
            internal_max_size,
            root_latch: PageLatch::new(),
            _marker: PhantomData,
        })
    }

    /// Opens or creates the index `name` with capacities derived from the
    /// page size.
    pub fn with_default_sizes(name: impl Into<String>, pool: Arc<BufferPool>) -> Result<Self> {
        let leaf_max = LeafRef::<K, V>::capacity();
        let internal_max = InternalRef::<K>::capacity();
        Self::new(name, pool, leaf_max, internal_max)
    }

    /// The index name.
    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// Current root page id (INVALID_PAGE_ID when empty).
    pub fn root_page_id(&self) -> PageId {
        PageId(self.root_page_id.load(Ordering::Acquire))
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    fn set_root_page_id(&self, page_id: PageId) {
        self.root_page_id.store(page_id.0, Ordering::Release);
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Point lookup: returns the value stored under `key`, if any.
    ///
    /// Descends with shared latches; at most one value can match since keys
    /// are unique.
    pub fn get_value(&self, key: &K, txn: &mut Transaction) -> Result<Option<V>> {
        let Some(leaf_id) = self.find_leaf(Some(key), Some(&mut *txn), TreeOp::Search)? else {
            return Ok(None);
        };
        let result = LeafRef::<K, V>::new(self.frame_of(leaf_id)?).lookup(key);
        self.release(TreeOp::Search, txn)?;
        Ok(result)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts `(key, value)`. Returns false (leaving the tree unchanged)
    /// when the key is already present.
    pub fn insert(&self, key: K, value: V, txn: &mut Transaction) -> Result<bool> {
        loop {
            if self.is_empty() {
                // The emptiness check races with other writers; recheck
                // under the virtual root latch before starting a new tree.
                self.root_latch.wlatch();
                if self.is_empty() {
                    let started = self.start_new_tree(&key, &value);
                    self.root_latch.wunlatch();
                    return started.map(|_| true);
                }
                self.root_latch.wunlatch();
            }

            match self.insert_into_leaf(&key, &value, txn)? {
                Some(inserted) => return Ok(inserted),
                // The tree emptied between the check and the descent.
                None => continue,
            }
        }
    }

    /// Creates a single-leaf tree holding `(key, value)`.
    ///
    /// Caller holds the virtual root latch exclusively.
    fn start_new_tree(&self, key: &K, value: &V) -> Result<()> {
        let (page_id, frame) = self.pool.new_page()?;
        let leaf = LeafRef::<K, V>::init(frame, page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key, value);
        self.set_root_page_id(page_id);
        self.update_root_page_id()?;
        self.pool.unpin_page(page_id, true);
        debug!(index = %self.index_name, root = %page_id, "started new tree");
        Ok(())
    }

    /// Inserts into the leaf covering `key`, splitting on overflow.
    ///
    /// Returns `Ok(None)` when the tree turned out to be empty (caller
    /// retries), otherwise whether the key was inserted.
    fn insert_into_leaf(&self, key: &K, value: &V, txn: &mut Transaction) -> Result<Option<bool>> {
        let Some(leaf_id) = self.find_leaf(Some(key), Some(&mut *txn), TreeOp::Insert)? else {
            return Ok(None);
        };
        let leaf = LeafRef::<K, V>::new(self.frame_of(leaf_id)?);

        if leaf.lookup(key).is_some() {
            self.release(TreeOp::Insert, txn)?;
            return Ok(Some(false));
        }

        if leaf.size() < leaf.max_size() - 1 {
            // Room for in-place insert without reaching the spare slot.
            leaf.insert(key, value);
        } else {
            leaf.insert(key, value);
            let new_leaf_id = self.split_leaf(leaf_id)?;

            let new_leaf = LeafRef::<K, V>::new(self.frame_of(new_leaf_id)?);
            new_leaf.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(new_leaf_id);

            let separator = new_leaf.key_at(0);
            self.insert_into_parent(leaf_id, separator, new_leaf_id)?;
        }

        self.release(TreeOp::Insert, txn)?;
        Ok(Some(true))
    }

    /// Splits a full leaf, moving its upper half into a new right sibling.
    /// Returns the (pinned) sibling's page id.
    fn split_leaf(&self, leaf_id: PageId) -> Result<PageId> {
        let (new_id, new_frame) = self.pool.new_page()?;
        let leaf = LeafRef::<K, V>::new(self.frame_of(leaf_id)?);
        let new_leaf =
            LeafRef::<K, V>::init(new_frame, new_id, leaf.parent_page_id(), self.leaf_max_size);
        leaf.move_half_to(&new_leaf);
        debug!(index = %self.index_name, from = %leaf_id, to = %new_id, "split leaf");
        Ok(new_id)
    }

    /// Splits a full internal node. Returns the (pinned) sibling's page id;
    /// the separator to push up is the sibling's slot-0 key.
    fn split_internal(&self, node_id: PageId) -> Result<PageId> {
        let (new_id, new_frame) = self.pool.new_page()?;
        let internal = InternalRef::<K>::new(self.frame_of(node_id)?);
        let new_internal = InternalRef::<K>::init(
            new_frame,
            new_id,
            internal.parent_page_id(),
            self.internal_max_size,
        );
        internal.move_half_to(&new_internal, &self.pool)?;
        debug!(index = %self.index_name, from = %node_id, to = %new_id, "split internal");
        Ok(new_id)
    }

    /// Links a freshly split-off sibling into the parent, splitting upward
    /// recursively as needed.
    ///
    /// `old_id` is pinned by the caller (it sits in the transaction's page
    /// set); this routine consumes the creation pin of `new_id`. Every node
    /// modified here is still latched: an unsafe child kept its ancestors
    /// latched during the descent.
    fn insert_into_parent(&self, old_id: PageId, key: K, new_id: PageId) -> Result<()> {
        let old_frame = self.frame_of(old_id)?;
        let parent_id = node::parent_page_id(old_frame);

        if !parent_id.is_valid() {
            // The old node was the root: grow a new root above it.
            let (root_id, root_frame) = self.pool.new_page()?;
            let root =
                InternalRef::<K>::init(root_frame, root_id, INVALID_PAGE_ID, self.internal_max_size);
            root.populate_new_root(old_id, &key, new_id);
            node::set_parent_page_id(old_frame, root_id);
            node::set_parent_page_id(self.frame_of(new_id)?, root_id);

            self.set_root_page_id(root_id);
            self.update_root_page_id()?;
            self.pool.unpin_page(root_id, true);
            self.pool.unpin_page(new_id, true);
            debug!(index = %self.index_name, root = %root_id, "root split, tree grew");
            return Ok(());
        }

        let parent_frame = self.pool.fetch_page(parent_id)?;
        let parent = InternalRef::<K>::new(parent_frame);

        if parent.size() < parent.max_size() - 1 {
            parent.insert_node_after(old_id, &key, new_id);
            self.pool.unpin_page(new_id, true);
            self.pool.unpin_page(parent_id, true);
            return Ok(());
        }

        // Parent is full as well: insert, split it, and recurse.
        parent.insert_node_after(old_id, &key, new_id);
        let new_parent_id = self.split_internal(parent_id)?;
        let separator = InternalRef::<K>::new(self.frame_of(new_parent_id)?).key_at(0);
        self.pool.unpin_page(new_id, true);
        self.pool.unpin_page(parent_id, true);
        self.insert_into_parent(parent_id, separator, new_parent_id)
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Removes `key` if present; absent keys are a silent no-op.
    pub fn remove(&self, key: &K, txn: &mut Transaction) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let Some(leaf_id) = self.find_leaf(Some(key), Some(&mut *txn), TreeOp::Delete)? else {
            return Ok(());
        };
        let leaf = LeafRef::<K, V>::new(self.frame_of(leaf_id)?);

        let old_size = leaf.size();
        let new_size = leaf.remove(key);
        if new_size != old_size && new_size < leaf.min_size() {
            self.coalesce_or_redistribute(leaf_id, txn)?;
        }
        self.release(TreeOp::Delete, txn)
    }

    /// Restores the size invariant of an underfull node by borrowing from or
    /// merging with a sibling; the root is adjusted instead.
    fn coalesce_or_redistribute(&self, node_id: PageId, txn: &mut Transaction) -> Result<()> {
        let node_frame = self.frame_of(node_id)?;
        let parent_id = node::parent_page_id(node_frame);
        if !parent_id.is_valid() {
            return self.adjust_root(node_id, txn);
        }

        // Peek at the parent to pick a sibling: the right one for the
        // leftmost child, the left one otherwise.
        let parent_frame = self.pool.fetch_page(parent_id)?;
        let parent = InternalRef::<K>::new(parent_frame);
        let index = parent.value_index(node_id).ok_or_else(|| {
            ArborError::TreeCorrupted(format!("node {node_id} missing from parent {parent_id}"))
        })?;
        let sibling_id = if index == 0 {
            parent.value_at(1)
        } else {
            parent.value_at(index - 1)
        };
        self.pool.unpin_page(parent_id, false);

        let sibling_frame = self.pool.fetch_page(sibling_id)?;
        sibling_frame.wlatch();
        txn.add_into_page_set(LatchTarget::Page(sibling_id));

        let node_size = node::size(node_frame);
        let sibling_size = node::size(sibling_frame);
        let max_size = node::max_size(node_frame);

        // Redistribute when both nodes together exceed the effective
        // capacity (max_size - 1); merging would overflow at rest.
        if node_size + sibling_size > max_size - 1 {
            self.redistribute(sibling_id, node_id, index)
        } else {
            self.coalesce(sibling_id, node_id, index, txn)
        }
    }

    /// Moves one entry from `sibling_id` into the underfull `node_id` and
    /// fixes the parent separator. `index` is the node's slot in the parent;
    /// 0 means the sibling is on the right.
    fn redistribute(&self, sibling_id: PageId, node_id: PageId, index: u32) -> Result<()> {
        let node_frame = self.frame_of(node_id)?;
        let sibling_frame = self.frame_of(sibling_id)?;
        let parent_id = node::parent_page_id(node_frame);
        let parent_frame = self.pool.fetch_page(parent_id)?;
        let parent = InternalRef::<K>::new(parent_frame);

        match self.node_type_of(node_frame)? {
            NodeType::Leaf => {
                let sibling = LeafRef::<K, V>::new(sibling_frame);
                let node = LeafRef::<K, V>::new(node_frame);
                if index != 0 {
                    // Borrow the left sibling's last entry; it becomes the
                    // separator between sibling and node.
                    let moved_key = sibling.key_at(sibling.size() - 1);
                    sibling.move_last_to_front_of(&node);
                    parent.set_key_at(index, &moved_key);
                } else {
                    // Borrow the right sibling's first entry; the sibling's
                    // new first key becomes the separator.
                    let new_separator = sibling.key_at(1);
                    sibling.move_first_to_end_of(&node);
                    parent.set_key_at(1, &new_separator);
                }
            }
            NodeType::Internal => {
                let sibling = InternalRef::<K>::new(sibling_frame);
                let node = InternalRef::<K>::new(node_frame);
                if index != 0 {
                    let moved_key = sibling.key_at(sibling.size() - 1);
                    let middle = parent.key_at(index);
                    sibling.move_last_to_front_of(&node, &middle, &self.pool)?;
                    parent.set_key_at(index, &moved_key);
                } else {
                    let new_separator = sibling.key_at(1);
                    let middle = parent.key_at(1);
                    sibling.move_first_to_end_of(&node, &middle, &self.pool)?;
                    parent.set_key_at(1, &new_separator);
                }
            }
        }

        self.pool.unpin_page(parent_id, true);
        debug!(index = %self.index_name, node = %node_id, sibling = %sibling_id, "redistributed");
        Ok(())
    }

    /// Merges `node_id` and `sibling_id` into the left of the two, removes
    /// the absorbed child from the parent, and schedules the absorbed page
    /// for deletion. Recurses into the parent when it underflows.
    fn coalesce(
        &self,
        sibling_id: PageId,
        node_id: PageId,
        index: u32,
        txn: &mut Transaction,
    ) -> Result<()> {
        // The survivor is always the left node, so the parent loses a slot
        // strictly after slot 0 and leaf chain patching stays one-way.
        let (survivor_id, absorbed_id) = if index == 0 {
            (node_id, sibling_id)
        } else {
            (sibling_id, node_id)
        };
        let survivor_frame = self.frame_of(survivor_id)?;
        let absorbed_frame = self.frame_of(absorbed_id)?;

        let parent_id = node::parent_page_id(absorbed_frame);
        let parent_frame = self.pool.fetch_page(parent_id)?;
        let parent = InternalRef::<K>::new(parent_frame);
        let absorbed_slot = parent.value_index(absorbed_id).ok_or_else(|| {
            ArborError::TreeCorrupted(format!(
                "node {absorbed_id} missing from parent {parent_id}"
            ))
        })?;

        match self.node_type_of(absorbed_frame)? {
            NodeType::Leaf => {
                let survivor = LeafRef::<K, V>::new(survivor_frame);
                let absorbed = LeafRef::<K, V>::new(absorbed_frame);
                absorbed.move_all_to(&survivor);
                survivor.set_next_page_id(absorbed.next_page_id());
            }
            NodeType::Internal => {
                let survivor = InternalRef::<K>::new(survivor_frame);
                let absorbed = InternalRef::<K>::new(absorbed_frame);
                let middle = parent.key_at(absorbed_slot);
                absorbed.move_all_to(&survivor, &middle, &self.pool)?;
            }
        }

        parent.remove(absorbed_slot);
        txn.add_into_deleted_page_set(absorbed_id);
        debug!(
            index = %self.index_name,
            survivor = %survivor_id,
            absorbed = %absorbed_id,
            "coalesced"
        );

        let parent_underfull = parent.size() < parent.min_size();
        self.pool.unpin_page(parent_id, true);
        if parent_underfull {
            self.coalesce_or_redistribute(parent_id, txn)?;
        }
        Ok(())
    }

    /// Handles underflow at the root: an empty leaf root empties the tree;
    /// an internal root with a single child hands the root role to that
    /// child. Anything else keeps the root as is (the root is exempt from
    /// the minimum-size bound).
    fn adjust_root(&self, root_id: PageId, txn: &mut Transaction) -> Result<()> {
        let frame = self.frame_of(root_id)?;
        debug_assert!(node::is_root(frame));
        match (self.node_type_of(frame)?, node::size(frame)) {
            (NodeType::Leaf, 0) => {
                self.set_root_page_id(INVALID_PAGE_ID);
                self.update_root_page_id()?;
                txn.add_into_deleted_page_set(root_id);
                debug!(index = %self.index_name, "last key removed, tree emptied");
            }
            (NodeType::Internal, 1) => {
                let new_root_id = InternalRef::<K>::new(frame).value_at(0);
                self.set_root_page_id(new_root_id);
                self.update_root_page_id()?;

                let child_frame = self.pool.fetch_page(new_root_id)?;
                node::set_parent_page_id(child_frame, INVALID_PAGE_ID);
                self.pool.unpin_page(new_root_id, true);

                txn.add_into_deleted_page_set(root_id);
                debug!(index = %self.index_name, root = %new_root_id, "root collapsed");
            }
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // Range iteration
    // =========================================================================

    /// Iterator over the whole tree in ascending key order.
    pub fn iter(&self) -> Result<IndexIterator<K, V>> {
        let leaf = self.find_leaf(None, None, TreeOp::Search)?;
        Ok(IndexIterator::new(Arc::clone(&self.pool), leaf, 0))
    }

    /// Iterator starting at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<IndexIterator<K, V>> {
        let Some(leaf_id) = self.find_leaf(Some(key), None, TreeOp::Search)? else {
            return Ok(IndexIterator::end(Arc::clone(&self.pool)));
        };
        let slot = LeafRef::<K, V>::new(self.frame_of(leaf_id)?).key_index(key);
        Ok(IndexIterator::new(Arc::clone(&self.pool), Some(leaf_id), slot))
    }

    /// The exhausted iterator.
    pub fn end(&self) -> IndexIterator<K, V> {
        IndexIterator::end(Arc::clone(&self.pool))
    }

    // =========================================================================
    // Descent and latch crabbing
    // =========================================================================

    /// Descends to the leaf that would contain `key` (the leftmost leaf when
    /// `key` is None). Returns None when the tree is empty.
    ///
    /// With a transaction, applies latch crabbing: the returned leaf is
    /// latched and pinned through the transaction's page set, and unsafe
    /// ancestors are still held. Without one, performs an unlatched descent
    /// (diagnostics and iterators) and the caller owns the returned leaf's
    /// single pin.
    fn find_leaf(
        &self,
        key: Option<&K>,
        txn: Option<&mut Transaction>,
        op: TreeOp,
    ) -> Result<Option<PageId>> {
        match txn {
            None => self.find_leaf_unlatched(key),
            Some(txn) => self.find_leaf_latched(key, txn, op),
        }
    }

    fn find_leaf_unlatched(&self, key: Option<&K>) -> Result<Option<PageId>> {
        if self.is_empty() {
            return Ok(None);
        }

        let mut page_id = self.root_page_id();
        let mut frame = self.pool.fetch_page(page_id)?;
        loop {
            if self.node_type_of(frame)? == NodeType::Leaf {
                return Ok(Some(page_id));
            }
            let internal = InternalRef::<K>::new(frame);
            let child = match key {
                Some(key) => internal.lookup(key),
                None => internal.value_at(0),
            };
            self.pool.unpin_page(page_id, false);
            page_id = child;
            frame = self.pool.fetch_page(page_id)?;
        }
    }

    fn find_leaf_latched(
        &self,
        key: Option<&K>,
        txn: &mut Transaction,
        op: TreeOp,
    ) -> Result<Option<PageId>> {
        // The virtual root comes first: it pins down root_page_id against
        // concurrent root replacement.
        match op.latch_mode() {
            LatchMode::Shared => self.root_latch.rlatch(),
            LatchMode::Exclusive => self.root_latch.wlatch(),
        }
        txn.add_into_page_set(LatchTarget::VirtualRoot);

        let root = self.root_page_id();
        if !root.is_valid() {
            self.release(op, txn)?;
            return Ok(None);
        }

        let mut page_id = root;
        self.crab_into(op, page_id, txn)?;
        loop {
            let frame = self.frame_of(page_id)?;
            if self.node_type_of(frame)? == NodeType::Leaf {
                return Ok(Some(page_id));
            }
            let internal = InternalRef::<K>::new(frame);
            let child = match key {
                Some(key) => internal.lookup(key),
                None => internal.value_at(0),
            };
            self.crab_into(op, child, txn)?;
            page_id = child;
        }
    }

    /// Fetches and latches `page_id`; if the node is safe for `op`, releases
    /// every ancestor latch first recorded in the page set, then enrolls the
    /// page.
    fn crab_into(&self, op: TreeOp, page_id: PageId, txn: &mut Transaction) -> Result<()> {
        let frame = self.pool.fetch_page(page_id)?;
        match op.latch_mode() {
            LatchMode::Shared => frame.rlatch(),
            LatchMode::Exclusive => frame.wlatch(),
        }
        if Self::is_safe(frame, op) {
            self.release(op, txn)?;
        }
        txn.add_into_page_set(LatchTarget::Page(page_id));
        Ok(())
    }

    /// A node is safe for an operation when the operation cannot propagate
    /// structural changes past it.
    fn is_safe(frame: &BufferFrame, op: TreeOp) -> bool {
        match op {
            TreeOp::Search => true,
            TreeOp::Insert => node::size(frame) < node::max_size(frame) - 1,
            TreeOp::Delete => node::size(frame) > node::min_size(frame),
        }
    }

    /// Releases everything the transaction holds, oldest first: unlatch,
    /// unpin, then perform deferred deletions.
    fn release(&self, op: TreeOp, txn: &mut Transaction) -> Result<()> {
        let mode = op.latch_mode();
        for target in txn.take_page_set() {
            match target {
                LatchTarget::VirtualRoot => match mode {
                    LatchMode::Shared => self.root_latch.runlatch(),
                    LatchMode::Exclusive => self.root_latch.wunlatch(),
                },
                LatchTarget::Page(page_id) => {
                    let frame = self.frame_of(page_id)?;
                    match mode {
                        LatchMode::Shared => frame.runlatch(),
                        LatchMode::Exclusive => frame.wunlatch(),
                    }
                    self.pool.unpin_page(page_id, mode == LatchMode::Exclusive);
                    if txn.remove_from_deleted(page_id) {
                        self.pool.delete_page(page_id);
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Utilities and debug
    // =========================================================================

    /// Looks up the frame of a page this operation already holds pinned.
    fn frame_of(&self, page_id: PageId) -> Result<&BufferFrame> {
        self.pool.frame(page_id).ok_or_else(|| {
            ArborError::TreeCorrupted(format!("pinned page {page_id} not resident"))
        })
    }

    fn node_type_of(&self, frame: &BufferFrame) -> Result<NodeType> {
        node::node_type(frame)
            .ok_or_else(|| ArborError::TreeCorrupted("unknown node type byte".to_string()))
    }

    /// Persists the current root page id under the index name in the header
    /// page. Called on every root change, inside the virtual-root critical
    /// section.
    fn update_root_page_id(&self) -> Result<()> {
        let frame = self.pool.fetch_page(HEADER_PAGE_ID)?;
        let result = HeaderRef::new(frame).set_root(&self.index_name, self.root_page_id());
        self.pool.unpin_page(HEADER_PAGE_ID, true);
        result
    }

    /// Walks the whole tree (unlatched) checking structural invariants:
    /// uniform leaf depth, size bounds, parent links, separator ordering,
    /// and the leaf chain. Returns aggregate statistics.
    ///
    /// Diagnostic only; run at quiescence.
    pub fn validate(&self) -> Result<TreeStats> {
        let root_id = self.root_page_id();
        if !root_id.is_valid() {
            return Ok(TreeStats::default());
        }

        let mut walk = ValidateWalk {
            leaf_depth: None,
            key_count: 0,
            leaf_count: 0,
        };
        self.validate_node(root_id, INVALID_PAGE_ID, 1, None, None, &mut walk)?;
        self.validate_leaf_chain(&walk)?;

        Ok(TreeStats {
            height: walk.leaf_depth.unwrap_or(0),
            key_count: walk.key_count,
            leaf_count: walk.leaf_count,
        })
    }

    fn validate_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        depth: u32,
        lower: Option<K>,
        upper: Option<K>,
        walk: &mut ValidateWalk,
    ) -> Result<()> {
        let frame = self.pool.fetch_page(page_id)?;
        let result = self.validate_node_inner(
            frame,
            page_id,
            expected_parent,
            depth,
            lower,
            upper,
            walk,
        );
        self.pool.unpin_page(page_id, false);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_node_inner(
        &self,
        frame: &BufferFrame,
        page_id: PageId,
        expected_parent: PageId,
        depth: u32,
        lower: Option<K>,
        upper: Option<K>,
        walk: &mut ValidateWalk,
    ) -> Result<()> {
        let corrupt = |what: String| ArborError::TreeCorrupted(what);

        if node::parent_page_id(frame) != expected_parent {
            return Err(corrupt(format!(
                "{page_id}: parent pointer {} != {expected_parent}",
                node::parent_page_id(frame)
            )));
        }
        let is_root = !expected_parent.is_valid();

        match self.node_type_of(frame)? {
            NodeType::Leaf => {
                let leaf = LeafRef::<K, V>::new(frame);
                let n = leaf.size();
                if !is_root && (n < leaf.min_size() || n > leaf.max_size()) {
                    return Err(corrupt(format!("{page_id}: leaf size {n} out of bounds")));
                }
                for i in 0..n {
                    let k = leaf.key_at(i);
                    if i > 0 && leaf.key_at(i - 1) >= k {
                        return Err(corrupt(format!("{page_id}: leaf keys out of order")));
                    }
                    if lower.is_some_and(|b| k < b) || upper.is_some_and(|b| k >= b) {
                        return Err(corrupt(format!(
                            "{page_id}: key {k:?} outside separator range"
                        )));
                    }
                }
                walk.key_count += n as usize;
                walk.leaf_count += 1;
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(d) if d != depth => {
                        return Err(corrupt(format!(
                            "{page_id}: leaf at depth {depth}, expected {d}"
                        )))
                    }
                    _ => {}
                }
            }
            NodeType::Internal => {
                let internal = InternalRef::<K>::new(frame);
                let n = internal.size();
                if is_root {
                    if n < 2 {
                        return Err(corrupt(format!("{page_id}: internal root size {n} < 2")));
                    }
                } else if n < internal.min_size() || n > internal.max_size() {
                    return Err(corrupt(format!(
                        "{page_id}: internal size {n} out of bounds"
                    )));
                }
                for i in 2..n {
                    if internal.key_at(i - 1) >= internal.key_at(i) {
                        return Err(corrupt(format!("{page_id}: separators out of order")));
                    }
                }
                for i in 0..n {
                    let child = internal.value_at(i);
                    let child_lower = if i == 0 { lower } else { Some(internal.key_at(i)) };
                    let child_upper = if i + 1 < n {
                        Some(internal.key_at(i + 1))
                    } else {
                        upper
                    };
                    self.validate_node(child, page_id, depth + 1, child_lower, child_upper, walk)?;
                }
            }
        }
        Ok(())
    }

    /// Follows next_page_id from the leftmost leaf: every leaf must be
    /// visited exactly once, keys strictly ascending across the chain.
    fn validate_leaf_chain(&self, walk: &ValidateWalk) -> Result<()> {
        let corrupt = |what: &str| ArborError::TreeCorrupted(what.to_string());

        let Some(mut page_id) = self.find_leaf(None, None, TreeOp::Search)? else {
            return Ok(());
        };
        // find_leaf pinned the leftmost leaf; the loop below unpins each
        // link as it hops.
        let mut chain_leaves = 0usize;
        let mut chain_keys = 0usize;
        let mut prev_key: Option<K> = None;

        loop {
            let frame = self.frame_of(page_id)?;
            let leaf = LeafRef::<K, V>::new(frame);
            chain_leaves += 1;
            for i in 0..leaf.size() {
                let k = leaf.key_at(i);
                if prev_key.is_some_and(|p| p >= k) {
                    self.pool.unpin_page(page_id, false);
                    return Err(corrupt("leaf chain keys out of order"));
                }
                prev_key = Some(k);
                chain_keys += 1;
            }
            let next = leaf.next_page_id();
            self.pool.unpin_page(page_id, false);

            if !next.is_valid() {
                break;
            }
            if chain_leaves > walk.leaf_count {
                return Err(corrupt("leaf chain longer than leaf count (cycle?)"));
            }
            self.pool.fetch_page(next)?;
            page_id = next;
        }

        if chain_leaves != walk.leaf_count {
            return Err(corrupt("leaf chain misses leaves"));
        }
        if chain_keys != walk.key_count {
            return Err(corrupt("leaf chain misses keys"));
        }
        Ok(())
    }
}

struct ValidateWalk {
    leaf_depth: Option<u32>,
    key_count: usize,
    leaf_count: usize,
}
