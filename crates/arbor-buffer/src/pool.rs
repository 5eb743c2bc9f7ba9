//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::{ClockReplacer, Replacer};
use arbor_common::page::{PageId, PAGE_SIZE};
use arbor_common::{ArborError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use sysinfo::System;
use tracing::debug;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

impl From<&arbor_common::StorageConfig> for BufferPoolConfig {
    fn from(config: &arbor_common::StorageConfig) -> Self {
        Self {
            num_frames: config.buffer_pool_pages,
        }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping (lock-free page table)
/// - Free frame list for new pages
/// - Clock replacement for eviction, with dirty victims written back
///   through the disk manager
/// - Pin counting for concurrent access
///
/// Page ids are allocated by the pool. Page 0 is reserved for the storage
/// directory and is never handed out by `new_page`; deleted page ids are
/// recycled.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping (lock-free reads).
    page_table: PageTable,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: ClockReplacer,
    /// Backing storage for page faults and dirty write-back.
    disk: Arc<DiskManager>,
    /// Next page id to allocate.
    next_page_id: AtomicU32,
    /// Page ids released by delete_page, available for reuse.
    free_page_ids: Mutex<Vec<PageId>>,
    /// Serializes page-fault handling so one page never lands in two frames.
    fault_lock: Mutex<()>,
}

impl BufferPool {
    /// Creates a new buffer pool over the given disk manager.
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Result<Self> {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        // Reserve page 0 for the storage directory so it can always be fetched.
        if disk.num_pages() == 0 {
            disk.allocate_page()?;
        }
        let next_page_id = disk.num_pages().max(1);

        Ok(Self {
            config,
            frames,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
            disk,
            next_page_id: AtomicU32::new(next_page_id),
            free_page_ids: Mutex::new(Vec::new()),
            fault_lock: Mutex::new(()),
        })
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Result<Self> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4; // 25% of available RAM
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferPoolConfig { num_frames }, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Checks if a page is resident in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Returns the frame holding a resident page without pinning it.
    ///
    /// Intended for callers that already hold a pin on the page (for example
    /// through a transaction's page set) and need to reach the frame again;
    /// the frame cannot be evicted from under them.
    #[inline]
    pub fn frame(&self, page_id: PageId) -> Option<&BufferFrame> {
        let frame_id = self.page_table.get(page_id)?;
        Some(&self.frames[frame_id.0 as usize])
    }

    /// Allocates a frame, evicting a victim if no frame is free.
    ///
    /// Dirty victims are written back to disk before the frame is reused.
    fn allocate_frame(&self) -> Result<FrameId> {
        {
            let mut free_list = self.free_list.lock();
            if let Some(frame_id) = free_list.pop() {
                return Ok(frame_id);
            }
        }

        let victim_id = self
            .replacer
            .evict(&|fid| self.frames[fid.0 as usize].pin_count() == 0);

        if let Some(victim_id) = victim_id {
            let frame = &self.frames[victim_id.0 as usize];

            if let Some(old_page_id) = frame.page_id() {
                if frame.is_dirty() {
                    debug!(page_id = %old_page_id, "writing back evicted dirty page");
                    let data = frame.read_data();
                    self.disk.write_page(old_page_id, &data)?;
                }
                self.page_table.remove(old_page_id);
            }

            return Ok(victim_id);
        }

        Err(ArborError::BufferPoolFull)
    }

    /// Allocates a fresh page and pins it.
    ///
    /// Returns the new page id and its zeroed frame. Fails with
    /// `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<(PageId, &BufferFrame)> {
        let page_id = self
            .free_page_ids
            .lock()
            .pop()
            .unwrap_or_else(|| PageId::new(self.next_page_id.fetch_add(1, Ordering::AcqRel)));

        let frame_id = match self.allocate_frame() {
            Ok(frame_id) => frame_id,
            Err(e) => {
                // Return the id so it is not leaked.
                self.free_page_ids.lock().push(page_id);
                return Err(e);
            }
        };

        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);

        Ok((page_id, frame))
    }

    /// Fetches a page, pinning it.
    ///
    /// Resident pages are returned directly; misses fault the page in from
    /// disk, evicting a victim if necessary.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&BufferFrame> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            return Ok(frame);
        }

        // Page fault. Serialize so two concurrent fetches of the same page
        // cannot land it in two frames.
        let _guard = self.fault_lock.lock();

        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            return Ok(frame);
        }

        let data = self.disk.read_page(page_id)?;
        let frame_id = self.allocate_frame()?;

        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.copy_from(&data);
        frame.set_page_id(Some(page_id));
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);

        Ok(frame)
    }

    /// Unpins a page in the buffer pool.
    ///
    /// Once the pin count reaches 0 the page becomes evictable.
    #[inline]
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if is_dirty {
                frame.set_dirty(true);
            }

            frame.unpin();
            return true;
        }
        false
    }

    /// Flushes a page to disk if it is resident and dirty.
    ///
    /// Returns true if the page was written.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            if frame.is_dirty() {
                let data = frame.read_data();
                self.disk.write_page(page_id, &data)?;
                frame.set_dirty(false);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flushes all resident dirty pages to disk.
    ///
    /// Returns the number of pages written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut dirty_pages = Vec::new();
        self.page_table.for_each(|page_id, frame_id| {
            dirty_pages.push((page_id, frame_id));
            true
        });

        let mut flushed = 0;
        for (page_id, frame_id) in dirty_pages {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.disk.write_page(page_id, &data)?;
                frame.set_dirty(false);
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Deletes a page from the buffer pool and recycles its id.
    ///
    /// Returns false if the page is pinned or not resident.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        if let Some(frame_id) = self.page_table.remove(page_id) {
            let frame = &self.frames[frame_id.0 as usize];

            // Cannot delete a pinned page - re-insert if pinned
            if frame.is_pinned() {
                self.page_table.insert(page_id, frame_id);
                return false;
            }

            self.replacer.remove(frame_id);
            frame.reset();
            self.free_list.lock().push(frame_id);
            self.free_page_ids.lock().push(page_id);

            debug!(page_id = %page_id, "deleted page");
            return true;
        }
        false
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        self.page_table.for_each(|_, frame_id| {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_count += 1;
            }
            if frame.is_dirty() {
                dirty_count += 1;
            }
            true
        });

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: self.page_table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManagerConfig;
    use tempfile::tempdir;

    fn create_test_pool(num_frames: usize) -> (BufferPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let pool = BufferPool::new(BufferPoolConfig { num_frames }, disk).unwrap();
        (pool, dir)
    }

    #[test]
    fn test_buffer_pool_new() {
        let (pool, _dir) = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn test_buffer_pool_new_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();

        // Page 0 is reserved for the storage directory.
        assert!(page_id.as_u32() >= 1);
        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.page_count(), 1);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_fetch_resident() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        let frame = pool.fetch_page(page_id).unwrap();
        assert_eq!(frame.page_id(), Some(page_id));
        assert!(frame.is_pinned());
    }

    #[test]
    fn test_buffer_pool_fetch_nonexistent() {
        let (pool, _dir) = create_test_pool(10);

        let result = pool.fetch_page(PageId::new(77));
        assert!(matches!(result, Err(ArborError::PageNotFound { .. })));
    }

    #[test]
    fn test_buffer_pool_fetch_header_page() {
        let (pool, _dir) = create_test_pool(10);

        // The reserved directory page is always fetchable.
        let frame = pool.fetch_page(PageId::new(0)).unwrap();
        assert_eq!(frame.page_id(), Some(PageId::new(0)));
        pool.unpin_page(PageId::new(0), false);
    }

    #[test]
    fn test_buffer_pool_unpin() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();
        assert!(frame.is_pinned());

        pool.unpin_page(page_id, false);
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_buffer_pool_dirty_tracking() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, true);

        let frame = pool.fetch_page(page_id).unwrap();
        assert!(frame.is_dirty());
        pool.unpin_page(page_id, false);
    }

    #[test]
    fn test_buffer_pool_eviction_roundtrip() {
        let (pool, _dir) = create_test_pool(3);

        // Fill the pool with dirty pages carrying a marker byte.
        let mut ids = Vec::new();
        for i in 0..3 {
            let (page_id, frame) = pool.new_page().unwrap();
            frame.write_data()[0] = 0xA0 + i as u8;
            ids.push(page_id);
            pool.unpin_page(page_id, true);
        }

        assert_eq!(pool.free_count(), 0);

        // One more page forces an eviction with write-back.
        let (extra, _) = pool.new_page().unwrap();
        pool.unpin_page(extra, true);

        // All original pages are still readable, evicted or not.
        for (i, &page_id) in ids.iter().enumerate() {
            let frame = pool.fetch_page(page_id).unwrap();
            assert_eq!(frame.read_data()[0], 0xA0 + i as u8);
            pool.unpin_page(page_id, false);
        }
    }

    #[test]
    fn test_buffer_pool_full_all_pinned() {
        let (pool, _dir) = create_test_pool(2);

        pool.new_page().unwrap();
        pool.new_page().unwrap();

        let result = pool.new_page();
        assert!(matches!(result, Err(ArborError::BufferPoolFull)));
    }

    #[test]
    fn test_buffer_pool_delete_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);

        assert!(pool.contains(page_id));
        assert!(pool.delete_page(page_id));
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_buffer_pool_delete_pinned_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();

        assert!(!pool.delete_page(page_id));
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_recycles_deleted_page_ids() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();
        pool.unpin_page(page_id, false);
        pool.delete_page(page_id);

        let (recycled, _) = pool.new_page().unwrap();
        assert_eq!(recycled, page_id);
        pool.unpin_page(recycled, false);
    }

    #[test]
    fn test_buffer_pool_flush_page() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, frame) = pool.new_page().unwrap();
        frame.write_data()[0] = 0x5A;
        pool.unpin_page(page_id, true);

        assert!(pool.flush_page(page_id).unwrap());
        // No longer dirty after flush.
        assert!(!pool.flush_page(page_id).unwrap());
    }

    #[test]
    fn test_buffer_pool_flush_all() {
        let (pool, _dir) = create_test_pool(10);

        for _ in 0..5 {
            let (page_id, _) = pool.new_page().unwrap();
            pool.unpin_page(page_id, true);
        }

        assert_eq!(pool.flush_all().unwrap(), 5);
        assert_eq!(pool.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_buffer_pool_frame_lookup() {
        let (pool, _dir) = create_test_pool(10);

        let (page_id, _) = pool.new_page().unwrap();

        let frame = pool.frame(page_id).unwrap();
        assert_eq!(frame.page_id(), Some(page_id));
        // frame() does not pin.
        assert_eq!(frame.pin_count(), 1);

        assert!(pool.frame(PageId::new(999)).is_none());
        pool.unpin_page(page_id, false);
    }

    #[test]
    fn test_buffer_pool_stats() {
        let (pool, _dir) = create_test_pool(10);

        let mut ids = Vec::new();
        for i in 0..5 {
            let (page_id, _) = pool.new_page().unwrap();
            ids.push(page_id);
            if i % 2 == 0 {
                pool.unpin_page(page_id, true); // dirty, unpinned
            }
        }

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.free_frames, 5);
        assert_eq!(stats.used_frames, 5);
        assert_eq!(stats.pinned_frames, 2);
        assert_eq!(stats.dirty_frames, 3);
    }

    #[test]
    fn test_buffer_pool_persistence_across_pools() {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };
        let page_id;

        {
            let disk = Arc::new(DiskManager::new(config.clone()).unwrap());
            let pool = BufferPool::new(BufferPoolConfig { num_frames: 4 }, disk).unwrap();
            let (id, frame) = pool.new_page().unwrap();
            frame.write_data()[7] = 0x42;
            pool.unpin_page(id, true);
            pool.flush_all().unwrap();
            page_id = id;
        }

        {
            let disk = Arc::new(DiskManager::new(config).unwrap());
            let pool = BufferPool::new(BufferPoolConfig { num_frames: 4 }, disk).unwrap();
            let frame = pool.fetch_page(page_id).unwrap();
            assert_eq!(frame.read_data()[7], 0x42);
            pool.unpin_page(page_id, false);
        }
    }
}
