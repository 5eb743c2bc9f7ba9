//! Buffer frame management.

use arbor_common::page::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{RawRwLock, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Invalid frame ID.
    pub const INVALID: FrameId = FrameId(u32::MAX);

    /// Returns true if this is a valid frame ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// Reader/writer latch for a page.
///
/// Unlike an RAII lock this exposes explicit acquire/release pairs, because
/// B+ tree latch crabbing acquires latches during a descent and releases them
/// from a transaction's page set long after the acquiring stack frame has
/// returned. Callers must pair every `rlatch` with a `runlatch` and every
/// `wlatch` with a `wunlatch` on the same thread schedule they would pair a
/// lock guard.
pub struct PageLatch {
    raw: RawRwLock,
}

impl PageLatch {
    /// Creates an unlocked latch.
    pub const fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
        }
    }

    /// Acquires the latch in shared mode, blocking until available.
    #[inline]
    pub fn rlatch(&self) {
        self.raw.lock_shared();
    }

    /// Releases a shared acquisition.
    #[inline]
    pub fn runlatch(&self) {
        // Safety: paired with a prior rlatch() by the latch discipline.
        unsafe { self.raw.unlock_shared() }
    }

    /// Acquires the latch in exclusive mode, blocking until available.
    #[inline]
    pub fn wlatch(&self) {
        self.raw.lock_exclusive();
    }

    /// Releases an exclusive acquisition.
    #[inline]
    pub fn wunlatch(&self) {
        // Safety: paired with a prior wlatch() by the latch discipline.
        unsafe { self.raw.unlock_exclusive() }
    }

    /// Attempts an exclusive acquisition without blocking.
    #[inline]
    pub fn try_wlatch(&self) -> bool {
        self.raw.try_lock_exclusive()
    }
}

impl Default for PageLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PageLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLatch").finish_non_exhaustive()
    }
}

/// A frame in the buffer pool holding a single page.
///
/// Each frame contains:
/// - The actual page data (PAGE_SIZE bytes)
/// - Metadata for buffer management (pin count, dirty flag, etc.)
/// - The page latch used by index latch crabbing
pub struct BufferFrame {
    /// Frame identifier.
    frame_id: FrameId,
    /// The page currently stored in this frame (INVALID_PAGE_ID = none).
    page_id: AtomicU32,
    /// Page data buffer.
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    /// Page latch for index-level crabbing.
    latch: PageLatch,
    /// Number of users currently accessing this page.
    pin_count: AtomicU32,
    /// Whether the page has been modified.
    is_dirty: AtomicBool,
    /// Reference bit for clock replacement algorithm.
    reference_bit: AtomicBool,
}

impl BufferFrame {
    /// Creates a new empty buffer frame.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU32::new(INVALID_PAGE_ID.0),
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
            latch: PageLatch::new(),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            reference_bit: AtomicBool::new(false),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID currently stored in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let raw = self.page_id.load(Ordering::Acquire);
        if raw == INVALID_PAGE_ID.0 {
            None
        } else {
            Some(PageId(raw))
        }
    }

    /// Sets the page ID for this frame.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<PageId>) {
        let raw = page_id.unwrap_or(INVALID_PAGE_ID).0;
        self.page_id.store(raw, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the previous pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        let prev = self.pin_count.fetch_add(1, Ordering::AcqRel);
        self.reference_bit.store(true, Ordering::Relaxed);
        prev
    }

    /// Decrements the pin count, returning the new pin count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow protection: restore to 0
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Marks this frame as dirty.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Returns the reference bit value.
    #[inline]
    pub fn reference_bit(&self) -> bool {
        self.reference_bit.load(Ordering::Relaxed)
    }

    /// Sets the reference bit.
    #[inline]
    pub fn set_reference_bit(&self, value: bool) {
        self.reference_bit.store(value, Ordering::Relaxed);
    }

    /// Returns true if this frame is empty (no page loaded).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_id.load(Ordering::Acquire) == INVALID_PAGE_ID.0
    }

    /// Returns the page latch of this frame.
    #[inline]
    pub fn latch(&self) -> &PageLatch {
        &self.latch
    }

    /// Acquires the page latch in shared mode.
    #[inline]
    pub fn rlatch(&self) {
        self.latch.rlatch();
    }

    /// Releases a shared page latch acquisition.
    #[inline]
    pub fn runlatch(&self) {
        self.latch.runlatch();
    }

    /// Acquires the page latch in exclusive mode.
    #[inline]
    pub fn wlatch(&self) {
        self.latch.wlatch();
    }

    /// Releases an exclusive page latch acquisition.
    #[inline]
    pub fn wunlatch(&self) {
        self.latch.wunlatch();
    }

    /// Reads the page data.
    #[inline]
    pub fn read_data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.read()
    }

    /// Writes to the page data.
    #[inline]
    pub fn write_data(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.data.write()
    }

    /// Copies data into the frame.
    #[inline]
    pub fn copy_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let len = src.len().min(PAGE_SIZE);
        data[..len].copy_from_slice(&src[..len]);
    }

    /// Copies data out of the frame.
    #[inline]
    pub fn copy_to(&self, dst: &mut [u8]) {
        let data = self.data.read();
        let len = dst.len().min(PAGE_SIZE);
        dst[..len].copy_from_slice(&data[..len]);
    }

    /// Resets the frame to empty state.
    ///
    /// The caller must hold no pin and no latch on the frame.
    #[inline]
    pub fn reset(&self) {
        self.page_id.store(INVALID_PAGE_ID.0, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.reference_bit.store(false, Ordering::Relaxed);
        let mut data = self.data.write();
        data.fill(0);
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .field("reference_bit", &self.reference_bit())
            .finish()
    }
}
