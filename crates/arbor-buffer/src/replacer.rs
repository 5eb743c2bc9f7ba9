//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Trait for page replacement algorithms.
///
/// The replacer tracks which frames are occupied and picks eviction victims.
/// Pin counts are owned by the frames themselves, so `evict` takes a
/// predicate that tells the replacer whether a candidate may be evicted.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed and is in use.
    fn record_access(&self, frame_id: FrameId);

    /// Selects a victim frame for eviction.
    ///
    /// Only frames for which `can_evict` returns true are considered.
    /// Returns None if no frame qualifies. The victim is removed from the
    /// replacer's working set.
    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId>;

    /// Removes a frame from the replacer's working set.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of frames in the working set.
    fn size(&self) -> usize;
}

/// Clock replacement algorithm implementation.
///
/// Uses atomic reference bits for lock-free access recording. Only the clock
/// hand is protected by a mutex.
pub struct ClockReplacer {
    /// Number of frames.
    num_frames: usize,
    /// Reference bits for each frame (atomic for lock-free access).
    reference_bits: Vec<AtomicBool>,
    /// Whether each frame currently holds a page.
    in_use: Vec<AtomicBool>,
    /// Current clock hand position.
    clock_hand: Mutex<usize>,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            reference_bits: (0..num_frames).map(|_| AtomicBool::new(false)).collect(),
            in_use: (0..num_frames).map(|_| AtomicBool::new(false)).collect(),
            clock_hand: Mutex::new(0),
        }
    }

    /// Returns the total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.num_frames
    }
}

impl Replacer for ClockReplacer {
    #[inline]
    fn record_access(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.reference_bits[idx].store(true, Ordering::Relaxed);
            self.in_use[idx].store(true, Ordering::Relaxed);
        }
    }

    fn evict(&self, can_evict: &dyn Fn(FrameId) -> bool) -> Option<FrameId> {
        let mut hand = self.clock_hand.lock();

        // Two full rotations: the first may only clear reference bits.
        for _ in 0..(self.num_frames * 2) {
            let idx = *hand;
            *hand = (*hand + 1) % self.num_frames;

            if !self.in_use[idx].load(Ordering::Relaxed) {
                continue;
            }
            if self.reference_bits[idx].swap(false, Ordering::Relaxed) {
                continue;
            }
            let frame_id = FrameId(idx as u32);
            if can_evict(frame_id) {
                self.in_use[idx].store(false, Ordering::Relaxed);
                return Some(frame_id);
            }
        }
        None
    }

    #[inline]
    fn remove(&self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if idx < self.num_frames {
            self.in_use[idx].store(false, Ordering::Relaxed);
            self.reference_bits[idx].store(false, Ordering::Relaxed);
        }
    }

    fn size(&self) -> usize {
        self.in_use
            .iter()
            .filter(|b| b.load(Ordering::Relaxed))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_replacer_empty() {
        let replacer = ClockReplacer::new(4);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(&|_| true), None);
    }

    #[test]
    fn test_clock_replacer_evicts_accessed_frame() {
        let replacer = ClockReplacer::new(4);
        replacer.record_access(FrameId(1));

        // First rotation clears the reference bit, second evicts.
        assert_eq!(replacer.evict(&|_| true), Some(FrameId(1)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_respects_predicate() {
        let replacer = ClockReplacer::new(4);
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));

        // Frame 0 is "pinned": only frame 1 qualifies.
        let victim = replacer.evict(&|fid| fid != FrameId(0));
        assert_eq!(victim, Some(FrameId(1)));

        // Frame 0 still cannot be evicted.
        assert_eq!(replacer.evict(&|fid| fid != FrameId(0)), None);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_clock_replacer_second_chance() {
        let replacer = ClockReplacer::new(4);
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));

        // Evict once; the survivor keeps its place in the working set.
        let first = replacer.evict(&|_| true).unwrap();
        replacer.record_access(first); // bring it back
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_clock_replacer_remove() {
        let replacer = ClockReplacer::new(4);
        replacer.record_access(FrameId(2));
        assert_eq!(replacer.size(), 1);

        replacer.remove(FrameId(2));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(&|_| true), None);
    }

    #[test]
    fn test_clock_replacer_capacity() {
        let replacer = ClockReplacer::new(16);
        assert_eq!(replacer.capacity(), 16);
    }

    #[test]
    fn test_clock_replacer_out_of_range_access_ignored() {
        let replacer = ClockReplacer::new(2);
        replacer.record_access(FrameId(100));
        assert_eq!(replacer.size(), 0);
    }
}
