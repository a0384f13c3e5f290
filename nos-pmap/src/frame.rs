//! In-memory physical frame arena
//!
//! A contiguous run of page frames handed out one page at a time from a
//! LIFO free list. Every frame in the arena is a managed page with its own
//! [`PageMeta`]; frames outside the arena are treated as device memory.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use nos_api::memory::{Frame, FrameAllocator, PageMeta};
use spin::Mutex;

use crate::addr::PageNum;

/// Frame arena statistics.
///
/// Tracks usage and capacity information for the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total number of frames in the arena.
    pub total_frames: usize,
    /// Number of frames currently in use.
    pub used_frames: usize,
    /// Highest number of frames in use at once.
    pub peak_frames: usize,
}

/// A fixed pool of physical frames
pub struct FrameArena {
    /// First frame number of the arena
    base: PageNum,
    /// Frame contents
    frames: Box<[Frame]>,
    /// Per-frame metadata
    meta: Box<[PageMeta]>,
    /// Allocation state per frame, for double-free detection
    in_use: Box<[AtomicBool]>,
    /// Free list of available frames
    free_list: Mutex<Vec<PageNum>>,
    /// Number of used frames
    used: AtomicUsize,
    /// High-water mark of used frames
    peak: AtomicUsize,
}

impl FrameArena {
    /// Create an arena of `count` zeroed frames starting at frame `base`
    pub fn new(base: PageNum, count: usize) -> Self {
        let frames: Vec<Frame> = (0..count).map(|_| Frame::zeroed()).collect();
        let meta: Vec<PageMeta> = (0..count).map(|_| PageMeta::new()).collect();
        let in_use: Vec<AtomicBool> = (0..count).map(|_| AtomicBool::new(false)).collect();
        // Lowest frames are handed out first
        let free_list: Vec<PageNum> = (base..base + count).rev().collect();

        Self {
            base,
            frames: frames.into_boxed_slice(),
            meta: meta.into_boxed_slice(),
            in_use: in_use.into_boxed_slice(),
            free_list: Mutex::new(free_list),
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// First frame number of the arena
    pub fn base(&self) -> PageNum {
        self.base
    }

    /// Number of frames in the arena
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Whether `pfn` belongs to the arena
    pub fn contains(&self, pfn: PageNum) -> bool {
        self.slot(pfn).is_some()
    }

    /// Whether `pfn` is currently handed out
    pub fn is_allocated(&self, pfn: PageNum) -> bool {
        self.slot(pfn).is_some_and(|i| self.in_use[i].load(Ordering::Acquire))
    }

    /// Get arena statistics
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            total_frames: self.capacity(),
            used_frames: self.used.load(Ordering::Acquire),
            peak_frames: self.peak.load(Ordering::Acquire),
        }
    }

    fn slot(&self, pfn: PageNum) -> Option<usize> {
        let index = pfn.checked_sub(self.base)?;
        (index < self.frames.len()).then_some(index)
    }
}

impl FrameAllocator for FrameArena {
    fn alloc_zeroed_page(&self) -> Option<PageNum> {
        let pfn = self.free_list.lock().pop()?;
        let index = pfn - self.base;
        if self.in_use[index].swap(true, Ordering::AcqRel) {
            fatal!("frame arena: free frame {:#x} already in use", pfn);
        }
        self.frames[index].zero();
        let used = self.used.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(used, Ordering::AcqRel);
        Some(pfn)
    }

    fn free_page(&self, pfn: PageNum) {
        let Some(index) = self.slot(pfn) else {
            fatal!("frame arena: free of foreign frame {:#x}", pfn);
        };
        if !self.in_use[index].swap(false, Ordering::AcqRel) {
            fatal!("frame arena: double free of frame {:#x}", pfn);
        }
        self.meta[index].clear_attrs(nos_api::memory::PageAttrs::all());
        self.used.fetch_sub(1, Ordering::AcqRel);
        self.free_list.lock().push(pfn);
    }

    fn page_meta(&self, pfn: PageNum) -> Option<&PageMeta> {
        self.slot(pfn).map(|i| &self.meta[i])
    }

    fn frame(&self, pfn: PageNum) -> Option<&Frame> {
        self.slot(pfn).map(|i| &self.frames[i])
    }

    fn allocated_pages(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}
