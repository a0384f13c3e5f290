//! Memory-related types

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

/// Base page shift
pub const PAGE_SHIFT: usize = 12;

/// Base page size in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of 64-bit words in one page frame
pub const WORDS_PER_FRAME: usize = PAGE_SIZE / core::mem::size_of::<u64>();

bitflags! {
    /// Per-page attribute bits synchronized from hardware mappings
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageAttrs: u32 {
        /// Some mapping of the page was accessed
        const REFERENCED = 1 << 0;
        /// Some mapping of the page was written
        const MODIFIED = 1 << 1;
    }
}

/// Metadata kept by the physical allocator for each managed page.
#[derive(Debug)]
pub struct PageMeta {
    attrs: AtomicU32,
}

impl PageMeta {
    /// Create metadata with no attributes set
    pub const fn new() -> Self {
        Self { attrs: AtomicU32::new(0) }
    }

    /// Current attribute bits
    pub fn attrs(&self) -> PageAttrs {
        PageAttrs::from_bits_truncate(self.attrs.load(Ordering::Acquire))
    }

    /// Set attribute bits
    pub fn set_attrs(&self, bits: PageAttrs) {
        if !bits.is_empty() {
            self.attrs.fetch_or(bits.bits(), Ordering::AcqRel);
        }
    }

    /// Clear attribute bits, returning the bits that were set before
    pub fn clear_attrs(&self, bits: PageAttrs) -> PageAttrs {
        let old = self.attrs.fetch_and(!bits.bits(), Ordering::AcqRel);
        PageAttrs::from_bits_truncate(old) & bits
    }
}

impl Default for PageMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// One physical page frame, viewed as 64-bit words.
///
/// Page-table pages are accessed word by word with atomic operations, so the
/// frame is expressed as atomics from the start.
#[repr(C, align(4096))]
pub struct Frame {
    words: [AtomicU64; WORDS_PER_FRAME],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Frame>(), PAGE_SIZE);
static_assertions::const_assert_eq!(core::mem::align_of::<Frame>(), PAGE_SIZE);

impl Frame {
    /// A zero-filled frame
    pub const fn zeroed() -> Self {
        Self { words: [const { AtomicU64::new(0) }; WORDS_PER_FRAME] }
    }

    /// Access one word of the frame
    pub fn word(&self, index: usize) -> &AtomicU64 {
        &self.words[index]
    }

    /// All words of the frame
    pub fn words(&self) -> &[AtomicU64; WORDS_PER_FRAME] {
        &self.words
    }

    /// Zero every word
    pub fn zero(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Copy the contents of `src` into this frame
    pub fn copy_from(&self, src: &Frame) {
        for (d, s) in self.words.iter().zip(src.words.iter()) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::zeroed()
    }
}
