//! Page table entries
//!
//! Entries use the x86-64 bit layout. Two software bits mark wired mappings
//! and mappings tracked in a reverse map.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use nos_api::memory::PageAttrs;

use crate::addr::{addr_to_pfn, PageNum};

bitflags! {
    /// Page table entry bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Entry is present
        const VALID = 1 << 0;
        /// Writes allowed
        const WRITABLE = 1 << 1;
        /// Accessible from user mode
        const USER = 1 << 2;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled
        const NO_CACHE = 1 << 4;
        /// Set by hardware on access
        const ACCESSED = 1 << 5;
        /// Set by hardware on write
        const DIRTY = 1 << 6;
        /// Large-page leaf at an intermediate level
        const LARGE = 1 << 7;
        /// Survives address space switches
        const GLOBAL = 1 << 8;
        /// Software: mapping is wired
        const WIRED = 1 << 9;
        /// Software: mapping has a reverse-map entry
        const PVLIST = 1 << 10;
        /// Instruction fetch forbidden
        const NO_EXEC = 1 << 63;
    }
}

/// Physical frame bits of a base-page entry
pub const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Physical frame bits of a large-page entry
pub const LARGE_FRAME_MASK: u64 = 0x000f_ffff_ffe0_0000;

/// Bits that describe access rights
pub const PROTECTION_MASK: PteFlags = PteFlags::WRITABLE.union(PteFlags::NO_EXEC);

impl PteFlags {
    /// Entry bits that record the given page attributes
    pub fn from_page_attrs(attrs: PageAttrs) -> Self {
        let mut bits = PteFlags::empty();
        if attrs.contains(PageAttrs::REFERENCED) {
            bits |= PteFlags::ACCESSED;
        }
        if attrs.contains(PageAttrs::MODIFIED) {
            bits |= PteFlags::DIRTY;
        }
        bits
    }
}

/// A page table entry value
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(u64);

static_assertions::assert_eq_size!(Pte, u64);

impl Pte {
    /// The invalid entry
    pub const EMPTY: Pte = Pte(0);

    /// Entry mapping the frame at `pa` with `flags`
    pub const fn new(pa: usize, flags: PteFlags) -> Self {
        Pte((pa as u64 & FRAME_MASK) | flags.bits())
    }

    /// Entry from its raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Pte(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Flag bits
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether `flags` are all set
    pub const fn has(self, flags: PteFlags) -> bool {
        self.0 & flags.bits() == flags.bits()
    }

    /// Entry is present
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.has(PteFlags::VALID)
    }

    /// Entry is a large-page leaf
    #[inline]
    pub const fn is_large(self) -> bool {
        self.has(PteFlags::LARGE)
    }

    /// Mapping is wired
    #[inline]
    pub const fn is_wired(self) -> bool {
        self.has(PteFlags::WIRED)
    }

    /// Mapping has a reverse-map entry
    #[inline]
    pub const fn is_managed(self) -> bool {
        self.has(PteFlags::PVLIST)
    }

    /// Writes allowed
    #[inline]
    pub const fn is_writable(self) -> bool {
        self.has(PteFlags::WRITABLE)
    }

    /// Physical address of the mapped frame
    pub const fn frame(self) -> usize {
        if self.is_large() {
            (self.0 & LARGE_FRAME_MASK) as usize
        } else {
            (self.0 & FRAME_MASK) as usize
        }
    }

    /// Frame number of the mapped frame
    pub const fn pfn(self) -> PageNum {
        addr_to_pfn(self.frame())
    }

    /// Same entry with `flags` added
    pub const fn with(self, flags: PteFlags) -> Self {
        Pte(self.0 | flags.bits())
    }

    /// Same entry with `flags` removed
    pub const fn without(self, flags: PteFlags) -> Self {
        Pte(self.0 & !flags.bits())
    }

    /// Page attributes recorded by the hardware in this entry
    pub fn page_attrs(self) -> PageAttrs {
        let mut attrs = PageAttrs::empty();
        if self.has(PteFlags::ACCESSED) {
            attrs |= PageAttrs::REFERENCED;
        }
        if self.has(PteFlags::DIRTY) {
            attrs |= PageAttrs::MODIFIED;
        }
        attrs
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pte({:#x}, {:?})", self.frame(), self.flags())
    }
}

/// A live table slot.
///
/// All updates are atomic so that concurrent hardware accessed/dirty updates
/// and shootdown bookkeeping never observe a torn entry.
#[derive(Clone, Copy)]
pub struct PteSlot<'a> {
    word: &'a AtomicU64,
}

impl<'a> PteSlot<'a> {
    /// Wrap a table word
    pub fn new(word: &'a AtomicU64) -> Self {
        Self { word }
    }

    /// Current value
    pub fn load(&self) -> Pte {
        Pte(self.word.load(Ordering::Acquire))
    }

    /// Store a value, for slots no other CPU can be using yet
    pub fn store(&self, pte: Pte) {
        self.word.store(pte.0, Ordering::Release);
    }

    /// Install `pte` and return the previous value
    pub fn swap(&self, pte: Pte) -> Pte {
        Pte(self.word.swap(pte.0, Ordering::AcqRel))
    }

    /// Install `new` if the slot still holds `current`
    pub fn compare_exchange(&self, current: Pte, new: Pte) -> Result<Pte, Pte> {
        self.word
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(Pte)
            .map_err(Pte)
    }

    /// Atomically apply `f` to a valid entry, retrying on interference.
    /// Returns the old value; an invalid entry is left alone.
    pub fn update(&self, f: impl Fn(Pte) -> Pte) -> Pte {
        let mut old = self.load();
        loop {
            if !old.is_valid() {
                return old;
            }
            match self.compare_exchange(old, f(old)) {
                Ok(prev) => return prev,
                Err(cur) => old = cur,
            }
        }
    }

    /// Set bits, returning the previous value
    pub fn set_bits(&self, flags: PteFlags) -> Pte {
        Pte(self.word.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear bits, returning the previous value
    pub fn clear_bits(&self, flags: PteFlags) -> Pte {
        Pte(self.word.fetch_and(!flags.bits(), Ordering::AcqRel))
    }
}

impl fmt::Debug for PteSlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

bitflags! {
    /// Access rights requested for a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        /// Loads allowed
        const READ = 1 << 0;
        /// Stores allowed
        const WRITE = 1 << 1;
        /// Instruction fetch allowed
        const EXECUTE = 1 << 2;
        /// Read and write
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Every right
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Protection {
    /// Hardware bits granting this protection
    pub fn pte_bits(self) -> PteFlags {
        let mut bits = PteFlags::empty();
        if self.contains(Protection::WRITE) {
            bits |= PteFlags::WRITABLE;
        }
        if !self.contains(Protection::EXECUTE) {
            bits |= PteFlags::NO_EXEC;
        }
        bits
    }
}

bitflags! {
    /// Options for `enter`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnterFlags: u32 {
        /// Pin the mapping
        const WIRED = 1 << 0;
        /// Return out-of-memory instead of halting
        const CAN_FAIL = 1 << 1;
        /// The fault being resolved was a read
        const ACCESS_READ = 1 << 2;
        /// The fault being resolved was a write
        const ACCESS_WRITE = 1 << 3;
        /// Map uncached
        const NO_CACHE = 1 << 4;
    }
}

impl EnterFlags {
    /// Accessed/dirty bits to preload for the faulting access
    pub fn preset_bits(self) -> PteFlags {
        let mut bits = PteFlags::empty();
        if self.intersects(EnterFlags::ACCESS_READ | EnterFlags::ACCESS_WRITE) {
            bits |= PteFlags::ACCESSED;
        }
        if self.contains(EnterFlags::ACCESS_WRITE) {
            bits |= PteFlags::DIRTY;
        }
        if self.contains(EnterFlags::NO_CACHE) {
            bits |= PteFlags::NO_CACHE;
        }
        bits
    }
}
