//! Address space layout derived from the table geometry
//!
//! Every level holds 512 entries and the top level is carved into fixed
//! slot ranges:
//!
//! | Top-level slots | Use                                               |
//! |-----------------|---------------------------------------------------|
//! | 0..255          | user space                                        |
//! | 255             | reserved self-map block, never removed or protected |
//! | 256..511        | kernel virtual addresses, shared with every space |
//! | 511             | direct map of physical memory, no tables          |
//!
//! Addresses are flat: the kernel half is not sign extended.

use crate::addr::PAGE_SHIFT;
use crate::config::PagingLevels;

/// Entries in one table at any level
pub const ENTRIES_PER_TABLE: usize = 512;

/// Virtual address bits consumed per level
pub const LEVEL_SHIFT: usize = 9;

/// Top-level slot holding the self-map
pub const SLOT_SELF_MAP: usize = 255;

/// First top-level slot of kernel space
pub const SLOT_KERNEL_BASE: usize = 256;

/// Top-level slot covering the direct map
pub const SLOT_DIRECT_MAP: usize = 511;

/// Level at which large-page leaves live
pub const LARGE_PAGE_LEVEL: usize = 2;

/// Address space layout for a given table depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapLayout {
    /// Number of table levels
    pub levels: usize,
    /// Bytes covered by one top-level entry
    pub top_span: usize,
    /// Maximum user address (exclusive)
    pub user_max: usize,
    /// Start of the reserved self-map block
    pub self_map_base: usize,
    /// End of the reserved self-map block (exclusive)
    pub self_map_end: usize,
    /// Lowest kernel virtual address
    pub kernel_min: usize,
    /// End of table-mapped kernel space (exclusive)
    pub kernel_max: usize,
    /// Physical memory direct map base
    pub direct_map_base: usize,
    /// Physical memory direct map size (bytes)
    pub direct_map_size: usize,
}

impl PmapLayout {
    /// Layout for a table of the given depth
    pub const fn new(levels: PagingLevels) -> Self {
        let levels = levels.count();
        let top_span = Self::level_span(levels);
        Self {
            levels,
            top_span,
            user_max: SLOT_SELF_MAP * top_span,
            self_map_base: SLOT_SELF_MAP * top_span,
            self_map_end: (SLOT_SELF_MAP + 1) * top_span,
            kernel_min: SLOT_KERNEL_BASE * top_span,
            kernel_max: SLOT_DIRECT_MAP * top_span,
            direct_map_base: SLOT_DIRECT_MAP * top_span,
            direct_map_size: top_span,
        }
    }

    /// Shift of the address bits that index a table at `level`
    #[inline]
    pub const fn level_shift(level: usize) -> usize {
        PAGE_SHIFT + LEVEL_SHIFT * (level - 1)
    }

    /// Bytes covered by one entry of a table at `level`
    #[inline]
    pub const fn level_span(level: usize) -> usize {
        1 << Self::level_shift(level)
    }

    /// Size of a large-page leaf
    #[inline]
    pub const fn large_page_size(&self) -> usize {
        Self::level_span(LARGE_PAGE_LEVEL)
    }

    /// Index of `va` in the table at `level`
    #[inline]
    pub const fn index(&self, va: usize, level: usize) -> usize {
        (va >> Self::level_shift(level)) & (ENTRIES_PER_TABLE - 1)
    }

    /// End of the block covered by the `level` entry that maps `va`
    #[inline]
    pub const fn block_end(&self, va: usize, level: usize) -> usize {
        let span = Self::level_span(level);
        (va & !(span - 1)) + span
    }

    /// One past the highest translatable address
    pub const fn max_address(&self) -> usize {
        ENTRIES_PER_TABLE * self.top_span
    }

    /// Check if address is in user space
    pub fn is_user_address(&self, va: usize) -> bool {
        va < self.user_max
    }

    /// Check if address is in table-mapped kernel space
    pub fn is_kernel_address(&self, va: usize) -> bool {
        va >= self.kernel_min && va < self.kernel_max
    }

    /// Check if address lies in the reserved self-map block
    pub fn in_self_map(&self, va: usize) -> bool {
        va >= self.self_map_base && va < self.self_map_end
    }

    /// Check if address lies in the direct map
    pub fn in_direct_map(&self, va: usize) -> bool {
        va >= self.direct_map_base && va - self.direct_map_base < self.direct_map_size
    }

    /// Direct-map virtual address to physical address
    pub fn virt_to_phys(&self, va: usize) -> Option<usize> {
        self.in_direct_map(va).then(|| va - self.direct_map_base)
    }

    /// Physical address to its direct-map virtual address
    pub fn phys_to_virt(&self, pa: usize) -> Option<usize> {
        (pa < self.direct_map_size).then(|| self.direct_map_base + pa)
    }

    /// Verify layout consistency
    pub fn verify(&self) -> Result<(), &'static str> {
        if self.levels < 2 || self.levels > crate::config::MAX_LEVELS {
            return Err("Unsupported table depth");
        }
        if self.user_max > self.self_map_base {
            return Err("User space overlaps self-map block");
        }
        if self.self_map_end > self.kernel_min {
            return Err("Self-map block overlaps kernel space");
        }
        if self.kernel_max > self.direct_map_base {
            return Err("Kernel space overlaps direct map");
        }
        if self.direct_map_base + self.direct_map_size != self.max_address() {
            return Err("Direct map does not end the address space");
        }
        if self.top_span < self.large_page_size() {
            return Err("Top-level entry smaller than a large page");
        }
        Ok(())
    }
}
