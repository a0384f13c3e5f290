//! Pmap configuration
//!
//! Tunables fixed at bootstrap. The defaults describe a 4-level table on a
//! machine with up to 64 CPUs.

use crate::addr::{is_page_aligned, PAGE_SIZE};
use crate::error::{PmapError, Result};

/// Deepest supported table hierarchy
pub const MAX_LEVELS: usize = 4;

/// Width of the CPU sets used for active-CPU tracking
pub const MAX_CPUS: usize = 64;

/// Pages above which a user range invalidation becomes a full TLB flush
pub const DEFAULT_SHOOTALL_THRESHOLD: usize = 32;

/// Default bound on live reverse-map entries
pub const DEFAULT_PV_CAPACITY: usize = 65536;

/// KVA covered by one leaf table
pub const DEFAULT_INITIAL_KVA: usize = 512 * PAGE_SIZE;

/// Number of levels in the translation hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingLevels {
    /// 2-level table, 1 GiB of address space
    Two = 2,
    /// 3-level table, 512 GiB of address space
    Three = 3,
    /// 4-level table, 256 TiB of address space
    Four = 4,
}

impl PagingLevels {
    /// Level count as a number
    pub const fn count(self) -> usize {
        self as usize
    }
}

/// Pmap tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmapConfig {
    /// Depth of the table hierarchy
    pub levels: PagingLevels,
    /// Number of CPUs the shootdown coordinator tracks
    pub max_cpus: usize,
    /// Range size, in pages, above which a user-space range shootdown is
    /// replaced by a whole-TLB flush
    pub shootall_threshold: usize,
    /// Maximum number of live reverse-map entries
    pub pv_capacity: usize,
    /// KVA made available by bootstrap, in bytes
    pub initial_kva: usize,
    /// Map suitably aligned boot regions with large pages
    pub large_pages: bool,
    /// Spins allowed while waiting on a shootdown before declaring a CPU wedged
    pub shootdown_spin_limit: Option<u64>,
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self {
            levels: PagingLevels::Four,
            max_cpus: MAX_CPUS,
            shootall_threshold: DEFAULT_SHOOTALL_THRESHOLD,
            pv_capacity: DEFAULT_PV_CAPACITY,
            initial_kva: DEFAULT_INITIAL_KVA,
            large_pages: true,
            shootdown_spin_limit: None,
        }
    }
}

impl PmapConfig {
    /// Set the table depth
    pub fn with_levels(mut self, levels: PagingLevels) -> Self {
        self.levels = levels;
        self
    }

    /// Set the CPU count
    pub fn with_max_cpus(mut self, max_cpus: usize) -> Self {
        self.max_cpus = max_cpus;
        self
    }

    /// Set the full-flush threshold in pages
    pub fn with_shootall_threshold(mut self, pages: usize) -> Self {
        self.shootall_threshold = pages;
        self
    }

    /// Set the reverse-map entry bound
    pub fn with_pv_capacity(mut self, capacity: usize) -> Self {
        self.pv_capacity = capacity;
        self
    }

    /// Set the KVA prepared at bootstrap
    pub fn with_initial_kva(mut self, bytes: usize) -> Self {
        self.initial_kva = bytes;
        self
    }

    /// Allow or forbid large boot mappings
    pub fn with_large_pages(mut self, enabled: bool) -> Self {
        self.large_pages = enabled;
        self
    }

    /// Bound the shootdown acknowledgment wait
    pub fn with_shootdown_spin_limit(mut self, limit: Option<u64>) -> Self {
        self.shootdown_spin_limit = limit;
        self
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_cpus == 0 || self.max_cpus > MAX_CPUS {
            return Err(PmapError::InvalidConfig("max_cpus must be between 1 and 64"));
        }
        if self.shootall_threshold == 0 {
            return Err(PmapError::InvalidConfig("shootall_threshold must be at least one page"));
        }
        if self.pv_capacity == 0 {
            return Err(PmapError::InvalidConfig("pv_capacity must be non-zero"));
        }
        if !is_page_aligned(self.initial_kva) {
            return Err(PmapError::InvalidConfig("initial_kva must be page aligned"));
        }
        if self.shootdown_spin_limit == Some(0) {
            return Err(PmapError::InvalidConfig("shootdown_spin_limit must be non-zero"));
        }
        Ok(())
    }
}
