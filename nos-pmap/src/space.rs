//! Address spaces
//!
//! An [`AddressSpace`] is one translation context: a top-level table, the
//! CPUs it is loaded on, per-level lookup hints and page counts. Spaces are
//! created, referenced and destroyed through the
//! [`PmapManager`](crate::PmapManager).

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::addr::{PageNum, PhysAddr};
use crate::config::MAX_LEVELS;
use crate::shootdown::{AtomicCpuSet, CpuId, CpuSet, ShootScope};

/// Address space identifier
pub type SpaceId = u64;

/// Identifier of the kernel address space
pub const KERNEL_SPACE_ID: SpaceId = 0;

const NO_HINT: usize = usize::MAX;

/// Page counts of one address space
#[derive(Debug, Default)]
pub struct SpaceStats {
    resident: AtomicUsize,
    wired: AtomicUsize,
    table_pages: AtomicUsize,
}

impl SpaceStats {
    /// Base pages currently mapped
    pub fn resident(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    /// Base pages currently wired
    pub fn wired(&self) -> usize {
        self.wired.load(Ordering::Relaxed)
    }

    /// Table pages below the top level
    pub fn table_pages(&self) -> usize {
        self.table_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn add_resident(&self, pages: usize) {
        self.resident.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_resident(&self, pages: usize) {
        self.resident.fetch_sub(pages, Ordering::Relaxed);
    }

    pub(crate) fn add_wired(&self, pages: usize) {
        self.wired.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_wired(&self, pages: usize) {
        self.wired.fetch_sub(pages, Ordering::Relaxed);
    }

    pub(crate) fn add_table_pages(&self, pages: usize) {
        self.table_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_table_pages(&self, pages: usize) {
        self.table_pages.fetch_sub(pages, Ordering::Relaxed);
    }
}

/// One translation context
#[derive(Debug)]
pub struct AddressSpace {
    id: SpaceId,
    kernel: bool,
    root: PageNum,
    refs: AtomicUsize,
    active: AtomicCpuSet,
    hints: [AtomicUsize; MAX_LEVELS],
    stats: SpaceStats,
}

impl AddressSpace {
    pub(crate) fn new(id: SpaceId, root: PageNum, kernel: bool) -> Self {
        Self {
            id,
            kernel,
            root,
            refs: AtomicUsize::new(1),
            active: AtomicCpuSet::new(CpuSet::empty()),
            hints: [const { AtomicUsize::new(NO_HINT) }; MAX_LEVELS],
            stats: SpaceStats::default(),
        }
    }

    /// Identifier
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Whether this is the kernel address space
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Frame holding the top-level table
    pub fn root(&self) -> PageNum {
        self.root
    }

    /// Physical address of the top-level table
    pub fn root_pa(&self) -> PhysAddr {
        PhysAddr::from_pfn(self.root)
    }

    /// Outstanding references
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// CPUs that have this space loaded
    pub fn active_cpus(&self) -> CpuSet {
        self.active.load()
    }

    /// Whether `cpu` has this space loaded
    pub fn is_active_on(&self, cpu: CpuId) -> bool {
        self.active.load().contains(cpu)
    }

    /// Page counts
    pub fn stats(&self) -> &SpaceStats {
        &self.stats
    }

    /// Base pages currently mapped
    pub fn resident_count(&self) -> usize {
        self.stats.resident()
    }

    /// Base pages currently wired
    pub fn wired_count(&self) -> usize {
        self.stats.wired()
    }

    /// Which CPUs a shootdown for this space must reach
    pub(crate) fn shoot_scope(&self) -> ShootScope {
        if self.kernel {
            ShootScope::Kernel
        } else {
            ShootScope::Space(self.active.load())
        }
    }

    pub(crate) fn add_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference, returning how many are left
    pub(crate) fn release_ref(&self) -> usize {
        let old = self.refs.fetch_sub(1, Ordering::AcqRel);
        if old == 0 {
            fatal!("pmap: address space {} released with no references", self.id);
        }
        old - 1
    }

    pub(crate) fn mark_active(&self, cpu: CpuId) {
        self.active.insert(cpu);
    }

    pub(crate) fn mark_inactive(&self, cpu: CpuId) {
        self.active.remove(cpu);
    }

    pub(crate) fn hint(&self, level: usize) -> Option<PageNum> {
        let pfn = self.hints[level].load(Ordering::Relaxed);
        (pfn != NO_HINT).then_some(pfn)
    }

    pub(crate) fn set_hint(&self, level: usize, pfn: PageNum) {
        self.hints[level].store(pfn, Ordering::Relaxed);
    }

    /// Forget the hint at `level` if it names `pfn`
    pub(crate) fn clear_hint(&self, level: usize, pfn: PageNum) {
        let _ = self.hints[level].compare_exchange(pfn, NO_HINT, Ordering::Relaxed, Ordering::Relaxed);
    }
}
