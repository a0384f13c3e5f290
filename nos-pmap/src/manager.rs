//! Pmap manager and address-space lifecycle
//!
//! [`PmapManager`] is constructed once at boot and owns everything the
//! mapping operations share: the configuration and layout, the frame
//! allocator, the TLB seam, the shootdown coordinator, the kernel address
//! space and the global pmap lock.
//!
//! The kernel half of every user address space shares the kernel's table
//! pages by reference. Only top-level entries are copied, at creation time
//! and again by [`PmapManager::grow_kernel`] whenever growth adds a new one.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use nos_api::memory::FrameAllocator;
use spin::Mutex;

use crate::addr::{addr_to_pfn, pfn_to_addr, PageNum, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::config::{PmapConfig, MAX_LEVELS};
use crate::error::{PmapError, Result};
use crate::layout::{PmapLayout, ENTRIES_PER_TABLE, LARGE_PAGE_LEVEL, SLOT_KERNEL_BASE, SLOT_SELF_MAP};
use crate::pte::{Protection, Pte, PteFlags};
use crate::ptp::{DeferredFree, PtpMap, PtpSnapshot};
use crate::pv::{PoolStats, PvTable};
use crate::remove::RemoveMode;
use crate::shootdown::{ShootBatch, ShootdownCoordinator, TlbOps};
use crate::space::{AddressSpace, SpaceId, KERNEL_SPACE_ID};
use crate::table::{table_link, PteLookup, Walker};

/// A kernel region mapped during bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRegion {
    /// Kernel virtual start, page aligned
    pub va: VirtAddr,
    /// Physical start, page aligned
    pub pa: PhysAddr,
    /// Length in bytes
    pub len: usize,
    /// Access rights
    pub prot: Protection,
}

/// State guarded by the pmap lock
pub(crate) struct PmapState {
    /// Table pages of user address spaces
    pub(crate) ptps: PtpMap,
    /// Reverse maps of managed pages
    pub(crate) pv: PvTable,
    /// Live address spaces, kernel included
    pub(crate) spaces: HashMap<SpaceId, Arc<AddressSpace>>,
    pub(crate) next_id: SpaceId,
    /// Start of growable KVA
    pub(crate) kva_start: usize,
    /// End of KVA backed by table pages
    pub(crate) max_kva: usize,
    /// Kernel table pages allocated per level
    pub(crate) kernel_ptps: [usize; MAX_LEVELS + 1],
}

/// The machine-dependent virtual memory layer
pub struct PmapManager {
    pub(crate) config: PmapConfig,
    pub(crate) layout: PmapLayout,
    pub(crate) frames: Arc<dyn FrameAllocator>,
    pub(crate) tlb: Arc<dyn TlbOps>,
    pub(crate) shootdown: Arc<ShootdownCoordinator>,
    pub(crate) kernel: Arc<AddressSpace>,
    pub(crate) state: Mutex<PmapState>,
}

impl PmapManager {
    /// Build the kernel address space and its first mappings.
    ///
    /// Maps every boot region with global kernel entries, then prepares
    /// `initial_kva` bytes of KVA starting at the first leaf-table boundary
    /// after the last region.
    pub fn bootstrap(
        config: PmapConfig,
        frames: Arc<dyn FrameAllocator>,
        tlb: Arc<dyn TlbOps>,
        shootdown: Arc<ShootdownCoordinator>,
        regions: &[BootRegion],
    ) -> Result<Self> {
        config.validate()?;
        let layout = PmapLayout::new(config.levels);
        layout.verify().map_err(PmapError::InvalidConfig)?;

        let root = frames.alloc_zeroed_page().ok_or(PmapError::OutOfMemory)?;
        let kernel = Arc::new(AddressSpace::new(KERNEL_SPACE_ID, root, true));
        Walker::new(&*frames, &layout)
            .view(root, layout.levels)
            .at(SLOT_SELF_MAP)
            .store(table_link(root, false));

        let mut spaces = HashMap::new();
        spaces.insert(KERNEL_SPACE_ID, kernel.clone());
        let state = PmapState {
            ptps: PtpMap::new(),
            pv: PvTable::new(config.pv_capacity),
            spaces,
            next_id: KERNEL_SPACE_ID + 1,
            kva_start: layout.kernel_min,
            max_kva: layout.kernel_min,
            kernel_ptps: [0; MAX_LEVELS + 1],
        };

        let pmap = Self {
            config,
            layout,
            frames,
            tlb,
            shootdown,
            kernel,
            state: Mutex::new(state),
        };

        let mut kva_start = layout.kernel_min;
        for region in regions {
            pmap.map_boot_region(region)?;
            kva_start = kva_start.max(region.va.as_usize() + region.len);
        }
        let kva_start = align_up(kva_start, layout.large_page_size());
        {
            let mut st = pmap.state.lock();
            st.kva_start = kva_start;
            st.max_kva = kva_start;
        }
        let bound = pmap.grow_kernel(VirtAddr::new(kva_start + pmap.config.initial_kva));

        log::info!(
            "pmap: {} levels, kernel root {:#x}, {} boot regions, kva {:#x}..{:#x}",
            layout.levels,
            pfn_to_addr(root),
            regions.len(),
            kva_start,
            bound.as_usize()
        );
        Ok(pmap)
    }

    fn map_boot_region(&self, region: &BootRegion) -> Result<()> {
        let va = region.va.as_usize();
        let pa = region.pa.as_usize();
        if !region.va.is_page_aligned() || !region.pa.is_page_aligned() || region.len % PAGE_SIZE != 0 {
            return Err(PmapError::InvalidConfig("boot region not page aligned"));
        }
        if !self.layout.is_kernel_address(va) || va + region.len > self.layout.kernel_max {
            return Err(PmapError::InvalidConfig("boot region outside kernel space"));
        }

        let large = self.layout.large_page_size();
        let base_flags = PteFlags::VALID | PteFlags::GLOBAL | region.prot.pte_bits();
        let walker = self.walker();
        let mut st = self.state.lock();
        let mut offset = 0;

        while offset < region.len {
            let (va, pa) = (va + offset, pa + offset);
            // Top-level entries are copied into every space, so a large
            // leaf there would not be shared by reference
            let use_large = self.config.large_pages
                && LARGE_PAGE_LEVEL < self.layout.levels
                && va % large == 0
                && pa % large == 0
                && region.len - offset >= large;
            let (level, flags, size) = if use_large {
                (LARGE_PAGE_LEVEL, base_flags | PteFlags::LARGE, large)
            } else {
                (1, base_flags, PAGE_SIZE)
            };

            let table = self.ensure_kernel_tables(&mut st, va, level, &mut Vec::new());
            let slot = walker.view(table, level).at(self.layout.index(va, level));
            if slot.load().is_valid() {
                fatal!("pmap: boot region overlaps an existing mapping at {:#x}", va);
            }
            slot.store(Pte::new(pa, flags));
            self.kernel.stats().add_resident(size / PAGE_SIZE);
            offset += size;
        }
        log::debug!("pmap: boot region {:#x}+{:#x} -> {:#x}", va, region.len, pa);
        Ok(())
    }

    /// Walk the kernel tables for `va` down to `level`, allocating missing
    /// tables top-down. Top-level slots that get a new table are appended to
    /// `new_top`. Returns the table at `level`.
    fn ensure_kernel_tables(
        &self,
        st: &mut PmapState,
        va: usize,
        level: usize,
        new_top: &mut Vec<usize>,
    ) -> PageNum {
        let walker = self.walker();
        let top = self.layout.levels;
        let mut table = self.kernel.root();

        for parent_level in (level + 1..=top).rev() {
            let index = self.layout.index(va, parent_level);
            let slot = walker.view(table, parent_level).at(index);
            let pde = slot.load();
            table = if pde.is_valid() {
                if pde.is_large() {
                    fatal!("pmap: kernel table walk for {:#x} hit a large page", va);
                }
                pde.pfn()
            } else {
                let Some(pfn) = self.frames.alloc_zeroed_page() else {
                    fatal!("pmap: out of memory allocating kernel table for {:#x}", va);
                };
                slot.store(table_link(pfn, false));
                st.kernel_ptps[parent_level - 1] += 1;
                self.kernel.stats().add_table_pages(1);
                if parent_level == top {
                    new_top.push(index);
                }
                pfn
            };
        }
        table
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration in effect
    pub fn config(&self) -> &PmapConfig {
        &self.config
    }

    /// Address space layout
    pub fn layout(&self) -> &PmapLayout {
        &self.layout
    }

    /// The kernel address space
    pub fn kernel(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// The shootdown coordinator
    pub fn shootdown(&self) -> &ShootdownCoordinator {
        &self.shootdown
    }

    /// The frame allocator
    pub fn frames(&self) -> &dyn FrameAllocator {
        &*self.frames
    }

    /// KVA available to the kernel VM: start of growable KVA and end of
    /// kernel space
    pub fn virtual_space(&self) -> (VirtAddr, VirtAddr) {
        let st = self.state.lock();
        (VirtAddr::new(st.kva_start), VirtAddr::new(self.layout.kernel_max))
    }

    /// Current end of KVA backed by table pages
    pub fn kernel_bound(&self) -> VirtAddr {
        VirtAddr::new(self.state.lock().max_kva)
    }

    /// Number of live address spaces, kernel included
    pub fn space_count(&self) -> usize {
        self.state.lock().spaces.len()
    }

    /// Kernel table pages allocated at each level
    pub fn kernel_table_pages(&self) -> [usize; MAX_LEVELS + 1] {
        self.state.lock().kernel_ptps
    }

    /// Table pages owned by `space`
    pub fn ptp_info(&self, space: &AddressSpace) -> Vec<PtpSnapshot> {
        self.state.lock().ptps.snapshot(space.id())
    }

    /// Reverse mappings of the page at `pa`
    pub fn pv_mappings(&self, pa: PhysAddr) -> Vec<(SpaceId, VirtAddr)> {
        let st = self.state.lock();
        st.pv.iter(pa.pfn()).map(|e| (e.space, VirtAddr::new(e.va))).collect()
    }

    /// Reverse-map pool statistics
    pub fn pv_stats(&self) -> PoolStats {
        self.state.lock().pv.stats()
    }

    /// Walk `space` for `va`; see [`Walker::find_pte`]
    pub fn find_pte(&self, space: &AddressSpace, va: VirtAddr) -> PteLookup<'_> {
        self.walker().find_pte(space.root(), va.as_usize())
    }

    /// Whether every table level for `va` in `space` is present
    pub fn resolve_all_levels(&self, space: &AddressSpace, va: VirtAddr) -> bool {
        self.walker().resolve_all_levels(space.root(), va.as_usize())
    }

    pub(crate) fn walker(&self) -> Walker<'_> {
        Walker::new(&*self.frames, &self.layout)
    }

    /// Issue the collected shootdowns, wait for them, then free the
    /// unlinked table pages.
    pub(crate) fn finish(&self, batch: ShootBatch, free: DeferredFree) {
        if batch.is_empty() && free.is_empty() {
            return;
        }
        let done = batch.issue(&self.shootdown, &*self.tlb);
        free.release(&*self.frames, done);
    }

    pub(crate) fn space_by_id(&self, st: &PmapState, id: SpaceId) -> Arc<AddressSpace> {
        match st.spaces.get(&id) {
            Some(space) => space.clone(),
            None => fatal!("pmap: reverse map names unknown address space {}", id),
        }
    }

    // ========================================================================
    // Address-space lifecycle
    // ========================================================================

    /// Create an empty user address space sharing the kernel's upper half
    pub fn create(&self) -> Result<Arc<AddressSpace>> {
        let root = self.frames.alloc_zeroed_page().ok_or(PmapError::OutOfMemory)?;
        let walker = self.walker();
        let top = self.layout.levels;
        let view = walker.view(root, top);

        let mut st = self.state.lock();
        let kernel_view = walker.view(self.kernel.root(), top);
        for slot in SLOT_KERNEL_BASE..ENTRIES_PER_TABLE {
            view.at(slot).store(kernel_view.at(slot).load());
        }
        view.at(SLOT_SELF_MAP).store(table_link(root, false));

        let id = st.next_id;
        st.next_id += 1;
        let space = Arc::new(AddressSpace::new(id, root, false));
        st.spaces.insert(id, space.clone());
        drop(st);

        log::debug!("pmap: created address space {} root {:#x}", id, pfn_to_addr(root));
        Ok(space)
    }

    /// Take another reference on `space`
    pub fn reference(&self, space: &AddressSpace) {
        let refs = space.add_ref();
        log::trace!("pmap: address space {} now has {} references", space.id(), refs);
    }

    /// Drop a reference; the last one tears the address space down.
    ///
    /// Halts if the space is still active on any CPU.
    pub fn destroy(&self, space: &Arc<AddressSpace>) {
        if space.is_kernel() {
            fatal!("pmap: attempt to destroy the kernel address space");
        }
        if space.release_ref() > 0 {
            return;
        }
        let active = space.active_cpus();
        if !active.is_empty() {
            fatal!("pmap: destroying address space {} still active on {:?}", space.id(), active);
        }

        // Leftover mappings would leave dangling reverse-map entries
        self.do_remove(space, 0, self.layout.user_max, RemoveMode::All);

        let mut st = self.state.lock();
        st.spaces.remove(&space.id());
        let leftover = st.ptps.take_owned(space.id());
        drop(st);

        // Inactive everywhere, so no TLB can reach these pages
        for pfn in &leftover {
            self.frames.free_page(*pfn);
        }
        space.stats().sub_table_pages(leftover.len());
        self.frames.free_page(space.root());
        log::debug!("pmap: destroyed address space {}", space.id());
    }

    /// Load `space` on the current CPU
    pub fn activate(&self, space: &AddressSpace) {
        let cpu = self.tlb.current_cpu();
        space.mark_active(cpu);
        self.tlb.load_root(cpu, space.root_pa());
        log::trace!("pmap: cpu {} activated address space {}", cpu, space.id());
    }

    /// Mark `space` as no longer loaded on the current CPU
    pub fn deactivate(&self, space: &AddressSpace) {
        let cpu = self.tlb.current_cpu();
        space.mark_inactive(cpu);
        log::trace!("pmap: cpu {} deactivated address space {}", cpu, space.id());
    }

    // ========================================================================
    // Kernel growth
    // ========================================================================

    /// Extend the table-backed KVA to cover `new_bound`, returning the new
    /// bound. Never shrinks.
    pub fn grow_kernel(&self, new_bound: VirtAddr) -> VirtAddr {
        let mut st = self.state.lock();
        if new_bound.as_usize() <= st.max_kva {
            return VirtAddr::new(st.max_kva);
        }

        let span = self.layout.large_page_size();
        let target = align_up(new_bound.as_usize(), span);
        if target > self.layout.kernel_max {
            fatal!("pmap: kernel growth to {:#x} exceeds kernel space", target);
        }

        let mut new_top = Vec::new();
        let mut va = st.max_kva;
        while va < target {
            self.ensure_kernel_tables(&mut st, va, 1, &mut new_top);
            va += span;
        }
        let old = st.max_kva;
        st.max_kva = target;

        if !new_top.is_empty() {
            let walker = self.walker();
            let top = self.layout.levels;
            let kernel_view = walker.view(self.kernel.root(), top);
            for space in st.spaces.values().filter(|s| !s.is_kernel()) {
                let view = walker.view(space.root(), top);
                for &slot in &new_top {
                    view.at(slot).store(kernel_view.at(slot).load());
                }
            }
        }

        log::info!(
            "pmap: grew kernel {:#x} -> {:#x}, {} new top-level entries",
            old,
            target,
            new_top.len()
        );
        VirtAddr::new(target)
    }

    // ========================================================================
    // Page contents
    // ========================================================================

    /// Zero the page at `pa`
    pub fn zero_page(&self, pa: PhysAddr) {
        match self.frames.frame(pa.pfn()) {
            Some(frame) => frame.zero(),
            None => fatal!("pmap: zero_page of unbacked frame {:#x}", pa),
        }
    }

    /// Copy the page at `src` to `dst`
    pub fn copy_page(&self, src: PhysAddr, dst: PhysAddr) {
        let (Some(from), Some(to)) = (self.frames.frame(src.pfn()), self.frames.frame(dst.pfn())) else {
            fatal!("pmap: copy_page between unbacked frames {:#x} -> {:#x}", src, dst);
        };
        to.copy_from(from);
    }

    /// Whether the frame at `pa` carries reverse-map tracking
    pub fn is_managed(&self, pa: PhysAddr) -> bool {
        self.frames.page_meta(addr_to_pfn(pa.as_usize())).is_some()
    }
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
