//! Entering, querying and wiring single mappings

use crate::addr::{addr_to_pfn, page_round_up, PageNum, PhysAddr, VirtAddr, PAGE_MASK, PAGE_SIZE};
use crate::error::{PmapError, Result};
use crate::manager::{PmapManager, PmapState};
use crate::ptp::DeferredFree;
use crate::pte::{EnterFlags, Protection, Pte, PteFlags};
use crate::pv::{PvEntry, PvIndex};
use crate::shootdown::{Invalidation, ShootBatch, ShootScope};
use crate::space::AddressSpace;
use crate::table::Block;

impl PmapManager {
    /// Map `va` to the frame holding `pa` in `space`.
    ///
    /// Replaces any existing mapping at `va`. When an old valid entry is
    /// replaced the page is shot down before returning. Allocation failure
    /// is returned only with [`EnterFlags::CAN_FAIL`]; otherwise it halts.
    pub fn enter(
        &self,
        space: &AddressSpace,
        va: VirtAddr,
        pa: PhysAddr,
        prot: Protection,
        flags: EnterFlags,
    ) -> Result<()> {
        let va = va.as_usize() & !PAGE_MASK;
        let pa = pa.as_usize() & !PAGE_MASK;
        self.check_enter_range(space, va);

        let mut st = self.state.lock();
        let result = self.enter_locked(&mut st, space, va, pa, prot, flags);
        drop(st);

        match result {
            Ok(old) => {
                log::trace!("pmap: space {} enter {:#x} -> {:#x} {:?} (was {:?})", space.id(), va, pa, prot, old);
                if old.is_valid() {
                    let mut batch = ShootBatch::new();
                    batch.push(space.shoot_scope(), Invalidation::Page(va));
                    self.finish(batch, DeferredFree::new());
                }
                Ok(())
            }
            Err(err) if flags.contains(EnterFlags::CAN_FAIL) => {
                log::warn!("pmap: space {} enter {:#x} failed: {}", space.id(), va, err);
                Err(err)
            }
            Err(err) => fatal!("pmap: space {} enter {:#x}: {}", space.id(), va, err),
        }
    }

    fn check_enter_range(&self, space: &AddressSpace, va: usize) {
        let layout = &self.layout;
        if layout.in_self_map(va) {
            fatal!("pmap: enter into the self-map block at {:#x}", va);
        }
        if space.is_kernel() {
            if !layout.is_kernel_address(va) {
                fatal!("pmap: kernel enter at {:#x} outside kernel space", va);
            }
        } else if !layout.is_user_address(va) {
            fatal!("pmap: space {} enter at {:#x} outside user space", space.id(), va);
        }
    }

    /// Install the entry and fix up the bookkeeping. Returns the replaced
    /// entry.
    fn enter_locked(
        &self,
        st: &mut PmapState,
        space: &AddressSpace,
        va: usize,
        pa: usize,
        prot: Protection,
        flags: EnterFlags,
    ) -> Result<Pte> {
        let walker = self.walker();
        let path = walker.path(space.root(), va);
        let cur = walker.leaf(&path, va).map_or(Pte::EMPTY, |slot| slot.load());

        if !path.is_complete() {
            let stop = path.stop_level();
            if walker.entry(&path, va, stop).is_some_and(|slot| slot.load().is_valid()) {
                fatal!("pmap: enter at {:#x} inside a large page", va);
            }
            if space.is_kernel() {
                fatal!("pmap: kernel enter at {:#x} beyond the grown kernel range", va);
            }
        }

        let managed = self.frames.page_meta(addr_to_pfn(pa)).is_some();
        let same_frame = cur.is_valid() && cur.frame() == pa;
        let keep_pv = same_frame && cur.is_managed();
        let drop_old_pv = cur.is_valid() && cur.is_managed() && !same_frame;

        // Reserve everything that can fail before touching the tables
        let mut pv_index: Option<PvIndex> = None;
        if managed && !keep_pv && !drop_old_pv {
            pv_index = Some(st.pv.alloc().ok_or(PmapError::OutOfMemory)?);
        }
        let ptp: Option<PageNum> = if space.is_kernel() {
            None
        } else {
            match self.get_ptp(st, space, va) {
                Ok(pfn) => Some(pfn),
                Err(err) => {
                    if let Some(index) = pv_index {
                        st.pv.free(index);
                    }
                    return Err(err);
                }
            }
        };

        if drop_old_pv {
            match st.pv.remove(cur.pfn(), space.id(), va) {
                Some((index, _)) if managed => pv_index = Some(index),
                Some((index, _)) => st.pv.free(index),
                None => fatal!("pmap: managed mapping {:#x} of space {} missing from its reverse map", va, space.id()),
            }
        }

        let stats = space.stats();
        let wired = flags.contains(EnterFlags::WIRED);
        if cur.is_valid() {
            match (cur.is_wired(), wired) {
                (false, true) => stats.add_wired(1),
                (true, false) => stats.sub_wired(1),
                _ => {}
            }
        } else {
            stats.add_resident(1);
            if wired {
                stats.add_wired(1);
            }
            if let Some(ptp) = ptp {
                st.ptps.add_wire(ptp);
            }
        }

        let mut bits = PteFlags::VALID | prot.pte_bits() | flags.preset_bits();
        bits |= if space.is_kernel() { PteFlags::GLOBAL } else { PteFlags::USER };
        if wired {
            bits |= PteFlags::WIRED;
        }
        if pv_index.is_some() || keep_pv {
            bits |= PteFlags::PVLIST;
        }

        let table = match ptp {
            Some(pfn) => pfn,
            None => match path.table(1) {
                Some(pfn) => pfn,
                None => fatal!("pmap: no leaf table for {:#x}", va),
            },
        };
        let old = walker.view(table, 1).at(self.layout.index(va, 1)).swap(Pte::new(pa, bits));
        if old.is_managed() {
            self.sync_attrs(old);
        }
        if let Some(index) = pv_index {
            st.pv.enter(addr_to_pfn(pa), index, PvEntry { space: space.id(), va, ptp });
        }
        Ok(old)
    }

    /// Fold the hardware accessed/dirty bits of `pte` into its page
    pub(crate) fn sync_attrs(&self, pte: Pte) {
        if let Some(meta) = self.frames.page_meta(pte.pfn()) {
            meta.set_attrs(pte.page_attrs());
        }
    }

    /// Physical address `va` translates to in `space`
    pub fn extract(&self, space: &AddressSpace, va: VirtAddr) -> Option<PhysAddr> {
        self.walker().translate(space.root(), va.as_usize()).map(PhysAddr::new)
    }

    /// Map a kernel page without reverse-map tracking
    pub fn kenter(&self, va: VirtAddr, pa: PhysAddr, prot: Protection) {
        let va = va.as_usize() & !PAGE_MASK;
        let pa = pa.as_usize() & !PAGE_MASK;
        if !self.layout.is_kernel_address(va) {
            fatal!("pmap: kenter at {:#x} outside kernel space", va);
        }
        let walker = self.walker();
        let path = walker.path(self.kernel.root(), va);
        let Some(slot) = walker.leaf(&path, va) else {
            fatal!("pmap: kenter at {:#x} beyond the grown kernel range", va);
        };
        if slot.load().is_managed() {
            fatal!("pmap: kenter over managed mapping at {:#x}", va);
        }

        let bits = PteFlags::VALID | PteFlags::GLOBAL | PteFlags::WIRED | prot.pte_bits();
        let old = slot.swap(Pte::new(pa, bits));
        let stats = self.kernel.stats();
        if !old.is_valid() {
            stats.add_resident(1);
        }
        if !old.is_valid() || !old.is_wired() {
            stats.add_wired(1);
        }
        log::trace!("pmap: kenter {:#x} -> {:#x}", va, pa);

        if old.is_valid() {
            let mut batch = ShootBatch::new();
            batch.push(ShootScope::Kernel, Invalidation::Page(va));
            self.finish(batch, DeferredFree::new());
        }
    }

    /// Remove `len` bytes of mappings made with [`PmapManager::kenter`]
    pub fn kremove(&self, va: VirtAddr, len: usize) {
        let sva = va.page_round_down().as_usize();
        let eva = page_round_up(va.as_usize().saturating_add(len).min(self.layout.kernel_max));
        let walker = self.walker();
        let stats = self.kernel.stats();
        let mut removed = 0;

        for block in walker.blocks(self.kernel.root(), sva, eva) {
            let Block::Table { start, end, path } = block else {
                fatal!("pmap: kremove over a large page in {:#x}..{:#x}", sva, eva);
            };
            let Some(table) = path.table(1) else { continue };
            let view = walker.view(table, 1);
            for va in (start..end).step_by(PAGE_SIZE) {
                let slot = view.at(self.layout.index(va, 1));
                let pte = slot.load();
                if !pte.is_valid() {
                    continue;
                }
                if pte.is_managed() {
                    fatal!("pmap: kremove of managed mapping at {:#x}", va);
                }
                let old = slot.swap(Pte::EMPTY);
                stats.sub_resident(1);
                if old.is_wired() {
                    stats.sub_wired(1);
                }
                removed += 1;
            }
        }

        if removed > 0 {
            log::trace!("pmap: kremove {:#x}..{:#x}, {} pages", sva, eva, removed);
            let mut batch = ShootBatch::new();
            batch.push(ShootScope::Kernel, Invalidation::Range { start: sva, end: eva });
            self.finish(batch, DeferredFree::new());
        }
    }

    /// Clear the wired bit of the mapping at `va`
    pub fn unwire(&self, space: &AddressSpace, va: VirtAddr) {
        let va = va.as_usize() & !PAGE_MASK;
        let walker = self.walker();
        let _st = self.state.lock();
        let path = walker.path(space.root(), va);
        let Some(slot) = walker.leaf(&path, va).filter(|slot| slot.load().is_valid()) else {
            fatal!("pmap: unwire of unmapped {:#x} in space {}", va, space.id());
        };
        let old = slot.clear_bits(PteFlags::WIRED);
        if old.is_wired() {
            space.stats().sub_wired(1);
        } else {
            log::warn!("pmap: space {} unwire {:#x}: mapping was not wired", space.id(), va);
        }
    }

    /// Log every valid leaf of `space` in `[sva, eva)`
    pub fn dump(&self, space: &AddressSpace, sva: VirtAddr, eva: VirtAddr) {
        let walker = self.walker();
        let _st = self.state.lock();
        log::debug!("pmap: space {} mappings {:#x}..{:#x}", space.id(), sva, eva);
        for block in walker.blocks(space.root(), sva.as_usize(), eva.as_usize()) {
            match block {
                Block::Table { start, end, path } => {
                    let Some(table) = path.table(1) else { continue };
                    let view = walker.view(table, 1);
                    for va in (start..end).step_by(PAGE_SIZE) {
                        let pte = view.at(self.layout.index(va, 1)).load();
                        if pte.is_valid() {
                            log::debug!("  {:#x} -> {:?}", va, pte);
                        }
                    }
                }
                Block::Large { base, size, slot } => {
                    log::debug!("  {:#x}+{:#x} -> {:?}", base, size, slot.load());
                }
            }
        }
    }
}
