//! Mapping removal
//!
//! Range removal walks the range one leaf-table block at a time, unlinks
//! leaf tables that become empty, and finishes with a single shootdown
//! sized to the range. Unlinked table pages are freed only after that
//! shootdown has been acknowledged.

use crate::addr::{page_round_down, page_round_up, PageNum, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::manager::{PmapManager, PmapState};
use crate::ptp::DeferredFree;
use crate::pte::{Pte, PteSlot};
use crate::shootdown::{Invalidation, ShootBatch};
use crate::space::AddressSpace;
use crate::table::{pages_in, Block, TablePath};

/// Which entries a removal sweep takes out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveMode {
    All,
    SkipWired,
}

impl PmapManager {
    /// Remove every mapping of `space` in `[sva, eva)`
    pub fn remove(&self, space: &AddressSpace, sva: VirtAddr, eva: VirtAddr) {
        let (sva, eva) = self.clamp_range(space, sva.as_usize(), eva.as_usize());
        if sva < eva {
            self.do_remove(space, sva, eva, RemoveMode::All);
        }
    }

    /// Remove every non-wired user mapping of `space`
    pub fn collect(&self, space: &AddressSpace) {
        if space.is_kernel() {
            return;
        }
        self.do_remove(space, 0, self.layout.user_max, RemoveMode::SkipWired);
    }

    /// Page-align `[sva, eva)` and clip it to the part of the address
    /// space `space` may map.
    pub(crate) fn clamp_range(&self, space: &AddressSpace, sva: usize, eva: usize) -> (usize, usize) {
        // Both limits are page aligned, so clipping first keeps the
        // round-up from overflowing
        let (lo, hi) = if space.is_kernel() {
            (self.layout.kernel_min, self.layout.kernel_max)
        } else {
            (0, self.layout.user_max)
        };
        (page_round_down(sva).max(lo), page_round_up(eva.min(hi)))
    }

    pub(crate) fn do_remove(&self, space: &AddressSpace, sva: usize, eva: usize, mode: RemoveMode) {
        let walker = self.walker();
        let mut free = DeferredFree::new();
        let mut removed = Removed::default();

        let mut st = self.state.lock();
        let single = (eva - sva == PAGE_SIZE)
            .then(|| walker.path(space.root(), sva))
            .filter(|path| path.is_complete());
        if let Some(path) = single {
            self.remove_leaves(&mut st, space, sva, eva, &path, mode, &mut removed, &mut free);
        } else {
            for block in walker.blocks(space.root(), sva, eva) {
                match block {
                    Block::Table { start, end, path } => {
                        self.remove_leaves(&mut st, space, start, end, &path, mode, &mut removed, &mut free);
                    }
                    Block::Large { base, size, slot } => {
                        if base < sva || base + size > eva {
                            fatal!("pmap: partial removal of large page {:#x}+{:#x}", base, size);
                        }
                        if mode == RemoveMode::SkipWired && slot.load().is_wired() {
                            continue;
                        }
                        self.remove_large(space, slot, size);
                        removed.note(base, size / PAGE_SIZE);
                    }
                }
            }
        }
        drop(st);

        if removed.pages == 0 {
            return;
        }
        log::trace!(
            "pmap: space {} removed {} pages in {:#x}..{:#x}, {} table pages unlinked",
            space.id(),
            removed.pages,
            sva,
            eva,
            free.len()
        );

        let inv = if removed.pages == 1 {
            Invalidation::Page(removed.last)
        } else if !space.is_kernel() && pages_in(sva, eva) > self.config.shootall_threshold {
            Invalidation::All
        } else {
            Invalidation::Range { start: sva, end: eva }
        };
        let mut batch = ShootBatch::new();
        batch.push(space.shoot_scope(), inv);
        self.finish(batch, free);
    }

    /// Remove the valid entries of one leaf table in `[start, end)`
    #[allow(clippy::too_many_arguments)]
    fn remove_leaves(
        &self,
        st: &mut PmapState,
        space: &AddressSpace,
        start: usize,
        end: usize,
        path: &TablePath,
        mode: RemoveMode,
        removed: &mut Removed,
        free: &mut DeferredFree,
    ) {
        let Some(table) = path.table(1) else { return };
        let ptp = self.find_ptp(st, space, path, 1);
        if !space.is_kernel() && ptp.is_none() {
            fatal!("pmap: leaf table {:#x} of space {} is untracked", table, space.id());
        }

        let view = self.walker().view(table, 1);
        let before = removed.pages;
        for va in (start..end).step_by(PAGE_SIZE) {
            let slot = view.at(self.layout.index(va, 1));
            let pte = slot.load();
            if !pte.is_valid() || (mode == RemoveMode::SkipWired && pte.is_wired()) {
                continue;
            }
            let old = slot.swap(Pte::EMPTY);
            self.unaccount(st, space, va, old, ptp);
            removed.note(va, 1);
        }

        if let Some(ptp) = ptp {
            if removed.pages > before && st.ptps.wire_count(ptp) == 1 {
                self.free_ptp(st, space, start, path, free);
            }
        }
    }

    fn remove_large(&self, space: &AddressSpace, slot: PteSlot<'_>, size: usize) {
        let old = slot.swap(Pte::EMPTY);
        let stats = space.stats();
        stats.sub_resident(size / PAGE_SIZE);
        if old.is_wired() {
            stats.sub_wired(size / PAGE_SIZE);
        }
    }

    /// Undo the bookkeeping of a leaf entry just cleared at `va`
    fn unaccount(&self, st: &mut PmapState, space: &AddressSpace, va: usize, old: Pte, ptp: Option<PageNum>) {
        let stats = space.stats();
        stats.sub_resident(1);
        if old.is_wired() {
            stats.sub_wired(1);
        }
        if let Some(ptp) = ptp {
            st.ptps.drop_wire(ptp);
        }
        if old.is_managed() {
            self.sync_attrs(old);
            match st.pv.remove(old.pfn(), space.id(), va) {
                Some((index, _)) => st.pv.free(index),
                None => fatal!("pmap: managed mapping {:#x} of space {} missing from its reverse map", va, space.id()),
            }
        }
    }

    /// Remove every mapping of the page at `pa`, in every address space
    pub fn page_remove(&self, pa: PhysAddr) {
        let pfn = pa.pfn();
        let walker = self.walker();
        let mut batch = ShootBatch::new();
        let mut free = DeferredFree::new();

        let mut st = self.state.lock();
        while let Some((index, entry)) = st.pv.pop(pfn) {
            st.pv.free(index);
            let space = self.space_by_id(&st, entry.space);
            let path = walker.path(space.root(), entry.va);
            let Some(slot) = walker.leaf(&path, entry.va) else {
                fatal!("pmap: reverse map names {:#x} in space {} with no leaf table", entry.va, entry.space);
            };
            let old = slot.swap(Pte::EMPTY);
            if !old.is_valid() || old.pfn() != pfn {
                fatal!("pmap: reverse map for {:#x} disagrees with entry {:?} at {:#x}", pa, old, entry.va);
            }
            self.sync_attrs(old);

            let stats = space.stats();
            stats.sub_resident(1);
            if old.is_wired() {
                stats.sub_wired(1);
            }
            if let Some(ptp) = entry.ptp {
                if st.ptps.drop_wire(ptp) == 1 {
                    self.free_ptp(&mut st, &space, entry.va, &path, &mut free);
                }
            }
            batch.push(space.shoot_scope(), Invalidation::Page(entry.va));
        }
        drop(st);

        log::debug!("pmap: page_remove {:#x}: {} mappings, {} table pages unlinked", pa, batch.len(), free.len());
        self.finish(batch, free);
    }
}

/// Pages removed by one sweep
#[derive(Debug, Default)]
struct Removed {
    pages: usize,
    last: usize,
}

impl Removed {
    fn note(&mut self, va: usize, pages: usize) {
        self.pages += pages;
        self.last = va;
    }
}
