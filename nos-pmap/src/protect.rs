//! Protection changes and referenced/modified tracking

use nos_api::memory::PageAttrs;

use crate::addr::{PageNum, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::manager::PmapManager;
use crate::ptp::DeferredFree;
use crate::pte::{Protection, PteFlags, PteSlot};
use crate::shootdown::{Invalidation, ShootBatch};
use crate::space::AddressSpace;
use crate::table::{pages_in, Block};

impl PmapManager {
    /// Revoke write access, and set or clear no-execute, on every valid
    /// mapping of `space` in `[sva, eva)`.
    ///
    /// A large page must lie wholly inside the range; it is never split.
    pub fn write_protect(&self, space: &AddressSpace, sva: VirtAddr, eva: VirtAddr, prot: Protection) {
        let (sva, eva) = self.clamp_range(space, sva.as_usize(), eva.as_usize());
        if sva >= eva {
            return;
        }

        let mut set = PteFlags::empty();
        let mut clear = PteFlags::empty();
        if !prot.contains(Protection::WRITE) {
            clear |= PteFlags::WRITABLE;
        }
        if prot.contains(Protection::EXECUTE) {
            clear |= PteFlags::NO_EXEC;
        } else {
            set |= PteFlags::NO_EXEC;
        }

        let walker = self.walker();
        let mut changed = 0;
        let mut last = None;
        let st = self.state.lock();
        for block in walker.blocks(space.root(), sva, eva) {
            match block {
                Block::Table { start, end, path } => {
                    let Some(table) = path.table(1) else { continue };
                    let view = walker.view(table, 1);
                    for va in (start..end).step_by(PAGE_SIZE) {
                        if reprotect(view.at(self.layout.index(va, 1)), set, clear) {
                            changed += 1;
                            last = Some(va);
                        }
                    }
                }
                Block::Large { base, size, slot } => {
                    if base < sva || base + size > eva {
                        fatal!("pmap: partial protection of large page {:#x}+{:#x}", base, size);
                    }
                    if reprotect(slot, set, clear) {
                        changed += 1;
                        last = None;
                    }
                }
            }
        }
        drop(st);

        if changed == 0 {
            return;
        }
        log::trace!("pmap: space {} protect {:#x}..{:#x} {:?}, {} entries", space.id(), sva, eva, prot, changed);

        let inv = match last {
            Some(va) if changed == 1 => Invalidation::Page(va),
            _ if !space.is_kernel() && pages_in(sva, eva) > self.config.shootall_threshold => Invalidation::All,
            _ => Invalidation::Range { start: sva, end: eva },
        };
        let mut batch = ShootBatch::new();
        batch.push(space.shoot_scope(), inv);
        self.finish(batch, DeferredFree::new());
    }

    /// Reduce the protection of `[sva, eva)` to `prot`. Never grants access.
    pub fn protect(&self, space: &AddressSpace, sva: VirtAddr, eva: VirtAddr, prot: Protection) {
        if prot.is_empty() {
            self.remove(space, sva, eva);
        } else if !prot.contains(Protection::WRITE) {
            self.write_protect(space, sva, eva, prot);
        }
    }

    /// Reduce the protection of every mapping of the page at `pa`
    pub fn page_protect(&self, pa: PhysAddr, prot: Protection) {
        if prot.contains(Protection::WRITE) {
            return;
        }
        if prot.is_empty() {
            self.page_remove(pa);
        } else {
            self.clear_mapping_bits(pa.pfn(), PteFlags::WRITABLE);
        }
    }

    /// Whether the page at `pa` has any of `attrs`, in its own metadata or
    /// in any mapping of it. Bits found in mappings are cached in the page.
    pub fn test_attrs(&self, pa: PhysAddr, attrs: PageAttrs) -> bool {
        let pfn = pa.pfn();
        let Some(meta) = self.frames.page_meta(pfn) else {
            return false;
        };
        if meta.attrs().intersects(attrs) {
            return true;
        }

        let walker = self.walker();
        let mut found = PageAttrs::empty();
        let st = self.state.lock();
        for entry in st.pv.iter(pfn) {
            let space = self.space_by_id(&st, entry.space);
            let path = walker.path(space.root(), entry.va);
            if let Some(slot) = walker.leaf(&path, entry.va) {
                found |= slot.load().page_attrs() & attrs;
            }
            if found == attrs {
                break;
            }
        }
        drop(st);

        if found.is_empty() {
            return false;
        }
        meta.set_attrs(found);
        true
    }

    /// Clear `attrs` on the page at `pa` and on every mapping of it.
    /// Returns whether any of them were set.
    pub fn clear_attrs(&self, pa: PhysAddr, attrs: PageAttrs) -> bool {
        let pfn = pa.pfn();
        let Some(meta) = self.frames.page_meta(pfn) else {
            return false;
        };
        let cached = meta.clear_attrs(attrs).intersects(attrs);
        let mapped = self.clear_mapping_bits(pfn, PteFlags::from_page_attrs(attrs));
        cached || mapped
    }

    /// Whether the page at `pa` has been accessed
    pub fn is_referenced(&self, pa: PhysAddr) -> bool {
        self.test_attrs(pa, PageAttrs::REFERENCED)
    }

    /// Whether the page at `pa` has been written
    pub fn is_modified(&self, pa: PhysAddr) -> bool {
        self.test_attrs(pa, PageAttrs::MODIFIED)
    }

    /// Clear the referenced attribute of the page at `pa`
    pub fn clear_reference(&self, pa: PhysAddr) -> bool {
        self.clear_attrs(pa, PageAttrs::REFERENCED)
    }

    /// Clear the modified attribute of the page at `pa`
    pub fn clear_modify(&self, pa: PhysAddr) -> bool {
        self.clear_attrs(pa, PageAttrs::MODIFIED)
    }

    /// Clear `bits` in every mapping of `pfn`, shooting down each mapping
    /// that changed. Returns whether any mapping had them.
    fn clear_mapping_bits(&self, pfn: PageNum, bits: PteFlags) -> bool {
        let walker = self.walker();
        let mut batch = ShootBatch::new();
        let st = self.state.lock();
        for entry in st.pv.iter(pfn) {
            let space = self.space_by_id(&st, entry.space);
            let path = walker.path(space.root(), entry.va);
            let Some(slot) = walker.leaf(&path, entry.va) else {
                fatal!("pmap: reverse map names {:#x} in space {} with no leaf table", entry.va, entry.space);
            };
            if slot.clear_bits(bits).flags().intersects(bits) {
                batch.push(space.shoot_scope(), Invalidation::Page(entry.va));
            }
        }
        drop(st);

        let changed = !batch.is_empty();
        self.finish(batch, DeferredFree::new());
        changed
    }
}

/// Apply a protection change to one entry; whether it changed
fn reprotect(slot: PteSlot<'_>, set: PteFlags, clear: PteFlags) -> bool {
    let old = slot.update(|pte| pte.with(set).without(clear));
    old.is_valid() && old != old.with(set).without(clear)
}
