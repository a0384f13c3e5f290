//! Page table page lifecycle
//!
//! Every table page below the top level of a user address space is
//! recorded in a [`PtpMap`] with its owner, level and wire count. The wire
//! count is one structural reference for the link from the parent plus one
//! per valid entry the page holds. When only the structural reference is
//! left the page is unlinked and queued on a [`DeferredFree`] list, which
//! can only be released with the completion token of the shootdown that
//! followed the unlink.
//!
//! Kernel table pages are shared by every address space and are never
//! freed, so they are not tracked here.

extern crate alloc;

use alloc::vec::Vec;
use hashbrown::HashMap;
use nos_api::memory::FrameAllocator;

use crate::addr::PageNum;
use crate::error::{PmapError, Result};
use crate::manager::{PmapManager, PmapState};
use crate::pte::Pte;
use crate::shootdown::ShootdownComplete;
use crate::space::{AddressSpace, SpaceId};
use crate::table::{table_link, TablePath};

/// Bookkeeping for one table page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpInfo {
    /// Address space the page belongs to
    pub owner: SpaceId,
    /// Level of the table held in the page
    pub level: usize,
    /// Structural reference plus valid entries
    pub wire_count: usize,
}

/// Snapshot of one table page, for inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PtpSnapshot {
    /// Level of the table
    pub level: usize,
    /// Frame holding the table
    pub pfn: PageNum,
    /// Current wire count
    pub wire_count: usize,
}

/// Table pages of all user address spaces
#[derive(Debug, Default)]
pub struct PtpMap {
    pages: HashMap<PageNum, PtpInfo>,
}

impl PtpMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self { pages: HashMap::new() }
    }

    /// Record a freshly linked page holding only its structural reference
    pub fn insert(&mut self, pfn: PageNum, owner: SpaceId, level: usize) {
        let info = PtpInfo { owner, level, wire_count: 1 };
        if self.pages.insert(pfn, info).is_some() {
            fatal!("pmap: table page {:#x} recorded twice", pfn);
        }
    }

    /// Bookkeeping for `pfn`
    pub fn get(&self, pfn: PageNum) -> Option<&PtpInfo> {
        self.pages.get(&pfn)
    }

    /// Wire count of `pfn`
    pub fn wire_count(&self, pfn: PageNum) -> usize {
        match self.pages.get(&pfn) {
            Some(info) => info.wire_count,
            None => fatal!("pmap: wire count of untracked table page {:#x}", pfn),
        }
    }

    /// Account one more valid entry in `pfn`
    pub fn add_wire(&mut self, pfn: PageNum) {
        match self.pages.get_mut(&pfn) {
            Some(info) => info.wire_count += 1,
            None => fatal!("pmap: wiring untracked table page {:#x}", pfn),
        }
    }

    /// Account one fewer valid entry in `pfn`; returns the new count
    pub fn drop_wire(&mut self, pfn: PageNum) -> usize {
        let Some(info) = self.pages.get_mut(&pfn) else {
            fatal!("pmap: unwiring untracked table page {:#x}", pfn);
        };
        if info.wire_count <= 1 {
            fatal!("pmap: table page {:#x} wire count would drop below its structural reference", pfn);
        }
        info.wire_count -= 1;
        info.wire_count
    }

    /// Forget `pfn`
    pub fn remove(&mut self, pfn: PageNum) -> Option<PtpInfo> {
        self.pages.remove(&pfn)
    }

    /// Forget every page owned by `owner`, returning their frames
    pub fn take_owned(&mut self, owner: SpaceId) -> Vec<PageNum> {
        let owned: Vec<PageNum> = self
            .pages
            .iter()
            .filter(|(_, info)| info.owner == owner)
            .map(|(&pfn, _)| pfn)
            .collect();
        for pfn in &owned {
            self.pages.remove(pfn);
        }
        owned
    }

    /// Pages owned by `owner`, ordered by level and frame
    pub fn snapshot(&self, owner: SpaceId) -> Vec<PtpSnapshot> {
        let mut pages: Vec<PtpSnapshot> = self
            .pages
            .iter()
            .filter(|(_, info)| info.owner == owner)
            .map(|(&pfn, info)| PtpSnapshot { level: info.level, pfn, wire_count: info.wire_count })
            .collect();
        pages.sort_unstable();
        pages
    }

    /// Number of tracked pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether no page is tracked
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Table pages unlinked during one operation, waiting for the shootdown
/// that makes them unreachable from every TLB.
#[derive(Debug, Default)]
#[must_use = "unlinked table pages leak unless released"]
pub struct DeferredFree {
    pages: Vec<PageNum>,
}

impl DeferredFree {
    /// Create an empty list
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Queue an unlinked page
    pub fn push(&mut self, pfn: PageNum) {
        self.pages.push(pfn);
    }

    /// Number of queued pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Return every queued page to the allocator
    pub fn release(self, frames: &dyn FrameAllocator, _done: ShootdownComplete) {
        for pfn in self.pages {
            frames.free_page(pfn);
        }
    }
}

impl PmapManager {
    /// Table page at `level` on `path`, if it belongs to `space`.
    ///
    /// The per-level hint short-circuits the metadata lookup when it matches
    /// the frame found in the parent entry.
    pub(crate) fn find_ptp(
        &self,
        st: &PmapState,
        space: &AddressSpace,
        path: &TablePath,
        level: usize,
    ) -> Option<PageNum> {
        if space.is_kernel() {
            return None;
        }
        let pfn = path.table(level)?;
        if space.hint(level) == Some(pfn) {
            return Some(pfn);
        }
        match st.ptps.get(pfn) {
            Some(info) if info.owner == space.id() && info.level == level => {
                space.set_hint(level, pfn);
                Some(pfn)
            }
            _ => None,
        }
    }

    /// Make sure every table down to the leaf table for `va` exists,
    /// allocating missing ones top-down. Returns the leaf table.
    pub(crate) fn get_ptp(
        &self,
        st: &mut PmapState,
        space: &AddressSpace,
        va: usize,
    ) -> Result<PageNum> {
        let walker = self.walker();
        let top = self.layout.levels;
        let mut parent = space.root();

        for level in (1..top).rev() {
            let parent_level = level + 1;
            let slot = walker.view(parent, parent_level).at(self.layout.index(va, parent_level));
            let pde = slot.load();
            let pfn = if pde.is_valid() {
                if pde.is_large() {
                    fatal!("pmap: large page in user address space {} at {:#x}", space.id(), va);
                }
                pde.pfn()
            } else {
                let pfn = self.frames.alloc_zeroed_page().ok_or(PmapError::OutOfMemory)?;
                st.ptps.insert(pfn, space.id(), level);
                slot.store(table_link(pfn, true));
                if parent_level != top {
                    st.ptps.add_wire(parent);
                }
                space.stats().add_table_pages(1);
                log::trace!("pmap: space {} new level {} table {:#x} for {:#x}", space.id(), level, pfn, va);
                pfn
            };
            space.set_hint(level, pfn);
            parent = pfn;
        }
        Ok(parent)
    }

    /// Unlink the now-empty leaf table on `path` and walk upwards, unlinking
    /// every parent that loses its last entry. Unlinked pages go on `free`.
    pub(crate) fn free_ptp(
        &self,
        st: &mut PmapState,
        space: &AddressSpace,
        va: usize,
        path: &TablePath,
        free: &mut DeferredFree,
    ) {
        let walker = self.walker();
        let top = self.layout.levels;
        let mut level = 1;

        loop {
            let (Some(pfn), Some(parent)) = (path.table(level), path.table(level + 1)) else {
                fatal!("pmap: freeing table for {:#x} with an incomplete path", va);
            };
            walker.view(parent, level + 1).at(self.layout.index(va, level + 1)).swap(Pte::EMPTY);
            if st.ptps.remove(pfn).is_none() {
                fatal!("pmap: freeing untracked table page {:#x}", pfn);
            }
            space.clear_hint(level, pfn);
            space.stats().sub_table_pages(1);
            free.push(pfn);

            if level + 1 == top || st.ptps.drop_wire(parent) > 1 {
                break;
            }
            level += 1;
        }
    }
}
