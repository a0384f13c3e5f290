//! Reverse mappings
//!
//! For every managed physical page, the list of (address space, virtual
//! address, leaf table) triples currently mapping it. Entries come from a
//! bounded [`PvPool`]; running out of entries is the allocation failure
//! `enter` reports to best-effort callers.

extern crate alloc;

use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::addr::PageNum;
use crate::space::SpaceId;

/// Handle of an entry in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PvIndex(u32);

/// One reverse mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvEntry {
    /// Address space holding the mapping
    pub space: SpaceId,
    /// Virtual address of the mapping
    pub va: usize,
    /// Leaf table holding the entry; `None` in the kernel address space
    pub ptp: Option<PageNum>,
}

#[derive(Debug, Clone, Copy)]
struct PvSlot {
    entry: PvEntry,
    next: Option<PvIndex>,
}

/// Reverse-map pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum number of live entries.
    pub capacity: usize,
    /// Slots created so far.
    pub total_slots: usize,
    /// Entries currently in use.
    pub used: usize,
}

/// A bounded pool of reverse-map entries.
///
/// Slots are created lazily up to the capacity and recycled through an
/// index-linked free list.
#[derive(Debug)]
pub struct PvPool {
    slots: Vec<PvSlot>,
    free_list: Option<PvIndex>,
    capacity: usize,
    used: usize,
}

const VACANT: PvEntry = PvEntry { space: 0, va: 0, ptp: None };

impl PvPool {
    /// Create a pool holding at most `capacity` live entries
    pub fn new(capacity: usize) -> Self {
        Self { slots: Vec::new(), free_list: None, capacity, used: 0 }
    }

    /// Allocate an entry, or `None` when the pool is exhausted
    pub fn alloc(&mut self) -> Option<PvIndex> {
        let index = match self.free_list {
            Some(index) => {
                self.free_list = self.slots[index.0 as usize].next;
                index
            }
            None => {
                if self.slots.len() >= self.capacity {
                    return None;
                }
                self.slots.push(PvSlot { entry: VACANT, next: None });
                PvIndex((self.slots.len() - 1) as u32)
            }
        };
        self.used += 1;
        self.slots[index.0 as usize].next = None;
        Some(index)
    }

    /// Return an entry to the pool
    pub fn free(&mut self, index: PvIndex) {
        let slot = &mut self.slots[index.0 as usize];
        slot.entry = VACANT;
        slot.next = self.free_list;
        self.free_list = Some(index);
        self.used -= 1;
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats { capacity: self.capacity, total_slots: self.slots.len(), used: self.used }
    }

    fn slot(&self, index: PvIndex) -> &PvSlot {
        &self.slots[index.0 as usize]
    }

    fn slot_mut(&mut self, index: PvIndex) -> &mut PvSlot {
        &mut self.slots[index.0 as usize]
    }
}

/// Reverse-map chains for every managed page
#[derive(Debug)]
pub struct PvTable {
    pool: PvPool,
    heads: HashMap<PageNum, PvIndex>,
}

impl PvTable {
    /// Create an empty table backed by a pool of `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self { pool: PvPool::new(capacity), heads: HashMap::new() }
    }

    /// Reserve an entry
    pub fn alloc(&mut self) -> Option<PvIndex> {
        self.pool.alloc()
    }

    /// Release an entry that is not on any chain
    pub fn free(&mut self, index: PvIndex) {
        self.pool.free(index);
    }

    /// Link a reserved entry at the head of the chain for `pfn`
    pub fn enter(&mut self, pfn: PageNum, index: PvIndex, entry: PvEntry) {
        let next = self.heads.insert(pfn, index);
        let slot = self.pool.slot_mut(index);
        slot.entry = entry;
        slot.next = next;
    }

    /// Unlink the entry for (`space`, `va`) from the chain for `pfn`.
    /// The entry stays allocated so the caller can reuse or free it.
    pub fn remove(&mut self, pfn: PageNum, space: SpaceId, va: usize) -> Option<(PvIndex, PvEntry)> {
        let mut prev: Option<PvIndex> = None;
        let mut cur = self.heads.get(&pfn).copied();

        while let Some(index) = cur {
            let slot = *self.pool.slot(index);
            if slot.entry.space == space && slot.entry.va == va {
                match prev {
                    Some(p) => self.pool.slot_mut(p).next = slot.next,
                    None => match slot.next {
                        Some(next) => {
                            self.heads.insert(pfn, next);
                        }
                        None => {
                            self.heads.remove(&pfn);
                        }
                    },
                }
                self.pool.slot_mut(index).next = None;
                return Some((index, slot.entry));
            }
            prev = cur;
            cur = slot.next;
        }
        None
    }

    /// Unlink the first entry of the chain for `pfn`
    pub fn pop(&mut self, pfn: PageNum) -> Option<(PvIndex, PvEntry)> {
        let index = *self.heads.get(&pfn)?;
        let slot = *self.pool.slot(index);
        match slot.next {
            Some(next) => {
                self.heads.insert(pfn, next);
            }
            None => {
                self.heads.remove(&pfn);
            }
        }
        self.pool.slot_mut(index).next = None;
        Some((index, slot.entry))
    }

    /// Entries currently mapping `pfn`
    pub fn iter(&self, pfn: PageNum) -> PvIter<'_> {
        PvIter { table: self, cur: self.heads.get(&pfn).copied() }
    }

    /// Number of mappings of `pfn`
    pub fn count(&self, pfn: PageNum) -> usize {
        self.iter(pfn).count()
    }

    /// Whether `pfn` has no mappings
    pub fn is_unmapped(&self, pfn: PageNum) -> bool {
        !self.heads.contains_key(&pfn)
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// Iterator over one reverse-map chain
pub struct PvIter<'a> {
    table: &'a PvTable,
    cur: Option<PvIndex>,
}

impl Iterator for PvIter<'_> {
    type Item = PvEntry;

    fn next(&mut self) -> Option<PvEntry> {
        let index = self.cur?;
        let slot = self.table.pool.slot(index);
        self.cur = slot.next;
        Some(slot.entry)
    }
}
