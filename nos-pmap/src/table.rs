//! Page table tree walker
//!
//! Table pages live in the frame allocator and are reached through
//! [`TableView`], which performs the frame to accessible-memory translation
//! in one place. The [`Walker`] resolves a virtual address to the chain of
//! tables that translate it, stopping at the first invalid entry or large
//! page. Walking never allocates.

use nos_api::memory::FrameAllocator;

use crate::addr::{pfn_to_addr, PageNum, PAGE_MASK, PAGE_SIZE};
use crate::config::MAX_LEVELS;
use crate::layout::{PmapLayout, ENTRIES_PER_TABLE};
use crate::pte::{Pte, PteSlot};

/// One table page at a given level
#[derive(Clone, Copy)]
pub struct TableView<'a> {
    pfn: PageNum,
    level: usize,
    frame: &'a nos_api::memory::Frame,
}

impl<'a> TableView<'a> {
    /// View the table held in frame `pfn`
    pub fn new(frames: &'a dyn FrameAllocator, pfn: PageNum, level: usize) -> Self {
        let Some(frame) = frames.frame(pfn) else {
            fatal!("pmap: table page {:#x} at level {} has no backing frame", pfn, level);
        };
        Self { pfn, level, frame }
    }

    /// Entry `index` of this table
    #[inline]
    pub fn at(&self, index: usize) -> PteSlot<'a> {
        PteSlot::new(self.frame.word(index))
    }

    /// Frame holding the table
    pub fn pfn(&self) -> PageNum {
        self.pfn
    }

    /// Level of the table, 1 being the leaf table
    pub fn level(&self) -> usize {
        self.level
    }

    /// Number of valid entries
    pub fn valid_entries(&self) -> usize {
        (0..ENTRIES_PER_TABLE)
            .filter(|&i| self.at(i).load().is_valid())
            .count()
    }
}

/// The tables traversed while resolving one virtual address.
///
/// `table(level)` is the frame of the table consulted at `level`, known for
/// every level from the top down to [`TablePath::stop_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TablePath {
    tables: [PageNum; MAX_LEVELS + 1],
    top: usize,
    stop: usize,
}

impl TablePath {
    /// Table consulted at `level`, if the walk got that far
    pub fn table(&self, level: usize) -> Option<PageNum> {
        (level >= self.stop && level <= self.top).then(|| self.tables[level])
    }

    /// Lowest level reached
    pub fn stop_level(&self) -> usize {
        self.stop
    }

    /// Whether every intermediate level is valid down to the leaf table
    pub fn is_complete(&self) -> bool {
        self.stop == 1
    }
}

/// Result of [`Walker::find_pte`]
#[derive(Debug, Clone, Copy)]
pub struct PteLookup<'a> {
    /// Level of the located entry; 1 for a leaf
    pub level: usize,
    /// Table holding the entry
    pub table: PageNum,
    /// The entry itself
    pub slot: PteSlot<'a>,
}

/// A unit of work for range operations
#[derive(Debug, Clone, Copy)]
pub enum Block<'a> {
    /// Part of a leaf table covering `[start, end)`
    Table {
        /// First address in the block
        start: usize,
        /// End of the block (exclusive)
        end: usize,
        /// Tables down to the leaf
        path: TablePath,
    },
    /// A large-page leaf
    Large {
        /// First address mapped by the entry
        base: usize,
        /// Bytes mapped by the entry
        size: usize,
        /// The large-page entry
        slot: PteSlot<'a>,
    },
}

/// Reads the table tree of one address space
#[derive(Clone, Copy)]
pub struct Walker<'a> {
    frames: &'a dyn FrameAllocator,
    layout: &'a PmapLayout,
}

impl<'a> Walker<'a> {
    /// Walker over tables held by `frames`
    pub fn new(frames: &'a dyn FrameAllocator, layout: &'a PmapLayout) -> Self {
        Self { frames, layout }
    }

    /// View of the table in `pfn` at `level`
    #[inline]
    pub fn view(&self, pfn: PageNum, level: usize) -> TableView<'a> {
        TableView::new(self.frames, pfn, level)
    }

    /// Tables traversed for `va`, starting at `root`
    pub fn path(&self, root: PageNum, va: usize) -> TablePath {
        let top = self.layout.levels;
        let mut path = TablePath { tables: [0; MAX_LEVELS + 1], top, stop: top };
        path.tables[top] = root;

        for level in (2..=top).rev() {
            let pde = self.view(path.tables[level], level).at(self.layout.index(va, level)).load();
            if !pde.is_valid() || pde.is_large() {
                break;
            }
            path.tables[level - 1] = pde.pfn();
            path.stop = level - 1;
        }
        path
    }

    /// Entry for `va` in the table at `level` of `path`
    pub fn entry(&self, path: &TablePath, va: usize, level: usize) -> Option<PteSlot<'a>> {
        let table = path.table(level)?;
        Some(self.view(table, level).at(self.layout.index(va, level)))
    }

    /// Leaf entry for `va`, if every level above it is valid
    pub fn leaf(&self, path: &TablePath, va: usize) -> Option<PteSlot<'a>> {
        if !path.is_complete() {
            return None;
        }
        self.entry(path, va, 1)
    }

    /// Walk down from `root`, stopping at an invalid entry, a large-page
    /// leaf, or the leaf level.
    pub fn find_pte(&self, root: PageNum, va: usize) -> PteLookup<'a> {
        let path = self.path(root, va);
        let level = path.stop_level();
        let table = path.tables[level];
        PteLookup {
            level,
            table,
            slot: self.view(table, level).at(self.layout.index(va, level)),
        }
    }

    /// Whether every intermediate level for `va` is valid down to the leaf
    pub fn resolve_all_levels(&self, root: PageNum, va: usize) -> bool {
        self.path(root, va).is_complete()
    }

    /// Physical address `va` translates to.
    ///
    /// The direct map is computed algebraically; everything else goes
    /// through the tables.
    pub fn translate(&self, root: PageNum, va: usize) -> Option<usize> {
        if let Some(pa) = self.layout.virt_to_phys(va) {
            return Some(pa);
        }
        if va >= self.layout.max_address() {
            return None;
        }
        let lookup = self.find_pte(root, va);
        let pte = lookup.slot.load();
        if !pte.is_valid() {
            return None;
        }
        if lookup.level == 1 {
            return Some(pte.frame() | (va & PAGE_MASK));
        }
        if pte.is_large() {
            let span = PmapLayout::level_span(lookup.level);
            return Some(pte.frame() | (va & (span - 1)));
        }
        None
    }

    /// Blocks making up `[sva, eva)`, skipping the self-map block and any
    /// region whose intermediate entry is invalid.
    pub fn blocks(&self, root: PageNum, sva: usize, eva: usize) -> Blocks<'a> {
        Blocks { walker: *self, root, va: sva, eva }
    }
}

/// Iterator returned by [`Walker::blocks`]
pub struct Blocks<'a> {
    walker: Walker<'a>,
    root: PageNum,
    va: usize,
    eva: usize,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Block<'a>;

    fn next(&mut self) -> Option<Block<'a>> {
        let layout = self.walker.layout;
        while self.va < self.eva {
            let va = self.va;
            if layout.in_self_map(va) {
                self.va = layout.self_map_end.min(self.eva);
                continue;
            }

            let path = self.walker.path(self.root, va);
            let stop = path.stop_level();
            if stop == 1 {
                let end = layout.block_end(va, 2).min(self.eva);
                self.va = end;
                return Some(Block::Table { start: va, end, path });
            }

            self.va = layout.block_end(va, stop).min(self.eva);
            if let Some(slot) = self.walker.entry(&path, va, stop) {
                let pde = slot.load();
                if pde.is_valid() && pde.is_large() {
                    let size = PmapLayout::level_span(stop);
                    return Some(Block::Large { base: va & !(size - 1), size, slot });
                }
            }
        }
        None
    }
}

/// Entry linking a freshly allocated table page into its parent
pub fn table_link(pfn: PageNum, user: bool) -> Pte {
    use crate::pte::PteFlags;
    let mut flags = PteFlags::VALID | PteFlags::WRITABLE;
    if user {
        flags |= PteFlags::USER;
    }
    Pte::new(pfn_to_addr(pfn), flags)
}

/// Pages covered by one block
pub fn pages_in(start: usize, end: usize) -> usize {
    (end - start) / PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PagingLevels;
    use crate::frame::FrameArena;
    use crate::pte::PteFlags;

    fn build(levels: PagingLevels) -> (FrameArena, PmapLayout, PageNum) {
        let arena = FrameArena::new(0x100, 16);
        let layout = PmapLayout::new(levels);
        let root = arena.alloc_zeroed_page().unwrap();
        (arena, layout, root)
    }

    /// Link tables by hand down to the leaf for `va`; returns the leaf table
    fn link_down(arena: &FrameArena, layout: &PmapLayout, root: PageNum, va: usize) -> PageNum {
        let walker = Walker::new(arena, layout);
        let mut table = root;
        for level in (2..=layout.levels).rev() {
            let next = arena.alloc_zeroed_page().unwrap();
            walker.view(table, level).at(layout.index(va, level)).store(table_link(next, true));
            table = next;
        }
        table
    }

    #[test]
    fn test_walk_stops_at_invalid_top() {
        let (arena, layout, root) = build(PagingLevels::Four);
        let walker = Walker::new(&arena, &layout);
        let lookup = walker.find_pte(root, 0x1000);
        assert_eq!(lookup.level, 4);
        assert_eq!(lookup.table, root);
        assert!(!walker.resolve_all_levels(root, 0x1000));
        assert_eq!(walker.translate(root, 0x1000), None);
    }

    #[test]
    fn test_walk_to_leaf() {
        let (arena, layout, root) = build(PagingLevels::Four);
        let walker = Walker::new(&arena, &layout);
        let va = 0x4020_3000;
        let leaf = link_down(&arena, &layout, root, va);
        walker
            .view(leaf, 1)
            .at(layout.index(va, 1))
            .store(Pte::new(0x7000, PteFlags::VALID));

        let path = walker.path(root, va);
        assert!(path.is_complete());
        assert_eq!(path.table(1), Some(leaf));
        assert_eq!(path.table(4), Some(root));
        assert_eq!(walker.translate(root, va + 0x10), Some(0x7010));
        assert_eq!(walker.view(leaf, 1).valid_entries(), 1);
    }

    #[test]
    fn test_large_page_terminates_walk() {
        let (arena, layout, root) = build(PagingLevels::Three);
        let walker = Walker::new(&arena, &layout);
        let va = 0x4000_0000;
        let l2 = arena.alloc_zeroed_page().unwrap();
        walker.view(root, 3).at(layout.index(va, 3)).store(table_link(l2, false));
        walker
            .view(l2, 2)
            .at(layout.index(va, 2))
            .store(Pte::new(0x20_0000, PteFlags::VALID | PteFlags::LARGE));

        let lookup = walker.find_pte(root, va + 0x1234);
        assert_eq!(lookup.level, 2);
        assert!(lookup.slot.load().is_large());
        assert_eq!(walker.translate(root, va + 0x1234), Some(0x20_1234));
        assert!(!walker.resolve_all_levels(root, va));
    }

    #[test]
    fn test_direct_map_bypasses_tables() {
        let (arena, layout, root) = build(PagingLevels::Two);
        let walker = Walker::new(&arena, &layout);
        assert_eq!(walker.translate(root, layout.direct_map_base + 0x3456), Some(0x3456));
    }

    #[test]
    fn test_blocks_skip_invalid_and_self_map() {
        let (arena, layout, root) = build(PagingLevels::Four);
        let walker = Walker::new(&arena, &layout);
        let va = 0x20_0000;
        link_down(&arena, &layout, root, va);
        // Recursive slot pointing back at the root
        walker.view(root, 4).at(crate::layout::SLOT_SELF_MAP).store(table_link(root, false));

        let blocks: Vec<_> = walker.blocks(root, 0, layout.self_map_end).collect();
        assert_eq!(blocks.len(), 1);
        match blocks[0] {
            Block::Table { start, end, .. } => {
                assert_eq!(start, va);
                assert_eq!(end, va + layout.large_page_size());
            }
            Block::Large { .. } => panic!("unexpected large block"),
        }
    }
}
