//! Boot helpers for unit tests

use alloc::sync::Arc;
use nos_api::memory::FrameAllocator;

use crate::addr::{PageNum, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::arch::Uniprocessor;
use crate::config::PmapConfig;
use crate::frame::FrameArena;
use crate::layout::PmapLayout;
use crate::manager::{BootRegion, PmapManager};
use crate::pte::Protection;
use crate::shootdown::ShootdownCoordinator;

pub(crate) const ARENA_BASE: PageNum = 0x1000;
pub(crate) const ARENA_FRAMES: usize = 256;
/// Physical start of the boot region, outside the arena
pub(crate) const BOOT_PA: usize = 0x20_0000;

pub(crate) struct Rig {
    pub(crate) pmap: PmapManager,
    pub(crate) frames: Arc<FrameArena>,
    pub(crate) tlb: Arc<Uniprocessor>,
}

/// Boot a uniprocessor pmap with one large-page-sized kernel region at the
/// bottom of kernel space
pub(crate) fn rig(config: PmapConfig) -> Rig {
    let frames = Arc::new(FrameArena::new(ARENA_BASE, ARENA_FRAMES));
    let tlb = Arc::new(Uniprocessor::new());
    let shootdown = Arc::new(ShootdownCoordinator::from_config(&config));
    let layout = PmapLayout::new(config.levels);
    let region = BootRegion {
        va: VirtAddr::new(layout.kernel_min),
        pa: PhysAddr::new(BOOT_PA),
        len: layout.large_page_size(),
        prot: Protection::READ_WRITE,
    };
    let pmap = PmapManager::bootstrap(config, frames.clone(), tlb.clone(), shootdown, &[region]).unwrap();
    Rig { pmap, frames, tlb }
}

pub(crate) fn boot() -> (PmapManager, Arc<FrameArena>) {
    boot_with(PmapConfig::default())
}

pub(crate) fn boot_with(config: PmapConfig) -> (PmapManager, Arc<FrameArena>) {
    let r = rig(config);
    (r.pmap, r.frames)
}

/// A fresh managed page
pub(crate) fn managed_page(frames: &FrameArena) -> PhysAddr {
    PhysAddr::from_pfn(frames.alloc_zeroed_page().unwrap())
}

/// User page `n` of a small test window
pub(crate) fn uva(n: usize) -> VirtAddr {
    VirtAddr::new(0x40_0000 + n * PAGE_SIZE)
}
