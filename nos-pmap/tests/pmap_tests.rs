//! Pmap integration tests

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

use common::{boot, boot_with_frames, set_cpu, uva, valid_entries, Delivery, Harness};
use nos_pmap::{
    EnterFlags, FrameAllocator, PagingLevels, PhysAddr, PmapConfig, PmapError, Protection, VirtAddr,
    PAGE_SIZE,
};
use proptest::prelude::*;

/// Every table page of `space` holds one structural reference plus one per
/// valid entry
fn assert_wire_counts(h: &Harness, space: &nos_pmap::AddressSpace) {
    for ptp in h.pmap.ptp_info(space) {
        assert_eq!(
            ptp.wire_count,
            1 + valid_entries(&h.frames, ptp.pfn, ptp.level),
            "table page {:#x} at level {}",
            ptp.pfn,
            ptp.level
        );
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

fn basic_lifecycle(levels: PagingLevels) {
    let h = boot(PmapConfig::default().with_levels(levels), 1, Delivery::Inline);
    let baseline = h.frames.allocated_pages();

    let space = h.pmap.create().unwrap();
    let va = VirtAddr::new(0x1000);
    let frame = PhysAddr::from_pfn(5);
    h.pmap.enter(&space, va, frame, Protection::READ_WRITE, EnterFlags::empty()).unwrap();
    assert_eq!(h.pmap.extract(&space, va), Some(PhysAddr::new(0x5000)));
    assert_eq!(space.resident_count(), 1);

    h.pmap.remove(&space, va, VirtAddr::new(0x2000));
    assert_eq!(h.pmap.extract(&space, va), None);
    assert_eq!(space.resident_count(), 0);

    h.pmap.destroy(&space);
    assert_eq!(h.frames.allocated_pages(), baseline);
}

#[test]
fn test_basic_lifecycle_four_levels() {
    basic_lifecycle(PagingLevels::Four);
}

#[test]
fn test_basic_lifecycle_three_levels() {
    basic_lifecycle(PagingLevels::Three);
}

#[test]
fn test_basic_lifecycle_two_levels() {
    basic_lifecycle(PagingLevels::Two);
}

#[test]
fn test_destroy_removes_leftover_mappings() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let pa = h.page();
    let baseline = h.frames.allocated_pages();

    let space = h.pmap.create().unwrap();
    for i in 0..4 {
        h.pmap.enter(&space, uva(i * 600), pa, Protection::READ, EnterFlags::WIRED).unwrap();
    }
    h.pmap.destroy(&space);

    assert!(h.pmap.pv_mappings(pa).is_empty());
    assert_eq!(h.pmap.pv_stats().used, 0);
    assert_eq!(h.frames.allocated_pages(), baseline);
    assert_eq!(h.pmap.space_count(), 1);
}

#[test]
#[should_panic(expected = "still active")]
fn test_destroy_while_active_elsewhere_is_fatal() {
    let h = boot(PmapConfig::default(), 2, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    set_cpu(1);
    h.pmap.activate(&space);
    set_cpu(0);
    h.pmap.destroy(&space);
}

#[test]
fn test_activate_switches_roots() {
    let h = boot(PmapConfig::default(), 2, Delivery::Inline);
    let a = h.pmap.create().unwrap();
    let b = h.pmap.create().unwrap();

    h.pmap.activate(&a);
    set_cpu(1);
    h.pmap.activate(&b);
    set_cpu(0);

    assert_eq!(h.machine.root(0), a.root_pa());
    assert_eq!(h.machine.root(1), b.root_pa());
    assert!(a.is_active_on(0) && !a.is_active_on(1));
    assert!(b.is_active_on(1) && !b.is_active_on(0));
}

// ============================================================================
// Kernel growth
// ============================================================================

#[test]
fn test_kva_growth_propagates_to_every_space() {
    let h = boot(PmapConfig::default().with_levels(PagingLevels::Two), 1, Delivery::Inline);
    let a = h.pmap.create().unwrap();
    let b = h.pmap.create().unwrap();
    let old = h.pmap.kernel_bound();
    let span = h.layout().large_page_size();

    let new = h.pmap.grow_kernel(old.offset(3 * span));
    assert_eq!(new, old.offset(3 * span));

    let top = h.layout().levels;
    for va in (old.as_usize()..new.as_usize()).step_by(span) {
        let kernel = h.pmap.find_pte(h.pmap.kernel(), VirtAddr::new(va));
        assert!(kernel.level < top, "kernel has no table for {:#x}", va);
        for space in [&a, &b] {
            assert!(h.pmap.resolve_all_levels(space, VirtAddr::new(va)));
        }
    }
    // Boot region leaf, initial KVA leaf, then one per grown span
    assert_eq!(h.pmap.kernel_table_pages()[1], 2 + 3);
}

#[test]
fn test_kernel_mapping_in_grown_kva_is_shared() {
    let h = boot(PmapConfig::default().with_levels(PagingLevels::Two), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    let grown = h.pmap.grow_kernel(h.pmap.kernel_bound().offset(1));
    let kva = grown.as_usize() - PAGE_SIZE;
    let pa = h.page();

    h.pmap.kenter(VirtAddr::new(kva), pa, Protection::READ_WRITE);
    assert_eq!(h.pmap.extract(&space, VirtAddr::new(kva)), Some(pa));
    assert_eq!(h.machine.access(&h.pmap, &space, VirtAddr::new(kva), true), Some(pa));

    h.pmap.kremove(VirtAddr::new(kva), PAGE_SIZE);
    assert_eq!(h.pmap.extract(&space, VirtAddr::new(kva)), None);
}

#[test]
fn test_grow_below_bound_is_noop() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let bound = h.pmap.kernel_bound();
    let allocated = h.frames.allocated_pages();
    assert_eq!(h.pmap.grow_kernel(VirtAddr::new(h.layout().kernel_min)), bound);
    assert_eq!(h.frames.allocated_pages(), allocated);
}

#[test]
fn test_virtual_space_starts_after_boot_regions() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let (start, end) = h.pmap.virtual_space();
    assert_eq!(start.as_usize(), h.layout().kernel_min + h.layout().large_page_size());
    assert_eq!(end.as_usize(), h.layout().kernel_max);
}

/// Kernel boot mappings changed through the kernel space must look the
/// same from every user space
fn kernel_half_coherence(levels: PagingLevels) {
    let h = boot(PmapConfig::default().with_levels(levels), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    h.pmap.activate(&space);
    let base = h.layout().kernel_min;
    let size = h.layout().large_page_size();
    let target = VirtAddr::new(base + size / 2);
    let expected = PhysAddr::new(common::BOOT_PA + size / 2);

    assert_eq!(h.pmap.extract(&space, target), Some(expected));
    assert_eq!(h.machine.access(&h.pmap, &space, target, true), Some(expected));

    h.pmap.write_protect(h.pmap.kernel(), VirtAddr::new(base), VirtAddr::new(base + size), Protection::READ);
    assert!(!h.pmap.find_pte(&space, target).slot.load().is_writable());
    assert_eq!(h.machine.access(&h.pmap, &space, target, true), None);
    assert_eq!(h.machine.access(&h.pmap, &space, target, false), Some(expected));

    h.pmap.remove(h.pmap.kernel(), VirtAddr::new(base), VirtAddr::new(base + size));
    assert_eq!(h.pmap.extract(h.pmap.kernel(), target), None);
    assert_eq!(h.pmap.extract(&space, target), None);
    assert_eq!(h.machine.access(&h.pmap, &space, target, false), None);
}

#[test]
fn test_kernel_half_coherence_two_levels() {
    kernel_half_coherence(PagingLevels::Two);
}

#[test]
fn test_kernel_half_coherence_three_levels() {
    kernel_half_coherence(PagingLevels::Three);
}

#[test]
fn test_kernel_half_coherence_four_levels() {
    kernel_half_coherence(PagingLevels::Four);
}

// ============================================================================
// Mapping operations
// ============================================================================

#[test]
fn test_write_protect_rejects_writes() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    h.pmap.activate(&space);
    let pa = h.page();
    h.pmap.enter(&space, uva(1), pa, Protection::READ_WRITE, EnterFlags::empty()).unwrap();
    assert_eq!(h.machine.access(&h.pmap, &space, uva(1), true), Some(pa));
    assert!(h.machine.cached(0, uva(1)));

    h.pmap.write_protect(&space, uva(1), uva(2), Protection::READ);
    assert_eq!(h.pmap.extract(&space, uva(1)), Some(pa));
    assert!(!h.machine.cached(0, uva(1)));
    assert_eq!(h.machine.access(&h.pmap, &space, uva(1), true), None);
    assert_eq!(h.machine.access(&h.pmap, &space, uva(1), false), Some(pa));
}

#[test]
#[should_panic(expected = "partial protection of large page")]
fn test_write_protect_inside_large_page_is_fatal() {
    let h = boot(PmapConfig::default().with_levels(PagingLevels::Three), 1, Delivery::Inline);
    let base = h.layout().kernel_min;
    h.pmap.write_protect(
        h.pmap.kernel(),
        VirtAddr::new(base),
        VirtAddr::new(base + PAGE_SIZE),
        Protection::READ,
    );
}

#[test]
fn test_range_to_end_of_address_space() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    let pa = h.page();
    h.pmap.enter(&space, uva(3), pa, Protection::READ_WRITE, EnterFlags::empty()).unwrap();

    h.pmap.remove(&space, uva(3), VirtAddr::new(usize::MAX));
    assert_eq!(h.pmap.extract(&space, uva(3)), None);
    h.pmap.remove(&space, VirtAddr::new(0), VirtAddr::new(usize::MAX));
    assert!(h.pmap.ptp_info(&space).is_empty());
}

#[test]
fn test_replacement_correctness() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    let (a, b) = (h.page(), h.page());
    h.pmap.enter(&space, uva(4), a, Protection::READ, EnterFlags::empty()).unwrap();
    h.pmap.enter(&space, uva(4), b, Protection::READ, EnterFlags::empty()).unwrap();

    assert_eq!(h.pmap.extract(&space, uva(4)), Some(b));
    assert!(!h.pmap.pv_mappings(a).contains(&(space.id(), uva(4))));
    assert!(h.pmap.pv_mappings(b).contains(&(space.id(), uva(4))));
    assert_wire_counts(&h, &space);
}

#[test]
fn test_replacement_invalidates_stale_translation() {
    let h = boot(PmapConfig::default(), 2, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    let (a, b) = (h.page(), h.page());
    h.pmap.enter(&space, uva(4), a, Protection::READ, EnterFlags::empty()).unwrap();

    set_cpu(1);
    h.pmap.activate(&space);
    assert_eq!(h.machine.access(&h.pmap, &space, uva(4), false), Some(a));
    set_cpu(0);

    h.pmap.enter(&space, uva(4), b, Protection::READ, EnterFlags::empty()).unwrap();
    set_cpu(1);
    assert_eq!(h.machine.access(&h.pmap, &space, uva(4), false), Some(b));
    set_cpu(0);
}

#[test]
fn test_remove_is_idempotent() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    let pa = h.page();
    h.pmap.enter(&space, uva(2), pa, Protection::READ, EnterFlags::empty()).unwrap();
    h.pmap.enter(&space, uva(3), pa, Protection::READ, EnterFlags::empty()).unwrap();

    h.pmap.remove(&space, uva(2), uva(3));
    let ptps = h.pmap.ptp_info(&space);
    let stats = h.pmap.shootdown().stats();
    let allocated = h.frames.allocated_pages();

    h.pmap.remove(&space, uva(2), uva(3));
    assert_eq!(h.pmap.ptp_info(&space), ptps);
    assert_eq!(h.pmap.shootdown().stats(), stats);
    assert_eq!(h.frames.allocated_pages(), allocated);
    assert_eq!(h.pmap.extract(&space, uva(3)), Some(pa));
}

#[test]
fn test_page_remove_completeness() {
    let h = boot(PmapConfig::default(), 2, Delivery::Inline);
    let a = h.pmap.create().unwrap();
    let b = h.pmap.create().unwrap();
    let pa = h.page();
    let mappings = [(&a, uva(1)), (&a, uva(900)), (&b, uva(1)), (&b, uva(7))];
    for (space, va) in mappings {
        h.pmap.enter(space, va, pa, Protection::READ_WRITE, EnterFlags::empty()).unwrap();
    }

    h.pmap.activate(&a);
    set_cpu(1);
    h.pmap.activate(&b);
    assert_eq!(h.machine.access(&h.pmap, &b, uva(7), true), Some(pa));
    set_cpu(0);

    h.pmap.page_remove(pa);
    for (space, va) in mappings {
        assert_eq!(h.pmap.extract(space, va), None);
    }
    assert!(h.pmap.pv_mappings(pa).is_empty());
    assert!(!h.machine.cached(1, uva(7)));
    assert!(h.pmap.is_modified(pa));
}

#[test]
fn test_best_effort_enter_reports_pv_exhaustion() {
    let h = boot(PmapConfig::default().with_pv_capacity(2), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    let pa = h.page();
    h.pmap.enter(&space, uva(1), pa, Protection::READ, EnterFlags::empty()).unwrap();
    h.pmap.enter(&space, uva(2), pa, Protection::READ, EnterFlags::empty()).unwrap();

    let err = h.pmap.enter(&space, uva(3), pa, Protection::READ, EnterFlags::CAN_FAIL);
    assert_eq!(err, Err(PmapError::OutOfMemory));
    assert_eq!(h.pmap.extract(&space, uva(3)), None);
    assert_eq!(space.resident_count(), 2);
    assert_wire_counts(&h, &space);

    // Replacing an existing managed mapping reuses its entry
    let other = h.page();
    h.pmap.enter(&space, uva(2), other, Protection::READ, EnterFlags::CAN_FAIL).unwrap();
    assert_eq!(h.pmap.extract(&space, uva(2)), Some(other));
}

#[test]
fn test_best_effort_enter_reports_table_exhaustion() {
    let h = boot_with_frames(PmapConfig::default(), 1, Delivery::Inline, 16);
    let space = h.pmap.create().unwrap();
    let pa = h.page();
    let mut hoard = Vec::new();
    while let Some(pfn) = h.frames.alloc_zeroed_page() {
        hoard.push(pfn);
    }

    let err = h.pmap.enter(&space, uva(1), pa, Protection::READ, EnterFlags::CAN_FAIL);
    assert_eq!(err, Err(PmapError::OutOfMemory));
    assert_eq!(h.pmap.pv_stats().used, 0);
    assert_eq!(space.resident_count(), 0);

    for pfn in hoard {
        h.frames.free_page(pfn);
    }
    h.pmap.enter(&space, uva(1), pa, Protection::READ, EnterFlags::CAN_FAIL).unwrap();
    assert_eq!(h.pmap.extract(&space, uva(1)), Some(pa));
    assert_wire_counts(&h, &space);
}

#[test]
#[should_panic(expected = "out of memory")]
fn test_enter_without_best_effort_halts_on_exhaustion() {
    let h = boot(PmapConfig::default().with_pv_capacity(1), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    let pa = h.page();
    h.pmap.enter(&space, uva(1), pa, Protection::READ, EnterFlags::empty()).unwrap();
    let _ = h.pmap.enter(&space, uva(2), pa, Protection::READ, EnterFlags::empty());
}

#[test]
fn test_attributes_follow_hardware_bits() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    h.pmap.activate(&space);
    let pa = h.page();
    h.pmap.enter(&space, uva(1), pa, Protection::READ_WRITE, EnterFlags::empty()).unwrap();
    assert!(!h.pmap.is_referenced(pa));

    h.machine.access(&h.pmap, &space, uva(1), false);
    assert!(h.pmap.is_referenced(pa));
    assert!(!h.pmap.is_modified(pa));

    h.machine.access(&h.pmap, &space, uva(1), true);
    assert!(h.pmap.is_modified(pa));
    assert!(h.pmap.clear_modify(pa));
    assert!(!h.pmap.is_modified(pa));

    // The cached writable translation went with the dirty bit
    assert!(!h.machine.cached(0, uva(1)));
    h.machine.access(&h.pmap, &space, uva(1), true);
    assert!(h.pmap.is_modified(pa));
}

#[test]
fn test_collect_keeps_wired_mappings() {
    let h = boot(PmapConfig::default(), 1, Delivery::Inline);
    let space = h.pmap.create().unwrap();
    let pa = h.page();
    h.pmap.enter(&space, uva(1), pa, Protection::READ, EnterFlags::WIRED).unwrap();
    h.pmap.enter(&space, uva(2000), pa, Protection::READ, EnterFlags::empty()).unwrap();

    h.pmap.collect(&space);
    assert_eq!(h.pmap.extract(&space, uva(1)), Some(pa));
    assert_eq!(h.pmap.extract(&space, uva(2000)), None);
    assert_eq!(space.wired_count(), 1);
    assert_wire_counts(&h, &space);
}

// ============================================================================
// Shootdown
// ============================================================================

#[test]
fn test_remote_cpu_sees_removal() {
    let h = boot(PmapConfig::default(), 2, Delivery::Threaded);
    let space = h.pmap.create().unwrap();
    let pa = h.page();
    h.pmap.enter(&space, uva(1), pa, Protection::READ_WRITE, EnterFlags::empty()).unwrap();

    let pmap = h.pmap.clone();
    let machine = h.machine.clone();
    let remote = space.clone();
    thread::spawn(move || {
        set_cpu(1);
        pmap.activate(&remote);
        assert_eq!(machine.access(&pmap, &remote, uva(1), true), Some(pa));
    })
    .join()
    .unwrap();
    assert!(h.machine.cached(1, uva(1)));

    h.pmap.remove(&space, uva(1), uva(2));
    assert!(!h.machine.cached(1, uva(1)));
    assert!(h.pmap.shootdown().stats().ipis >= 1);

    let pmap = h.pmap.clone();
    let machine = h.machine.clone();
    thread::spawn(move || {
        set_cpu(1);
        assert_eq!(machine.access(&pmap, &space, uva(1), false), None);
    })
    .join()
    .unwrap();
}

#[test]
fn test_kernel_changes_reach_every_running_cpu() {
    let h = boot(PmapConfig::default(), 3, Delivery::Inline);
    let (kva, _) = h.pmap.virtual_space();
    let pa = h.page();
    h.pmap.kenter(kva, pa, Protection::READ_WRITE);

    for cpu in 0..3 {
        set_cpu(cpu);
        assert_eq!(h.machine.access(&h.pmap, h.pmap.kernel(), kva, false), Some(pa));
    }
    set_cpu(0);

    let before = h.machine.delivered();
    h.pmap.kremove(kva, PAGE_SIZE);
    assert_eq!(h.machine.delivered(), before + 2);
    for cpu in 0..3 {
        assert!(!h.machine.cached(cpu, kva));
    }
}

#[test]
fn test_concurrent_requesters() {
    const CPUS: usize = 4;
    const ROUNDS: usize = 50;
    let h = boot(PmapConfig::default(), CPUS, Delivery::Threaded);
    let space = h.pmap.create().unwrap();
    let pages: Vec<PhysAddr> = (0..CPUS).map(|_| h.page()).collect();
    let barrier = Arc::new(Barrier::new(CPUS));

    let workers: Vec<_> = (0..CPUS)
        .map(|cpu| {
            let pmap = h.pmap.clone();
            let machine = h.machine.clone();
            let space = space.clone();
            let barrier = barrier.clone();
            let pa = pages[cpu];
            thread::spawn(move || {
                set_cpu(cpu);
                pmap.activate(&space);
                barrier.wait();
                for round in 0..ROUNDS {
                    let va = uva(cpu * 1024 + round % 8);
                    pmap.enter(&space, va, pa, Protection::READ_WRITE, EnterFlags::empty()).unwrap();
                    assert_eq!(machine.access(&pmap, &space, va, true), Some(pa));
                    pmap.write_protect(&space, va, va.offset(PAGE_SIZE), Protection::READ);
                    assert_eq!(machine.access(&pmap, &space, va, true), None);
                    pmap.remove(&space, va, va.offset(PAGE_SIZE));
                    assert_eq!(machine.access(&pmap, &space, va, false), None);
                }
                barrier.wait();
                pmap.deactivate(&space);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(h.pmap.shootdown().pending(), 0);
    assert!(h.pmap.shootdown().stats().ipis > 0);
    assert_eq!(space.resident_count(), 0);
    assert!(h.pmap.ptp_info(&space).is_empty());
    h.pmap.destroy(&space);
}

// ============================================================================
// Reference-count conservation
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Enter { page: usize, frame: usize, wired: bool },
    Remove { page: usize, len: usize },
    PageRemove { frame: usize },
}

const FUZZ_PAGES: usize = 48;
const FUZZ_FRAMES: usize = 4;
const FUZZ_GROUP: usize = 12;
const FUZZ_STRIDE: usize = 3 * PAGE_SIZE;

/// Groups of pages sharing a leaf table, one group per directory table
fn fuzz_va(page: usize) -> VirtAddr {
    let group = page / FUZZ_GROUP;
    VirtAddr::new((group + 1) * 0x4000_0000 + (page % FUZZ_GROUP) * FUZZ_STRIDE)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..FUZZ_PAGES, 0..FUZZ_FRAMES, any::<bool>())
            .prop_map(|(page, frame, wired)| Op::Enter { page, frame, wired }),
        2 => (0..FUZZ_PAGES, 1..4usize).prop_map(|(page, len)| Op::Remove { page, len }),
        1 => (0..FUZZ_FRAMES).prop_map(|frame| Op::PageRemove { frame }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_wire_counts_are_conserved(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let h = boot(PmapConfig::default(), 1, Delivery::Inline);
        let frames: Vec<PhysAddr> = (0..FUZZ_FRAMES).map(|_| h.page()).collect();
        let baseline = h.frames.allocated_pages();
        let space = h.pmap.create().unwrap();
        let mut model: HashMap<usize, usize> = HashMap::new();

        for op in ops {
            match op {
                Op::Enter { page, frame, wired } => {
                    let flags = if wired { EnterFlags::WIRED } else { EnterFlags::empty() };
                    h.pmap.enter(&space, fuzz_va(page), frames[frame], Protection::READ_WRITE, flags).unwrap();
                    model.insert(page, frame);
                }
                Op::Remove { page, len } => {
                    let start = fuzz_va(page);
                    let end = start.offset(len * FUZZ_STRIDE);
                    h.pmap.remove(&space, start, end);
                    model.retain(|&p, _| !(start..end).contains(&fuzz_va(p)));
                }
                Op::PageRemove { frame } => {
                    h.pmap.page_remove(frames[frame]);
                    model.retain(|_, f| *f != frame);
                }
            }

            assert_wire_counts(&h, &space);
            prop_assert_eq!(space.resident_count(), model.len());
            for page in 0..FUZZ_PAGES {
                let expected = model.get(&page).map(|&f| frames[f]);
                prop_assert_eq!(h.pmap.extract(&space, fuzz_va(page)), expected);
            }
            for (frame, pa) in frames.iter().enumerate() {
                let mapped = model.values().filter(|&&f| f == frame).count();
                prop_assert_eq!(h.pmap.pv_mappings(*pa).len(), mapped);
            }
        }

        h.pmap.remove(&space, VirtAddr::new(0), VirtAddr::new(h.layout().user_max));
        prop_assert!(h.pmap.ptp_info(&space).is_empty());
        prop_assert_eq!(space.stats().table_pages(), 0);
        h.pmap.destroy(&space);
        prop_assert_eq!(h.frames.allocated_pages(), baseline);
        prop_assert_eq!(h.pmap.pv_stats().used, 0);
    }
}
