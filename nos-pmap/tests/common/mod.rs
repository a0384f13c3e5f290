//! Common test utilities
//!
//! A simulated multiprocessor for driving the pmap end to end: one
//! software TLB per CPU, one IPI mailbox per CPU, and a hardware-style
//! translation path that fills the TLB from the page tables and sets the
//! accessed and dirty bits the way an MMU would.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nos_pmap::shootdown::{CpuId, Invalidation, IpiError, IpiKind, ShootdownCoordinator, TlbOps};
use nos_pmap::table::TableView;
use nos_pmap::{
    AddressSpace, BootRegion, FrameAllocator, FrameArena, PageNum, PhysAddr, PmapConfig, PmapLayout,
    PmapManager, Protection, PteFlags, VirtAddr, PAGE_SIZE,
};

/// First frame of the test arena
pub const ARENA_BASE: PageNum = 0x1000;
/// Frames in the default test arena
pub const ARENA_FRAMES: usize = 512;
/// Physical start of the kernel boot region
pub const BOOT_PA: usize = 0x20_0000;

thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
}

/// Make the calling thread run as `cpu`
pub fn set_cpu(cpu: CpuId) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

/// CPU the calling thread runs as
pub fn current_cpu() -> CpuId {
    CURRENT_CPU.with(|c| c.get())
}

/// How IPIs reach their target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The handler runs inside `send_ipi`
    Inline,
    /// A per-CPU interrupt thread picks the IPI up from the mailbox
    Threaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TlbEntry {
    frame: usize,
    writable: bool,
    dirty: bool,
    global: bool,
}

/// Simulated machine implementing the TLB seam
pub struct SimMachine {
    cpus: usize,
    delivery: Delivery,
    coordinator: Arc<ShootdownCoordinator>,
    tlbs: Vec<Mutex<HashMap<usize, TlbEntry>>>,
    mailboxes: Vec<AtomicU8>,
    roots: Vec<AtomicUsize>,
    delivered: AtomicUsize,
    stop: AtomicBool,
}

impl SimMachine {
    /// Machine with `cpus` CPUs sharing `coordinator`
    pub fn new(cpus: usize, delivery: Delivery, coordinator: Arc<ShootdownCoordinator>) -> Self {
        Self {
            cpus,
            delivery,
            coordinator,
            tlbs: (0..cpus).map(|_| Mutex::new(HashMap::new())).collect(),
            mailboxes: (0..cpus).map(|_| AtomicU8::new(0)).collect(),
            roots: (0..cpus).map(|_| AtomicUsize::new(0)).collect(),
            delivered: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        }
    }

    /// Number of CPUs
    pub fn cpus(&self) -> usize {
        self.cpus
    }

    /// IPIs handled so far
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }

    /// Root table loaded on `cpu`
    pub fn root(&self, cpu: CpuId) -> PhysAddr {
        PhysAddr::new(self.roots[cpu].load(Ordering::Acquire))
    }

    /// Whether `cpu` holds a cached translation for `va`
    pub fn cached(&self, cpu: CpuId, va: VirtAddr) -> bool {
        self.tlbs[cpu].lock().unwrap().contains_key(&(va.as_usize() / PAGE_SIZE))
    }

    /// Run the pending IPI of `cpu`, if any
    pub fn service(&self, cpu: CpuId) {
        let pending = self.mailboxes[cpu].swap(0, Ordering::AcqRel);
        if pending != 0 {
            self.deliver(cpu, kind_from(pending - 1));
        }
    }

    fn deliver(&self, cpu: CpuId, kind: IpiKind) {
        self.delivered.fetch_add(1, Ordering::AcqRel);
        self.coordinator.handle_ipi(self, cpu, kind);
    }

    /// Access `va` in `space` on the current CPU the way the MMU would.
    ///
    /// Returns the translated address, or `None` where the hardware would
    /// fault: no valid translation, or a write through a read-only one.
    pub fn access(&self, pmap: &PmapManager, space: &AddressSpace, va: VirtAddr, write: bool) -> Option<PhysAddr> {
        let cpu = current_cpu();
        let vpn = va.as_usize() / PAGE_SIZE;
        let offset = va.page_offset();

        let mut tlb = self.tlbs[cpu].lock().unwrap();
        // A write through a clean entry goes back to the tables to set
        // the dirty bit
        if let Some(entry) = tlb.get(&vpn) {
            if !write || (entry.writable && entry.dirty) {
                return Some(PhysAddr::new(entry.frame + offset));
            }
            tlb.remove(&vpn);
        }

        let lookup = pmap.find_pte(space, va);
        let pte = lookup.slot.load();
        if !pte.is_valid() || (lookup.level != 1 && !pte.is_large()) {
            return None;
        }
        if write && !pte.is_writable() {
            return None;
        }
        let mut bits = PteFlags::ACCESSED;
        if write {
            bits |= PteFlags::DIRTY;
        }
        lookup.slot.set_bits(bits);

        let frame = pte.frame() + (va.as_usize() & (PmapLayout::level_span(lookup.level) - 1) & !(PAGE_SIZE - 1));
        let global = pte.has(PteFlags::GLOBAL);
        let dirty = write || pte.has(PteFlags::DIRTY);
        tlb.insert(vpn, TlbEntry { frame, writable: pte.is_writable(), dirty, global });
        Some(PhysAddr::new(frame + offset))
    }
}

fn kind_from(raw: u8) -> IpiKind {
    match raw {
        0 => IpiKind::Page,
        1 => IpiKind::Range,
        _ => IpiKind::All,
    }
}

impl TlbOps for SimMachine {
    fn current_cpu(&self) -> CpuId {
        current_cpu()
    }

    fn invalidate(&self, cpu: CpuId, inv: Invalidation) {
        let mut tlb = self.tlbs[cpu].lock().unwrap();
        match inv {
            Invalidation::Page(va) => {
                tlb.remove(&(va / PAGE_SIZE));
            }
            Invalidation::Range { start, end } => tlb.retain(|vpn, _| !(start..end).contains(&(vpn * PAGE_SIZE))),
            Invalidation::All => tlb.clear(),
        }
    }

    fn load_root(&self, cpu: CpuId, root: PhysAddr) {
        self.roots[cpu].store(root.as_usize(), Ordering::Release);
        self.tlbs[cpu].lock().unwrap().retain(|_, entry| entry.global);
    }

    fn send_ipi(&self, cpu: CpuId, kind: IpiKind) -> Result<(), IpiError> {
        if cpu >= self.cpus {
            return Err(IpiError::NoSuchCpu(cpu));
        }
        match self.delivery {
            Delivery::Inline => self.deliver(cpu, kind),
            Delivery::Threaded => {
                if self.mailboxes[cpu].swap(kind as u8 + 1, Ordering::AcqRel) != 0 {
                    panic!("cpu {} mailbox overrun", cpu);
                }
            }
        }
        Ok(())
    }

    fn poll(&self, cpu: CpuId) {
        self.service(cpu);
        thread::yield_now();
    }
}

/// A booted pmap on a simulated machine
pub struct Harness {
    pub machine: Arc<SimMachine>,
    pub frames: Arc<FrameArena>,
    pub pmap: Arc<PmapManager>,
    interrupts: Vec<JoinHandle<()>>,
}

impl Harness {
    /// Boot layout in use
    pub fn layout(&self) -> &PmapLayout {
        self.pmap.layout()
    }

    /// Allocate a managed page
    pub fn page(&self) -> PhysAddr {
        PhysAddr::from_pfn(self.frames.alloc_zeroed_page().expect("test arena exhausted"))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.machine.stop.store(true, Ordering::Release);
        for handle in self.interrupts.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Boot with the default arena
pub fn boot(config: PmapConfig, cpus: usize, delivery: Delivery) -> Harness {
    boot_with_frames(config, cpus, delivery, ARENA_FRAMES)
}

/// Boot a pmap on `cpus` simulated CPUs with one large-page kernel region
pub fn boot_with_frames(config: PmapConfig, cpus: usize, delivery: Delivery, frames: usize) -> Harness {
    set_cpu(0);
    let config = config.with_max_cpus(cpus);
    let coordinator = Arc::new(ShootdownCoordinator::from_config(&config));
    for cpu in 1..cpus {
        coordinator.cpu_online(cpu);
    }
    let machine = Arc::new(SimMachine::new(cpus, delivery, coordinator.clone()));
    let arena = Arc::new(FrameArena::new(ARENA_BASE, frames));

    let layout = PmapLayout::new(config.levels);
    let region = BootRegion {
        va: VirtAddr::new(layout.kernel_min),
        pa: PhysAddr::new(BOOT_PA),
        len: layout.large_page_size(),
        prot: Protection::READ_WRITE,
    };
    let pmap = PmapManager::bootstrap(config, arena.clone(), machine.clone(), coordinator, &[region])
        .expect("bootstrap failed");

    let mut interrupts = Vec::new();
    if delivery == Delivery::Threaded {
        for cpu in 0..cpus {
            let machine = machine.clone();
            interrupts.push(thread::spawn(move || {
                while !machine.stop.load(Ordering::Acquire) {
                    machine.service(cpu);
                    thread::yield_now();
                }
            }));
        }
    }

    Harness { machine, frames: arena, pmap: Arc::new(pmap), interrupts }
}

/// Valid entries in the table page `pfn` at `level`
pub fn valid_entries(frames: &FrameArena, pfn: PageNum, level: usize) -> usize {
    TableView::new(frames, pfn, level).valid_entries()
}

/// User page `n` of the test window
pub fn uva(n: usize) -> VirtAddr {
    VirtAddr::new(0x40_0000 + n * PAGE_SIZE)
}
