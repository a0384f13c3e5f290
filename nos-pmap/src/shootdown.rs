//! Cross-CPU TLB shootdown
//!
//! One request may be outstanding system-wide. A requester claims the
//! shared countdown by moving it from zero to the number of CPUs it will
//! interrupt, publishes the target address or range in the scratch slots,
//! sends the IPIs and finally invalidates its own TLB. Each interrupted CPU
//! invalidates locally and decrements the countdown; the requester's
//! [`ShootdownCoordinator::wait`] returns once it reaches zero.
//!
//! A CPU that never acknowledges is fatal. With a spin limit configured the
//! coordinator detects this instead of hanging.
//!
//! On a uniprocessor no IPIs are ever sent and the protocol collapses to a
//! local invalidation.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::addr::{PhysAddr, PAGE_SIZE};
use crate::config::{PmapConfig, MAX_CPUS};

/// Logical CPU index
pub use nos_api::core::types::CpuId;

// ============================================================================
// CPU sets
// ============================================================================

/// A set of CPUs, one bit per CPU
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// CPUs `0..count`
    pub const fn first(count: usize) -> Self {
        if count >= MAX_CPUS { Self(u64::MAX) } else { Self((1 << count) - 1) }
    }

    /// Set holding only `cpu`
    pub fn single(cpu: CpuId) -> Self {
        Self(cpu_bit(cpu))
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether `cpu` is in the set
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    /// Set with `cpu` added
    pub fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | cpu_bit(cpu))
    }

    /// Set with `cpu` removed
    pub fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !cpu_bit(cpu))
    }

    /// CPUs in both sets
    pub const fn intersect(self, other: CpuSet) -> Self {
        Self(self.0 & other.0)
    }

    /// Number of CPUs in the set
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether the set is empty
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// CPUs in the set, lowest first
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as CpuId;
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

/// Bit of `cpu` in a set; ids past the set width are fatal
fn cpu_bit(cpu: CpuId) -> u64 {
    if cpu >= MAX_CPUS {
        fatal!("shootdown: cpu {} beyond the {}-cpu set width", cpu, MAX_CPUS);
    }
    1 << cpu
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A CPU set updated concurrently
#[derive(Debug, Default)]
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    /// Create a set
    pub const fn new(set: CpuSet) -> Self {
        Self(AtomicU64::new(set.0))
    }

    /// Current members
    pub fn load(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::Acquire))
    }

    /// Add `cpu`
    pub fn insert(&self, cpu: CpuId) {
        self.0.fetch_or(cpu_bit(cpu), Ordering::AcqRel);
    }

    /// Remove `cpu`
    pub fn remove(&self, cpu: CpuId) {
        self.0.fetch_and(!cpu_bit(cpu), Ordering::AcqRel);
    }
}

// ============================================================================
// Requests and the TLB seam
// ============================================================================

/// What to invalidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// One page
    Page(usize),
    /// Pages in `[start, end)`
    Range {
        /// First address
        start: usize,
        /// End address (exclusive)
        end: usize,
    },
    /// Every non-global entry
    All,
}

impl Invalidation {
    /// IPI vector carrying this kind of request
    pub const fn kind(self) -> IpiKind {
        match self {
            Invalidation::Page(_) => IpiKind::Page,
            Invalidation::Range { .. } => IpiKind::Range,
            Invalidation::All => IpiKind::All,
        }
    }

    /// Whether the request covers `va`
    pub const fn covers(self, va: usize) -> bool {
        match self {
            Invalidation::Page(page) => va & !(PAGE_SIZE - 1) == page,
            Invalidation::Range { start, end } => va >= start && va < end,
            Invalidation::All => true,
        }
    }
}

/// Shootdown IPI vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpiKind {
    /// Invalidate the page in the first scratch slot
    Page = 0,
    /// Invalidate the range in the scratch slots
    Range = 1,
    /// Flush the TLB
    All = 2,
}

/// IPI delivery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiError {
    /// The target CPU does not exist or is not running
    NoSuchCpu(CpuId),
    /// The interrupt controller refused the IPI
    Delivery(CpuId),
}

impl fmt::Display for IpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpiError::NoSuchCpu(cpu) => write!(f, "no such cpu {}", cpu),
            IpiError::Delivery(cpu) => write!(f, "ipi delivery to cpu {} failed", cpu),
        }
    }
}

/// Machine operations the pmap needs from the CPU and interrupt controller
#[cfg_attr(test, mockall::automock)]
pub trait TlbOps: Send + Sync {
    /// CPU executing the caller
    fn current_cpu(&self) -> CpuId;

    /// Invalidate translations on `cpu`, which is always the executing CPU
    fn invalidate(&self, cpu: CpuId, inv: Invalidation);

    /// Install `root` as the translation root of `cpu`
    fn load_root(&self, cpu: CpuId, root: PhysAddr);

    /// Send a shootdown IPI to `cpu`
    fn send_ipi(&self, cpu: CpuId, kind: IpiKind) -> Result<(), IpiError>;

    /// Called while `cpu` spins on the countdown. Interrupts are enabled
    /// during the spin, so this is where pending shootdowns get serviced.
    fn poll(&self, cpu: CpuId) {
        let _ = cpu;
        core::hint::spin_loop();
    }
}

/// Which CPUs must drop translations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShootScope {
    /// Kernel mappings: every running CPU
    Kernel,
    /// A user address space active on these CPUs
    Space(CpuSet),
}

/// Proof that the last issued shootdown has been acknowledged
#[derive(Debug)]
pub struct ShootdownComplete {
    _private: (),
}

/// Shootdown statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShootdownStats {
    /// Single-page requests
    pub pages: u64,
    /// Range requests
    pub ranges: u64,
    /// Full flush requests
    pub full: u64,
    /// IPIs sent
    pub ipis: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pages: AtomicU64,
    ranges: AtomicU64,
    full: AtomicU64,
    ipis: AtomicU64,
}

// ============================================================================
// Coordinator
// ============================================================================

/// The shootdown rendezvous, shared by every address space
#[derive(Debug)]
pub struct ShootdownCoordinator {
    max_cpus: usize,
    running: AtomicCpuSet,
    /// CPUs yet to acknowledge the outstanding request
    wait: AtomicUsize,
    addr1: AtomicUsize,
    addr2: AtomicUsize,
    spin_limit: Option<u64>,
    counters: Counters,
}

impl ShootdownCoordinator {
    /// Coordinator for `max_cpus` CPUs with only CPU 0 running
    pub fn new(max_cpus: usize, spin_limit: Option<u64>) -> Self {
        if max_cpus == 0 || max_cpus > MAX_CPUS {
            fatal!("shootdown: unsupported cpu count {}", max_cpus);
        }
        Self {
            max_cpus,
            running: AtomicCpuSet::new(CpuSet::single(0)),
            wait: AtomicUsize::new(0),
            addr1: AtomicUsize::new(0),
            addr2: AtomicUsize::new(0),
            spin_limit,
            counters: Counters::default(),
        }
    }

    /// Coordinator sized from the pmap configuration
    pub fn from_config(config: &PmapConfig) -> Self {
        Self::new(config.max_cpus, config.shootdown_spin_limit)
    }

    /// Mark `cpu` as running
    pub fn cpu_online(&self, cpu: CpuId) {
        if cpu >= self.max_cpus {
            fatal!("shootdown: cpu {} beyond configured {}", cpu, self.max_cpus);
        }
        self.running.insert(cpu);
        log::debug!("shootdown: cpu {} online", cpu);
    }

    /// Mark `cpu` as no longer running
    pub fn cpu_offline(&self, cpu: CpuId) {
        self.running.remove(cpu);
        log::debug!("shootdown: cpu {} offline", cpu);
    }

    /// CPUs currently running
    pub fn running(&self) -> CpuSet {
        self.running.load()
    }

    /// Acknowledgments still outstanding
    pub fn pending(&self) -> usize {
        self.wait.load(Ordering::Acquire)
    }

    /// Get shootdown statistics
    pub fn stats(&self) -> ShootdownStats {
        ShootdownStats {
            pages: self.counters.pages.load(Ordering::Relaxed),
            ranges: self.counters.ranges.load(Ordering::Relaxed),
            full: self.counters.full.load(Ordering::Relaxed),
            ipis: self.counters.ipis.load(Ordering::Relaxed),
        }
    }

    /// Issue a shootdown without waiting for it.
    ///
    /// Remote CPUs are signaled first; the local invalidation comes last.
    pub fn shoot(&self, tlb: &dyn TlbOps, scope: ShootScope, inv: Invalidation) {
        let me = tlb.current_cpu();
        let running = self.running.load();
        let (targets, local) = match scope {
            ShootScope::Kernel => (running.without(me), true),
            ShootScope::Space(active) => (running.intersect(active).without(me), active.contains(me)),
        };

        match inv {
            Invalidation::Page(_) => self.counters.pages.fetch_add(1, Ordering::Relaxed),
            Invalidation::Range { .. } => self.counters.ranges.fetch_add(1, Ordering::Relaxed),
            Invalidation::All => self.counters.full.fetch_add(1, Ordering::Relaxed),
        };

        if !targets.is_empty() {
            self.claim(tlb, me, targets.len());
            match inv {
                Invalidation::Page(va) => self.addr1.store(va, Ordering::SeqCst),
                Invalidation::Range { start, end } => {
                    self.addr1.store(start, Ordering::SeqCst);
                    self.addr2.store(end, Ordering::SeqCst);
                }
                Invalidation::All => {}
            }
            for cpu in targets.iter() {
                if let Err(err) = tlb.send_ipi(cpu, inv.kind()) {
                    fatal!("shootdown: cpu {} -> cpu {}: {}", me, cpu, err);
                }
                self.counters.ipis.fetch_add(1, Ordering::Relaxed);
            }
            log::trace!("shootdown: cpu {} sent {:?} to {:?}", me, inv, targets);
        }

        if local {
            tlb.invalidate(me, inv);
        }
    }

    /// Wait until every CPU interrupted by the last request has acknowledged
    pub fn wait(&self, tlb: &dyn TlbOps) -> ShootdownComplete {
        let me = tlb.current_cpu();
        let mut spins = 0;
        while self.wait.load(Ordering::Acquire) != 0 {
            self.spin(tlb, me, &mut spins, "waiting for acknowledgments");
        }
        ShootdownComplete { _private: () }
    }

    /// IPI handler body, run on `cpu`
    pub fn handle_ipi(&self, tlb: &dyn TlbOps, cpu: CpuId, kind: IpiKind) {
        let inv = match kind {
            IpiKind::Page => Invalidation::Page(self.addr1.load(Ordering::SeqCst)),
            IpiKind::Range => Invalidation::Range {
                start: self.addr1.load(Ordering::SeqCst),
                end: self.addr2.load(Ordering::SeqCst),
            },
            IpiKind::All => Invalidation::All,
        };
        tlb.invalidate(cpu, inv);
        if self.wait.fetch_sub(1, Ordering::AcqRel) == 0 {
            fatal!("shootdown: cpu {} acknowledged with no request outstanding", cpu);
        }
    }

    /// Take the countdown from zero to `count`, waiting out any request
    /// already in flight.
    fn claim(&self, tlb: &dyn TlbOps, me: CpuId, count: usize) {
        let mut spins = 0;
        loop {
            if self
                .wait
                .compare_exchange_weak(0, count, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            while self.wait.load(Ordering::Acquire) != 0 {
                self.spin(tlb, me, &mut spins, "waiting for a previous request");
            }
        }
    }

    fn spin(&self, tlb: &dyn TlbOps, me: CpuId, spins: &mut u64, what: &str) {
        *spins += 1;
        if let Some(limit) = self.spin_limit {
            if *spins > limit {
                fatal!(
                    "shootdown: cpu {} {} for {} spins, {} cpus never acknowledged",
                    me,
                    what,
                    spins,
                    self.pending()
                );
            }
        }
        tlb.poll(me);
    }
}

/// Shootdowns collected during an operation and issued after the pmap lock
/// is dropped.
#[derive(Debug, Default)]
pub struct ShootBatch {
    requests: Vec<(ShootScope, Invalidation)>,
}

impl ShootBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self { requests: Vec::new() }
    }

    /// Queue a request
    pub fn push(&mut self, scope: ShootScope, inv: Invalidation) {
        self.requests.push((scope, inv));
    }

    /// Number of queued requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Issue every request in order and wait for the last one
    pub fn issue(self, coordinator: &ShootdownCoordinator, tlb: &dyn TlbOps) -> ShootdownComplete {
        for (scope, inv) in self.requests {
            coordinator.shoot(tlb, scope, inv);
        }
        coordinator.wait(tlb)
    }
}
