//! TLB back ends
//!
//! [`Uniprocessor`] serves single-CPU systems and hosted use: every
//! invalidation is local and no interrupt can be sent. On bare-metal x86_64
//! the [`native`] module drives the real TLB.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::addr::PhysAddr;
use crate::shootdown::{Invalidation, IpiError, IpiKind, TlbOps};
use nos_api::core::CpuId;

/// Invalidations performed, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbCounters {
    /// Single-page invalidations
    pub pages: u64,
    /// Range invalidations
    pub ranges: u64,
    /// Full flushes
    pub full: u64,
}

/// TLB back end for a single CPU
#[derive(Debug, Default)]
pub struct Uniprocessor {
    pages: AtomicU64,
    ranges: AtomicU64,
    full: AtomicU64,
    root: AtomicUsize,
}

impl Uniprocessor {
    /// Create a back end with no root loaded
    pub const fn new() -> Self {
        Self {
            pages: AtomicU64::new(0),
            ranges: AtomicU64::new(0),
            full: AtomicU64::new(0),
            root: AtomicUsize::new(0),
        }
    }

    /// Root table most recently loaded
    pub fn root(&self) -> PhysAddr {
        PhysAddr::new(self.root.load(Ordering::Acquire))
    }

    /// Invalidations performed so far
    pub fn counters(&self) -> TlbCounters {
        TlbCounters {
            pages: self.pages.load(Ordering::Relaxed),
            ranges: self.ranges.load(Ordering::Relaxed),
            full: self.full.load(Ordering::Relaxed),
        }
    }
}

impl TlbOps for Uniprocessor {
    fn current_cpu(&self) -> CpuId {
        0
    }

    fn invalidate(&self, _cpu: CpuId, inv: Invalidation) {
        let counter = match inv {
            Invalidation::Page(_) => &self.pages,
            Invalidation::Range { .. } => &self.ranges,
            Invalidation::All => &self.full,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn load_root(&self, _cpu: CpuId, root: PhysAddr) {
        self.root.store(root.as_usize(), Ordering::Release);
    }

    fn send_ipi(&self, cpu: CpuId, _kind: IpiKind) -> Result<(), IpiError> {
        Err(IpiError::NoSuchCpu(cpu))
    }
}

/// x86_64 TLB control
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod native {
    use super::*;
    use crate::addr::PAGE_SIZE;

    /// Ranges longer than this are flushed whole
    const INVLPG_LIMIT: usize = 32;

    /// Hooks into the interrupt controller
    pub struct ApicHooks {
        /// Identify the executing CPU
        pub current_cpu: fn() -> CpuId,
        /// Send a shootdown vector to `cpu`
        pub send_ipi: fn(CpuId, IpiKind) -> Result<(), IpiError>,
    }

    /// TLB back end using `invlpg` and CR3 reloads
    pub struct X86Tlb {
        hooks: ApicHooks,
    }

    impl X86Tlb {
        /// Back end driving the local TLB and the given interrupt hooks
        pub const fn new(hooks: ApicHooks) -> Self {
            Self { hooks }
        }
    }

    unsafe fn invlpg(va: usize) {
        unsafe { core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags)) };
    }

    /// Toggling CR4.PGE drops global entries along with everything else
    unsafe fn flush_all() {
        const CR4_PGE: usize = 1 << 7;
        unsafe {
            let cr4: usize;
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov cr4, {}", in(reg) cr4 & !CR4_PGE, options(nostack, preserves_flags));
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }

    impl TlbOps for X86Tlb {
        fn current_cpu(&self) -> CpuId {
            (self.hooks.current_cpu)()
        }

        fn invalidate(&self, cpu: CpuId, inv: Invalidation) {
            if cpu != self.current_cpu() {
                fatal!("tlb: cpu {} asked to invalidate for cpu {}", self.current_cpu(), cpu);
            }
            unsafe {
                match inv {
                    Invalidation::Page(va) => invlpg(va),
                    Invalidation::Range { start, end } if (end - start) / PAGE_SIZE > INVLPG_LIMIT => flush_all(),
                    Invalidation::Range { start, end } => {
                        for va in (start..end).step_by(PAGE_SIZE) {
                            invlpg(va);
                        }
                    }
                    Invalidation::All => flush_all(),
                }
            }
        }

        fn load_root(&self, _cpu: CpuId, root: PhysAddr) {
            unsafe { core::arch::asm!("mov cr3, {}", in(reg) root.as_usize(), options(nostack, preserves_flags)) };
        }

        fn send_ipi(&self, cpu: CpuId, kind: IpiKind) -> Result<(), IpiError> {
            (self.hooks.send_ipi)(cpu, kind)
        }
    }
}
