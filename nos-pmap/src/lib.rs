//! NOS pmap
//!
//! Machine-dependent virtual memory mapping for the NOS kernel. The pmap
//! establishes, tears down, queries and protects virtual to physical
//! mappings for every address space, and keeps every CPU's TLB coherent
//! with those mappings.
//!
//! # Architecture
//!
//! - **Walker** ([`table`]): resolves a virtual address through the
//!   hierarchical table, with early stops at invalid entries and large pages.
//! - **Mapping operations** ([`PmapManager`]): enter, remove, extract,
//!   write protection, page-wide removal and attribute tracking.
//! - **Table page lifecycle** ([`ptp`]): allocation on demand, wire counts
//!   and deferred freeing after shootdown.
//! - **Reverse maps** ([`pv`]): every mapping of each managed page.
//! - **Shootdown** ([`shootdown`]): the cross-CPU invalidation rendezvous.
//! - **Address spaces** ([`space`], [`PmapManager`]): create, destroy,
//!   activate, and kernel virtual address growth.
//!
//! # Locking
//!
//! One global spin lock guards table page wire counts, reverse maps and the
//! address-space registry. Page table entries are updated with atomic
//! read-modify-write operations. Mutations happen under the lock; the lock
//! is dropped before the shootdown is issued, and table pages are returned
//! to the allocator only after the shootdown has been acknowledged.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

/// Logs an invariant violation and halts.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*)
    }};
}

pub mod addr;
pub mod arch;
pub mod config;
pub mod error;
pub mod frame;
pub mod layout;
pub mod manager;
pub mod pte;
pub mod ptp;
pub mod pv;
pub mod shootdown;
pub mod space;
pub mod table;

mod mapping;
mod protect;
mod remove;

#[cfg(test)]
mod testutil;

pub use addr::{page_round_down, page_round_up, PageNum, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
pub use arch::Uniprocessor;
pub use config::{PagingLevels, PmapConfig};
pub use error::{PmapError, Result};
pub use frame::FrameArena;
pub use layout::PmapLayout;
pub use manager::{BootRegion, PmapManager};
pub use nos_api::memory::{FrameAllocator, PageAttrs};
pub use pte::{EnterFlags, Protection, Pte, PteFlags};
pub use ptp::PtpSnapshot;
pub use shootdown::{CpuSet, Invalidation, IpiError, IpiKind, ShootdownCoordinator, TlbOps};
pub use space::{AddressSpace, SpaceId};
