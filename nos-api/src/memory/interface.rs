//! Memory management interface

use crate::core::types::{Count, PageNum};
use super::types::{Frame, PageMeta};

/// Trait for the physical page allocator consumed by the pmap.
///
/// Frames are identified by page frame number. `frame` performs the
/// physical to kernel-accessible translation for a frame, which is how
/// page-table pages are read and written.
pub trait FrameAllocator: Send + Sync {
    /// Allocates a zero-filled page, or `None` when memory is exhausted
    fn alloc_zeroed_page(&self) -> Option<PageNum>;

    /// Returns a page to the allocator
    fn free_page(&self, pfn: PageNum);

    /// Metadata for a managed page; `None` for device or unmanaged memory
    fn page_meta(&self, pfn: PageNum) -> Option<&PageMeta>;

    /// Kernel-accessible view of a frame; `None` if the frame has no backing
    fn frame(&self, pfn: PageNum) -> Option<&Frame>;

    /// Number of pages currently handed out
    fn allocated_pages(&self) -> Count;
}
