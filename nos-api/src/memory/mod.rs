//! Memory management module

pub mod interface;
pub mod types;

pub use interface::FrameAllocator;
pub use types::{Frame, PageAttrs, PageMeta, PAGE_SHIFT, PAGE_SIZE, WORDS_PER_FRAME};
