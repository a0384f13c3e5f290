//! NOS API - Core interfaces and types shared by NOS kernel subsystems
//!
//! This crate holds the small vocabulary that the memory subsystems agree on:
//! the common error type, basic integer aliases, per-page metadata and the
//! physical page allocator seam.
//!
//! # Architecture
//!
//! - **Core**: Fundamental type aliases
//! - **Error**: Common error type and result alias
//! - **Memory**: Page frames, page metadata and the frame allocator trait
//!
//! # Usage
//!
//! ```rust
//! use nos_api::memory::{PageAttrs, PageMeta};
//!
//! let meta = PageMeta::new();
//! meta.set_attrs(PageAttrs::REFERENCED);
//! assert!(meta.attrs().contains(PageAttrs::REFERENCED));
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

pub mod core;
pub mod error;
pub mod memory;

pub use error::{Error, Result};
