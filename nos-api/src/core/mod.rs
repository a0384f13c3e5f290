//! Core types shared across the kernel

pub mod types;

pub use types::*;
