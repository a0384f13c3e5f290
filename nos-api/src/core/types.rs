//! Basic type aliases

/// Physical page frame number
pub type PageNum = usize;

/// Size in bytes
pub type Size = usize;

/// Logical CPU index
pub type CpuId = usize;

/// Count type
pub type Count = usize;
