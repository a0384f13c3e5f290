//! Pmap error type

use core::fmt;

/// Recoverable pmap failures.
///
/// Invariant violations are not represented here; they halt the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapError {
    /// A page table page or reverse-map entry could not be allocated
    OutOfMemory,
    /// The pmap configuration is inconsistent
    InvalidConfig(&'static str),
}

impl fmt::Display for PmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmapError::OutOfMemory => write!(f, "pmap: out of memory"),
            PmapError::InvalidConfig(msg) => write!(f, "pmap: invalid configuration: {}", msg),
        }
    }
}

impl From<PmapError> for nos_api::Error {
    fn from(err: PmapError) -> Self {
        match err {
            PmapError::OutOfMemory => nos_api::Error::OutOfMemory,
            PmapError::InvalidConfig(msg) => nos_api::Error::ConfigError(msg),
        }
    }
}

/// Result type for pmap operations
pub type Result<T> = core::result::Result<T, PmapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_to_api_error() {
        assert_eq!(nos_api::Error::from(PmapError::OutOfMemory), nos_api::Error::OutOfMemory);
        assert_eq!(
            nos_api::Error::from(PmapError::InvalidConfig("levels")),
            nos_api::Error::ConfigError("levels")
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", PmapError::OutOfMemory), "pmap: out of memory");
    }
}
