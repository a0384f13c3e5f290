//! Error handling module for NOS kernel subsystems

use core::fmt;

/// Common error type used throughout NOS kernel subsystems
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument(&'static str),
    /// Invalid state
    InvalidState(&'static str),
    /// Resource not found
    NotFound(&'static str),
    /// Resource busy
    Busy(&'static str),
    /// Out of memory
    OutOfMemory,
    /// Timeout
    Timeout,
    /// Configuration error
    ConfigError(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Busy(msg) => write!(f, "Resource busy: {}", msg),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Whether the caller may retry after freeing resources
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::OutOfMemory | Error::Busy(_) | Error::Timeout)
    }
}
