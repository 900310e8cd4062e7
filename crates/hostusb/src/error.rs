//! Host boundary error types

use thiserror::Error;

/// Errors reported by the platform USB stack.
///
/// Mirrors the usual libusb error set so that host implementations can
/// map their native codes one-to-one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device, interface, or endpoint not found
    #[error("device or endpoint not found")]
    NotFound,
    /// Resource busy (interface claimed elsewhere)
    #[error("resource busy")]
    Busy,
    /// Buffer overflow
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("i/o error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied by the platform (missing permission)
    #[error("access denied")]
    Access,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl HostError {
    /// Build an [`HostError::Other`] from anything displayable.
    pub fn other(message: impl std::fmt::Display) -> Self {
        Self::Other {
            message: message.to_string(),
        }
    }
}

/// Type alias for host boundary results
pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(HostError::Timeout.to_string(), "transfer timed out");
        assert_eq!(
            HostError::other("claim failed on interface 2").to_string(),
            "claim failed on interface 2"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(HostError::Access, HostError::Access);
        assert_ne!(HostError::Access, HostError::NoDevice);
    }
}
