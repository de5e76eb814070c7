//! Error types for rbdio
//!
//! Requests complete with a signed status code: zero (or a byte count) on
//! success, a negated errno on failure. [`Error`] is the typed form of those
//! codes and converts in both directions.

use thiserror::Error;

/// Common result type for rbdio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for rbdio
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("extent at {offset} starts beyond the {size} byte area")]
    OutOfRange { offset: u64, size: u64 },

    // Access errors
    #[error("image is read-only")]
    ReadOnly,

    #[error("compare mismatch at image offset {offset}")]
    Mismatch { offset: u64 },

    #[error("device or resource busy")]
    Busy,

    #[error("image is shutting down")]
    Shutdown,

    // Backend errors
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("request timeout")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: errno {0}")]
    Backend(i32),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Negated errno reported through completion handles
    #[must_use]
    pub fn errno(&self) -> i32 {
        -match self {
            Self::InvalidArgument(_) | Self::OutOfRange { .. } | Self::Configuration(_) => {
                libc::EINVAL
            }
            Self::ReadOnly => libc::EROFS,
            Self::Mismatch { .. } => libc::EILSEQ,
            Self::Busy => libc::EBUSY,
            Self::Shutdown => libc::ESHUTDOWN,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::Timeout => libc::ETIMEDOUT,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Backend(errno) => errno.abs(),
        }
    }

    /// Build an error from a (possibly negated) errno
    #[must_use]
    pub fn from_errno(r: i32) -> Self {
        match r.abs() {
            libc::EINVAL => Self::InvalidArgument(format!("errno {}", libc::EINVAL)),
            libc::EROFS => Self::ReadOnly,
            libc::EILSEQ => Self::Mismatch { offset: 0 },
            libc::EBUSY => Self::Busy,
            libc::ESHUTDOWN => Self::Shutdown,
            libc::ENOENT => Self::NotFound(String::new()),
            libc::EOPNOTSUPP => Self::NotSupported(String::new()),
            libc::ETIMEDOUT => Self::Timeout,
            errno => Self::Backend(errno),
        }
    }

    /// Turn a completion status into a result
    pub fn check(r: i32) -> Result<()> {
        if r < 0 { Err(Self::from_errno(r)) } else { Ok(()) }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_is_negative() {
        assert_eq!(Error::ReadOnly.errno(), -libc::EROFS);
        assert_eq!(Error::Shutdown.errno(), -libc::ESHUTDOWN);
        assert_eq!(Error::OutOfRange { offset: 10, size: 5 }.errno(), -libc::EINVAL);
        assert_eq!(Error::Backend(-libc::EIO).errno(), -libc::EIO);
        assert_eq!(Error::Backend(libc::EIO).errno(), -libc::EIO);
    }

    #[test]
    fn test_from_errno() {
        assert!(matches!(Error::from_errno(-libc::EROFS), Error::ReadOnly));
        assert!(matches!(Error::from_errno(-libc::EILSEQ), Error::Mismatch { .. }));
        assert!(matches!(Error::from_errno(-libc::EIO), Error::Backend(e) if e == libc::EIO));
        assert_eq!(Error::from_errno(-libc::ENOSPC).errno(), -libc::ENOSPC);
    }

    #[test]
    fn test_check() {
        assert!(Error::check(0).is_ok());
        assert!(Error::check(4096).is_ok());
        assert!(matches!(Error::check(-libc::EBUSY), Err(Error::Busy)));
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Busy.is_retryable());
        assert!(!Error::ReadOnly.is_retryable());
    }
}
