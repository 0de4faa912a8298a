//! Error types for StripeIO
//!
//! Every error carries a negative errno equivalent so it can travel through
//! reply payloads and sticky return codes unchanged.

use thiserror::Error;

/// Common result type for StripeIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for StripeIO
///
/// `Clone` because one sticky error is handed to every waiter of an
/// operation and recorded on each target request it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Operation setup errors
    #[error("operation storage too small: need {required} bytes, have {capacity}")]
    MessageSize { required: usize, capacity: usize },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    // Completion errors
    #[error("timed out")]
    TimedOut,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("inconsistent reply: {0}")]
    InconsistentReply(String),

    // Network/RPC errors
    #[error("target unavailable (rc={rc}): {reason}")]
    Unavailable { rc: i32, reason: String },

    #[error("remote error: rc={0}")]
    Remote(i32),

    // Internal errors
    #[error("erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an unavailable-target error with the default errno
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            rc: -libc::ECONNREFUSED,
            reason: reason.into(),
        }
    }

    /// Negative errno equivalent of this error
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::MessageSize { .. } => -libc::EMSGSIZE,
            Self::OutOfMemory(_) => -libc::ENOMEM,
            Self::InvalidArgument(_) | Self::Configuration(_) => -libc::EINVAL,
            Self::InvalidState(_) => -libc::EPROTO,
            Self::TimedOut => -libc::ETIMEDOUT,
            Self::NotFound(_) => -libc::ENOENT,
            Self::AlreadyExists(_) => -libc::EEXIST,
            Self::Io(_) | Self::InconsistentReply(_) | Self::ErasureCoding(_) => -libc::EIO,
            Self::Unavailable { rc, .. } => *rc,
            Self::Remote(rc) => *rc,
        }
    }

    /// Map a negative errno received from a remote service back into an error
    ///
    /// Returns `None` for zero. Positive codes are treated as their negation.
    #[must_use]
    pub fn from_errno(rc: i32) -> Option<Self> {
        let rc = if rc > 0 { -rc } else { rc };
        let err = match -rc {
            0 => return None,
            libc::EMSGSIZE => Self::MessageSize {
                required: 0,
                capacity: 0,
            },
            libc::ENOMEM => Self::OutOfMemory("remote".into()),
            libc::EINVAL => Self::InvalidArgument("remote".into()),
            libc::EPROTO => Self::InvalidState("remote".into()),
            libc::ETIMEDOUT => Self::TimedOut,
            libc::ENOENT => Self::NotFound("remote".into()),
            libc::EEXIST => Self::AlreadyExists("remote".into()),
            libc::EIO => Self::Io("remote".into()),
            libc::ECONNREFUSED | libc::EHOSTDOWN | libc::ESHUTDOWN | libc::ENOTCONN => {
                Self::Unavailable {
                    rc,
                    reason: "remote".into(),
                }
            }
            _ => Self::Remote(rc),
        };
        Some(err)
    }

    /// Check if this error means the target could not be reached at all
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Unavailable { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            Error::MessageSize {
                required: 64,
                capacity: 8
            }
            .errno(),
            -libc::EMSGSIZE
        );
        assert_eq!(Error::OutOfMemory("x".into()).errno(), -libc::ENOMEM);
        assert_eq!(Error::TimedOut.errno(), -libc::ETIMEDOUT);
        assert_eq!(Error::not_found("obj").errno(), -libc::ENOENT);
        assert_eq!(Error::InconsistentReply("tx".into()).errno(), -libc::EIO);
        assert_eq!(Error::unavailable("down").errno(), -libc::ECONNREFUSED);
    }

    #[test]
    fn test_from_errno() {
        assert_eq!(Error::from_errno(0), None);
        assert_eq!(Error::from_errno(-libc::ETIMEDOUT), Some(Error::TimedOut));
        assert!(Error::from_errno(-libc::ENOENT).unwrap().is_not_found());
        assert!(Error::from_errno(-libc::EHOSTDOWN).unwrap().is_unavailable());
        assert_eq!(Error::from_errno(-libc::E2BIG), Some(Error::Remote(-libc::E2BIG)));
        assert_eq!(Error::from_errno(libc::EIO).unwrap().errno(), -libc::EIO);
    }

    #[test]
    fn test_unavailable_keeps_rc() {
        let e = Error::from_errno(-libc::ESHUTDOWN).unwrap();
        assert_eq!(e.errno(), -libc::ESHUTDOWN);
        assert!(e.is_retryable());
        assert!(!Error::NotFound("k".into()).is_retryable());
    }
}
