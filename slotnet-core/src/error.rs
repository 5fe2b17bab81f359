/// Slotnet Error Types
///
/// One error enum covers codec, ring, channel and pool failures. Transport
/// errors are kept behind an `Arc` so every error is `Clone`: a completion
/// outcome is observed by as many waiters as care to ask for it.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for slotnet operations
#[derive(Error, Debug, Clone)]
pub enum SlotError {
    /// IO error during socket operations (refused, in use, reset...)
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Invalid construction parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A length (payload, header field or decoded body) is outside its bounds
    #[error("Invalid length: {length} (expected {min}..={max})")]
    InvalidLength { length: usize, min: usize, max: usize },

    /// Bytes on the wire are not a valid encoding
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Buffer or channel closed
    #[error("Closed")]
    Closed,

    /// A blocking wait ran out of time
    #[error("Timed out")]
    Timeout,

    /// Pending operation cancelled by close
    #[error("Cancelled")]
    Cancelled,

    /// Operation not allowed in the current lifecycle state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Internal invariant violated; never a protocol problem
    #[error("Bug: {0}")]
    Bug(String),
}

/// Result type alias for slotnet operations
pub type Result<T> = std::result::Result<T, SlotError>;

impl From<io::Error> for SlotError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl SlotError {
    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid encoding error
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::InvalidEncoding(msg.into())
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create an internal invariant violation
    pub fn bug(msg: impl Into<String>) -> Self {
        Self::Bug(msg.into())
    }

    /// Kind of the underlying IO error, if this is one
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// Framing errors make the byte stream untrustworthy; the connection must go.
    #[must_use]
    pub const fn is_framing_error(&self) -> bool {
        matches!(self, Self::InvalidLength { .. } | Self::InvalidEncoding(_))
    }

    /// Check if this error reports a closed resource
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }

    /// Check if this error is an internal invariant violation
    #[must_use]
    pub const fn is_bug(&self) -> bool {
        matches!(self, Self::Bug(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind() {
        let err = SlotError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        let copy = err.clone();
        assert_eq!(copy.io_kind(), Some(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn classification() {
        let framing = SlotError::InvalidLength { length: 0, min: 1, max: 8 };
        assert!(framing.is_framing_error());
        assert!(SlotError::encoding("bad").is_framing_error());
        assert!(!SlotError::Closed.is_framing_error());
        assert!(SlotError::Cancelled.is_closed());
        assert!(SlotError::bug("deflate overflow").is_bug());
        assert_eq!(
            framing.to_string(),
            "Invalid length: 0 (expected 1..=8)"
        );
    }
}
