//! Error types for the object streaming transport.
//!
//! `TransportError` is `Clone` so that a single terminal error can be handed
//! to every outstanding completion and still be kept on the session.

use crate::streaming::protocol::AcceptStatus;
use crate::streaming::State;
use std::io;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Fatal framing errors. Never resynchronized: the connection is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame header length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },

    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("malformed frame header: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// `send` on a stream that no longer accepts work.
    #[error("stream is {0:?} and does not accept new objects")]
    Terminated(State),

    /// Delivered to every outstanding completion after `stop`.
    #[error("stream stopped, send cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("connection rejected by receiver: {0:?}")]
    Rejected(AcceptStatus),

    #[error("duplicate route {network}/{trname}")]
    DuplicateRoute { network: String, trname: String },

    #[error("unknown route {0}")]
    UnknownRoute(String),

    #[error("payload ended after {got} of {expected} declared bytes")]
    ShortPayload { expected: u64, got: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    /// True for errors caused by the connection itself (as opposed to
    /// a rejected or cancelled request); these are eligible for reconnect.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::Rejected(_))
    }

    pub(crate) fn compression(msg: impl std::fmt::Display) -> Self {
        TransportError::Compression(msg.to_string())
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

impl From<TransportError> for io::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(inner) => io::Error::new(inner.kind(), inner.to_string()),
            TransportError::Framing(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_roundtrip_keeps_kind() {
        let err: TransportError = io::Error::new(io::ErrorKind::BrokenPipe, "peer gone").into();
        assert!(err.is_connection_error());
        let back: io::Error = err.into();
        assert_eq!(back.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_cancelled_is_distinct() {
        let err = TransportError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_connection_error());
        let io_err: TransportError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(!io_err.is_cancelled());
    }
}
