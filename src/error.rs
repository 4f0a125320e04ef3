//! Error types for objwire.

use thiserror::Error;

use crate::protocol::ObjectId;

/// Main error type for all objwire operations.
#[derive(Debug, Error)]
pub enum ObjwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed value, bad frame, unexpected tag, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Negative or oversized payload length on the wire.
    #[error("Invalid payload length: {0}")]
    BadLength(i64),

    /// No decoder registered for the given type tag.
    #[error("No decoder registered for tag {0}")]
    UnknownTag(i16),

    /// Every registered encoder declined the value. This is a programmer
    /// error (a value kind with no wire representation), not a recoverable
    /// protocol condition.
    #[error("No encoder accepted value of kind {0}")]
    Unencodable(&'static str),

    /// Reference id not present in the local registry (already released
    /// or never registered).
    #[error("No such object in registry: {0}")]
    NoSuchObject(ObjectId),

    /// The peer answered with a plain error outcome.
    #[error("Remote call failed: {target}.{member}")]
    CallFailed { target: String, member: String },

    /// The peer's invocation raised; the payload travelled back with the
    /// response.
    #[error("Remote exception in {target}.{member}: {detail}")]
    RemoteException {
        target: String,
        member: String,
        detail: String,
    },

    /// Connection closed by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No response arrived within the configured read timeout.
    #[error("Read timed out")]
    ReadTimeout,

    /// Authentication token missing or rejected.
    #[error("Authentication rejected")]
    AuthRejected,
}

impl ObjwireError {
    /// Whether this error is a transport-level failure.
    ///
    /// Network errors are the only class eligible for the single-retry
    /// policy on locally initiated connections; everything else is
    /// surfaced to the caller as-is.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ObjwireError::Io(_) | ObjwireError::ConnectionClosed | ObjwireError::ReadTimeout
        )
    }
}

/// Result type alias using ObjwireError.
pub type Result<T> = std::result::Result<T, ObjwireError>;
