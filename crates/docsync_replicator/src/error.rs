//! Error types for the replicator.

use docsync_core::CoreError;
use docsync_protocol::ProtocolError;
use std::sync::Arc;
use thiserror::Error;

/// Result type for replicator operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Errors raised by a replication session.
///
/// Network-shaped variants are classified by
/// [`RetryPolicy::classify`](crate::RetryPolicy::classify); callers never
/// need to inspect messages.
#[derive(Debug, Clone, Error)]
pub enum ReplicatorError {
    /// No response within the allotted time.
    #[error("operation timed out")]
    Timeout,

    /// The connection dropped mid-session.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The peer refused the connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// No route to the peer.
    #[error("host unreachable")]
    HostUnreachable,

    /// The peer's name did not resolve.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// The local network interface is down.
    #[error("network is down")]
    NetworkDown,

    /// The peer answered with an HTTP-style error status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Detail sent by the peer.
        message: String,
    },

    /// The peer closed the connection.
    #[error("remote closed the connection (code {code})")]
    RemoteClosed {
        /// Close code.
        code: u16,
    },

    /// Secure channel setup failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The peer rejected the session's credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The peer violated the replication protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session is not in a state that allows the operation.
    #[error("invalid state: {message}")]
    InvalidState {
        /// What was attempted.
        message: String,
    },

    /// The operation does not apply to this session's configuration.
    #[error("unsupported: {message}")]
    Unsupported {
        /// What was attempted.
        message: String,
    },

    /// A replicated revision diverged from the other side.
    #[error("document conflict: {doc_id}")]
    Conflict {
        /// The document id.
        doc_id: String,
    },

    /// The local database failed.
    #[error("database error: {0}")]
    Core(Arc<CoreError>),
}

impl ReplicatorError {
    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an unsupported operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Creates an HTTP-style error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }
}

impl From<CoreError> for ReplicatorError {
    fn from(err: CoreError) -> Self {
        Self::Core(Arc::new(err))
    }
}

impl From<docsync_codec::CodecError> for ReplicatorError {
    fn from(err: docsync_codec::CodecError) -> Self {
        Self::Protocol(ProtocolError::Codec(err))
    }
}
