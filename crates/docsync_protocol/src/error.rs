//! Protocol error types.

use docsync_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or sequencing messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The peer sent a message that is not valid at this point.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What the receiver was waiting for.
        expected: &'static str,
        /// What arrived.
        got: &'static str,
    },

    /// The peer speaks another protocol version.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Version spoken locally.
        local: u16,
        /// Version announced by the peer.
        remote: u16,
    },
}
