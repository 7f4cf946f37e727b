//! Protocol messages for replication.
//!
//! A session is a sequence of framed messages over a transport:
//!
//! ```text
//! active                          passive
//!   │── Hello ───────────────────────▶│
//!   │◀────────────────── HelloAck ────│   (or Error 401)
//!   │◀──────────────────── Changes ───│   pull batches, caught_up at end
//!   │── Push ────────────────────────▶│
//!   │◀──────────────────── PushAck ───│
//!   │── Heartbeat ───────────────────▶│   while idle
//! ```
//!
//! Closing is signalled out of band by the transport.

use crate::error::{ProtocolError, ProtocolResult};
use docsync_codec::{from_bytes, to_bytes};
use docsync_storage::{DocumentId, RevisionId, StoredDocument};
use serde::{Deserialize, Serialize};

/// Version spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// HTTP-style status codes carried by [`ErrorMessage`].
pub mod status {
    /// Missing or invalid credentials.
    pub const UNAUTHORIZED: u16 = 401;
    /// Access to the document or database is denied.
    pub const FORBIDDEN: u16 = 403;
    /// The request conflicts with the current revision.
    pub const CONFLICT: u16 = 409;
    /// The peer failed internally.
    pub const INTERNAL: u16 = 500;
    /// The peer is temporarily unable to serve.
    pub const UNAVAILABLE: u16 = 503;
}

/// Credentials presented in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credentials {
    /// Username and password.
    Basic {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// An existing session cookie.
    Session {
        /// Session id.
        session_id: String,
        /// Cookie name the session is stored under.
        cookie_name: String,
    },
}

/// A replication protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Opens a session.
    Hello(Hello),
    /// Accepts a session.
    HelloAck(HelloAck),
    /// A batch of revisions from the passive side.
    Changes(Changes),
    /// A batch of revisions from the active side.
    Push(Push),
    /// Per-document results for a [`Push`].
    PushAck(PushAck),
    /// Keep-alive.
    Heartbeat,
    /// Session-level failure.
    Error(ErrorMessage),
}

impl SyncMessage {
    /// Returns the message name, for logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Hello(_) => "Hello",
            SyncMessage::HelloAck(_) => "HelloAck",
            SyncMessage::Changes(_) => "Changes",
            SyncMessage::Push(_) => "Push",
            SyncMessage::PushAck(_) => "PushAck",
            SyncMessage::Heartbeat => "Heartbeat",
            SyncMessage::Error(_) => "Error",
        }
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(to_bytes(self)?)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are not a valid message.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(from_bytes(bytes)?)
    }

    /// Builds an "unexpected message" error naming this message.
    #[must_use]
    pub fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            expected,
            got: self.kind(),
        }
    }
}

/// Handshake sent by the active side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version.
    pub protocol_version: u16,
    /// Stable id of the active database.
    pub client_id: String,
    /// The active side will push.
    pub push: bool,
    /// The active side wants to pull.
    pub pull: bool,
    /// Keep the session open after catching up.
    pub continuous: bool,
    /// Remote sequence to resume pulling after.
    pub pull_since: u64,
    /// Restrict pulls to these documents.
    pub document_ids: Option<Vec<String>>,
    /// Credentials, if any.
    pub credentials: Option<Credentials>,
}

impl Hello {
    /// Creates a handshake with no credentials or document filter.
    pub fn new(client_id: impl Into<String>, push: bool, pull: bool, continuous: bool) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_id: client_id.into(),
            push,
            pull,
            continuous,
            pull_since: 0,
            document_ids: None,
            credentials: None,
        }
    }
}

/// Handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    /// Stable id of the passive database.
    pub server_id: String,
}

/// One revision on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionEnvelope {
    /// Document id.
    pub doc_id: DocumentId,
    /// Revision id.
    pub rev_id: RevisionId,
    /// Ancestors, nearest first.
    pub history: Vec<RevisionId>,
    /// Tombstone.
    pub deleted: bool,
    /// The receiver has lost access to the document.
    pub removed: bool,
    /// Encoded body. Empty for tombstones.
    pub body: Vec<u8>,
    /// Sender's local sequence for this revision.
    pub sequence: u64,
}

impl RevisionEnvelope {
    /// Wraps a stored document.
    #[must_use]
    pub fn from_stored(stored: &StoredDocument) -> Self {
        Self {
            doc_id: stored.revision.doc_id.clone(),
            rev_id: stored.revision.rev_id.clone(),
            history: stored.history.clone(),
            deleted: stored.revision.deleted,
            removed: false,
            body: stored.revision.body.clone(),
            sequence: stored.sequence.as_u64(),
        }
    }
}

/// A batch of revisions sent by the passive side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changes {
    /// Revisions in sequence order.
    pub revisions: Vec<RevisionEnvelope>,
    /// Highest sender sequence covered by this batch.
    pub last_sequence: u64,
    /// No further changes are pending on the sender.
    pub caught_up: bool,
}

/// A batch of revisions sent by the active side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    /// Revisions in sequence order.
    pub revisions: Vec<RevisionEnvelope>,
}

/// Why the receiver did not accept a pushed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocError {
    /// The receiver holds a divergent revision.
    Conflict,
    /// The sender may not write this document.
    Forbidden,
    /// The receiver was briefly unable to commit.
    Busy,
    /// Any other failure.
    Other(String),
}

impl DocError {
    /// Returns true if sending the revision again later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, DocError::Busy)
    }
}

/// Result for one pushed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocAck {
    /// Document id.
    pub doc_id: DocumentId,
    /// Revision id.
    pub rev_id: RevisionId,
    /// `None` if the revision was accepted or already known.
    pub error: Option<DocError>,
}

/// Results for a [`Push`], in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// One entry per pushed revision.
    pub results: Vec<DocAck>,
}

/// Session-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// HTTP-style status; see [`status`].
    pub code: u16,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorMessage {
    /// Creates an error message.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
