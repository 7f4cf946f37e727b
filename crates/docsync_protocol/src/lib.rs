//! # docsync Protocol
//!
//! Messages exchanged by replication peers, encoded as CBOR frames.
//!
//! Framing and delivery belong to the transport; this crate only defines
//! what a frame contains.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    status, Changes, Credentials, DocAck, DocError, ErrorMessage, Hello, HelloAck, Push, PushAck,
    RevisionEnvelope, SyncMessage, PROTOCOL_VERSION,
};
