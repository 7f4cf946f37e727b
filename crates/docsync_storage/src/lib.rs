//! # docsync Storage
//!
//! Revision model types and the revision store contract for docsync.
//!
//! A store keeps, per document, the current [`Revision`] and a bounded
//! list of ancestor ids. Commits are conditional on the caller's expected
//! parent so that the layer above can detect conflicts without holding a
//! global lock.
//!
//! ## Available Stores
//!
//! - [`MemoryRevisionStore`] - For testing and ephemeral databases
//! - [`FileRevisionStore`] - Append-only log with CRC-framed records

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod record;
mod revision;
mod store;
mod table;

pub use error::{StorageError, StorageResult};
pub use file::FileRevisionStore;
pub use memory::{MemoryRevisionStore, DEFAULT_LOCK_TIMEOUT};
pub use revision::{
    DocumentId, Revision, RevisionId, SequenceNumber, StoredDocument, DIGEST_LEN,
};
pub use store::RevisionStore;
