//! # docsync Core
//!
//! Documents, revision conflict resolution and the save/delete/purge
//! entry points.
//!
//! Every write names the revision it expects to replace. When the store
//! has moved on, the caller's [`ConcurrencyPolicy`] decides the outcome:
//!
//! - `FailOnConflict` rejects the write and leaves everything unchanged
//! - `LastWriteWins` re-parents the write onto the current revision
//!
//! Revisions pulled from a peer go through [`Database::apply_pulled`],
//! which never overrides unsynced local edits.
//!
//! ## Example
//!
//! ```rust
//! use docsync_core::{ConcurrencyPolicy, CoreError, Database, Document};
//!
//! let db = Database::open_in_memory().unwrap();
//! let mut doc = Document::with_id("doc1").unwrap();
//! doc.set("v", 1i64);
//! db.save(&mut doc, ConcurrencyPolicy::FailOnConflict).unwrap();
//!
//! let mut stale = Document::with_id("doc1").unwrap();
//! let result = db.save(&mut stale, ConcurrencyPolicy::FailOnConflict);
//! assert!(matches!(result, Err(CoreError::Conflict { .. })));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
pub mod conflict;
mod database;
mod document;
mod error;
mod locks;
mod retry;

pub use change_feed::{ChangeEvent, ChangeFeed, ChangeKind};
pub use config::DatabaseConfig;
pub use conflict::{
    ConcurrencyPolicy, Conflict, ConflictDecision, ConflictResolver, DefaultConflictResolver,
    PullDecision, RemoteRevision, Resolution,
};
pub use database::{Database, PullOutcome, ReplicatorGuard, MAX_CONFLICT_RESOLUTION_RETRIES};
pub use document::Document;
pub use error::{CoreError, CoreResult};
pub use retry::BusyRetry;

pub use docsync_codec::Value;
pub use docsync_storage::{DocumentId, Revision, RevisionId, SequenceNumber, StoredDocument};
