//! The revision store contract.

use crate::error::StorageResult;
use crate::revision::{DocumentId, Revision, RevisionId, SequenceNumber, StoredDocument};

/// A durable, transactional store of document revisions.
///
/// Stores hold the current revision of each document plus its ancestor
/// ids, assign a local sequence to every mutation, and keep a separate
/// namespace of raw, non-replicated records.
///
/// # Contract
///
/// - `commit` is atomic: it either installs the revision or changes
///   nothing.
/// - `commit` fails with `Aborted` if the current revision is not
///   `expected_parent`, and with `Busy` if the write lock cannot be
///   taken within the store's timeout.
/// - Sequences are strictly increasing across all mutations.
/// - Implementations must be `Send + Sync`.
pub trait RevisionStore: Send + Sync {
    /// Returns the stored record of a document, if any.
    fn current(&self, doc_id: &DocumentId) -> StorageResult<Option<StoredDocument>>;

    /// Installs `revision` as the current revision of its document.
    ///
    /// `history` is the new revision's ancestor list, nearest first.
    /// Returns the sequence assigned to the commit.
    fn commit(
        &self,
        revision: Revision,
        history: Vec<RevisionId>,
        expected_parent: Option<&RevisionId>,
    ) -> StorageResult<SequenceNumber>;

    /// Removes a document and all of its history.
    ///
    /// Returns the sequence assigned to the purge, or `None` if the
    /// document did not exist.
    fn purge(&self, doc_id: &DocumentId) -> StorageResult<Option<SequenceNumber>>;

    /// Returns documents whose last mutation is after `since`, in
    /// sequence order, up to `limit` entries.
    fn changes_since(
        &self,
        since: SequenceNumber,
        limit: usize,
    ) -> StorageResult<Vec<StoredDocument>>;

    /// Returns the highest sequence assigned so far.
    fn last_sequence(&self) -> SequenceNumber;

    /// Reads a raw local record.
    fn get_raw(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Writes a raw local record. `None` removes it.
    fn put_raw(&self, key: &str, value: Option<Vec<u8>>) -> StorageResult<()>;

    /// Returns the number of live (non-deleted) documents.
    fn document_count(&self) -> usize;

    /// Flushes pending writes to durable media.
    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
