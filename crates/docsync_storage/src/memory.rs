//! In-memory revision store for testing and ephemeral databases.

use crate::error::{StorageError, StorageResult};
use crate::revision::{DocumentId, Revision, RevisionId, SequenceNumber, StoredDocument};
use crate::store::RevisionStore;
use crate::table::DocumentTable;
use parking_lot::RwLock;
use std::time::Duration;

/// Default time a writer waits for the table lock before reporting `Busy`.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// An in-memory revision store.
///
/// Contents are lost when the store is dropped.
///
/// # Example
///
/// ```rust
/// use docsync_storage::{DocumentId, MemoryRevisionStore, Revision, RevisionStore};
///
/// let store = MemoryRevisionStore::new();
/// let rev = Revision::child_of(DocumentId::new("doc1").unwrap(), None, false, b"{}".to_vec());
/// store.commit(rev, Vec::new(), None).unwrap();
/// assert_eq!(store.document_count(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryRevisionStore {
    table: RwLock<DocumentTable>,
    lock_timeout: Duration,
}

impl MemoryRevisionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates an empty store with a custom write-lock timeout.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            table: RwLock::new(DocumentTable::default()),
            lock_timeout,
        }
    }
}

impl Default for MemoryRevisionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionStore for MemoryRevisionStore {
    fn current(&self, doc_id: &DocumentId) -> StorageResult<Option<StoredDocument>> {
        Ok(self.table.read().get(doc_id).cloned())
    }

    fn commit(
        &self,
        revision: Revision,
        history: Vec<RevisionId>,
        expected_parent: Option<&RevisionId>,
    ) -> StorageResult<SequenceNumber> {
        let mut table = self
            .table
            .try_write_for(self.lock_timeout)
            .ok_or(StorageError::Busy)?;
        table.check_parent(&revision.doc_id, expected_parent)?;
        let sequence = table.next_sequence();
        table.apply_commit(revision, history, sequence);
        Ok(sequence)
    }

    fn purge(&self, doc_id: &DocumentId) -> StorageResult<Option<SequenceNumber>> {
        let mut table = self
            .table
            .try_write_for(self.lock_timeout)
            .ok_or(StorageError::Busy)?;
        let sequence = table.next_sequence();
        Ok(table.apply_purge(doc_id, sequence).then_some(sequence))
    }

    fn changes_since(
        &self,
        since: SequenceNumber,
        limit: usize,
    ) -> StorageResult<Vec<StoredDocument>> {
        Ok(self.table.read().changes_since(since, limit))
    }

    fn last_sequence(&self) -> SequenceNumber {
        self.table.read().last_sequence()
    }

    fn get_raw(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.table.read().get_raw(key).cloned())
    }

    fn put_raw(&self, key: &str, value: Option<Vec<u8>>) -> StorageResult<()> {
        self.table
            .try_write_for(self.lock_timeout)
            .ok_or(StorageError::Busy)?
            .apply_raw(key, value);
        Ok(())
    }

    fn document_count(&self) -> usize {
        self.table.read().live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn doc(id: &str) -> DocumentId {
        DocumentId::new(id).unwrap()
    }

    #[test]
    fn commit_and_read_back() {
        let store = MemoryRevisionStore::new();
        let rev = Revision::child_of(doc("a"), None, false, b"body".to_vec());
        let seq = store.commit(rev.clone(), vec![], None).unwrap();

        let stored = store.current(&doc("a")).unwrap().unwrap();
        assert_eq!(stored.revision, rev);
        assert_eq!(stored.sequence, seq);
        assert_eq!(store.last_sequence(), seq);
    }

    #[test]
    fn stale_parent_aborts_without_mutation() {
        let store = MemoryRevisionStore::new();
        let r1 = Revision::child_of(doc("a"), None, false, b"1".to_vec());
        store.commit(r1.clone(), vec![], None).unwrap();

        let stray = Revision::child_of(doc("a"), None, false, b"2".to_vec());
        let err = store.commit(stray, vec![], None).unwrap_err();
        assert!(err.is_contention());
        assert_eq!(store.current(&doc("a")).unwrap().unwrap().revision, r1);
    }

    #[test]
    fn tombstones_are_not_counted() {
        let store = MemoryRevisionStore::new();
        let r1 = Revision::child_of(doc("a"), None, false, b"1".to_vec());
        store.commit(r1.clone(), vec![], None).unwrap();
        assert_eq!(store.document_count(), 1);

        let r2 = Revision::child_of(doc("a"), Some(&r1.rev_id), true, vec![]);
        store
            .commit(r2, vec![r1.rev_id.clone()], Some(&r1.rev_id))
            .unwrap();
        assert_eq!(store.document_count(), 0);
        assert!(store.current(&doc("a")).unwrap().unwrap().revision.deleted);
    }

    #[test]
    fn purge_absent_returns_none() {
        let store = MemoryRevisionStore::new();
        assert_eq!(store.purge(&doc("missing")).unwrap(), None);
        assert_eq!(store.last_sequence(), SequenceNumber::ZERO);
    }

    #[test]
    fn raw_records() {
        let store = MemoryRevisionStore::new();
        store.put_raw("checkpoint", Some(vec![1, 2])).unwrap();
        assert_eq!(store.get_raw("checkpoint").unwrap(), Some(vec![1, 2]));
        store.put_raw("checkpoint", None).unwrap();
        assert_eq!(store.get_raw("checkpoint").unwrap(), None);
    }

    #[test]
    fn held_lock_reports_busy() {
        let store = MemoryRevisionStore::with_lock_timeout(Duration::from_millis(10));
        let _guard = store.table.write();
        let rev = Revision::child_of(doc("a"), None, false, vec![]);
        assert!(matches!(
            store.commit(rev, vec![], None),
            Err(StorageError::Busy)
        ));
    }

    #[test]
    fn concurrent_creates_have_one_winner() {
        let store = Arc::new(MemoryRevisionStore::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let rev = Revision::child_of(doc("race"), None, false, vec![i]);
                    store.commit(rev, vec![], None).is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }
}
