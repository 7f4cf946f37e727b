//! Fault injection for revision stores.
//!
//! [`FaultyStore`] wraps a [`MemoryRevisionStore`] and can slow down raw
//! reads or make every write fail with `StorageError::Busy`. Use it to
//! widen race windows or to drive error paths that a healthy store never
//! takes.
//!
//! ```rust,ignore
//! let store = Arc::new(FaultyStore::new());
//! store.set_raw_read_delay(Duration::from_millis(300));
//! let db = Arc::new(store.open_database());
//! ```

use docsync_core::{Database, DatabaseConfig};
use docsync_storage::{
    DocumentId, MemoryRevisionStore, Revision, RevisionId, RevisionStore, SequenceNumber,
    StorageError, StorageResult, StoredDocument,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A memory store with switchable faults.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryRevisionStore,
    raw_read_delay: Mutex<Option<Duration>>,
    fail_writes: AtomicBool,
    rejected_writes: AtomicUsize,
}

impl FaultyStore {
    /// Creates a store with no faults enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `get_raw` sleep for `delay` before reading.
    pub fn set_raw_read_delay(&self, delay: Duration) {
        *self.raw_read_delay.lock() = Some(delay);
    }

    /// Makes `commit`, `purge` and `put_raw` fail with `Busy` while set.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns how many writes were rejected so far.
    pub fn rejected_writes(&self) -> usize {
        self.rejected_writes.load(Ordering::SeqCst)
    }

    /// Opens a database over this store.
    pub fn open_database(self: &Arc<Self>) -> Database {
        Database::with_store(Arc::clone(self) as Arc<dyn RevisionStore>, DatabaseConfig::new())
    }

    fn check_write(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            self.rejected_writes.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Busy);
        }
        Ok(())
    }
}

impl RevisionStore for FaultyStore {
    fn current(&self, doc_id: &DocumentId) -> StorageResult<Option<StoredDocument>> {
        self.inner.current(doc_id)
    }

    fn commit(
        &self,
        revision: Revision,
        history: Vec<RevisionId>,
        expected_parent: Option<&RevisionId>,
    ) -> StorageResult<SequenceNumber> {
        self.check_write()?;
        self.inner.commit(revision, history, expected_parent)
    }

    fn purge(&self, doc_id: &DocumentId) -> StorageResult<Option<SequenceNumber>> {
        self.check_write()?;
        self.inner.purge(doc_id)
    }

    fn changes_since(
        &self,
        since: SequenceNumber,
        limit: usize,
    ) -> StorageResult<Vec<StoredDocument>> {
        self.inner.changes_since(since, limit)
    }

    fn last_sequence(&self) -> SequenceNumber {
        self.inner.last_sequence()
    }

    fn get_raw(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let delay = *self.raw_read_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.inner.get_raw(key)
    }

    fn put_raw(&self, key: &str, value: Option<Vec<u8>>) -> StorageResult<()> {
        self.check_write()?;
        self.inner.put_raw(key, value)
    }

    fn document_count(&self) -> usize {
        self.inner.document_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::save_doc;
    use std::time::Instant;

    #[test]
    fn failing_writes_reject_saves_until_cleared() {
        let store = Arc::new(FaultyStore::new());
        let db = store.open_database();

        store.set_fail_writes(true);
        let mut doc = docsync_core::Document::with_id("doc1").unwrap();
        let err = db
            .save(&mut doc, docsync_core::ConcurrencyPolicy::LastWriteWins)
            .unwrap_err();
        assert!(err.is_busy());
        assert!(store.rejected_writes() >= 1);

        store.set_fail_writes(false);
        save_doc(&db, "doc1", [("v", 1i64)]);
        assert_eq!(db.document_count(), 1);
    }

    #[test]
    fn raw_reads_are_delayed() {
        let store = FaultyStore::new();
        store.set_raw_read_delay(Duration::from_millis(20));
        let started = Instant::now();
        assert!(store.get_raw("missing").unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
