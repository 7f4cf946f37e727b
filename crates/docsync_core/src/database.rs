//! Database facade: save, delete, purge and pull apply.

use crate::change_feed::{ChangeEvent, ChangeFeed, ChangeKind};
use crate::config::DatabaseConfig;
use crate::conflict::{
    resolve, resolve_pulled, ConcurrencyPolicy, Conflict, ConflictDecision, ConflictResolver,
    PullDecision, RemoteRevision, Resolution,
};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::locks::DocumentLocks;
use docsync_codec::to_cbor;
use docsync_storage::{
    DocumentId, FileRevisionStore, MemoryRevisionStore, Revision, RevisionId, RevisionStore,
    SequenceNumber, StoredDocument,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on handler rounds in [`Database::save_with_conflict_handler`].
pub const MAX_CONFLICT_RESOLUTION_RETRIES: usize = 13;

/// Result of applying a revision received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The revision is now current locally.
    Applied(Revision),
    /// The local document already had this revision or a newer one.
    AlreadyPresent,
    /// Local and remote diverged; the remote revision is queued for
    /// [`Database::resolve_conflict`].
    Conflict,
    /// The peer revoked access and the local copy was purged.
    Purged,
}

/// Keeps [`Database::close`] from succeeding while a replicator uses the
/// database. Released on drop.
#[derive(Debug)]
pub struct ReplicatorGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ReplicatorGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

enum WriteOutcome {
    Committed(Revision),
    Rejected,
}

/// A document database.
///
/// All writes go through the conflict rules in [`crate::conflict`]. Writes
/// to the same document serialize on a per-document lock; writes to
/// different documents proceed in parallel.
///
/// # Example
///
/// ```rust
/// use docsync_core::{ConcurrencyPolicy, Database, Document};
///
/// let db = Database::open_in_memory().unwrap();
/// let mut doc = Document::with_id("doc1").unwrap();
/// doc.set("v", 1i64);
///
/// let rev = db.save(&mut doc, ConcurrencyPolicy::FailOnConflict).unwrap();
/// assert_eq!(rev.generation(), 1);
/// assert_eq!(doc.generation(), 1);
/// ```
pub struct Database {
    id: Uuid,
    config: DatabaseConfig,
    store: Arc<dyn RevisionStore>,
    locks: DocumentLocks,
    feed: ChangeFeed,
    conflicts: Mutex<HashMap<DocumentId, RemoteRevision>>,
    replicators: Arc<AtomicUsize>,
    open: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens or creates a database stored in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked by another process or
    /// cannot be read.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, DatabaseConfig::default())
    }

    /// Opens or creates a database with a custom configuration.
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn open_with_config(path: &Path, config: DatabaseConfig) -> CoreResult<Self> {
        let store = FileRevisionStore::open_with_timeout(path, config.lock_timeout)?;
        info!(path = %path.display(), "opened database");
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Creates an empty in-memory database.
    ///
    /// # Errors
    ///
    /// Infallible today; returns `CoreResult` to match [`Database::open`].
    pub fn open_in_memory() -> CoreResult<Self> {
        Ok(Self::open_in_memory_with_config(DatabaseConfig::default()))
    }

    /// Creates an empty in-memory database with a custom configuration.
    #[must_use]
    pub fn open_in_memory_with_config(config: DatabaseConfig) -> Self {
        let store = MemoryRevisionStore::with_lock_timeout(config.lock_timeout);
        Self::with_store(Arc::new(store), config)
    }

    /// Creates a database over an existing store.
    #[must_use]
    pub fn with_store(store: Arc<dyn RevisionStore>, config: DatabaseConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            feed: ChangeFeed::with_max_history(config.change_feed_history),
            config,
            store,
            locks: DocumentLocks::default(),
            conflicts: Mutex::new(HashMap::new()),
            replicators: Arc::new(AtomicUsize::new(0)),
            open: AtomicBool::new(true),
        }
    }

    /// Returns the unique id of this database instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns true until [`Database::close`] succeeds.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    // ---- reads ----

    /// Loads a live document. Returns `None` if the document is absent or
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDocumentId` for an empty id, or a storage or codec
    /// error.
    pub fn get_document(&self, id: &str) -> CoreResult<Option<Document>> {
        self.ensure_open()?;
        let doc_id = DocumentId::new(id)?;
        match self.store.current(&doc_id)? {
            Some(stored) if !stored.revision.deleted => {
                Ok(Some(Document::from_revision(stored.revision)?))
            }
            _ => Ok(None),
        }
    }

    /// Returns the stored record of a document, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn get_stored(&self, doc_id: &DocumentId) -> CoreResult<Option<StoredDocument>> {
        self.ensure_open()?;
        Ok(self.store.current(doc_id)?)
    }

    /// Returns documents changed after `since`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn changes_since(
        &self,
        since: SequenceNumber,
        limit: usize,
    ) -> CoreResult<Vec<StoredDocument>> {
        self.ensure_open()?;
        Ok(self.store.changes_since(since, limit)?)
    }

    /// Returns the sequence of the latest mutation.
    #[must_use]
    pub fn last_sequence(&self) -> SequenceNumber {
        self.store.last_sequence()
    }

    /// Returns the number of live documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.store.document_count()
    }

    /// Subscribes to committed mutations.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// Returns the change feed.
    #[must_use]
    pub fn change_feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Reads a raw, non-replicated record.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn get_raw(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.store.get_raw(key)?)
    }

    /// Writes or removes a raw, non-replicated record.
    ///
    /// # Errors
    ///
    /// Returns `Busy` on contention, or a storage error.
    pub fn put_raw(&self, key: &str, value: Option<Vec<u8>>) -> CoreResult<()> {
        self.ensure_open()?;
        Ok(self.store.put_raw(key, value)?)
    }

    // ---- writes ----

    /// Saves a document.
    ///
    /// On success the handle is rebased onto the committed revision. On
    /// `Conflict` the handle is left unchanged.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `policy` is `FailOnConflict` and another writer got
    ///   there first
    /// - `Busy` on lock contention
    pub fn save(&self, doc: &mut Document, policy: ConcurrencyPolicy) -> CoreResult<Revision> {
        match self.write(doc, policy, false)? {
            WriteOutcome::Committed(rev) => Ok(rev),
            WriteOutcome::Rejected => Err(CoreError::conflict(doc.id().as_str())),
        }
    }

    /// Saves a document, reporting a lost `FailOnConflict` race as
    /// `Ok(false)` instead of an error.
    ///
    /// # Errors
    ///
    /// Same as [`Database::save`], minus `Conflict`.
    pub fn try_save(&self, doc: &mut Document, policy: ConcurrencyPolicy) -> CoreResult<bool> {
        Ok(matches!(
            self.write(doc, policy, false)?,
            WriteOutcome::Committed(_)
        ))
    }

    /// Deletes a document by committing a tombstone.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the handle was never saved, or the document is
    ///   absent or already deleted in the store
    /// - `Conflict` and `Busy` as for [`Database::save`]
    pub fn delete(&self, doc: &mut Document, policy: ConcurrencyPolicy) -> CoreResult<Revision> {
        match self.write(doc, policy, true)? {
            WriteOutcome::Committed(rev) => Ok(rev),
            WriteOutcome::Rejected => Err(CoreError::conflict(doc.id().as_str())),
        }
    }

    /// Deletes a document, reporting a lost race as `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Same as [`Database::delete`], minus `Conflict`.
    pub fn try_delete(&self, doc: &mut Document, policy: ConcurrencyPolicy) -> CoreResult<bool> {
        Ok(matches!(
            self.write(doc, policy, true)?,
            WriteOutcome::Committed(_)
        ))
    }

    /// Saves a document, asking `handler` to reconcile each conflict.
    ///
    /// The handler receives the caller's handle and the current stored
    /// document (`None` if it was deleted or purged). Returning `true`
    /// retries the save on top of the current revision; returning `false`
    /// gives up.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the handler gives up or the retry bound is
    /// reached.
    pub fn save_with_conflict_handler<F>(
        &self,
        doc: &mut Document,
        mut handler: F,
    ) -> CoreResult<Revision>
    where
        F: FnMut(&mut Document, Option<&Document>) -> bool,
    {
        for _ in 0..MAX_CONFLICT_RESOLUTION_RETRIES {
            if let WriteOutcome::Committed(rev) =
                self.write(doc, ConcurrencyPolicy::FailOnConflict, false)?
            {
                return Ok(rev);
            }

            let current = self.store.current(doc.id())?.map(|s| s.revision);
            let current_doc = match &current {
                Some(rev) if !rev.deleted => Some(Document::from_revision(rev.clone())?),
                _ => None,
            };
            if !handler(doc, current_doc.as_ref()) {
                return Err(CoreError::conflict(doc.id().as_str()));
            }
            doc.rebase(current);
        }
        Err(CoreError::conflict(doc.id().as_str()))
    }

    /// Removes a document and all of its history. Not replicated.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the document does not exist.
    pub fn purge(&self, id: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let doc_id = DocumentId::new(id)?;
        let lock = self.locks.handle(&doc_id);
        let _guard = lock
            .try_lock_for(self.config.lock_timeout)
            .ok_or(CoreError::Busy)?;

        let sequence = self
            .store
            .purge(&doc_id)?
            .ok_or_else(|| CoreError::not_found(id))?;
        self.conflicts.lock().remove(&doc_id);
        self.feed.emit(ChangeEvent {
            sequence,
            doc_id,
            rev_id: None,
            kind: ChangeKind::Purged,
        });
        info!(doc_id = id, seq = sequence.as_u64(), "purged document");
        Ok(())
    }

    fn write(
        &self,
        doc: &mut Document,
        policy: ConcurrencyPolicy,
        deleting: bool,
    ) -> CoreResult<WriteOutcome> {
        self.ensure_open()?;
        if deleting && !doc.exists() {
            return Err(CoreError::not_found(doc.id().as_str()));
        }

        let body = if deleting {
            Vec::new()
        } else {
            doc.encode_body()?
        };

        let lock = self.locks.handle(doc.id());
        let _guard = lock
            .try_lock_for(self.config.lock_timeout)
            .ok_or(CoreError::Busy)?;

        let current = self.store.current(doc.id())?;
        if let Some(current) = &current {
            if !current.revision.rev_id.has_successor() {
                return Err(CoreError::invalid_revision(
                    doc.id().as_str(),
                    &current.revision.rev_id,
                    "generation limit reached",
                ));
            }
        }
        let decision = resolve(
            doc.id(),
            doc.rev_id(),
            body,
            deleting,
            current.as_ref().map(|c| &c.revision),
            policy,
        );

        let revision = match decision {
            ConflictDecision::Proceed(rev) => rev,
            ConflictDecision::MergedWinner(rev) => {
                debug!(
                    doc_id = %doc.id(),
                    rev = %rev.rev_id,
                    "conflict resolved by last write wins"
                );
                rev
            }
            ConflictDecision::RejectConflict => {
                debug!(doc_id = %doc.id(), "write rejected on conflict");
                return Ok(WriteOutcome::Rejected);
            }
            ConflictDecision::NotFound => {
                return Err(CoreError::not_found(doc.id().as_str()));
            }
        };

        let history = current
            .as_ref()
            .map(|c| c.child_history(self.config.max_history_depth))
            .unwrap_or_default();
        let expected = current.as_ref().map(|c| &c.revision.rev_id);
        self.commit(revision.clone(), history, expected)?;

        doc.mark_committed(revision.clone());
        Ok(WriteOutcome::Committed(revision))
    }

    fn commit(
        &self,
        revision: Revision,
        history: Vec<RevisionId>,
        expected: Option<&RevisionId>,
    ) -> CoreResult<SequenceNumber> {
        let doc_id = revision.doc_id.clone();
        let rev_id = revision.rev_id.clone();
        let kind = if revision.deleted {
            ChangeKind::Deleted
        } else {
            ChangeKind::Saved
        };

        let sequence = self.store.commit(revision, history, expected)?;
        debug!(
            doc_id = %doc_id,
            rev = %rev_id,
            seq = sequence.as_u64(),
            "committed revision"
        );
        self.feed.emit(ChangeEvent {
            sequence,
            doc_id,
            rev_id: Some(rev_id),
            kind,
        });
        Ok(sequence)
    }

    // ---- replication ----

    /// Applies a revision received from a peer.
    ///
    /// A pull never overrides unsynced local edits: divergence is reported
    /// as [`PullOutcome::Conflict`] and the remote revision is queued.
    ///
    /// # Errors
    ///
    /// Returns `Busy` on lock contention, or a storage error.
    pub fn apply_pulled(&self, remote: RemoteRevision) -> CoreResult<PullOutcome> {
        self.apply_remote(remote, true)
    }

    /// Applies a revision pushed by a peer.
    ///
    /// Same as [`Database::apply_pulled`] except that a divergent revision
    /// is rejected with [`PullOutcome::Conflict`] and not queued; the
    /// pushing side resolves it after its next pull.
    ///
    /// # Errors
    ///
    /// Returns `Busy` on lock contention, or a storage error.
    pub fn apply_pushed(&self, remote: RemoteRevision) -> CoreResult<PullOutcome> {
        self.apply_remote(remote, false)
    }

    fn apply_remote(&self, remote: RemoteRevision, queue_conflict: bool) -> CoreResult<PullOutcome> {
        self.ensure_open()?;
        let doc_id = remote.doc_id().clone();
        let lock = self.locks.handle(&doc_id);
        let _guard = lock
            .try_lock_for(self.config.lock_timeout)
            .ok_or(CoreError::Busy)?;

        if remote.removed {
            if let Some(sequence) = self.store.purge(&doc_id)? {
                self.feed.emit(ChangeEvent {
                    sequence,
                    doc_id: doc_id.clone(),
                    rev_id: None,
                    kind: ChangeKind::Purged,
                });
            }
            self.conflicts.lock().remove(&doc_id);
            info!(doc_id = %doc_id, "access removed, purged local copy");
            return Ok(PullOutcome::Purged);
        }

        check_lineage(&remote)?;
        let local = self.store.current(&doc_id)?;
        match resolve_pulled(&remote, local.as_ref()) {
            PullDecision::AlreadyPresent => Ok(PullOutcome::AlreadyPresent),
            PullDecision::FastForward => {
                let mut history = remote.history;
                history.truncate(self.config.max_history_depth);
                let expected = local.as_ref().map(|l| &l.revision.rev_id);
                self.commit(remote.revision.clone(), history, expected)?;
                self.conflicts.lock().remove(&doc_id);
                Ok(PullOutcome::Applied(remote.revision))
            }
            PullDecision::Conflict => {
                debug!(
                    doc_id = %doc_id,
                    remote_rev = %remote.rev_id(),
                    queued = queue_conflict,
                    "remote revision conflicts with local edits"
                );
                if queue_conflict {
                    self.conflicts.lock().insert(doc_id, remote);
                }
                Ok(PullOutcome::Conflict)
            }
        }
    }

    /// Returns ids of documents with a queued pulled conflict.
    #[must_use]
    pub fn pending_conflicts(&self) -> Vec<DocumentId> {
        let mut ids: Vec<_> = self.conflicts.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Settles a queued pulled conflict with `resolver`.
    ///
    /// The resolved revision descends from the remote one so that the next
    /// push fast-forwards the peer. Returns `None` if nothing was queued
    /// for `doc_id`.
    ///
    /// # Errors
    ///
    /// Returns `Busy` on contention (the conflict stays queued), or a codec
    /// or storage error.
    pub fn resolve_conflict(
        &self,
        doc_id: &DocumentId,
        resolver: &dyn ConflictResolver,
    ) -> CoreResult<Option<Revision>> {
        self.ensure_open()?;
        let Some(remote) = self.conflicts.lock().remove(doc_id) else {
            return Ok(None);
        };

        let lock = self.locks.handle(doc_id);
        let Some(_guard) = lock.try_lock_for(self.config.lock_timeout) else {
            self.conflicts.lock().insert(doc_id.clone(), remote);
            return Err(CoreError::Busy);
        };

        match self.settle(&remote, resolver) {
            Ok(rev) => {
                info!(doc_id = %doc_id, rev = %rev.rev_id, "conflict resolved");
                Ok(Some(rev))
            }
            Err(err) => {
                warn!(doc_id = %doc_id, error = %err, "conflict resolution failed");
                self.conflicts.lock().insert(doc_id.clone(), remote);
                Err(err)
            }
        }
    }

    fn settle(
        &self,
        remote: &RemoteRevision,
        resolver: &dyn ConflictResolver,
    ) -> CoreResult<Revision> {
        let depth = self.config.max_history_depth;
        let local = self.store.current(remote.doc_id())?;
        let expected = local.as_ref().map(|l| &l.revision.rev_id);

        let adopt_remote = |this: &Self| -> CoreResult<Revision> {
            let mut history = remote.history.clone();
            history.truncate(depth);
            this.commit(remote.revision.clone(), history, expected)?;
            Ok(remote.revision.clone())
        };

        let Some(local) = local.as_ref() else {
            return adopt_remote(self);
        };
        match resolve_pulled(remote, Some(local)) {
            PullDecision::FastForward => return adopt_remote(self),
            PullDecision::AlreadyPresent => return Ok(local.revision.clone()),
            PullDecision::Conflict => {}
        }

        let resolution = if local.revision.deleted && remote.revision.deleted {
            Resolution::Remote
        } else {
            resolver.resolve(&Conflict {
                doc_id: remote.doc_id().clone(),
                local: local.revision.clone(),
                remote: remote.revision.clone(),
            })
        };

        let (deleted, body) = match resolution {
            Resolution::Remote => return adopt_remote(self),
            Resolution::Local => (local.revision.deleted, local.revision.body.clone()),
            Resolution::Merged(value) => (false, to_cbor(&value)?),
            Resolution::Delete => (true, Vec::new()),
        };

        let revision = Revision::child_of(
            remote.doc_id().clone(),
            Some(remote.rev_id()),
            deleted,
            body,
        );
        let history = std::iter::once(remote.rev_id().clone())
            .chain(remote.history.iter().cloned())
            .take(depth)
            .collect();
        self.commit(revision.clone(), history, expected)?;
        Ok(revision)
    }

    // ---- lifecycle ----

    /// Registers an active replicator. The database cannot be closed while
    /// the guard is alive.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` if the database is closed.
    pub fn register_replicator(&self) -> CoreResult<ReplicatorGuard> {
        self.ensure_open()?;
        self.replicators.fetch_add(1, Ordering::SeqCst);
        Ok(ReplicatorGuard {
            count: Arc::clone(&self.replicators),
        })
    }

    /// Returns the number of registered replicators.
    #[must_use]
    pub fn active_replicators(&self) -> usize {
        self.replicators.load(Ordering::SeqCst)
    }

    /// Closes the database. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Busy` while replicators are registered, or a storage error
    /// if the final flush fails.
    pub fn close(&self) -> CoreResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        let active = self.active_replicators();
        if active > 0 {
            warn!(active, "cannot close database with active replicators");
            return Err(CoreError::Busy);
        }
        self.store.sync()?;
        self.open.store(false, Ordering::SeqCst);
        info!(db = %self.id, "closed database");
        Ok(())
    }
}

/// Rejects a remote revision whose generation does not follow its
/// nearest ancestor, or that leaves no room for a local child.
fn check_lineage(remote: &RemoteRevision) -> CoreResult<()> {
    let rev_id = remote.rev_id();
    let expected = RevisionId::next_generation(remote.history.first());
    if expected != Some(rev_id.generation()) {
        return Err(CoreError::invalid_revision(
            remote.doc_id().as_str(),
            rev_id,
            format!(
                "generation {} does not follow its history (expected {})",
                rev_id.generation(),
                expected.map_or_else(|| "none".to_string(), |g| g.to_string())
            ),
        ));
    }
    if !rev_id.has_successor() {
        return Err(CoreError::invalid_revision(
            remote.doc_id().as_str(),
            rev_id,
            "generation limit reached",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::Value;
    use docsync_storage::{StorageError, StorageResult};

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn doc_with(id: &str, v: i64) -> Document {
        let mut doc = Document::with_id(id).unwrap();
        doc.set("v", v);
        doc
    }

    #[test]
    fn save_and_load() {
        let db = db();
        let mut doc = doc_with("doc1", 1);
        db.save(&mut doc, ConcurrencyPolicy::FailOnConflict).unwrap();

        let loaded = db.get_document("doc1").unwrap().unwrap();
        assert_eq!(loaded.get("v").and_then(Value::as_i64), Some(1));
        assert_eq!(loaded.rev_id(), doc.rev_id());
        assert_eq!(db.document_count(), 1);
    }

    #[test]
    fn successive_saves_chain() {
        let db = db();
        let mut doc = doc_with("doc1", 1);
        for expected in 1..=4 {
            let rev = db.save(&mut doc, ConcurrencyPolicy::FailOnConflict).unwrap();
            assert_eq!(rev.generation(), expected);
        }
        let stored = db.get_stored(doc.id()).unwrap().unwrap();
        assert_eq!(stored.history.len(), 3);
    }

    #[test]
    fn rejected_save_leaves_handle_untouched() {
        let db = db();
        let mut original = doc_with("doc1", 1);
        db.save(&mut original, ConcurrencyPolicy::FailOnConflict)
            .unwrap();

        let mut a = db.get_document("doc1").unwrap().unwrap();
        let mut b = a.clone();
        a.set("v", 2i64);
        b.set("v", 3i64);
        db.save(&mut a, ConcurrencyPolicy::FailOnConflict).unwrap();

        let before = b.clone();
        assert!(!db.try_save(&mut b, ConcurrencyPolicy::FailOnConflict).unwrap());
        assert_eq!(b, before);
        assert!(matches!(
            db.save(&mut b, ConcurrencyPolicy::FailOnConflict),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn last_write_wins_overrides() {
        let db = db();
        let mut original = doc_with("doc1", 1);
        db.save(&mut original, ConcurrencyPolicy::LastWriteWins)
            .unwrap();

        let mut a = db.get_document("doc1").unwrap().unwrap();
        let mut b = a.clone();
        a.set("v", 2i64);
        b.set("v", 3i64);
        db.save(&mut a, ConcurrencyPolicy::LastWriteWins).unwrap();
        let rev = db.save(&mut b, ConcurrencyPolicy::LastWriteWins).unwrap();

        assert_eq!(rev.generation(), 3);
        let loaded = db.get_document("doc1").unwrap().unwrap();
        assert_eq!(loaded.get("v").and_then(Value::as_i64), Some(3));
    }

    #[test]
    fn delete_unsaved_is_not_found() {
        let db = db();
        let mut doc = doc_with("never", 1);
        assert!(matches!(
            db.delete(&mut doc, ConcurrencyPolicy::LastWriteWins),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_hides_document() {
        let db = db();
        let mut doc = doc_with("doc1", 1);
        db.save(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();
        let rev = db.delete(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();

        assert!(rev.deleted);
        assert!(doc.is_deleted());
        assert!(db.get_document("doc1").unwrap().is_none());
        assert_eq!(db.document_count(), 0);

        // Deleting the tombstone again has nothing to delete.
        assert!(matches!(
            db.delete(&mut doc, ConcurrencyPolicy::LastWriteWins),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn purge_absent_is_not_found() {
        let db = db();
        assert!(matches!(db.purge("ghost"), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn change_feed_sees_commits_and_purges() {
        let db = db();
        let rx = db.subscribe();
        let mut doc = doc_with("doc1", 1);
        db.save(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();
        db.purge("doc1").unwrap();

        let saved = rx.recv().unwrap();
        let purged = rx.recv().unwrap();
        assert_eq!(saved.kind, ChangeKind::Saved);
        assert_eq!(purged.kind, ChangeKind::Purged);
        assert!(purged.sequence > saved.sequence);
    }

    #[test]
    fn conflict_handler_merges() {
        let db = db();
        let mut base = doc_with("doc1", 1);
        db.save(&mut base, ConcurrencyPolicy::LastWriteWins).unwrap();

        let mut stale = db.get_document("doc1").unwrap().unwrap();
        let mut winner = stale.clone();
        winner.set("v", 10i64);
        db.save(&mut winner, ConcurrencyPolicy::LastWriteWins)
            .unwrap();

        stale.set("extra", true);
        let rev = db
            .save_with_conflict_handler(&mut stale, |mine, current| {
                let v = current.and_then(|c| c.get("v")).cloned();
                if let Some(v) = v {
                    mine.set("v", v);
                }
                true
            })
            .unwrap();

        assert_eq!(rev.generation(), 3);
        let loaded = db.get_document("doc1").unwrap().unwrap();
        assert_eq!(loaded.get("v").and_then(Value::as_i64), Some(10));
        assert_eq!(loaded.get("extra").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn conflict_handler_can_give_up() {
        let db = db();
        let mut base = doc_with("doc1", 1);
        db.save(&mut base, ConcurrencyPolicy::LastWriteWins).unwrap();
        let mut stale = Document::with_id("doc1").unwrap();

        let result = db.save_with_conflict_handler(&mut stale, |_, _| false);
        assert!(matches!(result, Err(CoreError::Conflict { .. })));
    }

    #[test]
    fn close_refused_while_replicating() {
        let db = db();
        let guard = db.register_replicator().unwrap();
        assert!(matches!(db.close(), Err(CoreError::Busy)));
        drop(guard);

        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(
            db.get_document("doc1"),
            Err(CoreError::DatabaseClosed)
        ));
        assert!(db.register_replicator().is_err());
        db.close().unwrap();
    }

    #[test]
    fn pushed_conflicts_are_not_queued() {
        let db = db();
        let mut doc = doc_with("doc1", 1);
        let base = db.save(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();
        doc.set("v", 2i64);
        db.save(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();

        let remote = Revision::child_of(doc.id().clone(), Some(&base.rev_id), false, vec![0xa0]);
        let outcome = db
            .apply_pushed(RemoteRevision {
                revision: remote,
                history: vec![base.rev_id],
                removed: false,
            })
            .unwrap();
        assert_eq!(outcome, PullOutcome::Conflict);
        assert!(db.pending_conflicts().is_empty());
    }

    #[test]
    fn remote_generation_must_follow_history() {
        let db = db();
        let id = DocumentId::new("doc1").unwrap();

        let skipped = Revision {
            doc_id: id.clone(),
            rev_id: RevisionId::new(5, "ab"),
            deleted: false,
            body: vec![0xa0],
        };
        let err = db
            .apply_pulled(RemoteRevision {
                revision: skipped,
                history: vec![RevisionId::new(1, "aa")],
                removed: false,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRevision { .. }));

        let unparented = Revision {
            doc_id: id,
            rev_id: RevisionId::new(2, "ab"),
            deleted: false,
            body: vec![0xa0],
        };
        let err = db
            .apply_pushed(RemoteRevision {
                revision: unparented,
                history: Vec::new(),
                removed: false,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRevision { .. }));
        assert!(db.get_document("doc1").unwrap().is_none());
        assert!(db.pending_conflicts().is_empty());
    }

    #[test]
    fn last_generation_from_peer_is_rejected() {
        let db = db();
        let id = DocumentId::new("doc1").unwrap();
        let last = Revision {
            doc_id: id,
            rev_id: RevisionId::new(u64::MAX, "ab"),
            deleted: false,
            body: vec![0xa0],
        };
        let err = db
            .apply_pulled(RemoteRevision {
                revision: last,
                history: vec![RevisionId::new(u64::MAX - 1, "aa")],
                removed: false,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRevision { .. }));

        // Nothing was installed, so local writes keep working.
        let mut doc = doc_with("doc1", 1);
        let rev = db.save(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();
        assert_eq!(rev.generation(), 1);
    }

    #[test]
    fn save_on_last_generation_is_rejected() {
        let store = Arc::new(MemoryRevisionStore::new());
        let id = DocumentId::new("doc1").unwrap();
        let last = Revision {
            doc_id: id.clone(),
            rev_id: RevisionId::new(u64::MAX, "ab"),
            deleted: false,
            body: vec![0xa0],
        };
        store.commit(last, Vec::new(), None).unwrap();
        let db = Database::with_store(store, DatabaseConfig::new());

        let mut doc = db.get_document("doc1").unwrap().unwrap();
        doc.set("v", 1i64);
        assert!(matches!(
            db.save(&mut doc, ConcurrencyPolicy::LastWriteWins),
            Err(CoreError::InvalidRevision { .. })
        ));
        assert_eq!(db.get_stored(&id).unwrap().unwrap().revision.generation(), u64::MAX);
    }

    /// A store whose writes always lose the race for its lock.
    struct ContendedStore {
        inner: MemoryRevisionStore,
    }

    impl RevisionStore for ContendedStore {
        fn current(&self, doc_id: &DocumentId) -> StorageResult<Option<StoredDocument>> {
            self.inner.current(doc_id)
        }

        fn commit(
            &self,
            _revision: Revision,
            _history: Vec<RevisionId>,
            _expected_parent: Option<&RevisionId>,
        ) -> StorageResult<SequenceNumber> {
            Err(StorageError::Busy)
        }

        fn purge(&self, _doc_id: &DocumentId) -> StorageResult<Option<SequenceNumber>> {
            Err(StorageError::Busy)
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
            self.inner.get_raw(key)
        }

        fn put_raw(&self, key: &str, value: Option<Vec<u8>>) -> StorageResult<()> {
            self.inner.put_raw(key, value)
        }

        fn document_count(&self) -> usize {
            self.inner.document_count()
        }
    }

    #[test]
    fn store_contention_surfaces_as_busy() {
        let inner = MemoryRevisionStore::new();
        let seeded = Revision::child_of(DocumentId::new("doc1").unwrap(), None, false, vec![0xa0]);
        inner.commit(seeded, Vec::new(), None).unwrap();
        let db = Database::with_store(Arc::new(ContendedStore { inner }), DatabaseConfig::new());

        let mut fresh = doc_with("doc2", 1);
        let err = db.save(&mut fresh, ConcurrencyPolicy::LastWriteWins).unwrap_err();
        assert!(err.is_busy());
        assert!(!fresh.exists());

        let mut existing = db.get_document("doc1").unwrap().unwrap();
        let before = existing.clone();
        let err = db
            .delete(&mut existing, ConcurrencyPolicy::FailOnConflict)
            .unwrap_err();
        assert!(err.is_busy());
        assert_eq!(existing, before);

        assert!(db.purge("doc1").unwrap_err().is_busy());
        assert_eq!(db.document_count(), 1);
    }

    #[test]
    fn change_feed_history_replays_recent_mutations() {
        let db = db();
        let mut doc = doc_with("doc1", 1);
        let saved = db.save(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();
        db.purge("doc1").unwrap();

        let events = db.change_feed().poll(SequenceNumber::ZERO, 10);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Saved, ChangeKind::Purged]);
        assert_eq!(events[0].rev_id.as_ref(), Some(&saved.rev_id));
        assert!(db.change_feed().poll(events[1].sequence, 10).is_empty());
    }

    #[test]
    fn raw_records_roundtrip() {
        let db = db();
        db.put_raw("checkpoint/x", Some(vec![1])).unwrap();
        assert_eq!(db.get_raw("checkpoint/x").unwrap(), Some(vec![1]));
    }
}
