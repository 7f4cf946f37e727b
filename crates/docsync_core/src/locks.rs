//! Per-document write locks.

use docsync_storage::DocumentId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Entries beyond this count trigger pruning of unused locks.
const PRUNE_THRESHOLD: usize = 1024;

/// Hands out one mutex per document id so that writes to the same
/// document serialize while unrelated documents commit concurrently.
#[derive(Debug, Default)]
pub(crate) struct DocumentLocks {
    locks: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    /// Returns the lock for `doc_id`, creating it on first use.
    pub(crate) fn handle(&self, doc_id: &DocumentId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(doc_id.clone()).or_default())
    }
}
