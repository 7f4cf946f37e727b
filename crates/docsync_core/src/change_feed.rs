//! Change feed for observing committed document mutations.
//!
//! Events are emitted after the store accepts a commit, in sequence order.
//! A passive peer subscribes to wake continuous pulls. Callers that only
//! need recent events can [`ChangeFeed::poll`] the bounded history instead
//! of holding a subscription. Active sessions do neither: they compare
//! the store's last sequence with their push cursor.
//!
//! ```rust
//! use docsync_core::{ConcurrencyPolicy, Database, Document};
//!
//! let db = Database::open_in_memory().unwrap();
//! let changes = db.subscribe();
//!
//! let mut doc = Document::with_id("doc1").unwrap();
//! db.save(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();
//!
//! let event = changes.recv().unwrap();
//! assert_eq!(event.doc_id.as_str(), "doc1");
//! ```

use docsync_storage::{DocumentId, RevisionId, SequenceNumber};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A live revision became current.
    Saved,
    /// A tombstone became current.
    Deleted,
    /// The document and its history were removed.
    Purged,
}

/// A committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Sequence assigned by the store.
    pub sequence: SequenceNumber,
    /// Affected document.
    pub doc_id: DocumentId,
    /// New current revision. `None` for purges.
    pub rev_id: Option<RevisionId>,
    /// Kind of mutation.
    pub kind: ChangeKind,
}

/// Distributes committed mutations to subscribers and keeps a bounded
/// history for polling.
#[derive(Debug)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
    history: RwLock<Vec<ChangeEvent>>,
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a feed that retains up to `max_history` events.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Returns a receiver for all future events.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes an event. Disconnected subscribers are dropped.
    pub fn emit(&self, event: ChangeEvent) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(..excess);
            }
        }

        self.subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns retained events with sequence after `cursor`, up to `limit`.
    pub fn poll(&self, cursor: SequenceNumber, limit: usize) -> Vec<ChangeEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::with_max_history(1000)
    }
}
