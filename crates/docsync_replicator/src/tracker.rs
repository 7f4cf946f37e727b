//! Per-document replication outcomes.
//!
//! Outcomes are collected while a push or pull batch is processed and
//! delivered together when the batch completes.

use crate::config::DocumentFlags;
use crate::error::ReplicatorError;
use docsync_storage::DocumentId;

/// Outcome of replicating one document.
#[derive(Debug, Clone)]
pub struct ReplicatedDocument {
    /// Document id.
    pub id: DocumentId,
    /// Flags of the replicated revision.
    pub flags: DocumentFlags,
    /// Why the document did not replicate, if it did not.
    pub error: Option<ReplicatorError>,
    /// The document will be retried on a later attempt.
    pub error_is_transient: bool,
}

/// A batch of outcomes from one push or pull round.
#[derive(Debug, Clone)]
pub struct DocumentReplication {
    /// True for pushed documents, false for pulled ones.
    pub is_push: bool,
    /// Outcomes in processing order.
    pub documents: Vec<ReplicatedDocument>,
}

/// Accumulates outcomes for the current round.
#[derive(Debug, Default)]
pub struct DocumentReplicationTracker {
    pushed: Vec<ReplicatedDocument>,
    pulled: Vec<ReplicatedDocument>,
}

impl DocumentReplicationTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successfully replicated document.
    pub fn succeeded(&mut self, is_push: bool, id: DocumentId, flags: DocumentFlags) {
        self.record(
            is_push,
            ReplicatedDocument {
                id,
                flags,
                error: None,
                error_is_transient: false,
            },
        );
    }

    /// Records a document that failed to replicate.
    pub fn failed(
        &mut self,
        is_push: bool,
        id: DocumentId,
        flags: DocumentFlags,
        error: ReplicatorError,
        transient: bool,
    ) {
        self.record(
            is_push,
            ReplicatedDocument {
                id,
                flags,
                error: Some(error),
                error_is_transient: transient,
            },
        );
    }

    /// Returns the number of outcomes not yet flushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pushed.len() + self.pulled.len()
    }

    /// Takes the outcomes recorded in one direction, or `None` if there
    /// are none.
    pub fn flush(&mut self, is_push: bool) -> Option<DocumentReplication> {
        let documents = std::mem::take(self.side(is_push));
        (!documents.is_empty()).then_some(DocumentReplication { is_push, documents })
    }

    fn record(&mut self, is_push: bool, doc: ReplicatedDocument) {
        self.side(is_push).push(doc);
    }

    fn side(&mut self, is_push: bool) -> &mut Vec<ReplicatedDocument> {
        if is_push {
            &mut self.pushed
        } else {
            &mut self.pulled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DocumentId {
        DocumentId::new(s).unwrap()
    }

    #[test]
    fn batches_per_direction() {
        let mut tracker = DocumentReplicationTracker::new();
        tracker.succeeded(true, id("a"), DocumentFlags::default());
        tracker.failed(
            false,
            id("b"),
            DocumentFlags::default(),
            ReplicatorError::Conflict {
                doc_id: "b".into(),
            },
            false,
        );
        tracker.succeeded(true, id("c"), DocumentFlags::default());
        assert_eq!(tracker.pending(), 3);

        let pushed = tracker.flush(true).unwrap();
        assert!(pushed.is_push);
        let ids: Vec<_> = pushed.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let pulled = tracker.flush(false).unwrap();
        assert!(!pulled.is_push);
        assert!(matches!(
            pulled.documents[0].error,
            Some(ReplicatorError::Conflict { .. })
        ));
        assert!(!pulled.documents[0].error_is_transient);
    }

    #[test]
    fn empty_flush_is_none() {
        let mut tracker = DocumentReplicationTracker::new();
        assert!(tracker.flush(true).is_none());
        tracker.succeeded(false, id("a"), DocumentFlags::default());
        assert!(tracker.flush(true).is_none());
        assert!(tracker.flush(false).is_some());
        assert_eq!(tracker.pending(), 0);
    }
}
