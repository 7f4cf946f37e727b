//! Recorders for replicator events.

use crate::fixtures::wait_until;
use docsync_replicator::{
    ActivityLevel, DocumentReplication, ListenerToken, Replicator, ReplicatorStatus,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Captures every status a replicator publishes.
#[derive(Clone, Default)]
pub struct StatusRecorder {
    seen: Arc<Mutex<Vec<ReplicatorStatus>>>,
}

impl StatusRecorder {
    /// Registers a new recorder on `replicator`.
    pub fn attach(replicator: &Replicator) -> (Self, ListenerToken) {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.seen);
        let token = replicator.add_change_listener(move |status| sink.lock().push(status.clone()));
        (recorder, token)
    }

    /// Returns every status seen so far.
    pub fn statuses(&self) -> Vec<ReplicatorStatus> {
        self.seen.lock().clone()
    }

    /// Returns the sequence of activity levels, with consecutive
    /// duplicates (progress updates) collapsed.
    pub fn levels(&self) -> Vec<ActivityLevel> {
        let mut levels: Vec<ActivityLevel> = Vec::new();
        for status in self.seen.lock().iter() {
            if levels.last() != Some(&status.activity) {
                levels.push(status.activity);
            }
        }
        levels
    }

    /// Returns the most recent status.
    pub fn last(&self) -> Option<ReplicatorStatus> {
        self.seen.lock().last().cloned()
    }

    /// Returns how many times `level` was entered.
    pub fn count(&self, level: ActivityLevel) -> usize {
        self.levels().iter().filter(|l| **l == level).count()
    }

    /// Waits until `level` has been entered at least `times` times.
    pub fn wait_for(&self, level: ActivityLevel, times: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.count(level) >= times)
    }

    /// Waits for the final `Stopped` status.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.wait_for(ActivityLevel::Stopped, 1, timeout)
    }
}

/// Captures document replication batches.
#[derive(Clone, Default)]
pub struct DocumentRecorder {
    seen: Arc<Mutex<Vec<DocumentReplication>>>,
}

impl DocumentRecorder {
    /// Registers a new recorder on `replicator`.
    pub fn attach(replicator: &Replicator) -> (Self, ListenerToken) {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.seen);
        let token =
            replicator.add_document_replication_listener(move |batch| sink.lock().push(batch.clone()));
        (recorder, token)
    }

    /// Returns every batch seen so far.
    pub fn batches(&self) -> Vec<DocumentReplication> {
        self.seen.lock().clone()
    }

    /// Returns `(doc id, error)` pairs for one direction, in order.
    pub fn outcomes(&self, is_push: bool) -> Vec<(String, Option<String>)> {
        self.seen
            .lock()
            .iter()
            .filter(|b| b.is_push == is_push)
            .flat_map(|b| b.documents.iter())
            .map(|d| (d.id.to_string(), d.error.as_ref().map(ToString::to_string)))
            .collect()
    }

    /// Returns the ids replicated without error in one direction.
    pub fn succeeded(&self, is_push: bool) -> Vec<String> {
        self.outcomes(is_push)
            .into_iter()
            .filter(|(_, err)| err.is_none())
            .map(|(id, _)| id)
            .collect()
    }
}
