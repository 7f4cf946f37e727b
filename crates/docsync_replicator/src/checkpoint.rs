//! Replication checkpoints, kept as raw local records.

use crate::error::ReplicatorResult;
use docsync_codec::{from_bytes, to_bytes};
use docsync_core::Database;
use docsync_storage::{DocumentId, RevisionId, SequenceNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress of a session against one remote endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Local sequence up to which changes have been pushed.
    pub push_sequence: u64,
    /// Remote sequence up to which changes have been pulled.
    pub pull_remote_sequence: u64,
    /// Revision the remote is known to hold for each document.
    pub remote_revisions: BTreeMap<DocumentId, RevisionId>,
}

impl Checkpoint {
    /// Returns the push cursor.
    #[must_use]
    pub fn push_cursor(&self) -> SequenceNumber {
        SequenceNumber::new(self.push_sequence)
    }

    /// Returns true if the remote already holds `rev_id` for `doc_id`.
    #[must_use]
    pub fn remote_has(&self, doc_id: &DocumentId, rev_id: &RevisionId) -> bool {
        self.remote_revisions.get(doc_id) == Some(rev_id)
    }
}

/// Raw record key of the checkpoint for `endpoint`.
#[must_use]
pub fn checkpoint_key(endpoint: &str) -> String {
    format!("checkpoint/{endpoint}")
}

pub(crate) fn load(db: &Database, key: &str) -> ReplicatorResult<Checkpoint> {
    match db.get_raw(key)? {
        Some(bytes) => Ok(from_bytes(&bytes)?),
        None => Ok(Checkpoint::default()),
    }
}

pub(crate) fn save(db: &Database, key: &str, checkpoint: &Checkpoint) -> ReplicatorResult<()> {
    db.put_raw(key, Some(to_bytes(checkpoint)?))?;
    Ok(())
}

pub(crate) fn reset(db: &Database, key: &str) -> ReplicatorResult<()> {
    db.put_raw(key, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_checkpoint_is_default() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(load(&db, "checkpoint/x").unwrap(), Checkpoint::default());
    }

    #[test]
    fn save_load_reset() {
        let db = Database::open_in_memory().unwrap();
        let key = checkpoint_key("loopback://peer");
        let doc = DocumentId::new("doc1").unwrap();
        let rev = RevisionId::new(2, "b".repeat(40));

        let mut cp = Checkpoint {
            push_sequence: 7,
            pull_remote_sequence: 3,
            ..Checkpoint::default()
        };
        cp.remote_revisions.insert(doc.clone(), rev.clone());
        save(&db, &key, &cp).unwrap();

        let loaded = load(&db, &key).unwrap();
        assert_eq!(loaded, cp);
        assert!(loaded.remote_has(&doc, &rev));
        assert_eq!(loaded.push_cursor(), SequenceNumber::new(7));

        reset(&db, &key).unwrap();
        assert_eq!(load(&db, &key).unwrap(), Checkpoint::default());
    }
}
