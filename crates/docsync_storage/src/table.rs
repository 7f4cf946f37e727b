//! In-memory document table shared by the store implementations.

use crate::error::{StorageError, StorageResult};
use crate::revision::{DocumentId, Revision, RevisionId, SequenceNumber, StoredDocument};
use std::collections::{BTreeMap, HashMap};

/// Indexed view of all documents plus the raw namespace.
///
/// The file store rebuilds this by replaying its log; the memory store
/// uses it directly.
#[derive(Debug, Default)]
pub(crate) struct DocumentTable {
    docs: HashMap<DocumentId, StoredDocument>,
    by_sequence: BTreeMap<SequenceNumber, DocumentId>,
    raw: HashMap<String, Vec<u8>>,
    last_sequence: SequenceNumber,
}

impl DocumentTable {
    pub(crate) fn get(&self, doc_id: &DocumentId) -> Option<&StoredDocument> {
        self.docs.get(doc_id)
    }

    /// Fails with `Aborted` unless the current revision is `expected`.
    pub(crate) fn check_parent(
        &self,
        doc_id: &DocumentId,
        expected: Option<&RevisionId>,
    ) -> StorageResult<()> {
        let actual = self.docs.get(doc_id).map(|d| &d.revision.rev_id);
        if actual == expected {
            return Ok(());
        }
        Err(StorageError::Aborted {
            doc_id: doc_id.to_string(),
            expected: expected.map_or_else(|| "none".into(), ToString::to_string),
            actual: actual.map_or_else(|| "none".into(), ToString::to_string),
        })
    }

    pub(crate) fn next_sequence(&self) -> SequenceNumber {
        self.last_sequence.next()
    }

    pub(crate) fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub(crate) fn apply_commit(
        &mut self,
        revision: Revision,
        history: Vec<RevisionId>,
        sequence: SequenceNumber,
    ) {
        let doc_id = revision.doc_id.clone();
        if let Some(old) = self.docs.get(&doc_id) {
            self.by_sequence.remove(&old.sequence);
        }
        self.by_sequence.insert(sequence, doc_id.clone());
        self.docs.insert(
            doc_id,
            StoredDocument {
                revision,
                history,
                sequence,
            },
        );
        self.last_sequence = self.last_sequence.max(sequence);
    }

    /// Returns false if the document was absent.
    pub(crate) fn apply_purge(&mut self, doc_id: &DocumentId, sequence: SequenceNumber) -> bool {
        let Some(old) = self.docs.remove(doc_id) else {
            return false;
        };
        self.by_sequence.remove(&old.sequence);
        self.last_sequence = self.last_sequence.max(sequence);
        true
    }

    pub(crate) fn apply_raw(&mut self, key: &str, value: Option<Vec<u8>>) {
        match value {
            Some(bytes) => {
                self.raw.insert(key.to_string(), bytes);
            }
            None => {
                self.raw.remove(key);
            }
        }
    }

    pub(crate) fn get_raw(&self, key: &str) -> Option<&Vec<u8>> {
        self.raw.get(key)
    }

    pub(crate) fn changes_since(&self, since: SequenceNumber, limit: usize) -> Vec<StoredDocument> {
        self.by_sequence
            .range(since.next()..)
            .filter_map(|(_, id)| self.docs.get(id).cloned())
            .take(limit)
            .collect()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.docs.values().filter(|d| !d.revision.deleted).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(id: &str, parent: Option<&RevisionId>, body: &[u8]) -> Revision {
        Revision::child_of(DocumentId::new(id).unwrap(), parent, false, body.to_vec())
    }

    #[test]
    fn resaving_moves_document_in_sequence_index() {
        let mut table = DocumentTable::default();
        let a1 = rev("a", None, b"1");
        let b1 = rev("b", None, b"1");
        let a2 = rev("a", Some(&a1.rev_id), b"2");

        table.apply_commit(a1, vec![], SequenceNumber::new(1));
        table.apply_commit(b1, vec![], SequenceNumber::new(2));
        table.apply_commit(a2.clone(), vec![], SequenceNumber::new(3));

        let changes = table.changes_since(SequenceNumber::ZERO, 10);
        let ids: Vec<_> = changes.iter().map(|d| d.revision.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(changes[1].revision, a2);

        assert_eq!(table.changes_since(SequenceNumber::new(2), 10).len(), 1);
    }

    #[test]
    fn parent_check() {
        let mut table = DocumentTable::default();
        let a1 = rev("a", None, b"1");
        let id = a1.doc_id.clone();
        assert!(table.check_parent(&id, None).is_ok());

        table.apply_commit(a1.clone(), vec![], SequenceNumber::new(1));
        assert!(table.check_parent(&id, Some(&a1.rev_id)).is_ok());
        assert!(matches!(
            table.check_parent(&id, None),
            Err(StorageError::Aborted { .. })
        ));
    }

    #[test]
    fn purge_removes_from_index() {
        let mut table = DocumentTable::default();
        let a1 = rev("a", None, b"1");
        let id = a1.doc_id.clone();
        table.apply_commit(a1, vec![], SequenceNumber::new(1));

        assert!(table.apply_purge(&id, SequenceNumber::new(2)));
        assert!(!table.apply_purge(&id, SequenceNumber::new(3)));
        assert!(table.changes_since(SequenceNumber::ZERO, 10).is_empty());
        assert_eq!(table.last_sequence(), SequenceNumber::new(2));
    }
}
