//! Document and revision identity types.
//!
//! A revision id has the textual form `generation-digest`. Revisions are
//! ordered first by generation and then by digest, which gives every pair
//! of conflicting revisions a deterministic winner.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Length of the hex digest carried in a revision id.
pub const DIGEST_LEN: usize = 40;

/// Stable identifier of a document, unique within a store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates a document id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDocumentId` if the id is empty.
    pub fn new(id: impl Into<String>) -> StorageResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(StorageError::InvalidDocumentId(id));
        }
        Ok(Self(id))
    }

    /// Creates a random id from a v4 UUID.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = StorageError;

    fn try_from(id: String) -> StorageResult<Self> {
        Self::new(id)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one revision of a document: `generation-digest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    /// Creates a revision id from its parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> Self {
        Self {
            generation,
            digest: digest.into(),
        }
    }

    /// Returns the generation of a child of `parent`: one past the
    /// parent's, or 1 without a parent. `None` if `parent` is already at
    /// the last generation.
    #[must_use]
    pub fn next_generation(parent: Option<&RevisionId>) -> Option<u64> {
        parent.map_or(Some(1), |p| p.generation.checked_add(1))
    }

    /// Returns true if a child revision can still be derived from this one.
    #[must_use]
    pub fn has_successor(&self) -> bool {
        Self::next_generation(Some(self)).is_some()
    }

    /// Derives the id of a revision from its parent, deletion flag and body.
    ///
    /// The generation is [`RevisionId::next_generation`]. It saturates at
    /// `u64::MAX`; writers check [`RevisionId::has_successor`] first.
    #[must_use]
    pub fn derive(parent: Option<&RevisionId>, deleted: bool, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        hasher.update(body);

        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        Self {
            generation: Self::next_generation(parent).unwrap_or(u64::MAX),
            digest: digest[..DIGEST_LEN].to_string(),
        }
    }

    /// Returns the generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = StorageError;

    fn from_str(s: &str) -> StorageResult<Self> {
        let invalid = || StorageError::InvalidRevisionId(s.to_string());
        let (generation, digest) = s.split_once('-').ok_or_else(invalid)?;
        let generation: u64 = generation.parse().map_err(|_| invalid())?;
        if generation == 0 || digest.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(generation, digest))
    }
}

impl TryFrom<String> for RevisionId {
    type Error = StorageError;

    fn try_from(s: String) -> StorageResult<Self> {
        s.parse()
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.to_string()
    }
}

/// One immutable revision of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Document this revision belongs to.
    pub doc_id: DocumentId,
    /// Revision identifier.
    pub rev_id: RevisionId,
    /// True if this revision is a deletion tombstone.
    pub deleted: bool,
    /// Encoded body. Empty for tombstones.
    pub body: Vec<u8>,
}

impl Revision {
    /// Builds the revision that supersedes `parent` (or starts a new
    /// document when there is none).
    #[must_use]
    pub fn child_of(
        doc_id: DocumentId,
        parent: Option<&RevisionId>,
        deleted: bool,
        body: Vec<u8>,
    ) -> Self {
        let body = if deleted { Vec::new() } else { body };
        Self {
            rev_id: RevisionId::derive(parent, deleted, &body),
            doc_id,
            deleted,
            body,
        }
    }

    /// Returns the generation of this revision.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }

    /// Returns true if this revision wins over `other` in a conflict.
    #[must_use]
    pub fn wins_over(&self, other: &Revision) -> bool {
        self.rev_id > other.rev_id
    }
}

/// Monotonic local sequence assigned to every store mutation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Sequence before any mutation.
    pub const ZERO: Self = Self(0);

    /// Creates a sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// The store's record for one document: the current revision, its
/// ancestors and the sequence of the last mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Current revision.
    pub revision: Revision,
    /// Ancestor revision ids, nearest first.
    pub history: Vec<RevisionId>,
    /// Sequence at which the current revision was committed.
    pub sequence: SequenceNumber,
}

impl StoredDocument {
    /// Returns true if `rev_id` is the current revision or one of its
    /// recorded ancestors.
    #[must_use]
    pub fn knows(&self, rev_id: &RevisionId) -> bool {
        &self.revision.rev_id == rev_id || self.history.contains(rev_id)
    }

    /// Builds the ancestor list for a child of the current revision,
    /// bounded to `max_depth` entries.
    #[must_use]
    pub fn child_history(&self, max_depth: usize) -> Vec<RevisionId> {
        std::iter::once(self.revision.rev_id.clone())
            .chain(self.history.iter().cloned())
            .take(max_depth)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn doc(id: &str) -> DocumentId {
        DocumentId::new(id).unwrap()
    }

    #[test]
    fn empty_document_id_rejected() {
        assert!(matches!(
            DocumentId::new(""),
            Err(StorageError::InvalidDocumentId(_))
        ));
    }

    #[test]
    fn first_revision_is_generation_one() {
        let rev = Revision::child_of(doc("a"), None, false, b"{}".to_vec());
        assert_eq!(rev.generation(), 1);
        assert_eq!(rev.rev_id.digest().len(), DIGEST_LEN);
    }

    #[test]
    fn child_increments_generation() {
        let parent = Revision::child_of(doc("a"), None, false, b"v1".to_vec());
        let child = Revision::child_of(doc("a"), Some(&parent.rev_id), false, b"v2".to_vec());
        assert_eq!(child.generation(), 2);
        assert!(child.wins_over(&parent));
    }

    #[test]
    fn last_generation_has_no_successor() {
        let last = RevisionId::new(u64::MAX, "ab");
        assert!(!last.has_successor());
        assert_eq!(RevisionId::next_generation(Some(&last)), None);
        assert_eq!(RevisionId::derive(Some(&last), false, b"x").generation(), u64::MAX);

        let before = RevisionId::new(u64::MAX - 1, "ab");
        assert!(before.has_successor());
        assert_eq!(RevisionId::next_generation(None), Some(1));
    }

    #[test]
    fn digest_depends_on_deleted_flag() {
        let live = RevisionId::derive(None, false, b"");
        let dead = RevisionId::derive(None, true, b"");
        assert_ne!(live, dead);
    }

    #[test]
    fn tombstone_drops_body() {
        let rev = Revision::child_of(doc("a"), None, true, b"ignored".to_vec());
        assert!(rev.body.is_empty());
        assert!(rev.deleted);
    }

    #[test]
    fn revision_id_parse() {
        let id: RevisionId = "3-abc".parse().unwrap();
        assert_eq!(id.generation(), 3);
        assert_eq!(id.digest(), "abc");
        assert_eq!(id.to_string(), "3-abc");

        assert!("abc".parse::<RevisionId>().is_err());
        assert!("0-abc".parse::<RevisionId>().is_err());
        assert!("x-abc".parse::<RevisionId>().is_err());
        assert!("2-".parse::<RevisionId>().is_err());
    }

    #[test]
    fn same_generation_ties_break_on_digest() {
        let a = RevisionId::new(1, "aaaa");
        let b = RevisionId::new(1, "bbbb");
        assert!(b > a);
        assert!(RevisionId::new(2, "0000") > b);
    }

    #[test]
    fn child_history_is_bounded() {
        let stored = StoredDocument {
            revision: Revision::child_of(doc("a"), Some(&RevisionId::new(3, "c")), false, vec![]),
            history: vec![
                RevisionId::new(3, "c"),
                RevisionId::new(2, "b"),
                RevisionId::new(1, "a"),
            ],
            sequence: SequenceNumber::new(4),
        };
        let history = stored.child_history(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], stored.revision.rev_id);
        assert!(stored.knows(&RevisionId::new(1, "a")));
    }

    proptest! {
        #[test]
        fn ordering_is_total_and_generation_first(
            g1 in 1u64..100, g2 in 1u64..100,
            d1 in "[0-9a-f]{8}", d2 in "[0-9a-f]{8}",
        ) {
            let a = RevisionId::new(g1, d1);
            let b = RevisionId::new(g2, d2);
            if g1 != g2 {
                prop_assert_eq!(a.cmp(&b), g1.cmp(&g2));
            }
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn display_parse_is_identity(g in 1u64..1_000_000, d in "[0-9a-f]{40}") {
            let id = RevisionId::new(g, d);
            prop_assert_eq!(id.to_string().parse::<RevisionId>().unwrap(), id);
        }
    }
}
