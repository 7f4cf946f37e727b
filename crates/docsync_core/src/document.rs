//! In-memory document handles.

use crate::error::{CoreError, CoreResult};
use docsync_codec::{from_cbor, to_cbor, Value};
use docsync_storage::{DocumentId, Revision, RevisionId};
use std::collections::BTreeMap;

/// A mutable, in-memory view of a document.
///
/// A handle remembers the revision it was loaded from or last saved as.
/// That revision is the expected parent of the next save, which is how
/// concurrent writers are detected.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: DocumentId,
    body: Value,
    revision: Option<Revision>,
}

impl Document {
    /// Creates an unsaved document with a random id and an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: DocumentId::random(),
            body: Value::Dict(BTreeMap::new()),
            revision: None,
        }
    }

    /// Creates an unsaved document with the given id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDocumentId` if `id` is empty.
    pub fn with_id(id: impl Into<String>) -> CoreResult<Self> {
        Ok(Self {
            id: DocumentId::new(id)?,
            body: Value::Dict(BTreeMap::new()),
            revision: None,
        })
    }

    /// Builds a handle from a stored revision, decoding its body.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the body does not decode.
    pub fn from_revision(revision: Revision) -> CoreResult<Self> {
        let body = decode_body(&revision)?;
        Ok(Self {
            id: revision.doc_id.clone(),
            body,
            revision: Some(revision),
        })
    }

    /// Returns the document id.
    #[must_use]
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Returns the body.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Replaces the body.
    pub fn set_body(&mut self, body: Value) {
        self.body = body;
    }

    /// Sets one top-level property. A non-dictionary body is replaced by
    /// a dictionary first.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if !matches!(self.body, Value::Dict(_)) {
            self.body = Value::Dict(BTreeMap::new());
        }
        if let Value::Dict(entries) = &mut self.body {
            entries.insert(key.into(), value.into());
        }
    }

    /// Reads one top-level property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Returns the revision this handle is based on, if it was ever saved
    /// or loaded.
    #[must_use]
    pub fn revision(&self) -> Option<&Revision> {
        self.revision.as_ref()
    }

    /// Returns the id of the revision this handle is based on.
    #[must_use]
    pub fn rev_id(&self) -> Option<&RevisionId> {
        self.revision.as_ref().map(|r| &r.rev_id)
    }

    /// Returns the generation, or 0 for a never-saved document.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.rev_id().map_or(0, RevisionId::generation)
    }

    /// Returns true if the handle is based on a deletion tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.revision.as_ref().is_some_and(|r| r.deleted)
    }

    /// Returns true if the handle has been saved or loaded.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.revision.is_some()
    }

    pub(crate) fn encode_body(&self) -> CoreResult<Vec<u8>> {
        Ok(to_cbor(&self.body)?)
    }

    /// Rebases the handle onto `revision` after a commit.
    pub(crate) fn mark_committed(&mut self, revision: Revision) {
        if revision.deleted {
            self.body = Value::Dict(BTreeMap::new());
        }
        self.revision = Some(revision);
    }

    /// Points the handle at `revision` without touching the body.
    pub(crate) fn rebase(&mut self, revision: Option<Revision>) {
        self.revision = revision;
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a stored body. Tombstones and empty bodies decode to an empty
/// dictionary.
pub(crate) fn decode_body(revision: &Revision) -> CoreResult<Value> {
    if revision.deleted || revision.body.is_empty() {
        return Ok(Value::Dict(BTreeMap::new()));
    }
    from_cbor(&revision.body).map_err(CoreError::from)
}
