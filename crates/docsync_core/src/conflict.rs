//! Conflict detection and resolution.
//!
//! Local writes are resolved by [`resolve`], which compares the revision a
//! handle was based on with the store's current revision. Revisions that
//! arrive from a peer are classified by [`resolve_pulled`] using their
//! ancestry instead.

use docsync_storage::{DocumentId, Revision, RevisionId, StoredDocument};

/// Caller-selected policy for saves and deletes whose expected parent no
/// longer matches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// Re-parent the candidate onto the current revision. The candidate's
    /// body always wins.
    #[default]
    LastWriteWins,
    /// Reject the write and leave both the store and the handle unchanged.
    FailOnConflict,
}

/// Outcome of resolving a candidate write against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    /// The candidate's parent matches; commit this revision.
    Proceed(Revision),
    /// The parent is stale and the policy forbids overriding.
    RejectConflict,
    /// The parent is stale; the candidate was re-parented onto the current
    /// revision.
    MergedWinner(Revision),
    /// Nothing to delete: the document is absent or already deleted.
    NotFound,
}

impl ConflictDecision {
    /// Returns the revision to commit, if any.
    #[must_use]
    pub fn revision(&self) -> Option<&Revision> {
        match self {
            Self::Proceed(rev) | Self::MergedWinner(rev) => Some(rev),
            Self::RejectConflict | Self::NotFound => None,
        }
    }
}

/// Resolves a local save or delete.
///
/// `candidate_parent` is the revision the caller's handle was based on;
/// `current` is the store's current revision of the document.
#[must_use]
pub fn resolve(
    doc_id: &DocumentId,
    candidate_parent: Option<&RevisionId>,
    candidate_body: Vec<u8>,
    is_delete: bool,
    current: Option<&Revision>,
    policy: ConcurrencyPolicy,
) -> ConflictDecision {
    let current_id = current.map(|r| &r.rev_id);
    let nothing_to_delete = current.map_or(true, |r| r.deleted);

    if is_delete && nothing_to_delete {
        return ConflictDecision::NotFound;
    }

    if candidate_parent == current_id {
        return ConflictDecision::Proceed(Revision::child_of(
            doc_id.clone(),
            current_id,
            is_delete,
            candidate_body,
        ));
    }

    match policy {
        ConcurrencyPolicy::FailOnConflict => ConflictDecision::RejectConflict,
        ConcurrencyPolicy::LastWriteWins => ConflictDecision::MergedWinner(Revision::child_of(
            doc_id.clone(),
            current_id,
            is_delete,
            candidate_body,
        )),
    }
}

/// A revision received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRevision {
    /// The revision itself.
    pub revision: Revision,
    /// Its ancestors, nearest first.
    pub history: Vec<RevisionId>,
    /// The peer no longer grants access to this document.
    pub removed: bool,
}

impl RemoteRevision {
    /// Returns the document id.
    #[must_use]
    pub fn doc_id(&self) -> &DocumentId {
        &self.revision.doc_id
    }

    /// Returns the revision id.
    #[must_use]
    pub fn rev_id(&self) -> &RevisionId {
        &self.revision.rev_id
    }
}

/// How a pulled revision relates to the local document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// The local revision is an ancestor of the remote one (or there is no
    /// local document); install the remote revision.
    FastForward,
    /// The local document already has this revision or a descendant.
    AlreadyPresent,
    /// Local and remote have diverged.
    Conflict,
}

/// Classifies a pulled revision against the local document.
///
/// Pulls never override unsynced local edits, so any divergence is a
/// conflict regardless of which revision would win.
#[must_use]
pub fn resolve_pulled(remote: &RemoteRevision, local: Option<&StoredDocument>) -> PullDecision {
    let Some(local) = local else {
        return PullDecision::FastForward;
    };

    if local.knows(remote.rev_id()) {
        return PullDecision::AlreadyPresent;
    }
    if remote.history.contains(&local.revision.rev_id) {
        return PullDecision::FastForward;
    }
    PullDecision::Conflict
}

/// What a [`ConflictResolver`] chose for a pulled conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local revision's content.
    Local,
    /// Adopt the remote revision as-is.
    Remote,
    /// Store a new body.
    Merged(docsync_codec::Value),
    /// Delete the document.
    Delete,
}

/// Both sides of a pulled conflict, as seen by a resolver.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// Document id.
    pub doc_id: DocumentId,
    /// Local revision.
    pub local: Revision,
    /// Remote revision.
    pub remote: Revision,
}

/// Application hook that settles pulled conflicts.
pub trait ConflictResolver: Send + Sync {
    /// Chooses a resolution for `conflict`.
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Resolver used when the application supplies none.
///
/// A deletion wins over an edit; otherwise the revision that sorts higher
/// wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictResolver;

impl ConflictResolver for DefaultConflictResolver {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        match (conflict.local.deleted, conflict.remote.deleted) {
            (_, true) => Resolution::Remote,
            (true, false) => Resolution::Local,
            (false, false) if conflict.local.wins_over(&conflict.remote) => Resolution::Local,
            (false, false) => Resolution::Remote,
        }
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        self(conflict)
    }
}
