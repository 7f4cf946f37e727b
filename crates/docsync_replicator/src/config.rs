//! Replicator configuration.

use crate::retry::RetryPolicy;
use docsync_codec::Value;
use docsync_protocol::Credentials;
use docsync_storage::{DocumentId, RevisionId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Direction of replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicatorType {
    /// Send local changes only.
    Push,
    /// Receive remote changes only.
    Pull,
    /// Both directions.
    #[default]
    PushAndPull,
}

impl ReplicatorType {
    /// Returns true if local changes are sent.
    #[must_use]
    pub fn is_push(self) -> bool {
        matches!(self, Self::Push | Self::PushAndPull)
    }

    /// Returns true if remote changes are received.
    #[must_use]
    pub fn is_pull(self) -> bool {
        matches!(self, Self::Pull | Self::PushAndPull)
    }
}

/// Flags describing a replicated revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentFlags {
    /// The revision is a tombstone.
    pub deleted: bool,
    /// The remote side revoked access to the document.
    pub access_removed: bool,
}

/// Read-only view of a revision passed to replication filters.
#[derive(Debug, Clone, Copy)]
pub struct DocumentView<'a> {
    /// Document id.
    pub id: &'a DocumentId,
    /// Revision id.
    pub rev_id: &'a RevisionId,
    /// Decoded body. An empty dictionary for tombstones.
    pub body: &'a Value,
}

/// Decides whether a revision is replicated. Returning `false` skips it.
pub type ReplicationFilter = Arc<dyn Fn(&DocumentView<'_>, DocumentFlags) -> bool + Send + Sync>;

/// Credentials presented to the remote peer.
#[derive(Clone, PartialEq, Eq)]
pub enum Authenticator {
    /// Username and password.
    Basic {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// An existing session cookie.
    Session {
        /// Session id.
        session_id: String,
        /// Cookie name. Defaults to `SyncGatewaySession`.
        cookie_name: String,
    },
}

impl Authenticator {
    /// Creates basic credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Creates session credentials with the default cookie name.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::Session {
            session_id: session_id.into(),
            cookie_name: "SyncGatewaySession".into(),
        }
    }

    pub(crate) fn credentials(&self) -> Credentials {
        match self.clone() {
            Self::Basic { username, password } => Credentials::Basic { username, password },
            Self::Session {
                session_id,
                cookie_name,
            } => Credentials::Session {
                session_id,
                cookie_name,
            },
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Session { cookie_name, .. } => f
                .debug_struct("Session")
                .field("cookie_name", cookie_name)
                .finish_non_exhaustive(),
        }
    }
}

/// Configuration of a replication session.
///
/// Frozen once the session starts.
#[derive(Clone)]
pub struct ReplicatorConfig {
    /// Direction.
    pub replicator_type: ReplicatorType,
    /// Keep replicating after catching up.
    pub continuous: bool,
    /// Filter applied before pushing.
    pub push_filter: Option<ReplicationFilter>,
    /// Filter applied before saving pulled revisions.
    pub pull_filter: Option<ReplicationFilter>,
    /// Credentials sent in the handshake.
    pub authenticator: Option<Authenticator>,
    /// Restrict replication to these documents.
    pub document_ids: Option<Vec<String>>,
    /// Keep-alive period while idle.
    pub heartbeat_interval: Duration,
    /// How often progress is checkpointed.
    pub checkpoint_interval: Duration,
    /// Revisions per push batch.
    pub batch_size: usize,
    /// Bound on connecting and on the handshake.
    pub connect_timeout: Duration,
    /// Granularity of the session loop.
    pub poll_interval: Duration,
    /// Reconnect policy.
    pub retry: RetryPolicy,
}

impl ReplicatorConfig {
    /// Creates a one-shot push-and-pull configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            replicator_type: ReplicatorType::PushAndPull,
            continuous: false,
            push_filter: None,
            pull_filter: None,
            authenticator: None,
            document_ids: None,
            heartbeat_interval: Duration::from_secs(300),
            checkpoint_interval: Duration::from_secs(5),
            batch_size: 100,
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the direction.
    #[must_use]
    pub fn with_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    /// Makes the session continuous.
    #[must_use]
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the push filter.
    #[must_use]
    pub fn with_push_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&DocumentView<'_>, DocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.push_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the pull filter.
    #[must_use]
    pub fn with_pull_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&DocumentView<'_>, DocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.pull_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Restricts replication to the given documents.
    #[must_use]
    pub fn with_document_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the checkpoint interval.
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the push batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the connect and handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the session loop granularity.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns true if `id` passes the `document_ids` restriction.
    #[must_use]
    pub fn includes(&self, id: &DocumentId) -> bool {
        self.document_ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|d| d == id.as_str()))
    }
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReplicatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfig")
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("push_filter", &self.push_filter.is_some())
            .field("pull_filter", &self.pull_filter.is_some())
            .field("authenticator", &self.authenticator)
            .field("document_ids", &self.document_ids)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ReplicatorConfig::new()
            .with_type(ReplicatorType::Pull)
            .with_continuous(true)
            .with_batch_size(0)
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_document_ids(["a", "b"]);

        assert!(config.replicator_type.is_pull());
        assert!(!config.replicator_type.is_push());
        assert!(config.continuous);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.includes(&DocumentId::new("a").unwrap()));
        assert!(!config.includes(&DocumentId::new("c").unwrap()));
    }

    #[test]
    fn debug_hides_secrets() {
        let config =
            ReplicatorConfig::new().with_authenticator(Authenticator::basic("user", "hunter2"));
        let rendered = format!("{config:?}");
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn filters_are_shared_across_clones() {
        let config = ReplicatorConfig::new().with_push_filter(|doc, _| doc.id.as_str() != "skip");
        let copy = config.clone();
        let filter = copy.push_filter.unwrap();

        let rev = RevisionId::new(1, "a".repeat(40));
        let body = Value::Dict(Default::default());
        let id = DocumentId::new("skip").unwrap();
        let view = DocumentView {
            id: &id,
            rev_id: &rev,
            body: &body,
        };
        assert!(!filter(&view, DocumentFlags::default()));
    }
}
