//! Passive replication peer.
//!
//! Serves a [`Database`] to active sessions over loopback connections. It
//! answers the handshake, streams changes to pullers and applies pushed
//! revisions, rejecting divergent ones with a conflict.

use crate::error::{ReplicatorError, ReplicatorResult};
use crate::loopback::{loopback_pair, LoopbackTransport};
use crate::transport::{
    receive_message, send_message, Transport, TransportFactory, CLOSE_GOING_AWAY, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR,
};
use docsync_core::{BusyRetry, CoreError, Database, PullOutcome, RemoteRevision};
use docsync_protocol::{
    status, Changes, Credentials, DocAck, DocError, ErrorMessage, Hello, HelloAck, ProtocolError,
    Push, PushAck, RevisionEnvelope, SyncMessage, PROTOCOL_VERSION,
};
use docsync_storage::{DocumentId, Revision, RevisionId, SequenceNumber};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration of a [`PassivePeer`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Credentials every client must present. `None` accepts anyone.
    pub credentials: Option<Credentials>,
    /// Revisions per `Changes` batch.
    pub batch_size: usize,
    /// Granularity of the serving loop.
    pub poll_interval: Duration,
    /// How long to wait for the client's handshake.
    pub handshake_timeout: Duration,
}

impl PeerConfig {
    /// Creates a configuration that accepts any client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            credentials: None,
            batch_size: 100,
            poll_interval: Duration::from_millis(20),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Requires `credentials` from every client.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the serving loop granularity.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct PeerState {
    db: Arc<Database>,
    config: PeerConfig,
    revoked: Mutex<HashSet<DocumentId>>,
    // Last revision each document received by push, and from which client.
    origins: Mutex<HashMap<DocumentId, (String, RevisionId)>>,
    shutdown: AtomicBool,
    connections: AtomicUsize,
}

/// An in-process replication endpoint.
///
/// Implements [`TransportFactory`]: every `open` creates a loopback
/// connection and serves it on a new thread.
#[derive(Clone)]
pub struct PassivePeer {
    state: Arc<PeerState>,
}

impl PassivePeer {
    /// Serves `db` with `config`.
    #[must_use]
    pub fn new(db: Arc<Database>, config: PeerConfig) -> Self {
        Self {
            state: Arc::new(PeerState {
                db,
                config,
                revoked: Mutex::new(HashSet::new()),
                origins: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the served database.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.state.db
    }

    /// Revokes clients' access to `doc_id`. Revisions of the document are
    /// sent from now on as access removals.
    pub fn revoke_access(&self, doc_id: &DocumentId) {
        self.state.revoked.lock().insert(doc_id.clone());
    }

    /// Closes every connection with "going away" and refuses new ones
    /// until [`PassivePeer::resume`].
    pub fn shutdown(&self) {
        info!("passive peer shutting down");
        self.state.shutdown.store(true, Ordering::SeqCst);
    }

    /// Accepts connections again after [`PassivePeer::shutdown`].
    pub fn resume(&self) {
        self.state.shutdown.store(false, Ordering::SeqCst);
    }

    /// Returns the number of connections being served.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl TransportFactory for PassivePeer {
    fn endpoint(&self) -> String {
        format!("loopback://{}", self.state.db.id())
    }

    fn open(&self, _timeout: Duration) -> ReplicatorResult<Box<dyn Transport>> {
        if self.state.shutdown.load(Ordering::SeqCst) {
            return Err(ReplicatorError::ConnectionRefused);
        }
        let (client, server) = loopback_pair();
        let state = Arc::clone(&self.state);
        state.connections.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("docsync-peer".into())
            .spawn(move || {
                state.serve(server);
                state.connections.fetch_sub(1, Ordering::SeqCst);
            });
        if spawned.is_err() {
            self.state.connections.fetch_sub(1, Ordering::SeqCst);
            return Err(ReplicatorError::ConnectionRefused);
        }
        Ok(Box::new(client))
    }
}

impl PeerState {
    fn serve(&self, mut transport: LoopbackTransport) {
        match self.run(&mut transport) {
            Ok(()) => debug!("peer connection finished"),
            Err(err) => {
                debug!(error = %err, "peer connection failed");
                if matches!(err, ReplicatorError::Protocol(_)) {
                    transport.request_close(CLOSE_PROTOCOL_ERROR);
                }
            }
        }
        transport.close();
    }

    fn run(&self, t: &mut dyn Transport) -> ReplicatorResult<()> {
        let hello = match receive_message(t, self.config.handshake_timeout)? {
            Some(SyncMessage::Hello(hello)) => hello,
            Some(other) => return Err(other.unexpected("Hello").into()),
            None => return Err(ReplicatorError::Timeout),
        };

        if hello.protocol_version != PROTOCOL_VERSION {
            let err = ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: hello.protocol_version,
            };
            self.reject(t, status::INTERNAL, &err.to_string())?;
            return Err(err.into());
        }
        if let Some(required) = &self.config.credentials {
            if hello.credentials.as_ref() != Some(required) {
                warn!(client = %hello.client_id, "rejecting client with bad credentials");
                return self.reject(t, status::UNAUTHORIZED, "invalid credentials");
            }
        }

        info!(
            client = %hello.client_id,
            push = hello.push,
            pull = hello.pull,
            continuous = hello.continuous,
            since = hello.pull_since,
            "accepted replication session"
        );
        send_message(
            t,
            &SyncMessage::HelloAck(HelloAck {
                server_id: self.db.id().to_string(),
            }),
        )?;

        let feed = (hello.pull && hello.continuous).then(|| self.db.subscribe());
        let mut since = SequenceNumber::new(hello.pull_since);
        if hello.pull {
            since = self.send_changes(t, &hello, since)?;
        }

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                t.request_close(CLOSE_GOING_AWAY);
                return Ok(());
            }
            if t.close_requested().is_some() {
                return Ok(());
            }
            if let Some(feed) = &feed {
                if feed.try_iter().count() > 0 {
                    since = self.send_changes(t, &hello, since)?;
                }
            }

            match receive_message(t, self.config.poll_interval)? {
                Some(SyncMessage::Push(push)) if hello.push => {
                    let ack = self.accept(&hello.client_id, push);
                    send_message(t, &SyncMessage::PushAck(ack))?;
                }
                Some(SyncMessage::Heartbeat) => {}
                Some(other) => return Err(other.unexpected("Push").into()),
                None => {}
            }
        }
    }

    fn reject(&self, t: &mut dyn Transport, code: u16, message: &str) -> ReplicatorResult<()> {
        send_message(t, &SyncMessage::Error(ErrorMessage::new(code, message)))?;
        t.request_close(CLOSE_NORMAL);
        Ok(())
    }

    /// Streams every change after `since` and returns the new cursor. The
    /// last batch is flagged `caught_up`.
    fn send_changes(
        &self,
        t: &mut dyn Transport,
        hello: &Hello,
        mut since: SequenceNumber,
    ) -> ReplicatorResult<SequenceNumber> {
        let batch_size = self.config.batch_size;
        loop {
            let docs = self.db.changes_since(since, batch_size)?;
            let caught_up = docs.len() < batch_size;

            let mut revisions = Vec::with_capacity(docs.len());
            {
                let origins = self.origins.lock();
                let revoked = self.revoked.lock();
                for stored in &docs {
                    since = stored.sequence;
                    let doc_id = &stored.revision.doc_id;
                    if let Some(ids) = &hello.document_ids {
                        if !ids.iter().any(|id| id == doc_id.as_str()) {
                            continue;
                        }
                    }
                    let echo = origins
                        .get(doc_id)
                        .is_some_and(|(client, rev)| {
                            client == &hello.client_id && rev == &stored.revision.rev_id
                        });
                    if echo {
                        continue;
                    }
                    let mut envelope = RevisionEnvelope::from_stored(stored);
                    if revoked.contains(doc_id) {
                        envelope.removed = true;
                        envelope.body.clear();
                    }
                    revisions.push(envelope);
                }
            }

            debug!(count = revisions.len(), since = since.as_u64(), caught_up, "sending changes");
            send_message(
                t,
                &SyncMessage::Changes(Changes {
                    revisions,
                    last_sequence: since.as_u64(),
                    caught_up,
                }),
            )?;
            if caught_up {
                return Ok(since);
            }
        }
    }

    fn accept(&self, client_id: &str, push: Push) -> PushAck {
        let retry = BusyRetry::default();
        let results = push
            .revisions
            .into_iter()
            .map(|envelope| {
                let doc_id = envelope.doc_id.clone();
                let rev_id = envelope.rev_id.clone();
                let remote = RemoteRevision {
                    revision: Revision {
                        doc_id: envelope.doc_id,
                        rev_id: envelope.rev_id,
                        deleted: envelope.deleted,
                        body: envelope.body,
                    },
                    history: envelope.history,
                    removed: false,
                };

                let error = match retry.run(|| self.db.apply_pushed(remote.clone())) {
                    Ok(PullOutcome::Applied(_)) => {
                        self.origins
                            .lock()
                            .insert(doc_id.clone(), (client_id.to_string(), rev_id.clone()));
                        None
                    }
                    Ok(PullOutcome::AlreadyPresent | PullOutcome::Purged) => None,
                    Ok(PullOutcome::Conflict) => Some(DocError::Conflict),
                    Err(CoreError::Busy) => Some(DocError::Busy),
                    Err(err) => Some(DocError::Other(err.to_string())),
                };
                if let Some(error) = &error {
                    debug!(doc_id = %doc_id, rev = %rev_id, ?error, "rejected pushed revision");
                }
                DocAck {
                    doc_id,
                    rev_id,
                    error,
                }
            })
            .collect();
        PushAck { results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{ConcurrencyPolicy, Document};

    const WAIT: Duration = Duration::from_secs(2);

    fn peer_with_doc() -> PassivePeer {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut doc = Document::with_id("doc1").unwrap();
        doc.set("v", 1i64);
        db.save(&mut doc, ConcurrencyPolicy::LastWriteWins).unwrap();
        PassivePeer::new(db, PeerConfig::new())
    }

    fn handshake(t: &mut dyn Transport, hello: Hello) -> SyncMessage {
        send_message(t, &SyncMessage::Hello(hello)).unwrap();
        receive_message(t, WAIT).unwrap().unwrap()
    }

    #[test]
    fn one_shot_pull_streams_changes() {
        let peer = peer_with_doc();
        let mut t = peer.open(WAIT).unwrap();

        let ack = handshake(t.as_mut(), Hello::new("c1", false, true, false));
        assert!(matches!(ack, SyncMessage::HelloAck(_)));

        match receive_message(t.as_mut(), WAIT).unwrap().unwrap() {
            SyncMessage::Changes(changes) => {
                assert!(changes.caught_up);
                assert_eq!(changes.revisions.len(), 1);
                assert_eq!(changes.revisions[0].doc_id.as_str(), "doc1");
            }
            other => panic!("unexpected {other:?}"),
        }
        t.request_close(CLOSE_NORMAL);
    }

    #[test]
    fn bad_credentials_get_401() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let peer = PassivePeer::new(
            db,
            PeerConfig::new().with_credentials(Credentials::Basic {
                username: "u".into(),
                password: "right".into(),
            }),
        );
        let mut t = peer.open(WAIT).unwrap();
        let mut hello = Hello::new("c1", true, true, false);
        hello.credentials = Some(Credentials::Basic {
            username: "u".into(),
            password: "wrong".into(),
        });

        match handshake(t.as_mut(), hello) {
            SyncMessage::Error(err) => assert_eq!(err.code, status::UNAUTHORIZED),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pushed_conflict_is_rejected() {
        let peer = peer_with_doc();
        let mut t = peer.open(WAIT).unwrap();
        handshake(t.as_mut(), Hello::new("c1", true, false, false));

        let stray = Revision::child_of(DocumentId::new("doc1").unwrap(), None, false, vec![0xa0]);
        let push = Push {
            revisions: vec![RevisionEnvelope {
                doc_id: stray.doc_id.clone(),
                rev_id: stray.rev_id.clone(),
                history: vec![],
                deleted: false,
                removed: false,
                body: stray.body.clone(),
                sequence: 1,
            }],
        };
        send_message(t.as_mut(), &SyncMessage::Push(push)).unwrap();

        match receive_message(t.as_mut(), WAIT).unwrap().unwrap() {
            SyncMessage::PushAck(ack) => {
                assert_eq!(ack.results.len(), 1);
                assert_eq!(ack.results[0].error, Some(DocError::Conflict));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(peer.database().pending_conflicts().is_empty());
    }

    #[test]
    fn shutdown_refuses_connections() {
        let peer = peer_with_doc();
        peer.shutdown();
        assert!(matches!(
            peer.open(WAIT),
            Err(ReplicatorError::ConnectionRefused)
        ));
        peer.resume();
        assert!(peer.open(WAIT).is_ok());
    }
}
