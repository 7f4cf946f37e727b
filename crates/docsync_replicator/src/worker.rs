//! The session worker: connects, replicates and retries.
//!
//! One worker thread runs per started session. It owns the transport
//! exclusively and learns about `stop` and reachability changes through
//! its command channel, so no lock is held across network waits.

use crate::checkpoint::{self, Checkpoint};
use crate::config::{DocumentFlags, DocumentView, ReplicatorConfig};
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::retry::{ErrorClass, RetryDecision, RetryPolicy};
use crate::session::{Command, Shared};
use crate::state::Event;
use crate::tracker::DocumentReplicationTracker;
use crate::transport::{receive_message, send_message, Transport, CLOSE_NORMAL};
use docsync_codec::{from_cbor, Value};
use docsync_core::{BusyRetry, CoreError, PullOutcome, RemoteRevision, ReplicatorGuard};
use docsync_protocol::{
    status, Changes, DocError, ErrorMessage, Hello, Push, PushAck, RevisionEnvelope, SyncMessage,
};
use docsync_storage::{DocumentId, Revision, StoredDocument};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Why a connection attempt ended.
#[derive(Debug)]
enum Exit {
    Stopped,
    Completed,
    Failed(ReplicatorError),
}

/// How an offline wait ended.
enum Wake {
    Retry,
    Stop,
}

/// A pushed batch awaiting its acknowledgement.
struct InFlight {
    end: u64,
    flags: HashMap<DocumentId, DocumentFlags>,
}

/// Per-connection state.
struct Connection {
    busy: bool,
    pull_caught_up: bool,
    in_flight: Option<InFlight>,
    last_heartbeat: Instant,
    last_checkpoint: Instant,
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    config: ReplicatorConfig,
    retry_count: u32,
    tracker: DocumentReplicationTracker,
    guard: ReplicatorGuard,
}

impl Worker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        commands: Receiver<Command>,
        config: ReplicatorConfig,
        guard: ReplicatorGuard,
    ) -> Self {
        Self {
            shared,
            commands,
            config,
            retry_count: 0,
            tracker: DocumentReplicationTracker::new(),
            guard,
        }
    }

    pub(crate) fn run(mut self) {
        let last = loop {
            let err = match self.connect_and_replicate() {
                Exit::Stopped => break Event::Stop,
                Exit::Completed => break Event::Completed,
                Exit::Failed(err) => err,
            };

            let decision = self
                .config
                .retry
                .decide(&err, self.config.continuous, self.retry_count);
            let delay = match decision {
                RetryDecision::Stop => {
                    warn!(session = self.shared.id, error = %err, "replication failed");
                    break Event::Fatal(err);
                }
                RetryDecision::Offline { delay } => delay,
            };

            if delay.is_some() {
                self.retry_count += 1;
            }
            info!(
                session = self.shared.id,
                error = %err,
                retry_count = self.retry_count,
                delay_ms = delay.map(|d| d.as_millis() as u64),
                "going offline"
            );
            self.shared.transition(Event::Offline(err));

            match self.wait_offline(delay) {
                Wake::Stop => break Event::Stop,
                Wake::Retry => {
                    self.shared.transition(Event::Reconnect);
                }
            }
        };
        self.finish(last);
    }

    fn finish(self, last: Event) {
        self.save_checkpoint();
        let Self { shared, guard, .. } = self;
        drop(guard);
        if shared.transition(last).is_none() {
            shared.transition(Event::Stop);
        }
        shared.release();
        debug!(session = shared.id, "session worker exited");
    }

    /// Waits out an offline period. `None` waits for a reachability
    /// signal only.
    fn wait_offline(&mut self, delay: Option<Duration>) -> Wake {
        let deadline = delay.map(|d| Instant::now() + d);
        let received = match deadline {
            Some(deadline) => self
                .commands
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => self
                .commands
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => Wake::Stop,
            Ok(Command::NetworkReachable) => {
                debug!(session = self.shared.id, "network reachable, retrying now");
                self.retry_count = 0;
                Wake::Retry
            }
            Err(RecvTimeoutError::Timeout) => Wake::Retry,
        }
    }

    /// Returns `Some(Exit::Stopped)` if a stop is pending.
    fn poll_commands(&self) -> Option<Exit> {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return Some(Exit::Stopped),
                Ok(Command::NetworkReachable) => {}
                Err(TryRecvError::Empty) => return None,
            }
        }
    }

    fn connect_and_replicate(&mut self) -> Exit {
        if let Some(exit) = self.poll_commands() {
            return exit;
        }
        debug!(
            session = self.shared.id,
            endpoint = %self.shared.factory.endpoint(),
            "connecting"
        );
        let mut transport = match self.shared.factory.open(self.config.connect_timeout) {
            Ok(transport) => transport,
            Err(err) => return Exit::Failed(err),
        };

        let exit = match self.replicate(transport.as_mut()) {
            Ok(exit) => exit,
            Err(err) => Exit::Failed(err),
        };

        self.flush_documents();
        if transport.close_requested().is_none() {
            transport.request_close(CLOSE_NORMAL);
        }
        transport.close();
        self.save_checkpoint();
        exit
    }

    fn replicate(&mut self, t: &mut dyn Transport) -> ReplicatorResult<Exit> {
        let config = &self.config;
        let mut hello = Hello::new(
            self.shared.db.id().to_string(),
            config.replicator_type.is_push(),
            config.replicator_type.is_pull(),
            config.continuous,
        );
        hello.pull_since = self.shared.checkpoint.lock().pull_remote_sequence;
        hello.document_ids = config.document_ids.clone();
        hello.credentials = config.authenticator.as_ref().map(|a| a.credentials());
        send_message(t, &SyncMessage::Hello(hello))?;

        let reply = match self.await_handshake(t)? {
            Some(reply) => reply,
            None => return Ok(Exit::Stopped),
        };
        let server_id = match reply {
            SyncMessage::HelloAck(ack) => ack.server_id,
            SyncMessage::Error(err) => return Err(remote_error(err)),
            other => return Err(other.unexpected("HelloAck").into()),
        };

        let now = Instant::now();
        let mut conn = Connection {
            busy: false,
            pull_caught_up: !self.config.replicator_type.is_pull(),
            in_flight: None,
            last_heartbeat: now,
            last_checkpoint: now,
        };
        conn.busy = self.has_work(&conn);
        self.shared.transition(Event::Connected { busy: conn.busy });
        self.retry_count = 0;
        info!(session = self.shared.id, server = %server_id, "connected");

        loop {
            if let Some(exit) = self.poll_commands() {
                return Ok(exit);
            }
            if let Some(code) = t.close_requested() {
                return Err(ReplicatorError::RemoteClosed { code });
            }

            if self.config.replicator_type.is_push() && conn.in_flight.is_none() {
                self.send_push_batch(t, &mut conn)?;
            }

            match receive_message(t, self.config.poll_interval)? {
                Some(SyncMessage::Changes(changes)) if self.config.replicator_type.is_pull() => {
                    self.apply_changes(changes, &mut conn)?;
                }
                Some(SyncMessage::PushAck(ack)) if conn.in_flight.is_some() => {
                    self.handle_push_ack(ack, &mut conn)?;
                }
                Some(SyncMessage::Heartbeat) | None => {}
                Some(SyncMessage::Error(err)) => return Err(remote_error(err)),
                Some(other) => return Err(other.unexpected("Changes or PushAck").into()),
            }

            let busy = self.has_work(&conn);
            self.set_busy(&mut conn, busy);
            if !conn.busy && !self.config.continuous {
                info!(session = self.shared.id, "replication complete");
                return Ok(Exit::Completed);
            }

            if conn.last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                send_message(t, &SyncMessage::Heartbeat)?;
                conn.last_heartbeat = Instant::now();
            }
            if conn.last_checkpoint.elapsed() >= self.config.checkpoint_interval {
                self.save_checkpoint();
                conn.last_checkpoint = Instant::now();
            }
        }
    }

    /// Waits for the handshake reply. `None` means a stop was requested.
    fn await_handshake(&self, t: &mut dyn Transport) -> ReplicatorResult<Option<SyncMessage>> {
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            if self.poll_commands().is_some() {
                return Ok(None);
            }
            if let Some(code) = t.close_requested() {
                return Err(ReplicatorError::RemoteClosed { code });
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ReplicatorError::Timeout);
            }
            if let Some(message) = receive_message(t, left.min(self.config.poll_interval))? {
                return Ok(Some(message));
            }
        }
    }

    fn has_work(&self, conn: &Connection) -> bool {
        let push = self.config.replicator_type.is_push()
            && (conn.in_flight.is_some()
                || self.shared.db.last_sequence() > self.shared.checkpoint.lock().push_cursor());
        let pull = self.config.replicator_type.is_pull() && !conn.pull_caught_up;
        push || pull
    }

    fn set_busy(&self, conn: &mut Connection, busy: bool) {
        if conn.busy != busy {
            conn.busy = busy;
            self.shared.transition(Event::Activity { busy });
        }
    }

    // ---- push ----

    fn send_push_batch(&mut self, t: &mut dyn Transport, conn: &mut Connection) -> ReplicatorResult<()> {
        let db = &self.shared.db;
        let last = db.last_sequence();
        let checkpoint = self.shared.checkpoint.lock().clone();
        let cursor = checkpoint.push_cursor();
        if last <= cursor {
            return Ok(());
        }

        let docs = db.changes_since(cursor, self.config.batch_size)?;
        let Some(end) = docs.last().map(|d| d.sequence) else {
            // Only purges happened since the cursor.
            self.shared.checkpoint.lock().push_sequence = last.as_u64();
            return Ok(());
        };

        let mut revisions = Vec::new();
        let mut flags = HashMap::new();
        for stored in &docs {
            if should_push(&self.config, &checkpoint, stored)? {
                flags.insert(stored.revision.doc_id.clone(), flags_of(stored));
                revisions.push(RevisionEnvelope::from_stored(stored));
            }
        }

        if revisions.is_empty() {
            self.shared.checkpoint.lock().push_sequence = end.as_u64();
            return Ok(());
        }

        let count = revisions.len() as u64;
        debug!(session = self.shared.id, count, end = end.as_u64(), "pushing revisions");
        self.set_busy(conn, true);
        send_message(t, &SyncMessage::Push(Push { revisions }))?;
        conn.in_flight = Some(InFlight {
            end: end.as_u64(),
            flags,
        });
        self.shared.advance(0, count, 0);
        Ok(())
    }

    fn handle_push_ack(&mut self, ack: PushAck, conn: &mut Connection) -> ReplicatorResult<()> {
        let Some(in_flight) = conn.in_flight.take() else {
            return Ok(());
        };

        let mut transient = None;
        let mut succeeded = 0;
        let count = ack.results.len() as u64;
        for result in ack.results {
            let flags = in_flight
                .flags
                .get(&result.doc_id)
                .copied()
                .unwrap_or_default();
            match result.error {
                None => {
                    self.shared
                        .checkpoint
                        .lock()
                        .remote_revisions
                        .insert(result.doc_id.clone(), result.rev_id);
                    self.tracker.succeeded(true, result.doc_id, flags);
                    succeeded += 1;
                }
                Some(error) => {
                    let is_transient = error.is_transient();
                    let err = push_error(&result.doc_id, error);
                    debug!(doc_id = %result.doc_id, error = %err, "push rejected");
                    if is_transient && transient.is_none() {
                        transient = Some(err.clone());
                    }
                    self.tracker
                        .failed(true, result.doc_id, flags, err, is_transient);
                }
            }
        }

        if transient.is_none() {
            self.shared.checkpoint.lock().push_sequence = in_flight.end;
        }
        self.flush_side(true);
        self.shared.advance(count, 0, succeeded);

        match transient {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---- pull ----

    fn apply_changes(&mut self, changes: Changes, conn: &mut Connection) -> ReplicatorResult<()> {
        let count = changes.revisions.len() as u64;
        if count > 0 {
            self.set_busy(conn, true);
            self.shared.advance(0, count, 0);
        }

        let retry = BusyRetry::default();
        let mut failure = None;
        let mut succeeded = 0;
        for envelope in changes.revisions {
            if !self.config.includes(&envelope.doc_id) {
                continue;
            }
            let flags = DocumentFlags {
                deleted: envelope.deleted,
                access_removed: envelope.removed,
            };
            if !envelope.removed && !self.pull_filter_accepts(&envelope, flags)? {
                debug!(doc_id = %envelope.doc_id, "pull filter rejected revision");
                continue;
            }

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
                removed: envelope.removed,
            };

            match retry.run(|| self.shared.db.apply_pulled(remote.clone())) {
                Ok(PullOutcome::Applied(_)) => {
                    self.remember_remote(&doc_id, Some(rev_id));
                    self.tracker.succeeded(false, doc_id, flags);
                    succeeded += 1;
                }
                Ok(PullOutcome::AlreadyPresent) => {
                    self.remember_remote(&doc_id, Some(rev_id));
                }
                Ok(PullOutcome::Purged) => {
                    self.remember_remote(&doc_id, None);
                    self.tracker.succeeded(false, doc_id, flags);
                    succeeded += 1;
                }
                Ok(PullOutcome::Conflict) => {
                    let err = ReplicatorError::Conflict {
                        doc_id: doc_id.to_string(),
                    };
                    self.tracker.failed(false, doc_id, flags, err, false);
                }
                Err(err @ CoreError::InvalidRevision { .. }) => {
                    warn!(doc_id = %doc_id, error = %err, "skipping invalid pulled revision");
                    self.tracker
                        .failed(false, doc_id, flags, ReplicatorError::from(err), false);
                }
                Err(err) => {
                    let err = ReplicatorError::from(err);
                    let transient = RetryPolicy::classify(&err) == ErrorClass::Transient;
                    warn!(doc_id = %doc_id, error = %err, "cannot apply pulled revision");
                    self.tracker
                        .failed(false, doc_id, flags, err.clone(), transient);
                    failure = Some(err);
                    break;
                }
            }
        }

        self.flush_side(false);
        self.shared.advance(count, 0, succeeded);
        if let Some(err) = failure {
            return Err(err);
        }

        self.shared.checkpoint.lock().pull_remote_sequence = changes.last_sequence;
        conn.pull_caught_up = changes.caught_up;
        Ok(())
    }

    fn pull_filter_accepts(
        &self,
        envelope: &RevisionEnvelope,
        flags: DocumentFlags,
    ) -> ReplicatorResult<bool> {
        let Some(filter) = &self.config.pull_filter else {
            return Ok(true);
        };
        let body = body_value(envelope.deleted, &envelope.body)?;
        Ok(filter(
            &DocumentView {
                id: &envelope.doc_id,
                rev_id: &envelope.rev_id,
                body: &body,
            },
            flags,
        ))
    }

    fn remember_remote(&self, doc_id: &DocumentId, rev_id: Option<docsync_storage::RevisionId>) {
        let mut checkpoint = self.shared.checkpoint.lock();
        match rev_id {
            Some(rev_id) => {
                checkpoint.remote_revisions.insert(doc_id.clone(), rev_id);
            }
            None => {
                checkpoint.remote_revisions.remove(doc_id);
            }
        }
    }

    // ---- bookkeeping ----

    fn flush_side(&mut self, is_push: bool) {
        if let Some(batch) = self.tracker.flush(is_push) {
            self.shared.publish_documents(batch);
        }
    }

    fn flush_documents(&mut self) {
        self.flush_side(true);
        self.flush_side(false);
    }

    fn save_checkpoint(&self) {
        let snapshot: Checkpoint = self.shared.checkpoint.lock().clone();
        if let Err(err) = checkpoint::save(&self.shared.db, &self.shared.checkpoint_key, &snapshot) {
            warn!(session = self.shared.id, error = %err, "cannot save checkpoint");
        }
    }
}

/// Returns true if `stored` should be sent to the remote: it passes the
/// document id restriction and the push filter, and the remote does not
/// already hold it.
pub(crate) fn should_push(
    config: &ReplicatorConfig,
    checkpoint: &Checkpoint,
    stored: &StoredDocument,
) -> ReplicatorResult<bool> {
    let rev = &stored.revision;
    if !config.includes(&rev.doc_id) || checkpoint.remote_has(&rev.doc_id, &rev.rev_id) {
        return Ok(false);
    }
    let Some(filter) = &config.push_filter else {
        return Ok(true);
    };
    let body = body_value(rev.deleted, &rev.body)?;
    Ok(filter(
        &DocumentView {
            id: &rev.doc_id,
            rev_id: &rev.rev_id,
            body: &body,
        },
        flags_of(stored),
    ))
}

fn flags_of(stored: &StoredDocument) -> DocumentFlags {
    DocumentFlags {
        deleted: stored.revision.deleted,
        access_removed: false,
    }
}

fn body_value(deleted: bool, body: &[u8]) -> ReplicatorResult<Value> {
    if deleted || body.is_empty() {
        return Ok(Value::Dict(BTreeMap::new()));
    }
    Ok(from_cbor(body)?)
}

fn remote_error(err: ErrorMessage) -> ReplicatorError {
    match err.code {
        status::UNAUTHORIZED => ReplicatorError::AuthenticationFailed(err.message),
        code => ReplicatorError::http(code, err.message),
    }
}

fn push_error(doc_id: &DocumentId, error: DocError) -> ReplicatorError {
    match error {
        DocError::Conflict => ReplicatorError::Conflict {
            doc_id: doc_id.to_string(),
        },
        DocError::Forbidden => ReplicatorError::http(status::FORBIDDEN, "forbidden"),
        DocError::Busy => ReplicatorError::http(status::UNAVAILABLE, "remote busy"),
        DocError::Other(message) => ReplicatorError::http(status::INTERNAL, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_codec::to_cbor;

    fn stored(id: &str, deleted: bool, body: Vec<u8>) -> StoredDocument {
        let rev = Revision::child_of(DocumentId::new(id).unwrap(), None, deleted, body);
        StoredDocument {
            revision: rev,
            history: vec![],
            sequence: docsync_storage::SequenceNumber::new(1),
        }
    }

    #[test]
    fn echoes_are_not_pushed() {
        let doc = stored("a", false, vec![]);
        let mut checkpoint = Checkpoint::default();
        let config = ReplicatorConfig::new();
        assert!(should_push(&config, &checkpoint, &doc).unwrap());

        checkpoint
            .remote_revisions
            .insert(doc.revision.doc_id.clone(), doc.revision.rev_id.clone());
        assert!(!should_push(&config, &checkpoint, &doc).unwrap());
    }

    #[test]
    fn push_filter_sees_body_and_flags() {
        let mut body = BTreeMap::new();
        body.insert("public".to_string(), Value::Bool(true));
        let public = stored("a", false, to_cbor(&Value::Dict(body)).unwrap());
        let deleted = stored("b", true, vec![]);

        let config = ReplicatorConfig::new().with_push_filter(|doc, flags| {
            !flags.deleted && doc.body.get("public") == Some(&Value::Bool(true))
        });
        let checkpoint = Checkpoint::default();
        assert!(should_push(&config, &checkpoint, &public).unwrap());
        assert!(!should_push(&config, &checkpoint, &deleted).unwrap());
    }

    #[test]
    fn document_ids_restrict_push() {
        let config = ReplicatorConfig::new().with_document_ids(["a"]);
        let checkpoint = Checkpoint::default();
        assert!(should_push(&config, &checkpoint, &stored("a", false, vec![])).unwrap());
        assert!(!should_push(&config, &checkpoint, &stored("b", false, vec![])).unwrap());
    }

    #[test]
    fn remote_errors_map_to_session_errors() {
        assert!(matches!(
            remote_error(ErrorMessage::new(status::UNAUTHORIZED, "no")),
            ReplicatorError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            remote_error(ErrorMessage::new(status::UNAVAILABLE, "later")),
            ReplicatorError::Http { status: 503, .. }
        ));
        let doc = DocumentId::new("d").unwrap();
        assert!(matches!(
            push_error(&doc, DocError::Conflict),
            ReplicatorError::Conflict { .. }
        ));
        assert_eq!(
            RetryPolicy::classify(&push_error(&doc, DocError::Busy)),
            ErrorClass::Transient
        );
    }
}
