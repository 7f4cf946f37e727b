//! The replicator session and its control API.

use crate::checkpoint::{self, checkpoint_key, Checkpoint};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, ReplicatorResult};
use crate::listener::{Dispatcher, InlineExecutor, ListenerToken, Listeners, SerialExecutor};
use crate::registry::{self, Reachability};
use crate::state::{ActivityLevel, Event, ReplicatorStatus, StateMachine};
use crate::tracker::DocumentReplication;
use crate::transport::TransportFactory;
use crate::worker::{should_push, Worker};
use docsync_core::Database;
use docsync_storage::DocumentId;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, info, warn};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

const PENDING_SCAN_BATCH: usize = 500;

/// Requests delivered to the session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Stop,
    NetworkReachable,
}

/// State shared between the [`Replicator`] handle and its worker.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) db: Arc<Database>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) checkpoint_key: String,
    pub(crate) checkpoint: Mutex<Checkpoint>,
    config: RwLock<ReplicatorConfig>,
    machine: Mutex<StateMachine>,
    running: AtomicBool,
    control: Mutex<Option<Sender<Command>>>,
    status_listeners: Listeners<ReplicatorStatus>,
    document_listeners: Listeners<DocumentReplication>,
    dispatcher: Dispatcher,
}

impl Shared {
    pub(crate) fn config(&self) -> ReplicatorConfig {
        self.config.read().clone()
    }

    /// Feeds `event` to the state machine and publishes the new status.
    /// Returns the new level, or `None` if the event was ignored.
    pub(crate) fn transition(&self, event: Event) -> Option<ActivityLevel> {
        let mut machine = self.machine.lock();
        let status = machine.apply(event)?;
        match &status.error {
            Some(err) => info!(session = self.id, activity = ?status.activity, error = %err, "status changed"),
            None => info!(session = self.id, activity = ?status.activity, "status changed"),
        }
        let activity = status.activity;
        self.status_listeners.notify(&self.dispatcher, status);
        Some(activity)
    }

    /// Records progress and publishes the new status.
    pub(crate) fn advance(&self, completed: u64, total: u64, documents: u64) {
        let mut machine = self.machine.lock();
        let status = machine.advance(completed, total, documents);
        self.status_listeners.notify(&self.dispatcher, status);
    }

    pub(crate) fn publish_documents(&self, batch: DocumentReplication) {
        debug!(
            session = self.id,
            is_push = batch.is_push,
            count = batch.documents.len(),
            "document batch finished"
        );
        let _machine = self.machine.lock();
        self.document_listeners.notify(&self.dispatcher, batch);
    }

    /// Tears down the running flag, control channel and registry entry.
    /// Called by the worker after the final transition.
    pub(crate) fn release(&self) {
        self.control.lock().take();
        registry::deregister(self.id);
        self.running.store(false, Ordering::SeqCst);
    }

    fn send(&self, command: Command) {
        if let Some(tx) = self.control.lock().as_ref() {
            let _ = tx.send(command);
        }
    }
}

impl Reachability for Shared {
    fn network_reachable(&self) {
        self.send(Command::NetworkReachable);
    }
}

/// A replication session between a local database and one remote
/// endpoint.
///
/// `start` and `stop` only trigger work; the session runs on its own
/// thread and reports through [`ReplicatorStatus`] listeners. A session
/// runs once: after it stops, create a new one.
///
/// ```rust
/// use docsync_core::Database;
/// use docsync_replicator::{PassivePeer, PeerConfig, Replicator, ReplicatorConfig};
/// use std::sync::Arc;
///
/// let remote = Arc::new(Database::open_in_memory().unwrap());
/// let local = Arc::new(Database::open_in_memory().unwrap());
/// let peer = Arc::new(PassivePeer::new(remote, PeerConfig::new()));
///
/// let replicator = Replicator::new(local, peer, ReplicatorConfig::new());
/// replicator.add_change_listener(|status| println!("{:?}", status.activity));
/// replicator.start().unwrap();
/// ```
pub struct Replicator {
    shared: Arc<Shared>,
}

impl Replicator {
    /// Creates a stopped session replicating `db` with `target`.
    pub fn new(db: Arc<Database>, target: Arc<dyn TransportFactory>, config: ReplicatorConfig) -> Self {
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let checkpoint_key = checkpoint_key(&target.endpoint());
        Self {
            shared: Arc::new(Shared {
                id,
                db,
                factory: target,
                checkpoint_key,
                checkpoint: Mutex::new(Checkpoint::default()),
                config: RwLock::new(config),
                machine: Mutex::new(StateMachine::new()),
                running: AtomicBool::new(false),
                control: Mutex::new(None),
                status_listeners: Listeners::new(),
                document_listeners: Listeners::new(),
                dispatcher: Dispatcher::new(format!("docsync-repl-{id}")),
            }),
        }
    }

    /// Returns the process-unique session id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Returns the local database.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.shared.db
    }

    /// Returns a copy of the configuration.
    #[must_use]
    pub fn config(&self) -> ReplicatorConfig {
        self.shared.config()
    }

    /// Replaces the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once the session has been started.
    pub fn set_config(&self, config: ReplicatorConfig) -> ReplicatorResult<()> {
        let machine = self.shared.machine.lock();
        if machine.has_started() {
            return Err(ReplicatorError::invalid_state(
                "configuration is frozen once the replicator starts",
            ));
        }
        *self.shared.config.write() = config;
        Ok(())
    }

    /// Returns a snapshot of the current status.
    #[must_use]
    pub fn status(&self) -> ReplicatorStatus {
        self.shared.machine.lock().status()
    }

    /// Starts the session. Calling it while the session runs does
    /// nothing.
    ///
    /// Connection failures are reported through the status, never here.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the session already ran to completion,
    /// or a database error if the local database is closed.
    pub fn start(&self) -> ReplicatorResult<()> {
        let shared = &self.shared;
        if shared.machine.lock().is_finished() {
            return Err(ReplicatorError::invalid_state(
                "replicator has stopped; create a new one",
            ));
        }

        // The channel goes live together with the running flag, so a stop
        // racing with the rest of startup is queued for the worker.
        let commands = {
            let mut control = shared.control.lock();
            if shared
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!(session = shared.id, "start ignored, already running");
                return Ok(());
            }
            let (tx, rx) = mpsc::channel();
            *control = Some(tx);
            rx
        };

        match self.launch(commands) {
            Ok(()) => Ok(()),
            Err(err) => {
                shared.control.lock().take();
                shared.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn launch(&self, commands: Receiver<Command>) -> ReplicatorResult<()> {
        let shared = &self.shared;
        if shared.machine.lock().is_finished() {
            return Err(ReplicatorError::invalid_state(
                "replicator has stopped; create a new one",
            ));
        }

        let guard = shared.db.register_replicator()?;
        *shared.checkpoint.lock() = checkpoint::load(&shared.db, &shared.checkpoint_key)?;
        let config = shared.config();

        let weak: Weak<dyn Reachability> = Arc::downgrade(shared) as Weak<dyn Reachability>;
        registry::register(shared.id, weak);

        info!(
            session = shared.id,
            endpoint = %shared.factory.endpoint(),
            replicator_type = ?config.replicator_type,
            continuous = config.continuous,
            "starting replicator"
        );
        shared.transition(Event::Start);

        let worker = Worker::new(Arc::clone(shared), commands, config, guard);
        let spawned = thread::Builder::new()
            .name(format!("docsync-session-{}", shared.id))
            .spawn(move || worker.run());
        if let Err(err) = spawned {
            warn!(session = shared.id, error = %err, "cannot spawn session worker");
            shared.transition(Event::Fatal(ReplicatorError::invalid_state(format!(
                "cannot spawn session worker: {err}"
            ))));
            shared.release();
        }
        Ok(())
    }

    /// Stops the session. Safe to call any number of times, from any
    /// thread, including listener callbacks.
    pub fn stop(&self) {
        debug!(session = self.shared.id, "stop requested");
        self.shared.send(Command::Stop);
    }

    /// Tells an offline session that the network may be reachable again.
    pub fn network_reachable(&self) {
        self.shared.network_reachable();
    }

    /// Registers a status listener run on the session's dispatcher thread.
    pub fn add_change_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        self.add_change_listener_with_executor(Arc::new(InlineExecutor), listener)
    }

    /// Registers a status listener run on `executor`.
    pub fn add_change_listener_with_executor<F>(
        &self,
        executor: Arc<dyn SerialExecutor>,
        listener: F,
    ) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        self.shared.status_listeners.add(executor, Arc::new(listener))
    }

    /// Registers a document listener run on the session's dispatcher
    /// thread.
    pub fn add_document_replication_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        self.add_document_replication_listener_with_executor(Arc::new(InlineExecutor), listener)
    }

    /// Registers a document listener run on `executor`.
    pub fn add_document_replication_listener_with_executor<F>(
        &self,
        executor: Arc<dyn SerialExecutor>,
        listener: F,
    ) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        self.shared.document_listeners.add(executor, Arc::new(listener))
    }

    /// Removes a listener. Returns false if the token was unknown.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.shared.status_listeners.remove(token) || self.shared.document_listeners.remove(token)
    }

    /// Returns the number of registered listeners of both kinds.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.status_listeners.len() + self.shared.document_listeners.len()
    }

    /// Returns ids of local documents not yet pushed, in id order.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for pull-only sessions, or a database error.
    pub fn pending_document_ids(&self) -> ReplicatorResult<Vec<DocumentId>> {
        let config = self.push_config()?;
        let checkpoint = self.current_checkpoint()?;
        let db = &self.shared.db;

        let mut cursor = checkpoint.push_cursor();
        let mut ids = Vec::new();
        loop {
            let docs = db.changes_since(cursor, PENDING_SCAN_BATCH)?;
            let Some(last) = docs.last() else { break };
            cursor = last.sequence;
            for stored in &docs {
                if should_push(&config, &checkpoint, stored)? {
                    ids.push(stored.revision.doc_id.clone());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Returns true if the local document `id` has not been pushed yet.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for pull-only sessions, or a database error.
    pub fn is_document_pending(&self, id: &str) -> ReplicatorResult<bool> {
        let config = self.push_config()?;
        let Ok(doc_id) = DocumentId::new(id) else {
            return Ok(false);
        };
        let Some(stored) = self.shared.db.get_stored(&doc_id)? else {
            return Ok(false);
        };
        let checkpoint = self.current_checkpoint()?;
        if stored.sequence <= checkpoint.push_cursor() {
            return Ok(false);
        }
        should_push(&config, &checkpoint, &stored)
    }

    /// Forgets replication progress so the next run starts from scratch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` once the session has been started.
    pub fn reset_checkpoint(&self) -> ReplicatorResult<()> {
        let machine = self.shared.machine.lock();
        if machine.has_started() {
            return Err(ReplicatorError::invalid_state(
                "checkpoint can only be reset before the replicator starts",
            ));
        }
        checkpoint::reset(&self.shared.db, &self.shared.checkpoint_key)?;
        *self.shared.checkpoint.lock() = Checkpoint::default();
        info!(session = self.shared.id, "checkpoint reset");
        Ok(())
    }

    fn push_config(&self) -> ReplicatorResult<ReplicatorConfig> {
        let config = self.shared.config();
        if !config.replicator_type.is_push() {
            return Err(ReplicatorError::unsupported(
                "pending documents are only tracked by push replicators",
            ));
        }
        Ok(config)
    }

    fn current_checkpoint(&self) -> ReplicatorResult<Checkpoint> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(self.shared.checkpoint.lock().clone());
        }
        checkpoint::load(&self.shared.db, &self.shared.checkpoint_key)
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("id", &self.shared.id)
            .field("activity", &self.status().activity)
            .finish_non_exhaustive()
    }
}
