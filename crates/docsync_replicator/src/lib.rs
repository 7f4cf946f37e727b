//! # docsync Replicator
//!
//! Active replication sessions for docsync databases.
//!
//! This crate provides:
//! - The session activity state machine (stopped → connecting → idle/busy,
//!   offline while waiting to reconnect)
//! - Retry with exponential backoff and error classification
//! - Push and pull of revisions, with filters and document id restrictions
//! - Per-document replication outcomes, delivered in batches
//! - Checkpoints, so an interrupted session resumes where it stopped
//! - A transport abstraction, an in-process loopback transport and a
//!   passive peer that serves a database over it
//!
//! ## Lifecycle
//!
//! A [`Replicator`] starts in `Stopped`. `start` moves it to `Connecting`;
//! a successful handshake to `Busy` or `Idle`. Transient failures send it
//! `Offline` until a backoff expires or [`notify_network_reachable`] is
//! called. A one-shot session stops once its work is done; a continuous
//! one runs until `stop` or a fatal error.
//!
//! ## Key Invariants
//!
//! - Status listeners see every change in order, ending with one `Stopped`
//! - Pulled revisions never override unsynced local edits
//! - The local database cannot be closed while a session runs

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod error;
mod listener;
mod loopback;
mod passive;
mod registry;
mod retry;
mod session;
mod state;
mod tracker;
mod transport;
mod worker;

pub use checkpoint::{checkpoint_key, Checkpoint};
pub use config::{
    Authenticator, DocumentFlags, DocumentView, ReplicationFilter, ReplicatorConfig,
    ReplicatorType,
};
pub use error::{ReplicatorError, ReplicatorResult};
pub use listener::{InlineExecutor, ListenerToken, SerialExecutor, Task, ThreadExecutor};
pub use loopback::{loopback_pair, LoopbackTransport};
pub use passive::{PassivePeer, PeerConfig};
pub use registry::{active_sessions, notify_network_reachable};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use session::Replicator;
pub use state::{ActivityLevel, Event, Progress, ReplicatorStatus, StateMachine};
pub use tracker::{DocumentReplication, DocumentReplicationTracker, ReplicatedDocument};
pub use transport::{
    MockTransportFactory, Transport, TransportFactory, CLOSE_GOING_AWAY, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR,
};
