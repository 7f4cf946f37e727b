//! Replicator activity state machine.
//!
//! ```text
//!            start
//! Stopped ─────────▶ Connecting ──connected──▶ Idle ⇄ Busy
//!    ▲                  ▲   │                    │      │
//!    │                  │   └──────failure───────┴──────┴──▶ Offline
//!    │                  └──────────retry / reachable─────────────┘
//!    └──────── stop / fatal / one-shot done (from any state) ────────
//! ```
//!
//! The machine is pure: it does no I/O and never blocks. The session
//! worker feeds it events and publishes the resulting snapshots.

use crate::error::ReplicatorError;

/// High-level state of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityLevel {
    /// Not running. Both the initial and the terminal state.
    Stopped,
    /// Disconnected after a recoverable failure, waiting to reconnect.
    Offline,
    /// Opening the transport and handshaking.
    Connecting,
    /// Connected with no outstanding work.
    Idle,
    /// Connected and transferring revisions.
    Busy,
}

impl ActivityLevel {
    /// Returns true while a transport is connected.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

/// Transfer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Revisions processed.
    pub completed: u64,
    /// Revisions known to need processing.
    pub total: u64,
    /// Documents reported to document listeners.
    pub document_count: u64,
}

/// Snapshot of a replicator's state.
#[derive(Debug, Clone)]
pub struct ReplicatorStatus {
    /// Activity level.
    pub activity: ActivityLevel,
    /// Progress so far.
    pub progress: Progress,
    /// Error behind the last `Offline` or `Stopped` transition.
    pub error: Option<ReplicatorError>,
}

impl ReplicatorStatus {
    fn stopped() -> Self {
        Self {
            activity: ActivityLevel::Stopped,
            progress: Progress::default(),
            error: None,
        }
    }
}

/// Input to the state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// The application started the session.
    Start,
    /// The handshake completed.
    Connected {
        /// Work is outstanding.
        busy: bool,
    },
    /// Outstanding work appeared or drained.
    Activity {
        /// Work is outstanding.
        busy: bool,
    },
    /// A recoverable failure; the session waits to reconnect.
    Offline(ReplicatorError),
    /// Backoff expired or the network became reachable.
    Reconnect,
    /// A one-shot session finished its work.
    Completed,
    /// An unrecoverable failure.
    Fatal(ReplicatorError),
    /// The application stopped the session.
    Stop,
}

/// The activity state machine of one session.
#[derive(Debug, Clone)]
pub struct StateMachine {
    status: ReplicatorStatus,
    started: bool,
}

impl StateMachine {
    /// Creates a machine in `Stopped` that has never run.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: ReplicatorStatus::stopped(),
            started: false,
        }
    }

    /// Returns the current level.
    #[must_use]
    pub fn activity(&self) -> ActivityLevel {
        self.status.activity
    }

    /// Returns a snapshot of the current status.
    #[must_use]
    pub fn status(&self) -> ReplicatorStatus {
        self.status.clone()
    }

    /// Returns true once the session has been started.
    #[must_use]
    pub fn has_started(&self) -> bool {
        self.started
    }

    /// Returns true once a started session has stopped. No further
    /// transitions are possible.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.started && self.status.activity == ActivityLevel::Stopped
    }

    /// Applies `event`. Returns the new status if the level changed;
    /// events that are not legal in the current state are ignored.
    pub fn apply(&mut self, event: Event) -> Option<ReplicatorStatus> {
        use ActivityLevel::{Busy, Connecting, Idle, Offline, Stopped};

        let current = self.status.activity;
        let next = match (current, event) {
            (Stopped, Event::Start) if !self.started => {
                self.started = true;
                self.status.error = None;
                Connecting
            }
            (Connecting, Event::Connected { busy }) => {
                self.status.error = None;
                if busy {
                    Busy
                } else {
                    Idle
                }
            }
            (Idle, Event::Activity { busy: true }) => Busy,
            (Busy, Event::Activity { busy: false }) => Idle,
            (Connecting | Idle | Busy, Event::Offline(err)) => {
                self.status.error = Some(err);
                Offline
            }
            (Offline, Event::Reconnect) => Connecting,
            (Idle | Busy, Event::Completed) => Stopped,
            (Connecting | Idle | Busy | Offline, Event::Fatal(err)) => {
                self.status.error = Some(err);
                Stopped
            }
            (Connecting | Idle | Busy | Offline, Event::Stop) => Stopped,
            _ => return None,
        };

        self.status.activity = next;
        Some(self.status())
    }

    /// Adds to the progress counters and returns the new snapshot.
    pub fn advance(&mut self, completed: u64, total: u64, documents: u64) -> ReplicatorStatus {
        let progress = &mut self.status.progress;
        progress.total += total;
        progress.completed = (progress.completed + completed).min(progress.total);
        progress.document_count += documents;
        self.status()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
