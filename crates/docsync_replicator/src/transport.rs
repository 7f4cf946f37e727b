//! Transport abstraction.
//!
//! A transport moves opaque frames between two peers. Framing, masking
//! and encryption are its own business; the session only sees whole
//! frames plus out-of-band close signals.

use crate::error::{ReplicatorError, ReplicatorResult};
use docsync_protocol::SyncMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Close code for an orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent by a peer that is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code for a protocol violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// One open connection.
///
/// A transport is owned by a single session thread at a time.
pub trait Transport: Send {
    /// Sends one frame.
    fn send(&mut self, frame: Vec<u8>) -> ReplicatorResult<()>;

    /// Waits up to `timeout` for a frame. Returns `None` on timeout or
    /// after the peer requested a close.
    fn receive(&mut self, timeout: Duration) -> ReplicatorResult<Option<Vec<u8>>>;

    /// Asks the peer to close the connection with `code`.
    fn request_close(&mut self, code: u16);

    /// Returns the code of a close requested by the peer, if any.
    fn close_requested(&self) -> Option<u16>;

    /// Releases the connection. Calling it again has no effect.
    fn close(&mut self);
}

/// Opens connections to one remote endpoint.
pub trait TransportFactory: Send + Sync {
    /// Stable name of the endpoint, used to key checkpoints.
    fn endpoint(&self) -> String;

    /// Opens a connection, waiting at most `timeout`.
    fn open(&self, timeout: Duration) -> ReplicatorResult<Box<dyn Transport>>;
}

/// Encodes and sends one message.
pub(crate) fn send_message(transport: &mut dyn Transport, message: &SyncMessage) -> ReplicatorResult<()> {
    transport.send(message.encode()?)
}

/// Waits for one message.
pub(crate) fn receive_message(
    transport: &mut dyn Transport,
    timeout: Duration,
) -> ReplicatorResult<Option<SyncMessage>> {
    match transport.receive(timeout)? {
        Some(frame) => Ok(Some(SyncMessage::decode(&frame)?)),
        None => Ok(None),
    }
}

/// A transport factory that injects connection failures.
///
/// Queued failures are returned first, one per `open`; then the standing
/// failure, if set; then connections from the wrapped factory. Without a
/// wrapped factory every open fails with `HostUnreachable`.
#[derive(Default)]
pub struct MockTransportFactory {
    inner: Option<Arc<dyn TransportFactory>>,
    queued: Mutex<VecDeque<ReplicatorError>>,
    standing: Mutex<Option<ReplicatorError>>,
    opens: AtomicUsize,
}

impl MockTransportFactory {
    /// Creates a factory for an endpoint that can never be reached.
    #[must_use]
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Creates a factory that delegates to `inner`.
    #[must_use]
    pub fn wrapping(inner: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Some(inner),
            ..Self::default()
        }
    }

    /// Queues a failure for the next `open`.
    pub fn fail_next(&self, error: ReplicatorError) {
        self.queued.lock().push_back(error);
    }

    /// Sets or clears a failure returned by every `open`.
    pub fn set_failure(&self, error: Option<ReplicatorError>) {
        *self.standing.lock() = error;
    }

    /// Returns the number of `open` calls so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn endpoint(&self) -> String {
        self.inner
            .as_ref()
            .map_or_else(|| "mock://unreachable".to_string(), |f| f.endpoint())
    }

    fn open(&self, timeout: Duration) -> ReplicatorResult<Box<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.queued.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.standing.lock().clone() {
            return Err(err);
        }
        match &self.inner {
            Some(inner) => inner.open(timeout),
            None => Err(ReplicatorError::HostUnreachable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_mock_fails_every_open() {
        let factory = MockTransportFactory::unreachable();
        for _ in 0..3 {
            assert!(matches!(
                factory.open(Duration::from_millis(1)),
                Err(ReplicatorError::HostUnreachable)
            ));
        }
        assert_eq!(factory.open_count(), 3);
    }

    #[test]
    fn queued_failures_come_first() {
        let factory = MockTransportFactory::unreachable();
        factory.set_failure(Some(ReplicatorError::NetworkDown));
        factory.fail_next(ReplicatorError::Timeout);

        assert!(matches!(
            factory.open(Duration::ZERO),
            Err(ReplicatorError::Timeout)
        ));
        assert!(matches!(
            factory.open(Duration::ZERO),
            Err(ReplicatorError::NetworkDown)
        ));
        factory.set_failure(None);
        assert!(matches!(
            factory.open(Duration::ZERO),
            Err(ReplicatorError::HostUnreachable)
        ));
    }
}
