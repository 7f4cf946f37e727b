//! In-process transport backed by channels.

use crate::error::{ReplicatorError, ReplicatorResult};
use crate::transport::Transport;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

enum Packet {
    Frame(Vec<u8>),
    Close(u16),
}

/// One end of an in-process connection.
pub struct LoopbackTransport {
    tx: Option<Sender<Packet>>,
    rx: Receiver<Packet>,
    remote_close: Option<u16>,
}

/// Creates two connected transports.
#[must_use]
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        LoopbackTransport {
            tx: Some(a_tx),
            rx: a_rx,
            remote_close: None,
        },
        LoopbackTransport {
            tx: Some(b_tx),
            rx: b_rx,
            remote_close: None,
        },
    )
}

impl Transport for LoopbackTransport {
    fn send(&mut self, frame: Vec<u8>) -> ReplicatorResult<()> {
        let tx = self.tx.as_ref().ok_or(ReplicatorError::ConnectionReset)?;
        tx.send(Packet::Frame(frame))
            .map_err(|_| ReplicatorError::ConnectionReset)
    }

    fn receive(&mut self, timeout: Duration) -> ReplicatorResult<Option<Vec<u8>>> {
        if self.remote_close.is_some() {
            return Ok(None);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(Packet::Frame(frame)) => Ok(Some(frame)),
            Ok(Packet::Close(code)) => {
                self.remote_close = Some(code);
                Ok(None)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ReplicatorError::ConnectionReset),
        }
    }

    fn request_close(&mut self, code: u16) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Packet::Close(code));
        }
    }

    fn close_requested(&self) -> Option<u16> {
        self.remote_close
    }

    fn close(&mut self) {
        self.tx = None;
    }
}
