//! Per-session outbound queue.
//!
//! The queue is split into two narrow capabilities over one bounded
//! `mpsc` channel: [`Outbound`] can only enqueue or close, [`Inbox`] can
//! only drain. The broadcaster owns the `Outbound`; the session's writer
//! task owns the `Inbox`. `Outbound` is not `Clone`, so dropping (or
//! [`Outbound::close`]-ing) the one handle is what closes the queue.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::message::BroadcastMessage;

/// Why a message could not be queued for a session.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

/// Creates a session queue holding at most `capacity` undelivered messages.
///
/// # Panics
///
/// Panics if `capacity` is zero. [`crate::config::RelayConfig::from_args`]
/// rejects a zero capacity before it gets here.
pub fn outbound_channel(capacity: usize) -> (Outbound, Inbox) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbound { tx }, Inbox { rx })
}

/// Send side of a session queue.
#[derive(Debug)]
pub struct Outbound {
    tx: mpsc::Sender<BroadcastMessage>,
}

impl Outbound {
    /// Queues `message` without waiting.
    pub fn deliver(&self, message: BroadcastMessage) -> Result<(), DeliveryError> {
        self.tx.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Closes the queue. The inbox still yields everything already queued.
    pub fn close(self) {}
}

/// Drain side of a session queue.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<BroadcastMessage>,
}

impl Inbox {
    /// Waits for the next message; `None` once the queue is closed and drained.
    pub async fn next(&mut self) -> Option<BroadcastMessage> {
        self.rx.recv().await
    }

    /// Takes a queued message if one is ready.
    pub fn try_next(&mut self) -> Option<BroadcastMessage> {
        self.rx.try_recv().ok()
    }
}
