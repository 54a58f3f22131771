//! The broadcaster: single owner of the session registry.
//!
//! Every session talks to the broadcaster through a [`BroadcasterHandle`],
//! which pushes [`Event`]s into one bounded intake channel. The broadcaster
//! pulls one event at a time and handles it to completion, so registry
//! reads and writes are never concurrent and the order in which events
//! arrive at the intake is the order every client observes.
//!
//! Fan-out never waits on a client. A recipient whose queue is full or
//! closed is dealt with after the current event (see [`OverflowPolicy`])
//! and before the next one is pulled.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::{OverflowPolicy, RelayConfig},
    message::BroadcastMessage,
    outbound::{DeliveryError, Outbound},
    registry::{DeliveryFailure, Registry},
    session::SessionId,
};

/// Everything the broadcaster can be asked to do.
#[derive(Debug)]
pub enum Event {
    /// Register a session and announce it to everyone else.
    Join { id: SessionId, outbound: Outbound },
    /// Remove a session, close its queue and announce the departure.
    /// A no-op for sessions that are not registered.
    Leave { id: SessionId },
    /// Fan a chat line out to the registered sessions.
    Broadcast {
        from: SessionId,
        message: BroadcastMessage,
    },
    /// Close every queue and stop.
    Shutdown,
}

/// Creates a broadcaster and the handle used to reach it.
///
/// The broadcaster does nothing until [`Broadcaster::run`] is polled.
pub fn channel(config: &RelayConfig) -> (Broadcaster, BroadcasterHandle) {
    let (intake_tx, intake_rx) = mpsc::channel(config.intake_capacity);
    let broadcaster = Broadcaster {
        intake: intake_rx,
        registry: Registry::new(),
        overflow: config.overflow,
        echo_to_sender: config.echo_to_sender,
    };
    (broadcaster, BroadcasterHandle { intake: intake_tx })
}

/// Cloneable sender side of the broadcaster's intake.
///
/// Each method waits while the intake is full and fails only once the
/// broadcaster has stopped.
#[derive(Debug, Clone)]
pub struct BroadcasterHandle {
    intake: mpsc::Sender<Event>,
}

impl BroadcasterHandle {
    pub async fn join(&self, id: SessionId, outbound: Outbound) -> Result<()> {
        self.send(Event::Join { id, outbound })
            .await
            .context("failed to send join")
    }

    pub async fn leave(&self, id: SessionId) -> Result<()> {
        self.send(Event::Leave { id })
            .await
            .context("failed to send leave")
    }

    pub async fn broadcast(&self, from: SessionId, message: BroadcastMessage) -> Result<()> {
        self.send(Event::Broadcast { from, message })
            .await
            .context("failed to send broadcast")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Event::Shutdown)
            .await
            .context("failed to send shutdown")
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.intake
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("broadcaster has stopped"))
    }
}

pub struct Broadcaster {
    intake: mpsc::Receiver<Event>,
    registry: Registry,
    overflow: OverflowPolicy,
    echo_to_sender: bool,
}

impl Broadcaster {
    /// Processes events until a shutdown arrives or every handle is dropped.
    ///
    /// All sessions still registered when the loop ends have their queues
    /// closed, which lets their writers drain and exit.
    pub async fn run(mut self) {
        while let Some(event) = self.intake.recv().await {
            if !self.handle(event) {
                break;
            }
        }

        info!(sessions = self.registry.len(), "broadcaster stopped");
        self.registry.clear();
    }

    /// Handles one event to completion. Returns `false` to stop the loop.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Join { id, outbound } => self.on_join(id, outbound),
            Event::Leave { id } => self.on_leave(&id),
            Event::Broadcast { from, message } => self.on_broadcast(&from, &message),
            Event::Shutdown => {
                info!("broadcaster shutting down");
                return false;
            }
        }
        true
    }

    fn on_join(&mut self, id: SessionId, outbound: Outbound) {
        if let Err(rejected) = self.registry.insert(id.clone(), outbound) {
            warn!(session = %id, "session already registered, rejecting duplicate join");
            rejected.close();
            return;
        }
        info!(session = %id, sessions = self.registry.len(), "session joined");

        let failures = self
            .registry
            .fan_out(&BroadcastMessage::joined(&id), Some(&id));
        self.settle(failures);
    }

    fn on_leave(&mut self, id: &SessionId) {
        if !self.registry.contains(id) {
            debug!(session = %id, "leave for unregistered session ignored");
            return;
        }
        let failures = self.remove(id);
        self.settle(failures);
    }

    fn on_broadcast(&mut self, from: &SessionId, message: &BroadcastMessage) {
        if !self.registry.contains(from) {
            debug!(session = %from, "dropping line from departed session");
            return;
        }

        let exclude = (!self.echo_to_sender).then_some(from);
        let failures = self.registry.fan_out(message, exclude);
        self.settle(failures);
    }

    /// Removes `id`, closes its queue and tells everyone left.
    ///
    /// Returns the recipients that could not take the announcement.
    fn remove(&mut self, id: &SessionId) -> Vec<DeliveryFailure> {
        let Some(outbound) = self.registry.remove(id) else {
            return Vec::new();
        };
        outbound.close();
        info!(session = %id, sessions = self.registry.len(), "session left");

        self.registry.fan_out(&BroadcastMessage::left(id), None)
    }

    /// Applies the overflow policy to failed recipients, removing sessions
    /// until no removal produces further failures.
    fn settle(&mut self, failures: Vec<DeliveryFailure>) {
        let mut doomed = VecDeque::new();
        self.triage(failures, &mut doomed);

        while let Some(id) = doomed.pop_front() {
            let failures = self.remove(&id);
            self.triage(failures, &mut doomed);
        }
    }

    fn triage(&self, failures: Vec<DeliveryFailure>, doomed: &mut VecDeque<SessionId>) {
        for DeliveryFailure { id, error } in failures {
            match (error, self.overflow) {
                (DeliveryError::Full, OverflowPolicy::Drop) => {
                    warn!(session = %id, "outbound queue full, message dropped");
                }
                (DeliveryError::Full, OverflowPolicy::Disconnect) => {
                    warn!(session = %id, "outbound queue full, disconnecting slow client");
                    doomed.push_back(id);
                }
                (DeliveryError::Closed, _) => {
                    debug!(session = %id, "outbound queue closed, removing session");
                    doomed.push_back(id);
                }
            }
        }
    }
}
