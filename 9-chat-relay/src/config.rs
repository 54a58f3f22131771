//! Runtime knobs for the relay core.
//!
//! [`RelayConfig`] is built once from the `serve` arguments (each of which
//! also reads a `CHAT_RELAY_*` environment variable) and copied into the
//! broadcaster and every session.

use std::time::Duration;

use anyhow::{Result, ensure};
use clap::ValueEnum;

use crate::cli::ServeArgs;

/// What the broadcaster does when a session's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Remove the session as if it had left.
    Disconnect,
    /// Skip the message for that session only.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Per-session outbound queue capacity.
    pub outbound_capacity: usize,
    /// Capacity of the broadcaster's single event intake.
    pub intake_capacity: usize,
    pub overflow: OverflowPolicy,
    /// `None` keeps idle sessions open until their stream ends.
    pub idle_timeout: Option<Duration>,
    /// Whether a chat line is also delivered back to its sender.
    pub echo_to_sender: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            intake_capacity: 1024,
            overflow: OverflowPolicy::Disconnect,
            idle_timeout: None,
            echo_to_sender: true,
        }
    }
}

impl RelayConfig {
    pub fn from_args(args: &ServeArgs) -> Result<Self> {
        ensure!(args.queue_capacity > 0, "queue capacity must be at least 1");
        ensure!(args.intake_capacity > 0, "intake capacity must be at least 1");
        if let Some(secs) = args.idle_timeout_secs {
            ensure!(secs > 0, "idle timeout must be at least one second");
        }

        Ok(Self {
            outbound_capacity: args.queue_capacity,
            intake_capacity: args.intake_capacity,
            overflow: args.on_overflow,
            idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
            echo_to_sender: !args.no_echo,
        })
    }
}
