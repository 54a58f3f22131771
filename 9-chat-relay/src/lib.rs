//! Line-oriented chat relay over TCP.
//!
//! Every line a client sends is relayed to every connected client, and
//! clients are told when someone joins or leaves. Each module focuses on a
//! concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for serve and connect modes.
//! - [`config`] turns the serve arguments into a validated [`config::RelayConfig`].
//! - [`message`] defines the relayed line and its wire formats.
//! - [`outbound`] provides the bounded per-client queue, split into a send
//!   capability and a drain capability.
//! - [`session`] runs one connection: greeting, join, reader, writer, leave.
//! - [`registry`] maps active sessions to their queues and fans messages out.
//! - [`broadcaster`] owns the registry and serializes joins, leaves and
//!   chat lines through a single event loop, so no locks are needed.
//! - [`relay`] accepts TCP connections and hands them to the core.
//! - [`client`] is a netcat-style terminal client.
//!
//! Unit tests live next to the code; `tests/` drives the relay over real
//! sockets and the built binary end to end.

pub mod broadcaster;
pub mod cli;
pub mod client;
pub mod config;
pub mod message;
pub mod outbound;
pub mod registry;
pub mod relay;
pub mod session;
