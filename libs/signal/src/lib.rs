//! The signalling plane: presence, address resolution and the remote-action
//! ferry between nodes.
//!
//! One [`PresenceChannel`] per overlay maintains a session with the
//! presence/message service; the [`Signal`] controller module owns the
//! per-peer outgoing queues and translates remote actions to and from local
//! bus operations.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cache;
mod channel;
mod controller;
pub mod memory;
mod session;
mod transport;
mod wire;

pub use cache::JidCache;
pub use channel::{Error, Event, PresenceChannel};
pub use controller::{spawn_maintenance, PresenceUpdate, Signal, SignalConfig};
pub use session::{SessionAuth, SessionConfig};
pub use transport::{
    resolve_host, spawn_overlay_transport, PresenceTransport, SessionFactory, TransportContext,
    TransportFactory,
};
pub use wire::{AnnouncePayload, DirectedMessage, MessageKind, PeerAddress, Presence, PresenceStatus, WireMessage};
