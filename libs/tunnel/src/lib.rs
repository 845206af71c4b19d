//! The tunnel managers: pairwise encrypted data-plane channels between
//! overlay peers.
//!
//! Two flavours share the record types in this module. The kernel flavour
//! ([`kernel::KernelTunnels`]) swaps endpoint metadata once and binds a
//! kernel interface to a fixed remote address. The NAT-traversing flavour
//! ([`nat::LinkTunnels`]) walks a multi-phase ICE-style exchange driven by
//! the external data-plane engine.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod dataplane;
pub mod kernel;
pub mod nat;

use weft_model::{
    DataplaneKind, LinkId, Mac, NodeId, OverlayId, TapName, TunnelId, TunnelState,
};

/// The link creation handshake has completed.
pub const LINK_COMPLETE: u8 = 0xC0;

/// One pairwise tunnel, keyed by [`TunnelId`] in its manager's map.
///
/// A record exists only while its state is Authorized, Creating, Querying or
/// Online; reaching Offline removes it in the same handler.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub tunnel_id: TunnelId,
    pub overlay_id: OverlayId,
    pub peer_id: NodeId,
    pub tap_name: Option<TapName>,
    pub mac: Option<Mac>,
    pub peer_mac: Option<Mac>,
    pub fingerprint: Option<String>,
    pub dataplane: DataplaneKind,
    pub state: TunnelState,
    /// The data-plane session this tunnel was created under.
    pub session_epoch: u64,
    pub link: Option<Link>,
}

impl Tunnel {
    pub fn new(
        tunnel_id: TunnelId,
        overlay_id: OverlayId,
        peer_id: NodeId,
        state: TunnelState,
        dataplane: DataplaneKind,
        session_epoch: u64,
    ) -> Self {
        Self {
            tunnel_id,
            overlay_id,
            peer_id,
            tap_name: None,
            mac: None,
            peer_mac: None,
            fingerprint: None,
            dataplane,
            state,
            session_epoch,
            link: None,
        }
    }
}

/// The NAT-traversing channel owned by a tunnel.
#[derive(Debug, Clone)]
pub struct Link {
    pub link_id: LinkId,
    /// Handshake progress marker; the quadrant encodes initiator vs.
    /// responder, the low digit the step. [`LINK_COMPLETE`] is terminal.
    pub creation_state: u8,
    pub status_retry: u32,
    pub stats: serde_json::Value,
}

impl Link {
    pub fn new(link_id: LinkId, creation_state: u8) -> Self {
        Self {
            link_id,
            creation_state,
            status_retry: 0,
            stats: serde_json::Value::Null,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.creation_state == LINK_COMPLETE
    }
}
