use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DataplaneKind, LinkId, Mac, NodeId, OverlayId, TapName, TunnelId};

/// Lifecycle notification published by a tunnel manager on its event topic.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub kind: TunnelEventKind,
    pub overlay_id: OverlayId,
    pub peer_id: NodeId,
    pub tunnel_id: TunnelId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_id: Option<LinkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap_name: Option<TapName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<Mac>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_mac: Option<Mac>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataplane: Option<DataplaneKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelEventKind {
    Authorized,
    AuthExpired,
    Connected,
    Disconnected,
    Removed,
}

impl TunnelEvent {
    pub fn new(
        kind: TunnelEventKind,
        overlay_id: OverlayId,
        peer_id: NodeId,
        tunnel_id: TunnelId,
    ) -> Self {
        Self {
            kind,
            overlay_id,
            peer_id,
            tunnel_id,
            link_id: None,
            tap_name: None,
            mac: None,
            peer_mac: None,
            dataplane: None,
            connected_at: None,
        }
    }

    pub fn with_link(mut self, link_id: LinkId) -> Self {
        self.link_id = Some(link_id);
        self
    }

    pub fn with_tap(mut self, tap_name: Option<TapName>) -> Self {
        self.tap_name = tap_name;
        self
    }

    /// The full payload of a `Connected` notification.
    pub fn connected(
        overlay_id: OverlayId,
        peer_id: NodeId,
        tunnel_id: TunnelId,
        tap_name: Option<TapName>,
        mac: Option<Mac>,
        peer_mac: Option<Mac>,
        dataplane: DataplaneKind,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: TunnelEventKind::Connected,
            overlay_id,
            peer_id,
            tunnel_id,
            link_id: None,
            tap_name,
            mac,
            peer_mac,
            dataplane: Some(dataplane),
            connected_at: Some(connected_at),
        }
    }
}
