//! The RPC contract with the external data-plane engines.
//!
//! Both engines are collaborators on the bus: the managers send them typed
//! requests and receive typed replies; the NAT engine additionally delivers
//! unsolicited notifications (link state changes, session resets).

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use weft_model::{LinkId, Mac, NodeId, OverlayId, TapName, TunnelId, TurnServer};

/// A node's connection parameters as exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(rename = "UID")]
    pub uid: NodeId,
    #[serde(rename = "MAC", default)]
    pub mac: Option<Mac>,
    #[serde(rename = "FPR", default)]
    pub fpr: Option<String>,
    /// ICE-style connectivity address set.
    #[serde(rename = "CAS", default)]
    pub cas: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateTunnelParams {
    pub overlay_id: OverlayId,
    pub node_id: NodeId,
    pub tunnel_id: TunnelId,
    pub link_id: LinkId,
    pub stun_servers: Vec<String>,
    pub tap_name: TapName,
    pub ignored_net_interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_servers: Option<Vec<TurnServer>>,
    pub session_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateLinkParams {
    pub overlay_id: OverlayId,
    pub tunnel_id: TunnelId,
    pub link_id: LinkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stun_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_name: Option<TapName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored_net_interfaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_servers: Option<Vec<TurnServer>>,
    pub node_data: NodeData,
    pub session_id: u64,
}

/// Reply to both `dp_create_tunnel` and `dp_create_link`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointDescriptor {
    #[serde(rename = "MAC")]
    pub mac: Mac,
    #[serde(rename = "FPR")]
    pub fpr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_name: Option<TapName>,
    #[serde(rename = "CAS", default, skip_serializing_if = "Option::is_none")]
    pub cas: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoveTunnelParams {
    pub overlay_id: OverlayId,
    pub tunnel_id: TunnelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_id: Option<LinkId>,
    pub peer_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_name: Option<TapName>,
    pub session_id: u64,
}

/// `dp_query_link_stats` carries the tunnel ids to query; the reply is a
/// [`LinkStatsReport`].
pub type QueryLinkStatsParams = Vec<TunnelId>;

pub type LinkStatsReport = HashMap<TunnelId, HashMap<LinkId, LinkStatsEntry>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinkStatsEntry {
    pub status: LinkStatus,
    #[serde(default)]
    pub stats: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
    /// The engine has no record of the link; drop it locally.
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

/// Unsolicited notification from the NAT data-plane engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataplaneNotify {
    pub command: NotifyCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<TunnelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_id: Option<LinkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<LinkState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyCommand {
    LinkStateChange,
    /// The engine came up and advertises its session id.
    Ready,
    /// The engine restarted; all tunnel state is void.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    #[serde(rename = "LINK_STATE_UP")]
    Up,
    #[serde(rename = "LINK_STATE_DOWN")]
    Down,
}

/// Kernel engine: create the interface bound to a remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateTapParams {
    pub overlay_id: OverlayId,
    pub tunnel_id: TunnelId,
    pub tap_name: TapName,
    #[serde(rename = "VNId")]
    pub vnid: u64,
    pub remote_address: IpAddr,
}

/// Reply to `dp_create_tap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TapDescriptor {
    #[serde(rename = "MAC")]
    pub mac: Mac,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoveTapParams {
    pub tap_name: TapName,
}

/// A failing engine reply may advertise the session id it is actually
/// running under; the manager adopts it.
pub fn current_session_id(data: &serde_json::Value) -> Option<u64> {
    data.get("CurrentId")?.as_u64()
}
