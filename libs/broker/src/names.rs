//! Module and action names shared across the bus.
//!
//! Dispatch is by action name but typed at registration: each module installs
//! handlers for these constants, and unknown actions are failed rather than
//! ignored.

/// The signalling controller module.
pub const SIGNALLING: &str = "signalling";
/// The kernel (Geneve) tunnel manager.
pub const GENEVE_TUNNEL: &str = "geneve-tunnel";
/// The NAT-traversing tunnel manager.
pub const LINK_TUNNEL: &str = "link-tunnel";
/// The kernel data-plane collaborator.
pub const GENEVE_DATAPLANE: &str = "geneve-dataplane";
/// The ICE data-plane collaborator.
pub const ICE_DATAPLANE: &str = "ice-dataplane";

/// Carry a remote action to its recipient node (request to [`SIGNALLING`]).
pub const REMOTE_ACTION: &str = "remote_action";
/// Internal: a peer's transport address was learned or refreshed.
pub const PEER_ADDRESS_UPDATED: &str = "peer_address_updated";
/// Snapshot of the signalling plane for reporting surfaces.
pub const QUERY_REPORTING_DATA: &str = "query_reporting_data";

/// Authorise an inbound tunnel (role B).
pub const AUTH_TUNNEL: &str = "auth_tunnel";
/// Start an outbound tunnel handshake (role A).
pub const CREATE_TUNNEL: &str = "create_tunnel";
/// Tear a tunnel down.
pub const REMOVE_TUNNEL: &str = "remove_tunnel";
/// Cancel a failed handshake on the responder.
pub const ABORT_TUNNEL: &str = "abort_tunnel";
/// Kernel flavour: swap endpoint metadata (role B handler).
pub const EXCHANGE_ENDPOINT: &str = "exchange_endpoint";
/// Kernel flavour: deliver the initiator's MAC, completing the handshake.
pub const UPDATE_PEER_MAC: &str = "update_peer_mac";
/// NAT flavour: ask the responder to create its link endpoint.
pub const REQUEST_LINK_ENDPOINT: &str = "request_link_endpoint";
/// NAT flavour: deliver the initiator's connectivity address set.
pub const ADD_PEER_CAS: &str = "add_peer_cas";
/// Snapshot of all online tunnels.
pub const QUERY_TUNNEL_INFO: &str = "query_tunnel_info";
/// Per-overlay endpoint view for the visualiser.
pub const QUERY_TOPOLOGY_VIEW: &str = "query_topology_view";
/// Merge additional ignored interface names at runtime.
pub const ADD_IGNORED_INTERFACES: &str = "add_ignored_interfaces";

/// Data-plane requests.
pub const DP_CREATE_TUNNEL: &str = "dp_create_tunnel";
pub const DP_CREATE_LINK: &str = "dp_create_link";
pub const DP_QUERY_LINK_STATS: &str = "dp_query_link_stats";
pub const DP_REMOVE_TUNNEL: &str = "dp_remove_tunnel";
pub const DP_CREATE_TAP: &str = "dp_create_tap";
pub const DP_REMOVE_TAP: &str = "dp_remove_tap";
/// Unsolicited data-plane notification (link state, ready, reset).
pub const DP_NOTIFY: &str = "dp_notify";
