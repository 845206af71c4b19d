//! The NAT-traversing tunnel manager.
//!
//! Tunnels here own a link negotiated through the external ICE data-plane
//! engine: nine phases of endpoint and connectivity-address exchange,
//! tracked per link in its `creation_state` marker. The engine also feeds
//! back link state changes and statistics, which drive the online/offline
//! ladder after setup.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use weft_broker::{
    names, Cbt, ControllerModule, HandlerTable, ModuleHandle, Publisher, RemoteAction,
    TimedTransactions, DEFAULT_PRIORITY,
};
use weft_model::{
    DataplaneKind, LinkId, NodeId, OverlayId, TapName, TunnelEvent, TunnelEventKind, TunnelId,
    TunnelState, TurnServer,
};

use crate::dataplane::{
    current_session_id, CreateLinkParams, CreateTunnelParams, DataplaneNotify, EndpointDescriptor,
    LinkState, LinkStatsReport, LinkStatus, NotifyCommand, QueryLinkStatsParams,
    RemoveTunnelParams,
};
use crate::dataplane::NodeData;
use crate::{Link, Tunnel, LINK_COMPLETE};

/// Internal: periodic link statistics poll, posted by [`spawn_stats_poller`].
const POLL_LINK_STATS: &str = "poll_link_stats";

#[derive(Debug, Clone, Default)]
pub struct LinkOverlayConfig {
    pub tap_name_prefix: Option<String>,
    pub ignored_net_interfaces: Vec<String>,
    pub allow_recursive_tunneling: bool,
    pub stun: Vec<String>,
    pub turn: Vec<TurnServer>,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub node_id: NodeId,
    pub setup_timeout: Duration,
    /// Interfaces no data plane may bind, across all overlays.
    pub global_ignored_interfaces: Vec<String>,
    pub overlays: HashMap<OverlayId, LinkOverlayConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthParams {
    overlay_id: OverlayId,
    peer_id: NodeId,
    tunnel_id: TunnelId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateParams {
    overlay_id: OverlayId,
    peer_id: NodeId,
    tunnel_id: TunnelId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoveParams {
    overlay_id: OverlayId,
    peer_id: NodeId,
    tunnel_id: TunnelId,
}

/// Initiator → responder: create your side of the link.
/// Also the responder's reply, with its own node data filled in.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LinkEndptParams {
    overlay_id: OverlayId,
    tunnel_id: TunnelId,
    link_id: LinkId,
    node_data: NodeData,
}

/// Minimal view of any handshake payload: just the tunnel it concerns.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TunnelRef {
    tunnel_id: TunnelId,
}

struct Maps {
    tunnels: HashMap<TunnelId, Tunnel>,
    /// Secondary index; the inverse is recoverable from the tunnel record.
    links: HashMap<LinkId, TunnelId>,
    /// The data-plane session epoch; a newer id voids all records.
    session_id: u64,
}

type SharedMaps = Arc<Mutex<Maps>>;

pub struct LinkTunnels {
    handle: ModuleHandle,
    cfg: LinkConfig,
    timed: Arc<TimedTransactions>,
    events: Publisher<TunnelEvent>,
    maps: SharedMaps,
    /// Runtime additions to the configured ignore lists.
    ignored: HashMap<OverlayId, BTreeSet<String>>,
}

static REQ_HANDLERS: LazyLock<HandlerTable<LinkTunnels>> = LazyLock::new(|| {
    let mut table = HandlerTable::default();
    table.insert(names::AUTH_TUNNEL, LinkTunnels::req_auth_tunnel);
    table.insert(names::CREATE_TUNNEL, LinkTunnels::req_create_tunnel);
    table.insert(names::REQUEST_LINK_ENDPOINT, LinkTunnels::req_link_endpoint);
    table.insert(names::ADD_PEER_CAS, LinkTunnels::req_add_peer_cas);
    table.insert(names::REMOVE_TUNNEL, LinkTunnels::req_remove_tunnel);
    table.insert(names::DP_NOTIFY, LinkTunnels::req_dataplane_notify);
    table.insert(names::QUERY_TUNNEL_INFO, LinkTunnels::req_query_tunnel_info);
    table.insert(names::QUERY_TOPOLOGY_VIEW, LinkTunnels::req_query_topology_view);
    table.insert(names::ADD_IGNORED_INTERFACES, LinkTunnels::req_add_ignored_interfaces);
    table.insert(POLL_LINK_STATS, LinkTunnels::req_poll_link_stats);
    table
});

impl LinkTunnels {
    pub fn new(handle: ModuleHandle, cfg: LinkConfig, timed: Arc<TimedTransactions>) -> Self {
        let ignored = cfg
            .overlays
            .keys()
            .map(|overlay_id| (overlay_id.clone(), BTreeSet::new()))
            .collect();

        Self {
            handle,
            cfg,
            timed,
            events: Publisher::new(),
            maps: Arc::new(Mutex::new(Maps {
                tunnels: HashMap::new(),
                links: HashMap::new(),
                session_id: 0,
            })),
            ignored,
        }
    }

    /// The topic carrying this manager's tunnel lifecycle events.
    pub fn events_publisher(&self) -> Publisher<TunnelEvent> {
        self.events.clone()
    }

    pub fn terminate(&mut self) {
        tracing::info!("Link tunnel manager terminating");
    }

    fn tap_name(&self, overlay_id: &OverlayId, peer_id: &NodeId) -> TapName {
        let prefix = self
            .cfg
            .overlays
            .get(overlay_id)
            .and_then(|o| o.tap_name_prefix.as_deref());

        TapName::derive(overlay_id, peer_id, prefix)
    }

    /// The interfaces the engine must leave alone when gathering candidates:
    /// the new interface itself, both configured lists, and (unless
    /// recursive tunneling is allowed) every tap this manager owns.
    fn ignored_interfaces(&self, overlay_id: &OverlayId, new_tap: &TapName) -> Vec<String> {
        let mut ignored = BTreeSet::new();
        ignored.insert(new_tap.as_str().to_owned());
        ignored.extend(self.cfg.global_ignored_interfaces.iter().cloned());

        let overlay_cfg = self.cfg.overlays.get(overlay_id);
        if let Some(overlay_cfg) = overlay_cfg {
            ignored.extend(overlay_cfg.ignored_net_interfaces.iter().cloned());
        }
        if let Some(extra) = self.ignored.get(overlay_id) {
            ignored.extend(extra.iter().cloned());
        }

        let allow_recursive = overlay_cfg.is_some_and(|o| o.allow_recursive_tunneling);
        if !allow_recursive {
            for tunnel in self.maps.lock().tunnels.values() {
                if let Some(tap) = &tunnel.tap_name {
                    ignored.insert(tap.as_str().to_owned());
                }
            }
        }

        ignored.into_iter().collect()
    }

    fn stun(&self, overlay_id: &OverlayId) -> Vec<String> {
        self.cfg
            .overlays
            .get(overlay_id)
            .map(|o| o.stun.clone())
            .unwrap_or_default()
    }

    fn turn(&self, overlay_id: &OverlayId) -> Option<Vec<TurnServer>> {
        self.cfg
            .overlays
            .get(overlay_id)
            .map(|o| o.turn.clone())
            .filter(|turn| !turn.is_empty())
    }

    fn adopt_session(&self, data: &serde_json::Value) {
        if let Some(current) = current_session_id(data) {
            set_session(&self.maps, current);
        }
    }

    /// Node B: allocate the record and start the setup deadline.
    fn req_auth_tunnel(&mut self, cbt: Cbt) {
        let params: AuthParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };
        let AuthParams {
            overlay_id,
            peer_id,
            tunnel_id,
        } = params;

        {
            let mut maps = self.maps.lock();
            if maps.tunnels.contains_key(&tunnel_id) {
                drop(maps);
                self.handle.complete_with(
                    cbt,
                    format!(
                        "Tunnel auth failed, resource already exists for peer:tunnel {}:{tunnel_id}",
                        peer_id.brief()
                    ),
                    false,
                );
                return;
            }

            let session_id = maps.session_id;
            maps.tunnels.insert(
                tunnel_id,
                Tunnel::new(
                    tunnel_id,
                    overlay_id.clone(),
                    peer_id.clone(),
                    TunnelState::Authorized,
                    DataplaneKind::Ice,
                    session_id,
                ),
            );
        }

        self.watch_setup(tunnel_id);
        tracing::debug!(tunnel = %tunnel_id, peer = %peer_id.brief(), "Tunnel authorization completed");
        self.handle
            .complete_with(cbt, format!("Authorization completed, tunnel {tunnel_id}"), true);
        self.events.publish(TunnelEvent::new(
            TunnelEventKind::Authorized,
            overlay_id,
            peer_id,
            tunnel_id,
        ));
    }

    /// Expiry watchdog: a handshake that never reaches completion is rolled
    /// back and announced as expired.
    fn watch_setup(&self, tunnel_id: TunnelId) {
        let maps = self.maps.clone();
        let is_complete = {
            let maps = maps.clone();
            move |id: &TunnelId| {
                maps.lock()
                    .tunnels
                    .get(id)
                    .is_some_and(|t| t.link.as_ref().is_some_and(Link::is_complete))
            }
        };

        let handle = self.handle.clone();
        let events = self.events.clone();
        self.timed.register(
            tunnel_id,
            is_complete,
            move |id: TunnelId, _now: Instant| {
                expire_tunnel(&maps, &handle, &events, id);
            },
            self.cfg.setup_timeout,
            DEFAULT_PRIORITY,
        );
    }

    /// Node A, phase 1: allocate our interface and link.
    fn req_create_tunnel(&mut self, cbt: Cbt) {
        let params: CreateParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };
        let link_id = LinkId::from(params.tunnel_id);

        enum Plan {
            Duplicate,
            /// The tunnel was authorised here earlier; skip interface
            /// creation and ask the peer for its endpoint directly.
            ResumeAtEndpointRequest(NodeData),
            Fresh { session_id: u64 },
        }

        let plan = {
            let mut maps = self.maps.lock();
            let session_id = maps.session_id;
            match maps.tunnels.get_mut(&params.tunnel_id) {
                Some(tunnel) if tunnel.link.is_some() => Plan::Duplicate,
                Some(tunnel) => {
                    tunnel.link = Some(Link::new(link_id, 0xA2));
                    tunnel.state = TunnelState::Creating;
                    let node_data = NodeData {
                        uid: self.cfg.node_id.clone(),
                        mac: tunnel.mac.clone(),
                        fpr: tunnel.fingerprint.clone(),
                        cas: None,
                    };
                    maps.links.insert(link_id, params.tunnel_id);
                    Plan::ResumeAtEndpointRequest(node_data)
                }
                None => {
                    let mut tunnel = Tunnel::new(
                        params.tunnel_id,
                        params.overlay_id.clone(),
                        params.peer_id.clone(),
                        TunnelState::Creating,
                        DataplaneKind::Ice,
                        session_id,
                    );
                    tunnel.link = Some(Link::new(link_id, 0xA1));
                    tunnel.tap_name =
                        Some(self.tap_name(&params.overlay_id, &params.peer_id));
                    maps.tunnels.insert(params.tunnel_id, tunnel);
                    maps.links.insert(link_id, params.tunnel_id);
                    Plan::Fresh { session_id }
                }
            }
        };

        match plan {
            Plan::Duplicate => {
                self.handle.complete_with(
                    cbt,
                    format!(
                        "Failed, duplicate link requested to overlay {} peer {}",
                        params.overlay_id,
                        params.peer_id.brief()
                    ),
                    false,
                );
            }
            Plan::ResumeAtEndpointRequest(node_data) => {
                tracing::debug!(link = %link_id, peer = %params.peer_id.brief(), "Tunnel exists, resuming handshake");
                self.request_peer_endpoint(
                    params.overlay_id,
                    params.peer_id,
                    params.tunnel_id,
                    link_id,
                    node_data,
                    cbt,
                );
            }
            Plan::Fresh { session_id } => {
                let tap_name = self.tap_name(&params.overlay_id, &params.peer_id);
                let ignored = self.ignored_interfaces(&params.overlay_id, &tap_name);
                tracing::debug!(link = %link_id, peer = %params.peer_id.brief(), ?ignored, "Creating tunnel");

                self.handle.submit_chained(
                    names::ICE_DATAPLANE,
                    names::DP_CREATE_TUNNEL,
                    CreateTunnelParams {
                        overlay_id: params.overlay_id.clone(),
                        node_id: self.cfg.node_id.clone(),
                        tunnel_id: params.tunnel_id,
                        link_id,
                        stun_servers: self.stun(&params.overlay_id),
                        tap_name,
                        ignored_net_interfaces: ignored,
                        turn_servers: self.turn(&params.overlay_id),
                        session_id,
                    },
                    cbt,
                );
            }
        }
    }

    fn request_peer_endpoint(
        &self,
        overlay_id: OverlayId,
        peer_id: NodeId,
        tunnel_id: TunnelId,
        link_id: LinkId,
        node_data: NodeData,
        parent: Cbt,
    ) {
        RemoteAction::new(
            overlay_id.clone(),
            peer_id,
            names::LINK_TUNNEL,
            names::REQUEST_LINK_ENDPOINT,
            LinkEndptParams {
                overlay_id,
                tunnel_id,
                link_id,
                node_data,
            },
        )
        .submit(&self.handle, parent);
    }

    /// Node A, phase 2: our interface exists; ask the peer for its endpoint.
    fn resp_create_tunnel(&mut self, cbt: Cbt) {
        let parent = self.handle.take_parent(cbt.parent);
        let Ok(params) = cbt.params::<CreateTunnelParams>() else {
            tracing::warn!("Tunnel creation response without a readable request");
            return;
        };

        if !cbt.ok() || parent.is_none() {
            tracing::warn!(
                tunnel = %params.tunnel_id,
                "The create tunnel operation failed or the parent expired: {:?}",
                cbt.response_data()
            );
            self.adopt_session(cbt.response_data());
            self.deauth(params.tunnel_id);
            if let Some(parent) = parent {
                self.handle
                    .complete_with(parent, "Failed to create tunnel", false);
            }
            return;
        }
        let Some(parent) = parent else { return };

        let Ok(descriptor) =
            serde_json::from_value::<EndpointDescriptor>(cbt.response_data().clone())
        else {
            self.deauth(params.tunnel_id);
            self.handle
                .complete_with(parent, "Malformed endpoint descriptor", false);
            return;
        };

        let node_data = {
            let mut maps = self.maps.lock();
            let Some(tunnel) = maps.tunnels.get_mut(&params.tunnel_id) else {
                drop(maps);
                self.handle
                    .complete_with(parent, "Tunnel creation timeout failure", false);
                return;
            };
            if let Some(link) = tunnel.link.as_mut() {
                link.creation_state = 0xA2;
            }
            tunnel.mac = Some(descriptor.mac.clone());
            tunnel.fingerprint = Some(descriptor.fpr.clone());
            if descriptor.tap_name.is_some() {
                tunnel.tap_name = descriptor.tap_name.clone();
            }

            NodeData {
                uid: self.cfg.node_id.clone(),
                mac: tunnel.mac.clone(),
                fpr: tunnel.fingerprint.clone(),
                cas: None,
            }
        };

        tracing::debug!(link = %params.link_id, "Link phase 2/5 initiator");
        let peer_id = match self.peer_of(params.tunnel_id) {
            Some(peer_id) => peer_id,
            None => {
                self.handle
                    .complete_with(parent, "Tunnel creation timeout failure", false);
                return;
            }
        };
        self.request_peer_endpoint(
            params.overlay_id,
            peer_id,
            params.tunnel_id,
            params.link_id,
            node_data,
            parent,
        );
    }

    /// Node B, phase 3: the initiator wants our endpoint; have the engine
    /// create our side of the link.
    fn req_link_endpoint(&mut self, cbt: Cbt) {
        let params: LinkEndptParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };
        let peer_id = params.node_data.uid.clone();

        let session_id = {
            let mut maps = self.maps.lock();
            let session_id = maps.session_id;
            match maps.tunnels.get_mut(&params.tunnel_id) {
                None => {
                    drop(maps);
                    let msg = format!(
                        "The requested link endpoint was not authorized, it will not be created. \
                         tunnel={}, peer={}",
                        params.tunnel_id,
                        peer_id.brief()
                    );
                    tracing::warn!("{msg}");
                    self.handle.complete_with(cbt, msg, false);
                    return;
                }
                Some(tunnel) if tunnel.link.is_some() => {
                    drop(maps);
                    let msg = format!(
                        "A link already exists for this tunnel, it will not be created. \
                         tunnel={}, peer={}",
                        params.tunnel_id,
                        peer_id.brief()
                    );
                    tracing::warn!("{msg}");
                    self.handle.complete_with(cbt, msg, false);
                    return;
                }
                Some(tunnel) => {
                    tunnel.state = TunnelState::Creating;
                    tunnel.session_epoch = session_id;
                    tunnel.link = Some(Link::new(params.link_id, 0xB1));
                    let tap_name = self.tap_name(&params.overlay_id, &peer_id);
                    tunnel.tap_name = Some(tap_name);
                    maps.links.insert(params.link_id, params.tunnel_id);
                    session_id
                }
            }
        };

        let tap_name = self.tap_name(&params.overlay_id, &peer_id);
        let ignored = self.ignored_interfaces(&params.overlay_id, &tap_name);
        tracing::debug!(link = %params.link_id, ?ignored, "Link phase 1/4 responder");

        self.handle.submit_chained(
            names::ICE_DATAPLANE,
            names::DP_CREATE_LINK,
            CreateLinkParams {
                overlay_id: params.overlay_id.clone(),
                tunnel_id: params.tunnel_id,
                link_id: params.link_id,
                node_id: Some(self.cfg.node_id.clone()),
                stun_servers: Some(self.stun(&params.overlay_id)),
                tap_name: Some(tap_name),
                ignored_net_interfaces: Some(ignored),
                turn_servers: self.turn(&params.overlay_id),
                node_data: params.node_data,
                session_id,
            },
            cbt,
        );
    }

    /// Node B, phase 7: the initiator's connectivity addresses arrived.
    fn req_add_peer_cas(&mut self, cbt: Cbt) {
        let params: LinkEndptParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };

        let session_id = {
            let mut maps = self.maps.lock();
            match maps.tunnels.get_mut(&params.tunnel_id) {
                None => {
                    drop(maps);
                    tracing::info!(
                        tunnel = %params.tunnel_id,
                        "A request for an aborted tunnel was discarded"
                    );
                    self.handle
                        .complete_with(cbt, "This request was aborted", false);
                    return;
                }
                Some(tunnel) => {
                    if let Some(link) = tunnel.link.as_mut() {
                        link.creation_state = 0xB3;
                    }
                    tunnel.session_epoch
                }
            }
        };

        tracing::debug!(link = %params.link_id, "Link phase 3/4 responder");
        self.handle.submit_chained(
            names::ICE_DATAPLANE,
            names::DP_CREATE_LINK,
            CreateLinkParams {
                overlay_id: params.overlay_id.clone(),
                tunnel_id: params.tunnel_id,
                link_id: params.link_id,
                node_id: None,
                stun_servers: None,
                tap_name: None,
                ignored_net_interfaces: None,
                turn_servers: None,
                node_data: params.node_data,
                session_id,
            },
            cbt,
        );
    }

    /// Engine replies for phases 4 (responder), 6 (initiator) and
    /// 8 (responder), distinguished by the parked parent's action.
    fn resp_create_link(&mut self, cbt: Cbt) {
        let parent = self.handle.take_parent(cbt.parent);
        let Ok(params) = cbt.params::<CreateLinkParams>() else {
            tracing::warn!("Link creation response without a readable request");
            return;
        };

        if !cbt.ok() || parent.is_none() {
            tracing::warn!(
                link = %params.link_id,
                "Link endpoint creation failed or the parent expired: {:?}",
                cbt.response_data()
            );
            self.adopt_session(cbt.response_data());
            let reason = cbt.response_data().clone();
            self.rollback_incomplete(params.tunnel_id);
            if let Some(parent) = parent {
                self.handle.complete_with(parent, reason, false);
            }
            return;
        }
        let Some(parent) = parent else { return };

        let Ok(descriptor) =
            serde_json::from_value::<EndpointDescriptor>(cbt.response_data().clone())
        else {
            self.rollback_incomplete(params.tunnel_id);
            self.handle
                .complete_with(parent, "Malformed endpoint descriptor", false);
            return;
        };

        match parent.request.action.as_str() {
            // Phase 4, responder: reply with our node data.
            names::REQUEST_LINK_ENDPOINT => {
                {
                    let mut maps = self.maps.lock();
                    let Some(tunnel) = maps.tunnels.get_mut(&params.tunnel_id) else {
                        drop(maps);
                        self.handle
                            .complete_with(parent, "This request was aborted", false);
                        return;
                    };
                    if let Some(link) = tunnel.link.as_mut() {
                        link.creation_state = 0xB2;
                    }
                    tunnel.mac = Some(descriptor.mac.clone());
                    tunnel.fingerprint = Some(descriptor.fpr.clone());
                    if descriptor.tap_name.is_some() {
                        tunnel.tap_name = descriptor.tap_name.clone();
                    }
                    tunnel.peer_mac = params.node_data.mac.clone();
                }

                tracing::debug!(link = %params.link_id, "Link phase 2/4 responder");
                self.handle.complete_with(
                    parent,
                    LinkEndptParams {
                        overlay_id: params.overlay_id,
                        tunnel_id: params.tunnel_id,
                        link_id: params.link_id,
                        node_data: NodeData {
                            uid: self.cfg.node_id.clone(),
                            mac: Some(descriptor.mac),
                            fpr: Some(descriptor.fpr),
                            cas: descriptor.cas,
                        },
                    },
                    true,
                );
            }
            // Phase 6, initiator: send our connectivity addresses over.
            names::CREATE_TUNNEL => {
                let peer_id = {
                    let mut maps = self.maps.lock();
                    let Some(tunnel) = maps.tunnels.get_mut(&params.tunnel_id) else {
                        drop(maps);
                        self.handle
                            .complete_with(parent, "Tunnel creation timeout failure", false);
                        return;
                    };
                    if let Some(link) = tunnel.link.as_mut() {
                        link.creation_state = 0xA4;
                    }
                    tunnel.peer_id.clone()
                };

                tracing::debug!(link = %params.link_id, "Link phase 4/5 initiator");
                RemoteAction::new(
                    params.overlay_id.clone(),
                    peer_id,
                    names::LINK_TUNNEL,
                    names::ADD_PEER_CAS,
                    LinkEndptParams {
                        overlay_id: params.overlay_id,
                        tunnel_id: params.tunnel_id,
                        link_id: params.link_id,
                        node_data: NodeData {
                            uid: self.cfg.node_id.clone(),
                            mac: Some(descriptor.mac),
                            fpr: Some(descriptor.fpr),
                            cas: descriptor.cas,
                        },
                    },
                )
                .submit(&self.handle, parent);
            }
            // Phase 8, responder: the handshake is complete on our side.
            names::ADD_PEER_CAS => {
                let accepted = {
                    let mut maps = self.maps.lock();
                    match maps.tunnels.get_mut(&params.tunnel_id) {
                        Some(tunnel) => {
                            if let Some(link) = tunnel.link.as_mut() {
                                link.creation_state = LINK_COMPLETE;
                            }
                            true
                        }
                        None => false,
                    }
                };

                if !accepted {
                    self.handle
                        .complete_with(parent, "This request was aborted", false);
                    return;
                }

                tracing::info!(
                    tunnel = %params.tunnel_id,
                    link = %params.link_id,
                    "Link phase 4/4 responder, tunnel accepted"
                );
                self.handle.complete_with(
                    parent,
                    LinkEndptParams {
                        overlay_id: params.overlay_id,
                        tunnel_id: params.tunnel_id,
                        link_id: params.link_id,
                        node_data: NodeData {
                            uid: self.cfg.node_id.clone(),
                            mac: Some(descriptor.mac),
                            fpr: Some(descriptor.fpr),
                            cas: descriptor.cas,
                        },
                    },
                    true,
                );
            }
            other => {
                tracing::warn!(action = %other, "Link created for an unexpected operation");
                self.handle.complete_with(parent, (), true);
            }
        }
    }

    fn resp_remote_action(&mut self, cbt: Cbt) {
        let parent = self.handle.take_parent(cbt.parent);
        let Ok(act) = cbt.params::<RemoteAction>() else {
            tracing::warn!("Remote action response without a readable request");
            return;
        };

        if !cbt.ok() || parent.is_none() {
            if let Ok(TunnelRef { tunnel_id }) = act.request_params::<TunnelRef>() {
                tracing::debug!(
                    tunnel = %tunnel_id,
                    action = %act.action,
                    "Remote action failed or the parent expired"
                );
                self.rollback_incomplete(tunnel_id);
            }
            if let Some(parent) = parent {
                self.handle
                    .complete_with(parent, cbt.response_data().clone(), false);
            }
            return;
        }
        let Some(parent) = parent else { return };

        let Ok(completed) = serde_json::from_value::<RemoteAction>(cbt.response_data().clone())
        else {
            tracing::warn!("Remote completion carries no action payload");
            return;
        };

        match completed.action.as_str() {
            names::REQUEST_LINK_ENDPOINT => self.on_peer_endpoint(completed, parent),
            names::ADD_PEER_CAS => self.on_peer_cas_added(parent),
            other => tracing::warn!(action = %other, "Unsupported remote action completion"),
        }
    }

    /// Node A, phase 5: the responder's endpoint data arrived; feed its
    /// connectivity addresses to our engine.
    fn on_peer_endpoint(&mut self, completed: RemoteAction, parent: Cbt) {
        let Ok(reply) = completed.reply_data::<LinkEndptParams>() else {
            tracing::warn!("Malformed link endpoint reply");
            if let Ok(TunnelRef { tunnel_id }) = completed.request_params::<TunnelRef>() {
                self.rollback_incomplete(tunnel_id);
            }
            self.handle
                .complete_with(parent, "Malformed link endpoint reply", false);
            return;
        };

        let session_id = {
            let mut maps = self.maps.lock();
            let Some(tunnel) = maps.tunnels.get_mut(&reply.tunnel_id) else {
                // The handshake timed out while the peer answered.
                drop(maps);
                self.handle
                    .complete_with(parent, "Tunnel creation timeout failure", false);
                return;
            };
            if let Some(link) = tunnel.link.as_mut() {
                link.creation_state = 0xA3;
            }
            tunnel.peer_mac = reply.node_data.mac.clone();
            tunnel.session_epoch
        };

        tracing::debug!(link = %reply.link_id, "Link phase 3/5 initiator");
        self.handle.submit_chained(
            names::ICE_DATAPLANE,
            names::DP_CREATE_LINK,
            CreateLinkParams {
                overlay_id: reply.overlay_id,
                tunnel_id: reply.tunnel_id,
                link_id: reply.link_id,
                node_id: None,
                stun_servers: None,
                tap_name: None,
                ignored_net_interfaces: None,
                turn_servers: None,
                node_data: reply.node_data,
                session_id,
            },
            parent,
        );
    }

    /// Node A, phase 9: the responder confirmed; complete the original
    /// request.
    fn on_peer_cas_added(&mut self, parent: Cbt) {
        let Ok(params) = parent.params::<CreateParams>() else {
            tracing::warn!("Create tunnel request without readable parameters");
            return;
        };
        let link_id = LinkId::from(params.tunnel_id);

        let known = {
            let mut maps = self.maps.lock();
            match maps.tunnels.get_mut(&params.tunnel_id) {
                Some(tunnel) => {
                    if let Some(link) = tunnel.link.as_mut() {
                        link.creation_state = LINK_COMPLETE;
                    }
                    true
                }
                None => false,
            }
        };

        if !known {
            self.handle
                .complete_with(parent, "Tunnel creation timeout failure", false);
            return;
        }

        tracing::debug!(
            tunnel = %params.tunnel_id,
            peer = %params.peer_id.brief(),
            "Link phase 5/5 initiator, tunnel created"
        );
        self.handle
            .complete_with(parent, serde_json::json!({ "LinkId": link_id }), true);
    }

    /// Unsolicited engine notifications: link state changes and session
    /// epochs.
    fn req_dataplane_notify(&mut self, cbt: Cbt) {
        let notify: DataplaneNotify = match cbt.params() {
            Ok(notify) => notify,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Malformed notification: {e}"), false);
                return;
            }
        };

        match notify.command {
            NotifyCommand::LinkStateChange => self.on_link_state_change(notify),
            NotifyCommand::Ready => {
                if let Some(session_id) = notify.session_id {
                    set_session(&self.maps, session_id);
                }
            }
            NotifyCommand::Reset => {
                let mut maps = self.maps.lock();
                tracing::info!(session = maps.session_id, "Clearing tunnels for session");
                maps.tunnels.clear();
                maps.links.clear();
                maps.session_id = 0;
            }
        }

        self.handle.complete_with(cbt, (), true);
    }

    fn on_link_state_change(&mut self, notify: DataplaneNotify) {
        match notify.data {
            Some(LinkState::Down) => {
                let Some(tunnel_id) = notify.tunnel_id else { return };
                let should_query = {
                    let mut maps = self.maps.lock();
                    match maps.tunnels.get_mut(&tunnel_id) {
                        Some(tunnel) if tunnel.state != TunnelState::Querying => {
                            tunnel.state = TunnelState::Querying;
                            true
                        }
                        _ => false,
                    }
                };

                if should_query {
                    tracing::debug!(tunnel = %tunnel_id, "Link state is down, querying");
                    self.handle.submit_new(
                        names::ICE_DATAPLANE,
                        names::DP_QUERY_LINK_STATS,
                        QueryLinkStatsParams::from([tunnel_id]),
                    );
                }
            }
            Some(LinkState::Up) => {
                let tunnel_id = notify
                    .link_id
                    .and_then(|link_id| self.maps.lock().links.get(&link_id).copied())
                    .or(notify.tunnel_id);
                let Some(tunnel_id) = tunnel_id else { return };

                let event = {
                    let mut maps = self.maps.lock();
                    match maps.tunnels.get_mut(&tunnel_id) {
                        Some(tunnel) => {
                            let was_querying = tunnel.state == TunnelState::Querying;
                            tunnel.state = TunnelState::Online;
                            if was_querying {
                                // Just a recheck coming good; no event.
                                if let Some(link) = tunnel.link.as_mut() {
                                    link.status_retry = 0;
                                }
                                None
                            } else {
                                Some(
                                    TunnelEvent::connected(
                                        tunnel.overlay_id.clone(),
                                        tunnel.peer_id.clone(),
                                        tunnel_id,
                                        tunnel.tap_name.clone(),
                                        tunnel.mac.clone(),
                                        tunnel.peer_mac.clone(),
                                        DataplaneKind::Ice,
                                        Utc::now(),
                                    )
                                    .with_link(
                                        tunnel
                                            .link
                                            .as_ref()
                                            .map(|l| l.link_id)
                                            .unwrap_or_else(|| LinkId::from(tunnel_id)),
                                    ),
                                )
                            }
                        }
                        None => None,
                    }
                };

                if let Some(event) = event {
                    self.events.publish(event);
                }
            }
            None => {}
        }
    }

    /// Stats responses drive the retry ladder for flaky links.
    fn resp_query_link_stats(&mut self, cbt: Cbt) {
        if !cbt.ok() {
            tracing::warn!("Link stats update error: {:?}", cbt.response_data());
            self.adopt_session(cbt.response_data());
            return;
        }

        let Ok(report) = serde_json::from_value::<LinkStatsReport>(cbt.response_data().clone())
        else {
            tracing::warn!("Malformed link stats report");
            return;
        };

        let mut removals = Vec::new();
        let mut disconnects = Vec::new();
        {
            let mut maps = self.maps.lock();
            let session_id = maps.session_id;

            for (tunnel_id, links) in report {
                for (link_id, entry) in links {
                    match entry.status {
                        LinkStatus::Unknown => {
                            // The engine has no record of it; neither do we,
                            // from now on.
                            maps.tunnels.remove(&tunnel_id);
                            maps.links.remove(&link_id);
                        }
                        LinkStatus::Offline => {
                            let Some(tunnel) = maps.tunnels.get_mut(&tunnel_id) else {
                                continue;
                            };
                            let retry = tunnel
                                .link
                                .as_ref()
                                .map(|l| l.status_retry)
                                .unwrap_or_default();

                            if retry >= 2 && tunnel.state == TunnelState::Creating {
                                // Stuck creating; destroy it.
                                removals.push(RemoveTunnelParams {
                                    overlay_id: tunnel.overlay_id.clone(),
                                    tunnel_id,
                                    link_id: Some(link_id),
                                    peer_id: tunnel.peer_id.clone(),
                                    tap_name: tunnel.tap_name.clone(),
                                    session_id,
                                });
                            } else if tunnel.state == TunnelState::Querying
                                || (retry >= 1 && tunnel.state == TunnelState::Online)
                            {
                                let mut event = TunnelEvent::new(
                                    TunnelEventKind::Disconnected,
                                    tunnel.overlay_id.clone(),
                                    tunnel.peer_id.clone(),
                                    tunnel_id,
                                )
                                .with_link(link_id);
                                event.tap_name = tunnel.tap_name.clone();
                                disconnects.push(event);
                                // Offline is terminal for the record.
                                maps.tunnels.remove(&tunnel_id);
                                maps.links.remove(&link_id);
                            } else if let Some(link) =
                                maps.tunnels.get_mut(&tunnel_id).and_then(|t| t.link.as_mut())
                            {
                                link.status_retry += 1;
                                tracing::warn!(
                                    tunnel = %tunnel_id,
                                    retry = link.status_retry,
                                    "Link is offline, rechecking before giving up"
                                );
                            }
                        }
                        LinkStatus::Online => {
                            if let Some(tunnel) = maps.tunnels.get_mut(&tunnel_id) {
                                tunnel.state = TunnelState::Online;
                                if let Some(link) = tunnel.link.as_mut() {
                                    link.stats = entry.stats;
                                    link.status_retry = 0;
                                }
                            }
                        }
                    }
                }
            }
        }

        for params in removals {
            self.handle
                .submit_new(names::ICE_DATAPLANE, names::DP_REMOVE_TUNNEL, params);
        }
        for event in disconnects {
            self.events.publish(event);
        }
    }

    fn req_remove_tunnel(&mut self, cbt: Cbt) {
        let params: RemoveParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };

        enum Plan {
            NoRecord,
            Busy,
            Remove(RemoveTunnelParams),
        }

        let plan = {
            let maps = self.maps.lock();
            match maps.tunnels.get(&params.tunnel_id) {
                None => Plan::NoRecord,
                Some(tunnel)
                    if matches!(tunnel.state, TunnelState::Authorized | TunnelState::Online) =>
                {
                    Plan::Remove(RemoveTunnelParams {
                        overlay_id: params.overlay_id.clone(),
                        tunnel_id: params.tunnel_id,
                        link_id: tunnel.link.as_ref().map(|l| l.link_id),
                        peer_id: params.peer_id.clone(),
                        tap_name: tunnel.tap_name.clone(),
                        session_id: maps.session_id,
                    })
                }
                Some(_) => Plan::Busy,
            }
        };

        match plan {
            Plan::NoRecord => self.handle.complete_with(cbt, "No record", true),
            Plan::Busy => self
                .handle
                .complete_with(cbt, "Tunnel busy, retry operation", false),
            Plan::Remove(remove) => {
                self.handle.submit_chained(
                    names::ICE_DATAPLANE,
                    names::DP_REMOVE_TUNNEL,
                    remove,
                    cbt,
                );
            }
        }
    }

    /// The engine confirmed (or cannot dispute) the removal; drop the
    /// records and announce it.
    fn resp_remove_tunnel(&mut self, cbt: Cbt) {
        let parent = self.handle.take_parent(cbt.parent);
        let Ok(params) = cbt.params::<RemoveTunnelParams>() else {
            tracing::warn!("Tunnel removal response without a readable request");
            return;
        };

        self.adopt_session(cbt.response_data());

        {
            let mut maps = self.maps.lock();
            maps.tunnels.remove(&params.tunnel_id);
            if let Some(link_id) = params.link_id {
                maps.links.remove(&link_id);
            }
        }

        if let Some(parent) = parent {
            self.handle.complete_with(parent, "Tunnel removed", true);
        }

        self.events.publish(
            TunnelEvent::new(
                TunnelEventKind::Removed,
                params.overlay_id.clone(),
                params.peer_id.clone(),
                params.tunnel_id,
            )
            .with_link(params.link_id.unwrap_or_else(|| LinkId::from(params.tunnel_id)))
            .with_tap(params.tap_name.clone()),
        );
        tracing::info!(
            tunnel = %params.tunnel_id,
            overlay = %params.overlay_id.brief(),
            peer = %params.peer_id.brief(),
            "Tunnel removed"
        );
    }

    fn req_query_tunnel_info(&mut self, cbt: Cbt) {
        let results = {
            let maps = self.maps.lock();
            maps.tunnels
                .values()
                .filter(|t| t.state == TunnelState::Online)
                .map(|t| {
                    (
                        t.tunnel_id,
                        serde_json::json!({
                            "OverlayId": t.overlay_id,
                            "TunnelId": t.tunnel_id,
                            "PeerId": t.peer_id,
                            "Stats": t.link.as_ref().map(|l| l.stats.clone()),
                            "TapName": t.tap_name,
                            "MAC": t.mac,
                            "PeerMac": t.peer_mac,
                        }),
                    )
                })
                .collect::<HashMap<_, _>>()
        };

        self.handle.complete_with(cbt, results, true);
    }

    /// The visualiser's slice: per overlay, each link's best connection.
    fn req_query_topology_view(&mut self, cbt: Cbt) {
        let mut view: HashMap<OverlayId, serde_json::Map<String, serde_json::Value>> =
            HashMap::new();

        {
            let maps = self.maps.lock();
            for tunnel in maps.tunnels.values() {
                let Some(link) = &tunnel.link else { continue };

                let mut data = serde_json::Map::new();
                if let Some(tap_name) = &tunnel.tap_name {
                    data.insert("TapName".into(), serde_json::json!(tap_name));
                }
                if let Some(mac) = &tunnel.mac {
                    data.insert("MAC".into(), serde_json::json!(mac));
                }
                if let Some((local, remote)) = best_connection(&link.stats) {
                    data.insert("LocalEndpoint".into(), local);
                    data.insert("RemoteEndpoint".into(), remote);
                }

                view.entry(tunnel.overlay_id.clone())
                    .or_default()
                    .insert(tunnel.tunnel_id.to_string(), data.into());
            }
        }

        let ok = !view.is_empty();
        self.handle.complete_with(cbt, view, ok);
    }

    fn req_add_ignored_interfaces(&mut self, cbt: Cbt) {
        match cbt.params::<HashMap<OverlayId, Vec<String>>>() {
            Ok(additions) => {
                for (overlay_id, ifaces) in additions {
                    self.ignored.entry(overlay_id).or_default().extend(ifaces);
                }
                self.handle.complete_with(cbt, (), true);
            }
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Malformed ignore list: {e}"), false);
            }
        }
    }

    /// Queries the status of every link that completed its handshake.
    fn req_poll_link_stats(&mut self, cbt: Cbt) {
        let completed = {
            let maps = self.maps.lock();
            maps.tunnels
                .values()
                .filter(|t| t.link.as_ref().is_some_and(Link::is_complete))
                .map(|t| t.tunnel_id)
                .collect::<Vec<_>>()
        };

        if !completed.is_empty() {
            self.handle
                .submit_new(names::ICE_DATAPLANE, names::DP_QUERY_LINK_STATS, completed);
        }
        self.handle.complete_with(cbt, (), true);
    }

    /// Announce the expiry and drop the records; no interface exists yet.
    fn deauth(&self, tunnel_id: TunnelId) {
        deauth_tunnel(&self.maps, &self.events, tunnel_id);
    }

    /// Removes a link that failed its setup handshake, including whatever
    /// the engine allocated for it.
    fn rollback_incomplete(&self, tunnel_id: TunnelId) {
        rollback_incomplete(&self.maps, &self.handle, tunnel_id);
    }

    fn peer_of(&self, tunnel_id: TunnelId) -> Option<NodeId> {
        self.maps
            .lock()
            .tunnels
            .get(&tunnel_id)
            .map(|t| t.peer_id.clone())
    }
}

fn set_session(maps: &SharedMaps, session_id: u64) {
    let mut maps = maps.lock();
    if maps.session_id != session_id {
        tracing::info!(old = maps.session_id, new = session_id, "Updating data-plane session id");
        maps.session_id = session_id;
    }
}

fn deauth_tunnel(maps: &SharedMaps, events: &Publisher<TunnelEvent>, tunnel_id: TunnelId) {
    let tunnel = {
        let mut maps = maps.lock();
        let tunnel = maps.tunnels.remove(&tunnel_id);
        if let Some(link_id) = tunnel.as_ref().and_then(|t| t.link.as_ref().map(|l| l.link_id)) {
            maps.links.remove(&link_id);
        }
        tunnel
    };

    let Some(tunnel) = tunnel else { return };
    tracing::info!(tunnel = %tunnel_id, "Deauthorizing tunnel");
    events.publish(
        TunnelEvent::new(
            TunnelEventKind::AuthExpired,
            tunnel.overlay_id,
            tunnel.peer_id,
            tunnel_id,
        )
        .with_tap(tunnel.tap_name),
    );
}

fn rollback_incomplete(maps: &SharedMaps, handle: &ModuleHandle, tunnel_id: TunnelId) {
    let remove = {
        let mut maps = maps.lock();
        let session_id = maps.session_id;
        let Some(tunnel) = maps.tunnels.remove(&tunnel_id) else {
            return;
        };
        if let Some(link) = &tunnel.link {
            maps.links.remove(&link.link_id);
        }

        tunnel.link.as_ref().filter(|l| !l.is_complete()).map(|link| {
            tracing::info!(
                tunnel = %tunnel_id,
                peer = %tunnel.peer_id.brief(),
                creation_state = format!("{:02X}", link.creation_state),
                "Initiating removal of incomplete link"
            );
            RemoveTunnelParams {
                overlay_id: tunnel.overlay_id.clone(),
                tunnel_id,
                link_id: Some(link.link_id),
                peer_id: tunnel.peer_id.clone(),
                tap_name: tunnel.tap_name.clone(),
                session_id,
            }
        })
    };

    if let Some(remove) = remove {
        handle.submit_new(names::ICE_DATAPLANE, names::DP_REMOVE_TUNNEL, remove);
    }
}

/// Expiry of the setup watchdog: roll the tunnel back and announce it.
fn expire_tunnel(
    maps: &SharedMaps,
    handle: &ModuleHandle,
    events: &Publisher<TunnelEvent>,
    tunnel_id: TunnelId,
) {
    let (tunnel, remove) = {
        let mut maps = maps.lock();
        let session_id = maps.session_id;
        let Some(tunnel) = maps.tunnels.remove(&tunnel_id) else {
            return;
        };
        if let Some(link) = &tunnel.link {
            maps.links.remove(&link.link_id);
        }

        let remove = tunnel
            .link
            .as_ref()
            .filter(|l| !l.is_complete())
            .map(|link| RemoveTunnelParams {
                overlay_id: tunnel.overlay_id.clone(),
                tunnel_id,
                link_id: Some(link.link_id),
                peer_id: tunnel.peer_id.clone(),
                tap_name: tunnel.tap_name.clone(),
                session_id,
            });

        (tunnel, remove)
    };

    tracing::info!(tunnel = %tunnel_id, peer = %tunnel.peer_id.brief(), "Tunnel setup expired");
    if let Some(remove) = remove {
        handle.submit_new(names::ICE_DATAPLANE, names::DP_REMOVE_TUNNEL, remove);
    }
    events.publish(
        TunnelEvent::new(
            TunnelEventKind::AuthExpired,
            tunnel.overlay_id.clone(),
            tunnel.peer_id.clone(),
            tunnel_id,
        )
        .with_tap(tunnel.tap_name.clone()),
    );
}

/// Picks the best-connection endpoints out of an engine stats array.
fn best_connection(stats: &serde_json::Value) -> Option<(serde_json::Value, serde_json::Value)> {
    for entry in stats.as_array()? {
        if !entry.get("best_conn").and_then(|v| v.as_bool()).unwrap_or(false) {
            continue;
        }
        let lvals = entry.get("local_candidate")?.as_str()?.split(':').collect::<Vec<_>>();
        let rvals = entry.get("remote_candidate")?.as_str()?.split(':').collect::<Vec<_>>();
        if lvals.len() < 10 || rvals.len() < 8 {
            continue;
        }

        return Some((
            serde_json::json!({
                "Proto": lvals[7],
                "External": format!("{}:{}", lvals[5], lvals[6]),
                "Internal": format!("{}:{}", lvals[8], lvals[9]),
            }),
            serde_json::json!({
                "Proto": rvals[7],
                "External": format!("{}:{}", rvals[5], rvals[6]),
            }),
        ));
    }

    None
}

impl ControllerModule for LinkTunnels {
    fn handle_request(&mut self, cbt: Cbt) {
        if let Err(cbt) = REQ_HANDLERS.dispatch(self, cbt) {
            let action = cbt.request.action.clone();
            self.handle
                .complete_with(cbt, format!("Unsupported action: {action}"), false);
        }
    }

    fn handle_response(&mut self, cbt: Cbt) {
        match cbt.request.action.as_str() {
            names::REMOTE_ACTION => self.resp_remote_action(cbt),
            names::DP_CREATE_TUNNEL => self.resp_create_tunnel(cbt),
            names::DP_CREATE_LINK => self.resp_create_link(cbt),
            names::DP_QUERY_LINK_STATS => self.resp_query_link_stats(cbt),
            names::DP_REMOVE_TUNNEL => self.resp_remove_tunnel(cbt),
            other => {
                tracing::debug!(action = %other, "Releasing unexpected response");
            }
        }
    }

    fn handle_abort(&mut self, cbt: Cbt) {
        // A parent above us was cancelled; drop the records so a later
        // attempt can start clean.
        let tunnel_id = match cbt.request.action.as_str() {
            names::REMOTE_ACTION => cbt
                .params::<RemoteAction>()
                .ok()
                .and_then(|act| act.request_params::<TunnelRef>().ok())
                .map(|p| p.tunnel_id),
            names::DP_CREATE_TUNNEL | names::DP_CREATE_LINK | names::DP_REMOVE_TUNNEL => {
                cbt.params::<TunnelRef>().ok().map(|p| p.tunnel_id)
            }
            _ => None,
        };

        let Some(tunnel_id) = tunnel_id else { return };
        tracing::info!(tunnel = %tunnel_id, "Releasing aborted tunnel operation");
        let mut maps = self.maps.lock();
        if let Some(tunnel) = maps.tunnels.remove(&tunnel_id) {
            if let Some(link) = tunnel.link {
                maps.links.remove(&link.link_id);
            }
        }
    }
}

/// Posts a link statistics poll to the manager every `interval`.
pub fn spawn_stats_poller(handle: ModuleHandle, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            handle.submit_new(names::LINK_TUNNEL, POLL_LINK_STATS, ());
        }
    })
}
