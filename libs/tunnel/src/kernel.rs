//! The kernel (Geneve) tunnel manager.
//!
//! A lightweight three-step handshake: the initiator asks the responder for
//! its endpoint metadata, both sides bind a kernel interface to the other's
//! fixed address, and the initiator's MAC delivery completes the exchange.
//! Peer liveness is somebody else's business; the overlay controller probes
//! neighbours once they are up.

use std::collections::HashMap;
use std::net::IpAddr;
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
    DataplaneKind, Mac, NodeId, OverlayId, TapName, TunnelEvent, TunnelEventKind, TunnelId,
    TunnelState,
};

use crate::dataplane::{CreateTapParams, RemoveTapParams, TapDescriptor};
use crate::Tunnel;

#[derive(Debug, Clone)]
pub struct KernelOverlayConfig {
    pub tap_name_prefix: Option<String>,
    /// The address peers bind their end of the tunnel to.
    pub end_point_address: Option<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub node_id: NodeId,
    pub setup_timeout: Duration,
    pub overlays: HashMap<OverlayId, KernelOverlayConfig>,
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
    #[serde(rename = "VNId")]
    vnid: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RemoveParams {
    overlay_id: OverlayId,
    peer_id: NodeId,
    tunnel_id: TunnelId,
}

/// Initiator → responder: my endpoint, give me yours.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExchangeEndptParams {
    overlay_id: OverlayId,
    tunnel_id: TunnelId,
    #[serde(rename = "VNId")]
    vnid: u64,
    node_id: NodeId,
    end_point_address: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExchangeEndptReply {
    tunnel_id: TunnelId,
    #[serde(rename = "VNId")]
    vnid: u64,
    node_id: NodeId,
    end_point_address: IpAddr,
    #[serde(rename = "MAC")]
    mac: Option<Mac>,
    dataplane: DataplaneKind,
}

/// Minimal view of any handshake payload: just the tunnel it concerns.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TunnelRef {
    tunnel_id: TunnelId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateMacParams {
    overlay_id: OverlayId,
    tunnel_id: TunnelId,
    node_id: NodeId,
    #[serde(rename = "MAC")]
    mac: Mac,
}

/// Shared with the watchdog thread; handlers hold the lock for the duration
/// of one bus message and never block on I/O under it.
type TunnelMap = Arc<Mutex<HashMap<TunnelId, Tunnel>>>;

pub struct KernelTunnels {
    handle: ModuleHandle,
    cfg: KernelConfig,
    timed: Arc<TimedTransactions>,
    events: Publisher<TunnelEvent>,
    tunnels: TunnelMap,
}

static REQ_HANDLERS: LazyLock<HandlerTable<KernelTunnels>> = LazyLock::new(|| {
    let mut table = HandlerTable::default();
    table.insert(names::AUTH_TUNNEL, KernelTunnels::req_auth_tunnel);
    table.insert(names::CREATE_TUNNEL, KernelTunnels::req_create_tunnel);
    table.insert(names::EXCHANGE_ENDPOINT, KernelTunnels::req_exchange_endpoint);
    table.insert(names::UPDATE_PEER_MAC, KernelTunnels::req_update_peer_mac);
    table.insert(names::REMOVE_TUNNEL, KernelTunnels::req_remove_tunnel);
    table.insert(names::ABORT_TUNNEL, KernelTunnels::req_abort_tunnel);
    table
});

impl KernelTunnels {
    pub fn new(handle: ModuleHandle, cfg: KernelConfig, timed: Arc<TimedTransactions>) -> Self {
        Self {
            handle,
            cfg,
            timed,
            events: Publisher::new(),
            tunnels: Arc::default(),
        }
    }

    /// The topic carrying this manager's tunnel lifecycle events.
    pub fn events_publisher(&self) -> Publisher<TunnelEvent> {
        self.events.clone()
    }

    /// Destroys every interface this manager still owns.
    pub fn terminate(&mut self) {
        let mut tunnels = self.tunnels.lock();
        for tunnel in tunnels.values() {
            if let Some(tap_name) = &tunnel.tap_name {
                self.handle.submit_new(
                    names::GENEVE_DATAPLANE,
                    names::DP_REMOVE_TAP,
                    RemoveTapParams {
                        tap_name: tap_name.clone(),
                    },
                );
            }
        }
        tunnels.clear();
        tracing::info!("Kernel tunnel manager terminating");
    }

    fn tap_name(&self, overlay_id: &OverlayId, peer_id: &NodeId) -> TapName {
        let prefix = self
            .cfg
            .overlays
            .get(overlay_id)
            .and_then(|o| o.tap_name_prefix.as_deref());

        TapName::derive(overlay_id, peer_id, prefix)
    }

    fn remove_tap(&self, tap_name: TapName) {
        self.handle.submit_new(
            names::GENEVE_DATAPLANE,
            names::DP_REMOVE_TAP,
            RemoveTapParams { tap_name },
        );
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
            let mut tunnels = self.tunnels.lock();
            if tunnels.contains_key(&tunnel_id) {
                drop(tunnels);
                self.handle.complete_with(
                    cbt,
                    format!(
                        "Tunnel authorization failed, a tunnel with id {tunnel_id} already exists for peer {}",
                        peer_id.brief()
                    ),
                    false,
                );
                return;
            }

            let mut tunnel = Tunnel::new(
                tunnel_id,
                overlay_id.clone(),
                peer_id.clone(),
                TunnelState::Authorized,
                DataplaneKind::Geneve,
                0,
            );
            tunnel.tap_name = Some(self.tap_name(&overlay_id, &peer_id));
            tunnels.insert(tunnel_id, tunnel);
        }

        self.watch_setup(tunnel_id);
        tracing::debug!(
            tunnel = %tunnel_id,
            peer = %peer_id.brief(),
            "Tunnel authorization completed"
        );
        self.handle
            .complete_with(cbt, format!("Authorization completed, tunnel {tunnel_id}"), true);
        self.events.publish(TunnelEvent::new(
            TunnelEventKind::Authorized,
            overlay_id,
            peer_id,
            tunnel_id,
        ));
    }

    /// Expiry watchdog for a tunnel that was authorised but may never come up.
    fn watch_setup(&self, tunnel_id: TunnelId) {
        let tunnels = self.tunnels.clone();
        let is_complete = {
            let tunnels = tunnels.clone();
            move |id: &TunnelId| {
                tunnels
                    .lock()
                    .get(id)
                    .is_some_and(|t| t.state == TunnelState::Online)
            }
        };

        let handle = self.handle.clone();
        let events = self.events.clone();
        let on_expire = move |id: TunnelId, _now: Instant| {
            let Some(tunnel) = tunnels.lock().remove(&id) else {
                return;
            };

            match tunnel.state {
                TunnelState::Authorized => {
                    tracing::info!(tunnel = %id, "Deauthorizing expired tunnel");
                    events.publish(
                        TunnelEvent::new(
                            TunnelEventKind::AuthExpired,
                            tunnel.overlay_id,
                            tunnel.peer_id,
                            id,
                        )
                        .with_tap(tunnel.tap_name),
                    );
                }
                _ => {
                    tracing::info!(tunnel = %id, state = %tunnel.state, "Removing expired tunnel");
                    if let Some(tap_name) = tunnel.tap_name.clone() {
                        handle.submit_new(
                            names::GENEVE_DATAPLANE,
                            names::DP_REMOVE_TAP,
                            RemoveTapParams { tap_name },
                        );
                    }
                    events.publish(
                        TunnelEvent::new(
                            TunnelEventKind::Removed,
                            tunnel.overlay_id,
                            tunnel.peer_id,
                            id,
                        )
                        .with_tap(tunnel.tap_name),
                    );
                }
            }
        };

        self.timed.register(
            tunnel_id,
            is_complete,
            on_expire,
            self.cfg.setup_timeout,
            DEFAULT_PRIORITY,
        );
    }

    /// Node A: start the handshake towards an authorised peer.
    fn req_create_tunnel(&mut self, cbt: Cbt) {
        let params: CreateParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };

        let Some(end_point_address) = self
            .cfg
            .overlays
            .get(&params.overlay_id)
            .and_then(|o| o.end_point_address)
        else {
            self.handle.complete_with(
                cbt,
                format!("No endpoint address configured for overlay {}", params.overlay_id),
                false,
            );
            return;
        };

        if self.tunnels.lock().contains_key(&params.tunnel_id) {
            self.handle.complete_with(
                cbt,
                format!("Tunnel {} already exists", params.tunnel_id),
                false,
            );
            return;
        }

        let tap_name = self.tap_name(&params.overlay_id, &params.peer_id);
        // Remnants of an earlier run would shadow the new interface.
        self.remove_tap(tap_name.clone());

        let mut tunnel = Tunnel::new(
            params.tunnel_id,
            params.overlay_id.clone(),
            params.peer_id.clone(),
            TunnelState::Creating,
            DataplaneKind::Geneve,
            0,
        );
        tunnel.tap_name = Some(tap_name);
        self.tunnels.lock().insert(params.tunnel_id, tunnel);

        RemoteAction::new(
            params.overlay_id.clone(),
            params.peer_id.clone(),
            names::GENEVE_TUNNEL,
            names::EXCHANGE_ENDPOINT,
            ExchangeEndptParams {
                overlay_id: params.overlay_id,
                tunnel_id: params.tunnel_id,
                vnid: params.vnid,
                node_id: self.cfg.node_id.clone(),
                end_point_address,
            },
        )
        .submit(&self.handle, cbt);
    }

    /// Node B: the initiator's endpoint arrived; bind our interface to it.
    fn req_exchange_endpoint(&mut self, cbt: Cbt) {
        let params: ExchangeEndptParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };

        let tap_name = {
            let mut tunnels = self.tunnels.lock();
            match tunnels.get_mut(&params.tunnel_id) {
                Some(tunnel) if tunnel.state == TunnelState::Authorized => {
                    tunnel.state = TunnelState::Creating;
                    tunnel.tap_name.clone()
                }
                _ => None,
            }
        };

        let Some(tap_name) = tap_name else {
            let msg = format!(
                "The requested endpoint was not authorized or has expired, it will not be created. \
                 tunnel={} peer={}",
                params.tunnel_id,
                params.node_id.brief()
            );
            tracing::warn!("{msg}");
            self.handle.complete_with(cbt, msg, false);
            return;
        };

        // Replace any remnant before binding the new interface.
        self.remove_tap(tap_name.clone());
        self.handle.submit_chained(
            names::GENEVE_DATAPLANE,
            names::DP_CREATE_TAP,
            CreateTapParams {
                overlay_id: params.overlay_id,
                tunnel_id: params.tunnel_id,
                tap_name,
                vnid: params.vnid,
                remote_address: params.end_point_address,
            },
            cbt,
        );
    }

    /// Node B: the initiator's MAC completes the handshake.
    fn req_update_peer_mac(&mut self, cbt: Cbt) {
        let params: UpdateMacParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };

        let event = {
            let mut tunnels = self.tunnels.lock();
            match tunnels.get_mut(&params.tunnel_id) {
                None => Err(format!("Tunnel {} does not exist", params.tunnel_id)),
                Some(tunnel) if tunnel.state == TunnelState::Creating => {
                    tunnel.peer_mac = Some(params.mac);
                    // Connected is asserted here; the overlay controller
                    // checks peer liveness from now on.
                    tunnel.state = TunnelState::Online;
                    Ok(TunnelEvent::connected(
                        tunnel.overlay_id.clone(),
                        tunnel.peer_id.clone(),
                        params.tunnel_id,
                        tunnel.tap_name.clone(),
                        tunnel.mac.clone(),
                        tunnel.peer_mac.clone(),
                        DataplaneKind::Geneve,
                        Utc::now(),
                    ))
                }
                Some(_) => Err(format!("Invalid request for tunnel {}", params.tunnel_id)),
            }
        };

        match event {
            Ok(event) => {
                self.events.publish(event);
                self.handle.complete_with(cbt, "Peer MAC added", true);
            }
            Err(msg) => self.handle.complete_with(cbt, msg, false),
        }
    }

    /// Always succeeds and always announces the removal.
    fn req_remove_tunnel(&mut self, cbt: Cbt) {
        let params: RemoveParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };

        let tap_name = match self.tunnels.lock().remove(&params.tunnel_id) {
            Some(tunnel) => {
                if tunnel.state != TunnelState::Online {
                    tracing::warn!(
                        tunnel = %params.tunnel_id,
                        state = %tunnel.state,
                        "Removing a tunnel that is not online"
                    );
                }
                tunnel.tap_name
            }
            // No record; still remove the interface if one lingers.
            None => Some(self.tap_name(&params.overlay_id, &params.peer_id)),
        };

        if let Some(tap_name) = tap_name.clone() {
            self.remove_tap(tap_name);
        }

        self.handle
            .complete_with(cbt, format!("Tunnel deleted {}", params.tunnel_id), true);
        self.events.publish(
            TunnelEvent::new(
                TunnelEventKind::Removed,
                params.overlay_id,
                params.peer_id,
                params.tunnel_id,
            )
            .with_tap(tap_name),
        );
    }

    /// Node B: the initiator failed mid-handshake and cancels us.
    fn req_abort_tunnel(&mut self, cbt: Cbt) {
        let params: RemoveParams = match cbt.params() {
            Ok(params) => params,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Insufficient parameters: {e}"), false);
                return;
            }
        };

        tracing::info!(
            tunnel = %params.tunnel_id,
            peer = %params.peer_id.brief(),
            "Removing aborted tunnel"
        );

        match self.tunnels.lock().remove(&params.tunnel_id) {
            Some(tunnel) => {
                if let Some(tap_name) = tunnel.tap_name.clone() {
                    self.remove_tap(tap_name);
                }
                if matches!(tunnel.state, TunnelState::Authorized | TunnelState::Creating) {
                    self.events.publish(
                        TunnelEvent::new(
                            TunnelEventKind::AuthExpired,
                            tunnel.overlay_id,
                            tunnel.peer_id,
                            params.tunnel_id,
                        )
                        .with_tap(tunnel.tap_name),
                    );
                }
            }
            None => {
                // Still remove the interface if one lingers.
                self.remove_tap(self.tap_name(&params.overlay_id, &params.peer_id));
            }
        }

        self.handle
            .complete_with(cbt, format!("Tunnel aborted: {}", params.tunnel_id), true);
    }

    /// Drops the record and its interface; fails `parent` when present.
    fn rollback(&mut self, tunnel_id: TunnelId, parent: Option<Cbt>, reason: serde_json::Value) {
        if let Some(tunnel) = self.tunnels.lock().remove(&tunnel_id) {
            if let Some(tap_name) = tunnel.tap_name {
                self.remove_tap(tap_name);
            }
        }

        if let Some(parent) = parent {
            self.handle.complete_with(parent, reason, false);
        }
    }

    /// Node A: a data-plane or remote step failed after the peer may already
    /// have allocated state; cancel it explicitly.
    fn cancel_peer(&self, overlay_id: OverlayId, peer_id: NodeId, tunnel_id: TunnelId) {
        let act = RemoteAction::new(
            overlay_id.clone(),
            peer_id.clone(),
            names::GENEVE_TUNNEL,
            names::ABORT_TUNNEL,
            RemoveParams {
                overlay_id,
                peer_id,
                tunnel_id,
            },
        );
        // Fire-and-forget: the eventual completion is freed in the response
        // handler.
        let cbt = self.handle.create(names::SIGNALLING, names::REMOTE_ACTION, act);
        self.handle.submit(cbt);
    }

    fn resp_remote_action(&mut self, cbt: Cbt) {
        let parent = self.handle.take_parent(cbt.parent);
        let Ok(act) = cbt.params::<RemoteAction>() else {
            tracing::warn!("Remote action response without a readable request");
            return;
        };

        if !cbt.ok() || parent.is_none() {
            if let Ok(TunnelRef { tunnel_id }) = act.request_params::<TunnelRef>() {
                tracing::warn!(
                    tunnel = %tunnel_id,
                    action = %act.action,
                    "Remote action failed or the parent expired"
                );
                self.rollback(tunnel_id, parent, cbt.response_data().clone());
            }
            return;
        }

        let Ok(completed) = serde_json::from_value::<RemoteAction>(cbt.response_data().clone())
        else {
            tracing::warn!("Remote completion carries no action payload");
            return;
        };

        match completed.action.as_str() {
            names::EXCHANGE_ENDPOINT => self.on_endpoint_exchanged(completed, parent),
            names::UPDATE_PEER_MAC => self.on_peer_mac_updated(completed, parent),
            names::ABORT_TUNNEL => {} // Freed; nothing left to do.
            other => tracing::warn!(action = %other, "Unsupported remote action completion"),
        }
    }

    /// Node A: the responder's endpoint data arrived; bind our interface.
    fn on_endpoint_exchanged(&mut self, completed: RemoteAction, parent: Option<Cbt>) {
        let reply = match completed.reply_data::<ExchangeEndptReply>() {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Malformed endpoint exchange reply: {e}");
                let tunnel_id = completed
                    .request_params::<ExchangeEndptParams>()
                    .map(|p| p.tunnel_id);
                if let Ok(tunnel_id) = tunnel_id {
                    self.cancel_peer(
                        completed.overlay_id.clone(),
                        completed.recipient_id.clone(),
                        tunnel_id,
                    );
                    self.rollback(
                        tunnel_id,
                        parent,
                        serde_json::Value::String("Malformed endpoint exchange reply".to_owned()),
                    );
                }
                return;
            }
        };

        let tap_name = {
            let mut tunnels = self.tunnels.lock();
            match tunnels.get_mut(&reply.tunnel_id) {
                Some(tunnel) => {
                    tunnel.peer_mac = reply.mac.clone();
                    tunnel.tap_name.clone()
                }
                None => None,
            }
        };

        let Some(parent) = parent else {
            // Originating request expired while the peer answered; undo both
            // sides.
            self.cancel_peer(
                completed.overlay_id.clone(),
                completed.recipient_id.clone(),
                reply.tunnel_id,
            );
            self.rollback(reply.tunnel_id, None, serde_json::Value::Null);
            return;
        };

        let Some(tap_name) = tap_name else {
            self.handle
                .complete_with(parent, "Tunnel creation timeout failure", false);
            return;
        };

        self.handle.submit_chained(
            names::GENEVE_DATAPLANE,
            names::DP_CREATE_TAP,
            CreateTapParams {
                overlay_id: completed.overlay_id.clone(),
                tunnel_id: reply.tunnel_id,
                tap_name,
                vnid: reply.vnid,
                remote_address: reply.end_point_address,
            },
            parent,
        );
    }

    /// Node A: the responder accepted our MAC; the tunnel is up.
    fn on_peer_mac_updated(&mut self, completed: RemoteAction, parent: Option<Cbt>) {
        let Ok(params) = completed.request_params::<UpdateMacParams>() else {
            tracing::warn!("Malformed MAC update completion");
            return;
        };

        let event = {
            let mut tunnels = self.tunnels.lock();
            tunnels.get_mut(&params.tunnel_id).map(|tunnel| {
                tunnel.state = TunnelState::Online;
                TunnelEvent::connected(
                    tunnel.overlay_id.clone(),
                    tunnel.peer_id.clone(),
                    params.tunnel_id,
                    tunnel.tap_name.clone(),
                    tunnel.mac.clone(),
                    tunnel.peer_mac.clone(),
                    DataplaneKind::Geneve,
                    Utc::now(),
                )
            })
        };

        match event {
            Some(event) => {
                self.events.publish(event);
                if let Some(parent) = parent {
                    self.handle.complete_with(parent, "Tunnel created", true);
                }
            }
            None => {
                if let Some(parent) = parent {
                    self.handle
                        .complete_with(parent, "Tunnel creation timeout failure", false);
                }
            }
        }
    }

    fn resp_create_tap(&mut self, cbt: Cbt) {
        let parent = self.handle.take_parent(cbt.parent);
        let Ok(params) = cbt.params::<CreateTapParams>() else {
            tracing::warn!("Interface creation response without a readable request");
            return;
        };

        let Some(parent) = parent else {
            // Cancelled while the engine worked; undo the allocation.
            self.rollback(params.tunnel_id, None, serde_json::Value::Null);
            return;
        };

        if !cbt.ok() {
            tracing::warn!(
                tunnel = %params.tunnel_id,
                "Failed to create kernel interface: {:?}",
                cbt.response_data()
            );
            let reason = cbt.response_data().clone();
            match parent.request.action.as_str() {
                // Node A: the responder holds half a tunnel now; cancel it.
                names::CREATE_TUNNEL => {
                    if let Some(tunnel) = self.tunnels.lock().get(&params.tunnel_id) {
                        self.cancel_peer(
                            tunnel.overlay_id.clone(),
                            tunnel.peer_id.clone(),
                            params.tunnel_id,
                        );
                    }
                    self.rollback(params.tunnel_id, Some(parent), reason);
                }
                _ => self.rollback(params.tunnel_id, Some(parent), reason),
            }
            return;
        }

        let Ok(descriptor) = serde_json::from_value::<TapDescriptor>(cbt.response_data().clone())
        else {
            self.rollback(
                params.tunnel_id,
                Some(parent),
                serde_json::Value::String("Malformed interface descriptor".to_owned()),
            );
            return;
        };

        {
            let mut tunnels = self.tunnels.lock();
            if let Some(tunnel) = tunnels.get_mut(&params.tunnel_id) {
                tunnel.mac = Some(descriptor.mac.clone());
            }
        }

        match parent.request.action.as_str() {
            // Node B: answer the initiator with our endpoint data.
            names::EXCHANGE_ENDPOINT => {
                let Some(end_point_address) = self
                    .cfg
                    .overlays
                    .get(&params.overlay_id)
                    .and_then(|o| o.end_point_address)
                else {
                    self.rollback(
                        params.tunnel_id,
                        Some(parent),
                        serde_json::Value::String(format!(
                            "No endpoint address configured for overlay {}",
                            params.overlay_id
                        )),
                    );
                    return;
                };

                self.handle.complete_with(
                    parent,
                    ExchangeEndptReply {
                        tunnel_id: params.tunnel_id,
                        vnid: params.vnid,
                        node_id: self.cfg.node_id.clone(),
                        end_point_address,
                        mac: Some(descriptor.mac),
                        dataplane: DataplaneKind::Geneve,
                    },
                    true,
                );
            }
            // Node A: our interface is up; hand the responder our MAC.
            names::CREATE_TUNNEL => match self.peer_of(params.tunnel_id) {
                Some(peer_id) => {
                    RemoteAction::new(
                        params.overlay_id.clone(),
                        peer_id,
                        names::GENEVE_TUNNEL,
                        names::UPDATE_PEER_MAC,
                        UpdateMacParams {
                            overlay_id: params.overlay_id.clone(),
                            tunnel_id: params.tunnel_id,
                            node_id: self.cfg.node_id.clone(),
                            mac: descriptor.mac,
                        },
                    )
                    .submit(&self.handle, parent);
                }
                None => {
                    self.handle
                        .complete_with(parent, "Tunnel creation timeout failure", false);
                }
            },
            other => {
                tracing::warn!(action = %other, "Interface created for an unexpected operation");
                self.handle.complete_with(parent, (), true);
            }
        }
    }

    fn peer_of(&self, tunnel_id: TunnelId) -> Option<NodeId> {
        self.tunnels.lock().get(&tunnel_id).map(|t| t.peer_id.clone())
    }
}

impl ControllerModule for KernelTunnels {
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
            names::DP_CREATE_TAP => self.resp_create_tap(cbt),
            names::DP_REMOVE_TAP => {} // Best-effort cleanup; freed.
            other => {
                tracing::debug!(action = %other, "Releasing unexpected response");
            }
        }
    }

    fn handle_abort(&mut self, cbt: Cbt) {
        // A parent above us was cancelled; release whatever the operation
        // had allocated.
        let tunnel_id = match cbt.request.action.as_str() {
            names::REMOTE_ACTION => cbt
                .params::<RemoteAction>()
                .ok()
                .and_then(|act| act.request_params::<ExchangeEndptParams>().ok())
                .map(|p| p.tunnel_id),
            names::DP_CREATE_TAP => cbt.params::<CreateTapParams>().ok().map(|p| p.tunnel_id),
            _ => None,
        };

        if let Some(tunnel_id) = tunnel_id {
            tracing::info!(tunnel = %tunnel_id, "Releasing aborted tunnel operation");
            self.rollback(tunnel_id, None, serde_json::Value::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use weft_broker::{spawn_module, Nexus, Subscription};
    use weft_model::TunnelEventKind;

    const TICK: Duration = Duration::from_millis(20);

    /// Stands in for the kernel engine: creates and removes interfaces.
    struct StubDataplane {
        handle: ModuleHandle,
        calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        fail_create_tap: Arc<AtomicBool>,
    }

    impl ControllerModule for StubDataplane {
        fn handle_request(&mut self, cbt: Cbt) {
            self.calls
                .lock()
                .push((cbt.request.action.clone(), cbt.request.params.clone()));

            match cbt.request.action.as_str() {
                names::DP_CREATE_TAP => {
                    if self.fail_create_tap.load(Ordering::Relaxed) {
                        self.handle
                            .complete_with(cbt, "interface creation failed", false);
                    } else {
                        self.handle.complete_with(
                            cbt,
                            serde_json::json!({"MAC": "aa:bb:cc:00:00:01"}),
                            true,
                        );
                    }
                }
                names::DP_REMOVE_TAP => self.handle.complete_with(cbt, (), true),
                other => {
                    let msg = format!("Unsupported engine action: {other}");
                    self.handle.complete_with(cbt, msg, false);
                }
            }
        }

        fn handle_response(&mut self, _: Cbt) {}
    }

    /// Answers remote actions the way a healthy responder would.
    struct ScriptedSignal {
        handle: ModuleHandle,
        actions: Arc<Mutex<Vec<String>>>,
    }

    impl ControllerModule for ScriptedSignal {
        fn handle_request(&mut self, cbt: Cbt) {
            let Ok(mut act) = cbt.params::<RemoteAction>() else {
                self.handle.complete_with(cbt, "not a remote action", false);
                return;
            };
            self.actions.lock().push(act.action.clone());

            match act.action.as_str() {
                names::EXCHANGE_ENDPOINT => {
                    let params = act.request_params::<ExchangeEndptParams>().unwrap();
                    act.data = Some(
                        serde_json::to_value(ExchangeEndptReply {
                            tunnel_id: params.tunnel_id,
                            vnid: params.vnid,
                            node_id: NodeId::from("nodeB"),
                            end_point_address: "10.0.0.2".parse().unwrap(),
                            mac: Some("aa:bb:cc:00:00:02".into()),
                            dataplane: DataplaneKind::Geneve,
                        })
                        .unwrap(),
                    );
                    act.status = Some(true);
                    self.handle.complete_with(cbt, act, true);
                }
                _ => {
                    act.status = Some(true);
                    self.handle.complete_with(cbt, act, true);
                }
            }
        }

        fn handle_response(&mut self, _: Cbt) {}
    }

    struct Rig {
        caller: ModuleHandle,
        responses: mpsc::UnboundedReceiver<Cbt>,
        events: Subscription<TunnelEvent>,
        dp_calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        fail_create_tap: Arc<AtomicBool>,
        remote_actions: Arc<Mutex<Vec<String>>>,
        timed: Arc<TimedTransactions>,
    }

    fn rig(setup_timeout: Duration) -> Rig {
        let nexus = Nexus::new();
        let timed = Arc::new(TimedTransactions::new(TICK));
        timed.start();

        let mut overlays = HashMap::new();
        overlays.insert(
            OverlayId::from("ol001"),
            KernelOverlayConfig {
                tap_name_prefix: None,
                end_point_address: Some("10.0.0.1".parse().unwrap()),
            },
        );

        let (handle, inbox) = nexus.register(names::GENEVE_TUNNEL);
        let manager = KernelTunnels::new(
            handle,
            KernelConfig {
                node_id: NodeId::from("nodeA"),
                setup_timeout,
                overlays,
            },
            timed.clone(),
        );
        let events = manager.events_publisher().subscribe();
        spawn_module(inbox, manager);

        let dp_calls = Arc::new(Mutex::new(Vec::new()));
        let fail_create_tap = Arc::new(AtomicBool::new(false));
        let (dp_handle, dp_inbox) = nexus.register(names::GENEVE_DATAPLANE);
        spawn_module(
            dp_inbox,
            StubDataplane {
                handle: dp_handle,
                calls: dp_calls.clone(),
                fail_create_tap: fail_create_tap.clone(),
            },
        );

        let remote_actions = Arc::new(Mutex::new(Vec::new()));
        let (sig_handle, sig_inbox) = nexus.register(names::SIGNALLING);
        spawn_module(
            sig_inbox,
            ScriptedSignal {
                handle: sig_handle,
                actions: remote_actions.clone(),
            },
        );

        let (caller, caller_inbox) = nexus.register("caller");
        let (resp_tx, responses) = mpsc::unbounded_channel();
        struct Caller {
            responses: mpsc::UnboundedSender<Cbt>,
        }
        impl ControllerModule for Caller {
            fn handle_request(&mut self, _: Cbt) {}
            fn handle_response(&mut self, cbt: Cbt) {
                self.responses.send(cbt).unwrap();
            }
        }
        spawn_module(caller_inbox, Caller { responses: resp_tx });

        Rig {
            caller,
            responses,
            events,
            dp_calls,
            fail_create_tap,
            remote_actions,
            timed,
        }
    }

    async fn recv(responses: &mut mpsc::UnboundedReceiver<Cbt>) -> Cbt {
        tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("bus closed")
    }

    async fn recv_event(events: &mut Subscription<TunnelEvent>) -> TunnelEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("publisher closed")
    }

    fn auth(tunnel_id: TunnelId) -> AuthParams {
        AuthParams {
            overlay_id: OverlayId::from("ol001"),
            peer_id: NodeId::from("nodeB"),
            tunnel_id,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn responder_exchanges_endpoint_and_comes_online() {
        let mut rig = rig(Duration::from_secs(30));
        let tunnel_id = TunnelId::from_u128(1);

        rig.caller
            .submit_new(names::GENEVE_TUNNEL, names::AUTH_TUNNEL, auth(tunnel_id));
        assert!(recv(&mut rig.responses).await.ok());
        assert_eq!(
            recv_event(&mut rig.events).await.kind,
            TunnelEventKind::Authorized
        );

        // A second authorization for the same tunnel id is refused.
        rig.caller
            .submit_new(names::GENEVE_TUNNEL, names::AUTH_TUNNEL, auth(tunnel_id));
        assert!(!recv(&mut rig.responses).await.ok());

        // The initiator's endpoint arrives.
        rig.caller.submit_new(
            names::GENEVE_TUNNEL,
            names::EXCHANGE_ENDPOINT,
            ExchangeEndptParams {
                overlay_id: OverlayId::from("ol001"),
                tunnel_id,
                vnid: 42,
                node_id: NodeId::from("nodeB"),
                end_point_address: "10.0.0.2".parse().unwrap(),
            },
        );
        let reply = recv(&mut rig.responses).await;
        assert!(reply.ok());
        let endpoint =
            serde_json::from_value::<ExchangeEndptReply>(reply.response_data().clone()).unwrap();
        assert_eq!(endpoint.mac, Some("aa:bb:cc:00:00:01".into()));
        assert_eq!(endpoint.end_point_address, "10.0.0.1".parse::<IpAddr>().unwrap());

        // The interface was bound to the initiator's address, under the
        // deterministic name.
        {
            let calls = rig.dp_calls.lock();
            let create = calls
                .iter()
                .find(|(action, _)| action == names::DP_CREATE_TAP)
                .map(|(_, params)| params.clone())
                .unwrap();
            assert_eq!(create["TapName"], "ol001nodeB");
            assert_eq!(create["RemoteAddress"], "10.0.0.2");
            assert_eq!(create["VNId"], 42);
        }

        // The initiator's MAC completes the handshake.
        rig.caller.submit_new(
            names::GENEVE_TUNNEL,
            names::UPDATE_PEER_MAC,
            UpdateMacParams {
                overlay_id: OverlayId::from("ol001"),
                tunnel_id,
                node_id: NodeId::from("nodeB"),
                mac: "aa:bb:cc:00:00:02".into(),
            },
        );
        assert!(recv(&mut rig.responses).await.ok());

        let connected = recv_event(&mut rig.events).await;
        assert_eq!(connected.kind, TunnelEventKind::Connected);
        assert_eq!(connected.mac, Some("aa:bb:cc:00:00:01".into()));
        assert_eq!(connected.peer_mac, Some("aa:bb:cc:00:00:02".into()));
        assert!(connected.connected_at.is_some());
        assert!(rig.events.try_recv().is_none());
        rig.timed.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initiator_completes_the_handshake() {
        let mut rig = rig(Duration::from_secs(30));
        let tunnel_id = TunnelId::from_u128(2);

        let tag = rig.caller.submit_new(
            names::GENEVE_TUNNEL,
            names::CREATE_TUNNEL,
            CreateParams {
                overlay_id: OverlayId::from("ol001"),
                peer_id: NodeId::from("nodeB"),
                tunnel_id,
                vnid: 42,
            },
        );

        let response = recv(&mut rig.responses).await;
        assert_eq!(response.tag, tag);
        assert!(response.ok());

        let connected = recv_event(&mut rig.events).await;
        assert_eq!(connected.kind, TunnelEventKind::Connected);
        assert_eq!(connected.peer_mac, Some("aa:bb:cc:00:00:02".into()));
        assert!(rig.events.try_recv().is_none());

        assert_eq!(
            *rig.remote_actions.lock(),
            vec![
                names::EXCHANGE_ENDPOINT.to_owned(),
                names::UPDATE_PEER_MAC.to_owned()
            ]
        );
        rig.timed.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initiator_cancels_the_peer_when_its_own_interface_fails() {
        let mut rig = rig(Duration::from_secs(30));
        let tunnel_id = TunnelId::from_u128(3);
        rig.fail_create_tap.store(true, Ordering::Relaxed);

        let tag = rig.caller.submit_new(
            names::GENEVE_TUNNEL,
            names::CREATE_TUNNEL,
            CreateParams {
                overlay_id: OverlayId::from("ol001"),
                peer_id: NodeId::from("nodeB"),
                tunnel_id,
                vnid: 42,
            },
        );

        let response = recv(&mut rig.responses).await;
        assert_eq!(response.tag, tag);
        assert!(!response.ok());

        // The peer is explicitly cancelled and the record is gone.
        let actions = rig.remote_actions.lock().clone();
        assert!(actions.contains(&names::ABORT_TUNNEL.to_owned()));

        rig.caller.submit_new(
            names::GENEVE_TUNNEL,
            names::UPDATE_PEER_MAC,
            UpdateMacParams {
                overlay_id: OverlayId::from("ol001"),
                tunnel_id,
                node_id: NodeId::from("nodeB"),
                mac: "aa:bb:cc:00:00:02".into(),
            },
        );
        assert!(!recv(&mut rig.responses).await.ok());
        rig.timed.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn authorized_tunnel_expiry_is_announced() {
        let mut rig = rig(Duration::from_millis(40));
        let tunnel_id = TunnelId::from_u128(4);

        rig.caller
            .submit_new(names::GENEVE_TUNNEL, names::AUTH_TUNNEL, auth(tunnel_id));
        assert!(recv(&mut rig.responses).await.ok());
        assert_eq!(
            recv_event(&mut rig.events).await.kind,
            TunnelEventKind::Authorized
        );

        let expired = recv_event(&mut rig.events).await;
        assert_eq!(expired.kind, TunnelEventKind::AuthExpired);
        assert_eq!(expired.tunnel_id, tunnel_id);
        rig.timed.terminate();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_always_announces_even_without_a_record() {
        let mut rig = rig(Duration::from_secs(30));
        let tunnel_id = TunnelId::from_u128(5);

        rig.caller.submit_new(
            names::GENEVE_TUNNEL,
            names::REMOVE_TUNNEL,
            RemoveParams {
                overlay_id: OverlayId::from("ol001"),
                peer_id: NodeId::from("nodeB"),
                tunnel_id,
            },
        );
        assert!(recv(&mut rig.responses).await.ok());

        let removed = recv_event(&mut rig.events).await;
        assert_eq!(removed.kind, TunnelEventKind::Removed);
        assert_eq!(removed.tap_name.as_ref().map(|t| t.as_str()), Some("ol001nodeB"));

        // The lingering interface was removed regardless.
        assert!(rig
            .dp_calls
            .lock()
            .iter()
            .any(|(action, _)| action == names::DP_REMOVE_TAP));
        rig.timed.terminate();
    }
}
