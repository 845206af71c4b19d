use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use rand::Rng as _;
use serde::{Deserialize, Serialize};

use weft_broker::{names, Cbt, CbtTag, ControllerModule, HandlerTable, ModuleHandle, Publisher, RemoteAction};
use weft_model::{NodeId, OverlayId};

use crate::cache::JidCache;
use crate::transport::{PresenceTransport, TransportContext, TransportFactory};
use crate::wire::{MessageKind, PeerAddress, PresenceStatus};

/// Internal: a remote action received off the wire, posted by the transport.
pub(crate) const INBOUND_REMOTE_ACTION: &str = "inbound_remote_action";
/// Internal: periodic maintenance, posted by [`spawn_maintenance`].
pub(crate) const MAINTENANCE_TICK: &str = "maintenance_tick";

/// A peer was seen on the presence service.
#[derive(Debug, Clone)]
pub struct PresenceUpdate {
    pub overlay_id: OverlayId,
    pub peer_id: NodeId,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ActKind {
    #[serde(rename = "invk")]
    Invoke,
    #[serde(rename = "cmpt")]
    Complete,
}

impl From<ActKind> for MessageKind {
    fn from(kind: ActKind) -> Self {
        match kind {
            ActKind::Invoke => MessageKind::Invoke,
            ActKind::Complete => MessageKind::Complete,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PeerAddressUpdated {
    pub overlay_id: OverlayId,
    pub peer_id: NodeId,
    pub peer_address: PeerAddress,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct InboundRemoteAction {
    pub kind: ActKind,
    pub action: RemoteAction,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub node_id: NodeId,
    pub presence_interval: Duration,
    pub cache_expiry: Duration,
    pub request_timeout: Duration,
}

/// The signalling controller module.
///
/// Owns the per-overlay transports, the per-peer outgoing queues and the
/// table of inbound invocations awaiting local completion. Remote actions
/// whose peer address is unknown are queued and a `uid?` probe goes out; the
/// queue drains FIFO as soon as the address resolves.
pub struct Signal {
    handle: ModuleHandle,
    cfg: SignalConfig,
    presence: Publisher<PresenceUpdate>,
    factory: Box<dyn TransportFactory>,
    overlays: HashMap<OverlayId, OverlayChannel>,
    /// Inbound invocations keyed by the tag of the local operation that will
    /// complete them.
    remote_acts: HashMap<CbtTag, RemoteAction>,
}

struct OverlayChannel {
    transport: Box<dyn PresenceTransport>,
    jid_cache: Arc<JidCache>,
    outgoing: HashMap<NodeId, VecDeque<QueuedAct>>,
    announce_at: Instant,
}

struct QueuedAct {
    kind: ActKind,
    act: RemoteAction,
    queued_at: Instant,
}

static REQ_HANDLERS: LazyLock<HandlerTable<Signal>> = LazyLock::new(|| {
    let mut table = HandlerTable::default();
    table.insert(names::REMOTE_ACTION, Signal::req_remote_action);
    table.insert(names::PEER_ADDRESS_UPDATED, Signal::req_peer_address_updated);
    table.insert(names::QUERY_REPORTING_DATA, Signal::req_query_reporting_data);
    table.insert(INBOUND_REMOTE_ACTION, Signal::req_inbound_remote_action);
    table.insert(MAINTENANCE_TICK, Signal::req_maintenance_tick);
    table
});

impl Signal {
    pub fn new(handle: ModuleHandle, cfg: SignalConfig, factory: Box<dyn TransportFactory>) -> Self {
        Self {
            handle,
            cfg,
            presence: Publisher::new(),
            factory,
            overlays: HashMap::new(),
            remote_acts: HashMap::new(),
        }
    }

    /// The topic carrying peer presence notifications.
    pub fn presence_publisher(&self) -> Publisher<PresenceUpdate> {
        self.presence.clone()
    }

    /// Brings up the transport for one overlay.
    pub fn add_overlay(&mut self, overlay_id: OverlayId) -> anyhow::Result<()> {
        let jid_cache = Arc::new(JidCache::new(self.cfg.cache_expiry));
        let transport = self.factory.spawn(TransportContext {
            overlay_id: overlay_id.clone(),
            node_id: self.cfg.node_id.clone(),
            jid_cache: jid_cache.clone(),
            presence: self.presence.clone(),
            controller: self.handle.clone(),
        })?;

        // Spread initial announcements out so a fleet booting together does
        // not stampede the service.
        let announce_at =
            Instant::now() + self.cfg.presence_interval * rand::thread_rng().gen_range(1..=3u32);

        self.overlays.insert(
            overlay_id,
            OverlayChannel {
                transport,
                jid_cache,
                outgoing: HashMap::new(),
                announce_at,
            },
        );

        Ok(())
    }

    /// Asks every transport to disconnect.
    pub fn terminate(&mut self) {
        for channel in self.overlays.values() {
            channel.transport.shutdown();
        }
        tracing::info!("Signalling module terminating");
    }

    fn req_remote_action(&mut self, cbt: Cbt) {
        let mut act = match cbt.params::<RemoteAction>() {
            Ok(act) => act,
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Malformed remote action: {e}"), false);
                return;
            }
        };

        if !self.overlays.contains_key(&act.overlay_id) {
            self.handle.complete_with(cbt, "Overlay ID not found", false);
            return;
        }

        act.initiator_id = Some(self.cfg.node_id.clone());
        act.initiator_cm = Some(cbt.request.initiator.clone());
        act.action_tag = Some(cbt.tag);

        let peer_id = act.recipient_id.clone();
        let overlay_id = act.overlay_id.clone();
        // The originating cbt stays pending until the completion comes back
        // over the wire (or the scavenger gives up on it).
        self.transmit(&overlay_id, &peer_id, act, ActKind::Invoke);
    }

    /// Sends `act` to `peer_id`, queueing it and probing for the address if
    /// the peer is not yet resolved.
    fn transmit(&mut self, overlay_id: &OverlayId, peer_id: &NodeId, act: RemoteAction, kind: ActKind) {
        let now = Instant::now();
        let Some(channel) = self.overlays.get_mut(overlay_id) else {
            tracing::warn!(overlay = %overlay_id.brief(), "Cannot transmit on unknown overlay");
            return;
        };

        match channel.jid_cache.lookup(peer_id, now) {
            None => {
                channel
                    .outgoing
                    .entry(peer_id.clone())
                    .or_default()
                    .push_back(QueuedAct {
                        kind,
                        act,
                        queued_at: now,
                    });
                channel
                    .transport
                    .send_presence(PresenceStatus::UidQuery(peer_id.clone()), None);
            }
            Some(address) => {
                // The address may have arrived through a presence update we
                // have not processed yet; keep the per-peer FIFO order.
                Self::drain_queue(channel, peer_id, &address);
                Self::send_act(channel, &address, &act, kind);
                tracing::debug!(peer = %peer_id.brief(), "Sent remote action");
            }
        }
    }

    fn send_act(channel: &OverlayChannel, address: &PeerAddress, act: &RemoteAction, kind: ActKind) {
        let body = match serde_json::to_string(act) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Unserializable remote action: {e}");
                return;
            }
        };

        channel
            .transport
            .send_message(address.clone(), kind.into(), body);
    }

    fn drain_queue(channel: &mut OverlayChannel, peer_id: &NodeId, address: &PeerAddress) {
        let Some(queue) = channel.outgoing.remove(peer_id) else {
            return;
        };

        for entry in queue {
            Self::send_act(channel, address, &entry.act, entry.kind);
            tracing::debug!(peer = %peer_id.brief(), "Sent queued remote action");
        }
    }

    fn req_peer_address_updated(&mut self, cbt: Cbt) {
        match cbt.params::<PeerAddressUpdated>() {
            Ok(update) => {
                if let Some(channel) = self.overlays.get_mut(&update.overlay_id) {
                    Self::drain_queue(channel, &update.peer_id, &update.peer_address);
                }
                self.handle.complete_with(cbt, (), true);
            }
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Malformed address update: {e}"), false);
            }
        }
    }

    fn req_inbound_remote_action(&mut self, cbt: Cbt) {
        match cbt.params::<InboundRemoteAction>() {
            Ok(inbound) => {
                match inbound.kind {
                    ActKind::Invoke => self.invoke_on_target(inbound.action),
                    ActKind::Complete => self.complete_on_initiator(inbound.action),
                }
                self.handle.complete_with(cbt, (), true);
            }
            Err(e) => {
                self.handle
                    .complete_with(cbt, format!("Malformed inbound action: {e}"), false);
            }
        }
    }

    /// Turns a received invocation into a local operation on the bus.
    fn invoke_on_target(&mut self, act: RemoteAction) {
        // The service fans messages out to every session of an offline
        // address; verify we really are the recipient.
        if act.recipient_id != self.cfg.node_id {
            tracing::warn!(
                recipient = %act.recipient_id.brief(),
                "A mis-delivered remote action was discarded"
            );
            return;
        }

        let recipient_cm = act.recipient_cm.clone();
        let action = act.action.clone();
        let child = self.handle.create(&recipient_cm, &action, act.params.clone());
        self.remote_acts.insert(child.tag, act);
        self.handle.submit(child);
    }

    /// Resolves the local operation that is waiting on a received completion.
    fn complete_on_initiator(&mut self, act: RemoteAction) {
        if act.initiator_id.as_ref() != Some(&self.cfg.node_id) {
            tracing::warn!(
                initiator = ?act.initiator_id,
                "A mis-delivered remote action was discarded"
            );
            return;
        }

        let Some(tag) = act.action_tag else {
            tracing::warn!("Remote completion without a correlation tag");
            return;
        };
        let status = act.status.unwrap_or(false);

        self.handle.complete_pending(tag, &act, status);
    }

    fn req_query_reporting_data(&mut self, cbt: Cbt) {
        let report = self
            .overlays
            .iter()
            .map(|(overlay_id, channel)| {
                (
                    overlay_id.clone(),
                    serde_json::json!({
                        "host": channel.transport.host(),
                        "address": channel.transport.self_addr(),
                    }),
                )
            })
            .collect::<HashMap<_, _>>();

        self.handle.complete_with(cbt, report, true);
    }

    fn req_maintenance_tick(&mut self, cbt: Cbt) {
        let now = Instant::now();

        let dead = self
            .overlays
            .iter()
            .filter(|(_, channel)| !channel.transport.is_alive())
            .map(|(overlay_id, _)| overlay_id.clone())
            .collect::<Vec<_>>();
        for overlay_id in dead {
            tracing::warn!(overlay = %overlay_id.brief(), "Transport died; re-initialising overlay");
            self.overlays.remove(&overlay_id);
            if let Err(e) = self.add_overlay(overlay_id.clone()) {
                tracing::error!(overlay = %overlay_id.brief(), "Failed to re-initialise overlay: {e:#}");
            }
        }

        let mut expired = Vec::new();
        for (overlay_id, channel) in &mut self.overlays {
            if now >= channel.announce_at {
                channel
                    .transport
                    .send_presence(PresenceStatus::Ident(self.cfg.node_id.clone()), None);
                channel.announce_at =
                    now + self.cfg.presence_interval * rand::thread_rng().gen_range(2..=20u32);
            }

            channel.jid_cache.scavenge(now);

            // A queue whose oldest entry ran out of patience is dropped as a
            // whole: the peer is not reachable.
            let request_timeout = self.cfg.request_timeout;
            let unreachable = channel
                .outgoing
                .iter()
                .filter(|(_, queue)| {
                    queue
                        .front()
                        .is_some_and(|e| now.duration_since(e.queued_at) >= request_timeout)
                })
                .map(|(peer_id, _)| peer_id.clone())
                .collect::<Vec<_>>();

            for peer_id in unreachable {
                let Some(queue) = channel.outgoing.remove(&peer_id) else {
                    continue;
                };
                tracing::debug!(
                    peer = %peer_id.brief(),
                    overlay = %overlay_id.brief(),
                    qlen = queue.len(),
                    "Scavenging undeliverable remote actions"
                );
                for entry in queue {
                    expired.push(entry);
                }
            }
        }

        for entry in expired {
            if entry.kind == ActKind::Invoke {
                if let Some(tag) = entry.act.action_tag {
                    self.handle
                        .complete_pending(tag, "The specified recipient was not found", false);
                }
            }
        }

        self.handle.scavenge_pending(self.cfg.request_timeout, now);
        self.handle.complete_with(cbt, (), true);
    }
}

impl ControllerModule for Signal {
    fn handle_request(&mut self, cbt: Cbt) {
        if let Err(cbt) = REQ_HANDLERS.dispatch(self, cbt) {
            let action = cbt.request.action.clone();
            self.handle
                .complete_with(cbt, format!("Unsupported action: {action}"), false);
        }
    }

    fn handle_response(&mut self, cbt: Cbt) {
        // A completed local invocation goes back over the wire to whoever
        // asked for it.
        let Some(mut act) = self.remote_acts.remove(&cbt.tag) else {
            return;
        };

        act.data = Some(cbt.response_data().clone());
        act.status = Some(cbt.ok());

        let Some(peer_id) = act.initiator_id.clone() else {
            tracing::warn!("Completed remote action has no initiator");
            return;
        };
        let overlay_id = act.overlay_id.clone();
        self.transmit(&overlay_id, &peer_id, act, ActKind::Complete);
    }
}

/// Posts a maintenance tick to the signalling module every `interval`.
pub fn spawn_maintenance(handle: ModuleHandle, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval is immediate; skip it.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            handle.submit_new(names::SIGNALLING, MAINTENANCE_TICK, ());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use weft_broker::{spawn_module, Nexus};

    #[derive(Default)]
    struct Recorded {
        presences: Vec<(PresenceStatus, Option<PeerAddress>)>,
        messages: Vec<(PeerAddress, MessageKind, String)>,
    }

    struct FakeTransport {
        recorded: Arc<Mutex<Recorded>>,
    }

    impl PresenceTransport for FakeTransport {
        fn send_presence(&self, status: PresenceStatus, to: Option<PeerAddress>) {
            self.recorded.lock().presences.push((status, to));
        }

        fn send_message(&self, to: PeerAddress, kind: MessageKind, body: String) {
            self.recorded.lock().messages.push((to, kind, body));
        }

        fn self_addr(&self) -> PeerAddress {
            PeerAddress::from("nodeA@test")
        }

        fn host(&self) -> String {
            "test".to_owned()
        }

        fn is_alive(&self) -> bool {
            true
        }

        fn shutdown(&self) {}
    }

    struct FakeFactory {
        recorded: Arc<Mutex<Recorded>>,
        caches: Arc<Mutex<HashMap<OverlayId, Arc<JidCache>>>>,
    }

    impl TransportFactory for FakeFactory {
        fn spawn(&self, ctx: TransportContext) -> anyhow::Result<Box<dyn PresenceTransport>> {
            self.caches.lock().insert(ctx.overlay_id, ctx.jid_cache);

            Ok(Box::new(FakeTransport {
                recorded: self.recorded.clone(),
            }))
        }
    }

    struct Rig {
        caller: ModuleHandle,
        responses: mpsc::UnboundedReceiver<Cbt>,
        recorded: Arc<Mutex<Recorded>>,
        caches: Arc<Mutex<HashMap<OverlayId, Arc<JidCache>>>>,
        nexus: Nexus,
    }

    fn rig(request_timeout: Duration) -> Rig {
        let nexus = Nexus::new();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let caches = Arc::new(Mutex::new(HashMap::new()));

        let (handle, inbox) = nexus.register(names::SIGNALLING);
        let mut signal = Signal::new(
            handle,
            SignalConfig {
                node_id: NodeId::from("nodeA"),
                presence_interval: Duration::from_secs(30),
                cache_expiry: Duration::from_secs(60),
                request_timeout,
            },
            Box::new(FakeFactory {
                recorded: recorded.clone(),
                caches: caches.clone(),
            }),
        );
        signal.add_overlay(OverlayId::from("ol001")).unwrap();
        spawn_module(inbox, signal);

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
            recorded,
            caches,
            nexus,
        }
    }

    fn act_to(peer: &str, action: &str) -> RemoteAction {
        RemoteAction::new(
            OverlayId::from("ol001"),
            NodeId::from(peer),
            names::LINK_TUNNEL,
            action,
            serde_json::json!({"TunnelId": "t"}),
        )
    }

    async fn eventually(f: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn unresolved_peer_is_probed_and_queue_drains_in_fifo_order() {
        let mut rig = rig(Duration::from_secs(120));

        rig.caller
            .submit_new(names::SIGNALLING, names::REMOTE_ACTION, act_to("nodeP", "one"));
        rig.caller
            .submit_new(names::SIGNALLING, names::REMOTE_ACTION, act_to("nodeP", "two"));

        let recorded = rig.recorded.clone();
        eventually(move || recorded.lock().presences.len() == 2).await;
        {
            let recorded = rig.recorded.lock();
            assert!(recorded.messages.is_empty());
            assert_eq!(
                recorded.presences[0].0,
                PresenceStatus::UidQuery(NodeId::from("nodeP"))
            );
        }

        // The peer shows up: the cache learns its address and the transport
        // posts an internal address update.
        let cache = rig.caches.lock()[&OverlayId::from("ol001")].clone();
        cache.add(
            NodeId::from("nodeP"),
            PeerAddress::from("nodeP@test"),
            Instant::now(),
        );
        rig.caller.submit_new(
            names::SIGNALLING,
            names::PEER_ADDRESS_UPDATED,
            PeerAddressUpdated {
                overlay_id: OverlayId::from("ol001"),
                peer_id: NodeId::from("nodeP"),
                peer_address: PeerAddress::from("nodeP@test"),
            },
        );

        let recorded = rig.recorded.clone();
        eventually(move || recorded.lock().messages.len() == 2).await;
        let recorded = rig.recorded.lock();
        let bodies = recorded
            .messages
            .iter()
            .map(|(to, kind, body)| {
                assert_eq!(to, &PeerAddress::from("nodeP@test"));
                assert_eq!(*kind, MessageKind::Invoke);
                serde_json::from_str::<RemoteAction>(body).unwrap().action
            })
            .collect::<Vec<_>>();
        assert_eq!(bodies, vec!["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test]
    async fn inbound_invoke_is_dispatched_locally_and_completed_over_the_wire() {
        let rig = rig(Duration::from_secs(120));

        // A local module that answers the invoked action.
        let (target_handle, target_inbox) = rig.nexus.register(names::LINK_TUNNEL);
        struct Target {
            handle: ModuleHandle,
        }
        impl ControllerModule for Target {
            fn handle_request(&mut self, cbt: Cbt) {
                self.handle
                    .complete_with(cbt, serde_json::json!({"LinkId": "l"}), true);
            }
            fn handle_response(&mut self, _: Cbt) {}
        }
        spawn_module(target_inbox, Target {
            handle: target_handle,
        });

        // The initiator's address is already cached, so the completion goes
        // straight out.
        let cache = rig.caches.lock()[&OverlayId::from("ol001")].clone();
        cache.add(
            NodeId::from("nodeB"),
            PeerAddress::from("nodeB@test"),
            Instant::now(),
        );

        let mut act = act_to("nodeA", "request_link_endpoint");
        act.initiator_id = Some(NodeId::from("nodeB"));
        act.initiator_cm = Some(names::LINK_TUNNEL.to_owned());
        act.action_tag = Some(CbtTag::for_test(77));
        rig.caller.submit_new(
            names::SIGNALLING,
            INBOUND_REMOTE_ACTION,
            InboundRemoteAction {
                kind: ActKind::Invoke,
                action: act,
            },
        );

        let recorded = rig.recorded.clone();
        eventually(move || !recorded.lock().messages.is_empty()).await;
        let recorded = rig.recorded.lock();
        let (to, kind, body) = &recorded.messages[0];
        assert_eq!(to, &PeerAddress::from("nodeB@test"));
        assert_eq!(*kind, MessageKind::Complete);
        let completed = serde_json::from_str::<RemoteAction>(body).unwrap();
        assert_eq!(completed.status, Some(true));
        assert_eq!(completed.data, Some(serde_json::json!({"LinkId": "l"})));
        assert_eq!(completed.action_tag, Some(CbtTag::for_test(77)));
    }

    #[tokio::test]
    async fn mis_delivered_invoke_is_discarded() {
        let rig = rig(Duration::from_secs(120));

        let (_, mut target_inbox) = rig.nexus.register(names::LINK_TUNNEL);

        let mut act = act_to("someone-else", "request_link_endpoint");
        act.initiator_id = Some(NodeId::from("nodeB"));
        rig.caller.submit_new(
            names::SIGNALLING,
            INBOUND_REMOTE_ACTION,
            InboundRemoteAction {
                kind: ActKind::Invoke,
                action: act,
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(target_inbox.try_recv(), Err(_)));
        assert!(rig.recorded.lock().messages.is_empty());
    }

    #[tokio::test]
    async fn scavenged_queue_fails_the_waiting_invocation() {
        let mut rig = rig(Duration::ZERO);

        let tag = rig.caller.submit_new(
            names::SIGNALLING,
            names::REMOTE_ACTION,
            act_to("nodeP", "one"),
        );

        let recorded = rig.recorded.clone();
        eventually(move || !recorded.lock().presences.is_empty()).await;

        rig.caller.submit_new(names::SIGNALLING, MAINTENANCE_TICK, ());

        let response = rig.responses.recv().await.unwrap();
        assert_eq!(response.tag, tag);
        assert!(!response.ok());
        assert_eq!(
            response.response_data(),
            &serde_json::json!("The specified recipient was not found")
        );
    }

    #[tokio::test]
    async fn remote_action_for_unknown_overlay_fails_fast() {
        let mut rig = rig(Duration::from_secs(120));

        let mut act = act_to("nodeP", "one");
        act.overlay_id = OverlayId::from("nope");
        let tag = rig
            .caller
            .submit_new(names::SIGNALLING, names::REMOTE_ACTION, act);

        let response = rig.responses.recv().await.unwrap();
        assert_eq!(response.tag, tag);
        assert!(!response.ok());
    }
}

