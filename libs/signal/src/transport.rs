use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use backoff::ExponentialBackoff;
use futures::future::{select, Either};
use tokio::sync::mpsc;

use weft_broker::{names, ModuleHandle, Publisher, RemoteAction};
use weft_logging::err_with_src;
use weft_model::{NodeId, OverlayId};

use crate::cache::JidCache;
use crate::channel::{Event, PresenceChannel};
use crate::controller::{ActKind, InboundRemoteAction, PeerAddressUpdated, PresenceUpdate};
use crate::session::SessionConfig;
use crate::wire::{AnnouncePayload, MessageKind, PeerAddress, PresenceStatus};

const RESOLVE_ATTEMPTS: usize = 5;
const RESOLVE_RETRY_INTERVAL: Duration = Duration::from_secs(4);

/// What the controller holds of an overlay's transport.
///
/// The task on the other side owns all session state; these calls post into
/// its command queue and are safe from any thread.
pub trait PresenceTransport: Send {
    fn send_presence(&self, status: PresenceStatus, to: Option<PeerAddress>);
    fn send_message(&self, to: PeerAddress, kind: MessageKind, body: String);
    fn self_addr(&self) -> PeerAddress;
    fn host(&self) -> String;
    /// False once the transport task has exited; the next maintenance tick
    /// re-initialises the overlay.
    fn is_alive(&self) -> bool;
    fn shutdown(&self);
}

/// What a transport needs from the rest of the node.
pub struct TransportContext {
    pub overlay_id: OverlayId,
    pub node_id: NodeId,
    pub jid_cache: Arc<JidCache>,
    pub presence: Publisher<PresenceUpdate>,
    /// The signalling module's own handle, used to post internal operations
    /// back onto its task.
    pub controller: ModuleHandle,
}

pub trait TransportFactory: Send {
    fn spawn(&self, ctx: TransportContext) -> Result<Box<dyn PresenceTransport>>;
}

/// The production factory: dials each overlay's configured presence service.
pub struct SessionFactory {
    configs: HashMap<OverlayId, SessionConfig>,
}

impl SessionFactory {
    pub fn new(configs: HashMap<OverlayId, SessionConfig>) -> Self {
        Self { configs }
    }
}

impl TransportFactory for SessionFactory {
    fn spawn(&self, ctx: TransportContext) -> Result<Box<dyn PresenceTransport>> {
        let config = self
            .configs
            .get(&ctx.overlay_id)
            .with_context(|| format!("no session configured for overlay {}", ctx.overlay_id))?;

        Ok(spawn_overlay_transport(config.clone(), ctx))
    }
}

/// Resolves the presence service address, retrying a few times to ride out
/// boot-time races where the network is not up yet.
pub async fn resolve_host(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let mut attempts = 0;

    loop {
        attempts += 1;
        let outcome = tokio::net::lookup_host((host, port))
            .await
            .map(|addrs| addrs.collect::<Vec<_>>());

        match outcome {
            Ok(addresses) if !addresses.is_empty() => return Ok(addresses),
            Ok(_) => {
                if attempts >= RESOLVE_ATTEMPTS {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses for {host}:{port}"),
                    ));
                }
            }
            Err(e) => {
                if attempts >= RESOLVE_ATTEMPTS {
                    return Err(e);
                }
                tracing::warn!(
                    %host,
                    %port,
                    "Failed to retrieve address info: {}",
                    err_with_src(&e)
                );
            }
        }

        tokio::time::sleep(RESOLVE_RETRY_INTERVAL).await;
    }
}

enum Command {
    Presence(PresenceStatus, Option<PeerAddress>),
    Message(PeerAddress, MessageKind, String),
    Close,
}

struct ChannelTransport {
    cmd_tx: mpsc::UnboundedSender<Command>,
    alive: Arc<AtomicBool>,
    self_addr: PeerAddress,
    host: String,
}

impl PresenceTransport for ChannelTransport {
    fn send_presence(&self, status: PresenceStatus, to: Option<PeerAddress>) {
        let _ = self.cmd_tx.send(Command::Presence(status, to));
    }

    fn send_message(&self, to: PeerAddress, kind: MessageKind, body: String) {
        let _ = self.cmd_tx.send(Command::Message(to, kind, body));
    }

    fn self_addr(&self) -> PeerAddress {
        self.self_addr.clone()
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

/// Spawns the task owning one overlay's [`PresenceChannel`].
pub fn spawn_overlay_transport(
    config: SessionConfig,
    ctx: TransportContext,
) -> Box<dyn PresenceTransport> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let alive = Arc::new(AtomicBool::new(true));
    let transport = ChannelTransport {
        cmd_tx,
        alive: alive.clone(),
        self_addr: PeerAddress::new(&config.node_id, &config.host),
        host: config.host.clone(),
    };

    tokio::spawn(async move {
        run_transport(config, &ctx, cmd_rx).await;
        alive.store(false, Ordering::Relaxed);
        tracing::debug!(overlay = %ctx.overlay_id.brief(), "Transport loop ended");
    });

    Box::new(transport)
}

async fn run_transport(
    config: SessionConfig,
    ctx: &TransportContext,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let addresses = match resolve_host(&config.host, config.port).await {
        Ok(addresses) => addresses,
        Err(e) => {
            tracing::error!(
                host = %config.host,
                "Failure to resolve presence service address: {}",
                err_with_src(&e)
            );
            return;
        }
    };

    let mut channel =
        match PresenceChannel::disconnected(&config, addresses, ExponentialBackoff::default) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(overlay = %ctx.overlay_id.brief(), "Failed to set up presence channel: {e:#}");
                return;
            }
        };
    channel.connect();

    enum Step {
        Cmd(Option<Command>),
        Channel(Result<Event, crate::channel::Error>),
    }

    loop {
        // Both futures borrow into this scope; only their owned outputs
        // leave it.
        let step = {
            let cmd = pin!(cmd_rx.recv());
            let event = pin!(std::future::poll_fn(|cx| channel.poll(cx)));

            match select(cmd, event).await {
                Either::Left((cmd, _)) => Step::Cmd(cmd),
                Either::Right((event, _)) => Step::Channel(event),
            }
        };

        match step {
            Step::Cmd(None | Some(Command::Close)) => {
                if channel.close().is_err() {
                    // Mid-connect; nothing to close gracefully.
                    return;
                }
                // No further commands matter; drive the close to completion.
                loop {
                    match std::future::poll_fn(|cx| channel.poll(cx)).await {
                        Ok(Event::Closed) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            }
            Step::Cmd(Some(Command::Presence(status, to))) => {
                channel.send_presence(status, to);
            }
            Step::Cmd(Some(Command::Message(to, kind, body))) => {
                channel.send_message(to, kind, body);
            }
            Step::Channel(Ok(event)) => match event {
                Event::SessionEstablished => {
                    channel.send_presence(PresenceStatus::Ident(ctx.node_id.clone()), None);
                }
                Event::PresenceReceived { from, status } => {
                    let self_addr = channel.self_addr().clone();
                    let mut replies = Vec::new();
                    handle_presence(
                        ctx,
                        &self_addr,
                        &mut |to, kind, body| replies.push((to, kind, body)),
                        from,
                        status,
                    );
                    for (to, kind, body) in replies {
                        channel.send_message(to, kind, body);
                    }
                }
                Event::MessageReceived { from, kind, body } => {
                    handle_message(ctx, from, kind, body);
                }
                Event::HeartbeatSent => {}
                Event::Hiccup { backoff, error } => {
                    tracing::warn!(?backoff, overlay = %ctx.overlay_id.brief(), "Transport hiccup: {error:#}");
                }
                Event::Closed => return,
            },
            Step::Channel(Err(e)) => {
                if e.is_authentication_error() {
                    tracing::error!(
                        overlay = %ctx.overlay_id.brief(),
                        "Authentication failure. Verify the credentials for this overlay and restart"
                    );
                } else {
                    tracing::error!(overlay = %ctx.overlay_id.brief(), "Transport failed: {}", err_with_src(&e));
                }
                return;
            }
        }
    }
}

pub(crate) fn handle_presence(
    ctx: &TransportContext,
    self_addr: &PeerAddress,
    out: &mut dyn FnMut(PeerAddress, MessageKind, String),
    from: PeerAddress,
    status: PresenceStatus,
) {
    match status {
        PresenceStatus::Ident(node_id) => {
            if node_id == ctx.node_id {
                return;
            }

            peer_resolved(ctx, &node_id, &from, "presence");

            // Introduce ourselves back so the peer can skip a probe.
            let payload = AnnouncePayload {
                address: self_addr.clone(),
                node_id: ctx.node_id.clone(),
            };
            out(from, MessageKind::Announce, payload.to_string());
        }
        PresenceStatus::UidQuery(node_id) => {
            if node_id != ctx.node_id {
                return;
            }

            let payload = AnnouncePayload {
                address: self_addr.clone(),
                node_id: ctx.node_id.clone(),
            };
            out(from, MessageKind::UidReply, payload.to_string());
        }
    }
}

pub(crate) fn handle_message(ctx: &TransportContext, from: PeerAddress, kind: MessageKind, body: String) {
    match kind {
        MessageKind::Announce | MessageKind::UidReply => {
            let Ok(payload) = body.parse::<AnnouncePayload>() else {
                tracing::warn!(%from, "Malformed address announcement");
                return;
            };

            peer_resolved(ctx, &payload.node_id, &payload.address, "message");
        }
        MessageKind::Invoke | MessageKind::Complete => {
            let act = match serde_json::from_str::<RemoteAction>(&body) {
                Ok(act) => act,
                Err(e) => {
                    tracing::warn!(%from, "Undecodable remote action: {}", err_with_src(&e));
                    return;
                }
            };
            if act.overlay_id != ctx.overlay_id {
                tracing::warn!(
                    overlay = %act.overlay_id.brief(),
                    "Remote action for a foreign overlay was discarded"
                );
                return;
            }

            let act_kind = if kind == MessageKind::Invoke {
                ActKind::Invoke
            } else {
                ActKind::Complete
            };
            ctx.controller.submit_new(
                names::SIGNALLING,
                crate::controller::INBOUND_REMOTE_ACTION,
                InboundRemoteAction {
                    kind: act_kind,
                    action: act,
                },
            );
        }
    }
}

fn peer_resolved(ctx: &TransportContext, node_id: &NodeId, address: &PeerAddress, source: &str) {
    let now = Instant::now();
    ctx.jid_cache.add(node_id.clone(), address.clone(), now);

    ctx.presence.publish(PresenceUpdate {
        overlay_id: ctx.overlay_id.clone(),
        peer_id: node_id.clone(),
        timestamp: now,
    });

    ctx.controller.submit_new(
        names::SIGNALLING,
        names::PEER_ADDRESS_UPDATED,
        PeerAddressUpdated {
            overlay_id: ctx.overlay_id.clone(),
            peer_id: node_id.clone(),
            peer_address: address.clone(),
        },
    );

    tracing::debug!(
        peer = %node_id.brief(),
        overlay = %ctx.overlay_id.brief(),
        %address,
        source,
        "Resolved peer address"
    );
}
