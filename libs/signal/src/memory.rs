//! An in-process presence service.
//!
//! Wires any number of overlay transports together without a server: every
//! presence stanza is fanned out to all other members, directed messages go
//! to their addressee. The member tasks run the same inbound handling as the
//! websocket transport, so multi-node behaviour can be exercised entirely in
//! memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::{handle_message, handle_presence, PresenceTransport, TransportContext, TransportFactory};
use crate::wire::{DirectedMessage, MessageKind, PeerAddress, Presence, PresenceStatus, WireMessage};

#[derive(Clone, Default)]
pub struct MemoryHub {
    members: Arc<Mutex<HashMap<PeerAddress, mpsc::UnboundedSender<WireMessage>>>>,
}

enum Command {
    Presence(PresenceStatus, Option<PeerAddress>),
    Message(PeerAddress, MessageKind, String),
    Close,
}

struct MemberTransport {
    cmd_tx: mpsc::UnboundedSender<Command>,
    alive: Arc<AtomicBool>,
    self_addr: PeerAddress,
    host: String,
}

impl PresenceTransport for MemberTransport {
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

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches one node's overlay transport, addressed as `<node>@<host>`.
    pub fn attach(&self, ctx: TransportContext, host: &str) -> Box<dyn PresenceTransport> {
        let self_addr = PeerAddress::new(&ctx.node_id, host);
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        self.members.lock().insert(self_addr.clone(), wire_tx);

        let transport = MemberTransport {
            cmd_tx,
            alive: alive.clone(),
            self_addr: self_addr.clone(),
            host: host.to_owned(),
        };

        let hub = self.clone();
        tokio::spawn(async move {
            hub.run_member(ctx, self_addr.clone(), wire_rx, cmd_rx).await;
            hub.members.lock().remove(&self_addr);
            alive.store(false, Ordering::Relaxed);
        });

        Box::new(transport)
    }

    async fn run_member(
        &self,
        ctx: TransportContext,
        self_addr: PeerAddress,
        mut wire_rx: mpsc::UnboundedReceiver<WireMessage>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => return,
                    Some(Command::Presence(status, to)) => {
                        self.broadcast(&self_addr, WireMessage::Presence(Presence {
                            from: self_addr.clone(),
                            to,
                            status: status.to_string(),
                        }));
                    }
                    Some(Command::Message(to, kind, body)) => {
                        self.deliver(WireMessage::Message(DirectedMessage {
                            from: self_addr.clone(),
                            to,
                            kind,
                            body,
                        }));
                    }
                },
                wire = wire_rx.recv() => match wire {
                    None => return,
                    Some(WireMessage::Presence(presence)) => {
                        if presence.from == self_addr {
                            continue;
                        }
                        let Ok(status) = presence.status.parse::<PresenceStatus>() else {
                            continue;
                        };
                        let mut replies = Vec::new();
                        handle_presence(
                            &ctx,
                            &self_addr,
                            &mut |to, kind, body| replies.push((to, kind, body)),
                            presence.from,
                            status,
                        );
                        for (to, kind, body) in replies {
                            self.deliver(WireMessage::Message(DirectedMessage {
                                from: self_addr.clone(),
                                to,
                                kind,
                                body,
                            }));
                        }
                    }
                    Some(WireMessage::Message(message)) => {
                        if message.to != self_addr || message.from == self_addr {
                            continue;
                        }
                        handle_message(&ctx, message.from, message.kind, message.body);
                    }
                    Some(WireMessage::Heartbeat(_)) => {}
                },
            }
        }
    }

    fn broadcast(&self, from: &PeerAddress, message: WireMessage) {
        let members = self.members.lock();
        for (addr, tx) in members.iter() {
            if addr != from {
                let _ = tx.send(message.clone());
            }
        }
    }

    fn deliver(&self, message: WireMessage) {
        let WireMessage::Message(directed) = &message else {
            return;
        };

        let tx = self.members.lock().get(&directed.to).cloned();
        match tx {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => tracing::debug!(to = %directed.to, "No such member; message dropped"),
        }
    }
}

/// A [`TransportFactory`] backed by a [`MemoryHub`].
pub struct MemoryFactory {
    hub: MemoryHub,
    host: String,
}

impl MemoryFactory {
    pub fn new(hub: MemoryHub, host: &str) -> Self {
        Self {
            hub,
            host: host.to_owned(),
        }
    }
}

impl TransportFactory for MemoryFactory {
    fn spawn(&self, ctx: TransportContext) -> anyhow::Result<Box<dyn PresenceTransport>> {
        Ok(self.hub.attach(ctx, &self.host))
    }
}
