use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use weft_model::NodeId;

/// A node's opaque address on the presence/message service.
#[derive(Hash, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(node_id: &NodeId, host: &str) -> Self {
        Self(format!("{node_id}@{host}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// Everything that travels over the websocket, client- and server-bound.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum WireMessage {
    Presence(Presence),
    Message(DirectedMessage),
    Heartbeat(Empty),
}

// Serializes to "{}" rather than "null".
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct Empty {}

/// A broadcast presence stanza.
///
/// `to` is set on the `uid?` probe, which is addressed at one node; the
/// service still fans it out, so only the matching recipient answers.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Presence {
    pub from: PeerAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerAddress>,
    pub status: String,
}

/// A unicast message between two nodes.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DirectedMessage {
    pub from: PeerAddress,
    pub to: PeerAddress,
    pub kind: MessageKind,
    pub body: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `"<address>#<node_id>"`: unsolicited self-introduction.
    #[serde(rename = "announce")]
    Announce,
    /// `"<address>#<node_id>"`: answer to a `uid?` probe.
    #[serde(rename = "uid!")]
    UidReply,
    /// A serialised remote-action invocation.
    #[serde(rename = "invk")]
    Invoke,
    /// A serialised remote-action completion.
    #[serde(rename = "cmpt")]
    Complete,
}

/// The `"<tag>#<node_id>"` string carried in a presence stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceStatus {
    /// Asserting the sender's own identity.
    Ident(NodeId),
    /// Asking the node with this id to reveal its address.
    UidQuery(NodeId),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed presence status")]
pub struct BadStatus;

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Ident(node_id) => write!(f, "ident#{node_id}"),
            PresenceStatus::UidQuery(node_id) => write!(f, "uid?#{node_id}"),
        }
    }
}

impl FromStr for PresenceStatus {
    type Err = BadStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, node_id) = s.split_once('#').ok_or(BadStatus)?;

        match tag {
            "ident" => Ok(PresenceStatus::Ident(NodeId::from(node_id))),
            "uid?" => Ok(PresenceStatus::UidQuery(NodeId::from(node_id))),
            _ => Err(BadStatus),
        }
    }
}

/// The `"<address>#<node_id>"` body of `announce` and `uid!` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePayload {
    pub address: PeerAddress,
    pub node_id: NodeId,
}

impl fmt::Display for AnnouncePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.node_id)
    }
}

impl FromStr for AnnouncePayload {
    type Err = BadStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, node_id) = s.split_once('#').ok_or(BadStatus)?;

        Ok(Self {
            address: PeerAddress::from(address),
            node_id: NodeId::from(node_id),
        })
    }
}
