//! Shared types of the overlay control plane.
//!
//! Everything in here crosses a boundary: identifiers travel inside wire
//! payloads and bus messages, events go out to subscribers, and the
//! configuration types are what an embedding daemon deserializes into.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod event;

pub use config::{AuthMethod, OverlayConfig, Settings, TurnServer};
pub use event::{TunnelEvent, TunnelEventKind};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a node on the presence service. Opaque.
#[derive(Hash, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(String);

/// Name of a virtual network joining a set of nodes. Opaque.
#[derive(Hash, Deserialize, Serialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct OverlayId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First few characters, for log fields. Never semantic.
    pub fn brief(&self) -> &str {
        brief(&self.0)
    }
}

impl OverlayId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn brief(&self) -> &str {
        brief(&self.0)
    }
}

fn brief(s: &str) -> &str {
    let end = s
        .char_indices()
        .nth(7)
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    &s[..end]
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for OverlayId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OverlayId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

impl fmt::Debug for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// Identity of one pairwise tunnel. Agreed between both endpoints before
/// either allocates anything.
#[derive(Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TunnelId(Uuid);

/// Identity of the link owned by a NAT-traversing tunnel.
///
/// Numerically equal to the tunnel id today, but kept as its own type so the
/// link index cannot be keyed with the wrong id.
#[derive(Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinkId(Uuid);

impl TunnelId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl LinkId {
    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl From<TunnelId> for LinkId {
    fn from(t: TunnelId) -> Self {
        Self(t.0)
    }
}

impl From<LinkId> for TunnelId {
    fn from(l: LinkId) -> Self {
        Self(l.0)
    }
}

impl FromStr for TunnelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// A textual MAC address, carried opaquely between data plane and peers.
#[derive(Hash, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Mac(String);

impl Mac {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Mac {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Mac {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

pub const TAP_NAME_MAX_LEN: usize = 15;

/// Name of the local network interface backing a tunnel.
///
/// A pure function of `(overlay, peer)`: the per-overlay prefix (default: the
/// first five characters of the overlay id) followed by as much of the peer
/// id as fits into [`TAP_NAME_MAX_LEN`].
#[derive(Hash, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct TapName(String);

impl TapName {
    pub fn derive(overlay_id: &OverlayId, peer_id: &NodeId, prefix: Option<&str>) -> Self {
        let overlay = overlay_id.as_str();
        let prefix = prefix.unwrap_or_else(|| &overlay[..overlay.len().min(5)]);
        let prefix = &prefix[..prefix.len().min(TAP_NAME_MAX_LEN)];

        let peer = peer_id.as_str();
        let tail = &peer[..peer.len().min(TAP_NAME_MAX_LEN - prefix.len())];

        Self(format!("{prefix}{tail}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// Lifecycle state of a tunnel record.
///
/// `Offline` is terminal: a tunnel transitioning there is removed from the
/// manager's map in the same handler.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Authorized,
    Creating,
    Querying,
    Online,
    Offline,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Authorized => "authorized",
            TunnelState::Creating => "creating",
            TunnelState::Querying => "querying",
            TunnelState::Online => "online",
            TunnelState::Offline => "offline",
        };

        write!(f, "{s}")
    }
}

/// Which engine carries the tunnel's traffic.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataplaneKind {
    /// Kernel encapsulation bound to a fixed remote endpoint.
    Geneve,
    /// ICE-negotiated, NAT-traversing link.
    Ice,
}

impl fmt::Display for DataplaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataplaneKind::Geneve => write!(f, "geneve"),
            DataplaneKind::Ice => write!(f, "ice"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_is_bounded_and_deterministic() {
        let overlay = OverlayId::from("ol00112233445566");
        let peer = NodeId::from("peer1234567890abcdef");

        let a = TapName::derive(&overlay, &peer, None);
        let b = TapName::derive(&overlay, &peer, None);

        assert_eq!(a, b);
        assert!(a.as_str().len() <= TAP_NAME_MAX_LEN);
        assert_eq!(a.as_str(), "ol001peer123456");
    }

    #[test]
    fn tap_name_honours_configured_prefix() {
        let overlay = OverlayId::from("ol001");
        let peer = NodeId::from("peer1234567890abcdef");

        let tap = TapName::derive(&overlay, &peer, Some("weft"));

        assert_eq!(tap.as_str(), "weftpeer1234567");
    }

    #[test]
    fn tap_name_of_short_ids_is_their_concatenation() {
        let tap = TapName::derive(&OverlayId::from("ol"), &NodeId::from("p1"), None);

        assert_eq!(tap.as_str(), "olp1");
    }

    #[test]
    fn brief_is_a_prefix() {
        let node = NodeId::from("abcdef0123456789");

        assert_eq!(node.brief(), "abcdef0");
        assert_eq!(NodeId::from("ab").brief(), "ab");
    }

    #[test]
    fn link_and_tunnel_ids_convert_losslessly() {
        let tnl = TunnelId::from_u128(42);
        let link = LinkId::from(tnl);

        assert_eq!(TunnelId::from(link), tnl);
    }
}
