use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_model::{NodeId, OverlayId};

#[derive(Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EdgeId(Uuid);

impl EdgeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Configured, always kept.
    Static,
    /// Short-range ring edge to the next peers clockwise.
    Successor,
    /// Symphony-sampled shortcut.
    LongDistance,
    /// Requested by an application, kept while wanted.
    OnDemand,
    /// Initiated by the peer.
    Incoming,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    Initialized,
    PreAuth,
    Authorized,
    Created,
    Connected,
    Disconnected,
    Deleting,
}

impl EdgeState {
    /// States worth preserving: everything before the edge started dying.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            EdgeState::Initialized
                | EdgeState::PreAuth
                | EdgeState::Authorized
                | EdgeState::Created
                | EdgeState::Connected
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Target,
}

/// One chosen neighbour of this node in an overlay.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConnectionEdge {
    pub peer_id: NodeId,
    pub edge_id: EdgeId,
    pub edge_type: EdgeType,
    pub edge_state: EdgeState,
    pub role: Role,
}

impl ConnectionEdge {
    pub fn new(peer_id: NodeId, edge_type: EdgeType, role: Role) -> Self {
        Self {
            peer_id,
            edge_id: EdgeId::random(),
            edge_type,
            edge_state: EdgeState::Initialized,
            role,
        }
    }
}

/// This node's neighbours in one overlay, keyed by peer id.
///
/// Peer ids are unique by construction and the node's own id never appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyList {
    overlay_id: OverlayId,
    node_id: NodeId,
    edges: BTreeMap<NodeId, ConnectionEdge>,
}

impl AdjacencyList {
    pub fn new(overlay_id: OverlayId, node_id: NodeId) -> Self {
        Self {
            overlay_id,
            node_id,
            edges: BTreeMap::new(),
        }
    }

    pub fn overlay_id(&self) -> &OverlayId {
        &self.overlay_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Inserts an edge, refusing a self-edge. Returns whether it was stored.
    pub fn insert(&mut self, edge: ConnectionEdge) -> bool {
        if edge.peer_id == self.node_id {
            tracing::warn!(peer = %edge.peer_id.brief(), "Refusing self-edge");
            return false;
        }

        self.edges.insert(edge.peer_id.clone(), edge);
        true
    }

    pub fn get(&self, peer_id: &NodeId) -> Option<&ConnectionEdge> {
        self.edges.get(peer_id)
    }

    pub fn contains(&self, peer_id: &NodeId) -> bool {
        self.edges.contains_key(peer_id)
    }

    pub fn remove(&mut self, peer_id: &NodeId) -> Option<ConnectionEdge> {
        self.edges.remove(peer_id)
    }

    pub fn set_state(&mut self, peer_id: &NodeId, state: EdgeState) -> bool {
        match self.edges.get_mut(peer_id) {
            Some(edge) => {
                edge.edge_state = state;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEdge> {
        self.edges.values()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// All edges of `edge_type`, optionally narrowed to one state.
    pub fn select(
        &self,
        edge_type: EdgeType,
        edge_state: Option<EdgeState>,
    ) -> impl Iterator<Item = &ConnectionEdge> {
        self.edges.values().filter(move |e| {
            e.edge_type == edge_type && edge_state.is_none_or(|s| e.edge_state == s)
        })
    }
}

/// The difference of two adjacency lists, keyed on peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphTransformation {
    /// Edges present only in the new list.
    pub additions: Vec<ConnectionEdge>,
    /// Edges present only in the old list.
    pub removals: Vec<ConnectionEdge>,
    /// Peers present in both whose edge type changed: `(old, new)`.
    pub updates: Vec<(ConnectionEdge, ConnectionEdge)>,
}

impl GraphTransformation {
    pub fn new(old: &AdjacencyList, new: &AdjacencyList) -> Self {
        let mut additions = Vec::new();
        let mut removals = Vec::new();
        let mut updates = Vec::new();

        for edge in new.iter() {
            match old.get(&edge.peer_id) {
                None => additions.push(edge.clone()),
                Some(prev) if prev.edge_type != edge.edge_type => {
                    updates.push((prev.clone(), edge.clone()))
                }
                Some(_) => {}
            }
        }

        for edge in old.iter() {
            if !new.contains(&edge.peer_id) {
                removals.push(edge.clone());
            }
        }

        Self {
            additions,
            removals,
            updates,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty() && self.updates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDemandOp {
    Add,
    Remove,
}

/// A queued application request for a direct edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnDemandRequest {
    pub peer_id: NodeId,
    pub op: OnDemandOp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn adj(node: &str) -> AdjacencyList {
        AdjacencyList::new(OverlayId::from("ol001"), NodeId::from(node))
    }

    #[test]
    fn self_edges_are_refused() {
        let mut list = adj("a");

        let stored = list.insert(ConnectionEdge::new(
            NodeId::from("a"),
            EdgeType::Successor,
            Role::Initiator,
        ));

        assert!(!stored);
        assert!(list.is_empty());
    }

    #[test]
    fn transformation_is_the_set_difference() {
        let mut old = adj("a");
        old.insert(ConnectionEdge::new(
            NodeId::from("b"),
            EdgeType::Successor,
            Role::Initiator,
        ));
        old.insert(ConnectionEdge::new(
            NodeId::from("c"),
            EdgeType::LongDistance,
            Role::Initiator,
        ));

        let mut new = adj("a");
        new.insert(ConnectionEdge::new(
            NodeId::from("c"),
            EdgeType::Successor,
            Role::Initiator,
        ));
        new.insert(ConnectionEdge::new(
            NodeId::from("d"),
            EdgeType::Successor,
            Role::Initiator,
        ));

        let diff = GraphTransformation::new(&old, &new);

        assert_eq!(diff.additions.len(), 1);
        assert_eq!(diff.additions[0].peer_id, NodeId::from("d"));
        assert_eq!(diff.removals.len(), 1);
        assert_eq!(diff.removals[0].peer_id, NodeId::from("b"));
        assert_eq!(diff.updates.len(), 1);
        assert_eq!(diff.updates[0].1.edge_type, EdgeType::Successor);
    }
}
