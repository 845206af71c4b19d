use rand::Rng;

use weft_model::{NodeId, OverlayId};

use crate::graph::{
    AdjacencyList, ConnectionEdge, EdgeState, EdgeType, GraphTransformation, OnDemandOp,
    OnDemandRequest, Role,
};

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub overlay_id: OverlayId,
    pub node_id: NodeId,
    /// Peers that always get a direct edge.
    pub static_edges: Vec<NodeId>,
    /// Only build edges from the static list.
    pub manual_topology: bool,
    pub min_successors: usize,
    pub max_long_distance_edges: usize,
    pub max_on_demand_edges: usize,
}

/// Computes the adjacency list this node needs to maintain the overlay
/// topology: static edges, ring successors, Symphony long-distance shortcuts
/// and on-demand edges.
pub struct GraphBuilder {
    cfg: BuilderConfig,
    peers: Vec<NodeId>,
    /// All peers plus this node, sorted: the ring.
    nodes: Vec<NodeId>,
    my_idx: usize,
    relink: bool,
}

impl GraphBuilder {
    pub fn new(cfg: BuilderConfig) -> Self {
        if cfg.manual_topology && cfg.static_edges.is_empty() {
            tracing::warn!(
                overlay = %cfg.overlay_id.brief(),
                "Manual topology specified but no static peers are provided"
            );
        }

        Self {
            cfg,
            peers: Vec::new(),
            nodes: Vec::new(),
            my_idx: 0,
            relink: false,
        }
    }

    /// Produces the target adjacency list.
    ///
    /// `current` is the adjacency in effect, used to avoid churning edges
    /// that are still useful. Consumed entries are drained from `requests`.
    pub fn build(
        &mut self,
        peers: &[NodeId],
        current: &AdjacencyList,
        requests: &mut Vec<OnDemandRequest>,
        relink: bool,
        rng: &mut impl Rng,
    ) -> AdjacencyList {
        self.relink = relink;
        self.prep(peers);

        let mut adj = AdjacencyList::new(self.cfg.overlay_id.clone(), self.cfg.node_id.clone());
        self.build_static(&mut adj);
        if !self.cfg.manual_topology {
            self.build_successors(&mut adj, current);
            self.build_long_distance(&mut adj, current, rng);
            self.build_on_demand(&mut adj, current, requests);
        }

        adj
    }

    /// [`build`](Self::build) and diff against `current` in one step.
    pub fn transformation(
        &mut self,
        peers: &[NodeId],
        current: &AdjacencyList,
        requests: &mut Vec<OnDemandRequest>,
        relink: bool,
        rng: &mut impl Rng,
    ) -> GraphTransformation {
        let new = self.build(peers, current, requests, relink, rng);

        GraphTransformation::new(current, &new)
    }

    /// An unsampled adjacency list: static edges plus a successor edge to
    /// every peer with an id greater than ours. For deployments small enough
    /// that every node can connect to every other.
    pub fn build_full_mesh(&mut self, peers: &[NodeId]) -> AdjacencyList {
        self.prep(peers);

        let mut adj = AdjacencyList::new(self.cfg.overlay_id.clone(), self.cfg.node_id.clone());
        for peer_id in &self.peers {
            if self.cfg.static_edges.contains(peer_id) {
                adj.insert(ConnectionEdge::new(
                    peer_id.clone(),
                    EdgeType::Static,
                    Role::Initiator,
                ));
            } else if !self.cfg.manual_topology && self.cfg.node_id < *peer_id {
                adj.insert(ConnectionEdge::new(
                    peer_id.clone(),
                    EdgeType::Successor,
                    Role::Initiator,
                ));
            }
        }

        adj
    }

    fn prep(&mut self, peers: &[NodeId]) {
        self.peers = peers.to_vec();
        self.nodes = peers.to_vec();
        self.nodes.push(self.cfg.node_id.clone());
        self.nodes.sort();
        self.nodes.dedup();
        self.my_idx = self
            .nodes
            .binary_search(&self.cfg.node_id)
            .unwrap_or_else(|i| i);
    }

    fn build_static(&self, adj: &mut AdjacencyList) {
        for peer_id in &self.cfg.static_edges {
            if *peer_id != self.cfg.node_id && self.peers.contains(peer_id) {
                adj.insert(ConnectionEdge::new(
                    peer_id.clone(),
                    EdgeType::Static,
                    Role::Initiator,
                ));
            }
        }
    }

    /// The next `min(min_successors, |peers|)` nodes clockwise of us.
    fn successors(&self) -> Vec<NodeId> {
        let num_nodes = self.nodes.len();
        let wanted = self.cfg.min_successors.min(self.peers.len());

        (1..=wanted)
            .map(|i| self.nodes[(self.my_idx + i) % num_nodes].clone())
            .collect()
    }

    fn build_successors(&self, adj: &mut AdjacencyList, current: &AdjacencyList) {
        let mut connected = current
            .select(EdgeType::Successor, Some(EdgeState::Connected))
            .map(|e| e.peer_id.clone())
            .collect::<Vec<_>>();

        // Ideal successors first; the previously-connected ones count toward
        // the budget of retained edges.
        let mut retained = 0;
        for peer_id in self.successors() {
            if adj.contains(&peer_id) {
                continue;
            }
            if let Some(pos) = connected.iter().position(|p| *p == peer_id) {
                connected.remove(pos);
                retained += 1;
                if let Some(edge) = current.get(&peer_id) {
                    adj.insert(edge.clone());
                }
            } else {
                adj.insert(ConnectionEdge::new(
                    peer_id,
                    EdgeType::Successor,
                    Role::Initiator,
                ));
            }
        }

        // Do not drop an existing successor before its ideal replacement is
        // online: keep the leftovers, largest peer id first, while under
        // budget.
        connected.sort();
        for peer_id in connected.into_iter().rev() {
            if retained >= self.cfg.min_successors {
                break;
            }
            if let Some(edge) = current.get(&peer_id) {
                adj.insert(edge.clone());
                retained += 1;
            }
        }
    }

    fn build_long_distance(
        &self,
        adj: &mut AdjacencyList,
        current: &AdjacencyList,
        rng: &mut impl Rng,
    ) {
        if 2 * self.cfg.min_successors > self.peers.len() {
            // Not enough peers for shortcuts to pay off.
            return;
        }

        let mut existing = 0;
        if !self.relink {
            for edge in current.select(EdgeType::LongDistance, None) {
                if edge.edge_state.is_live()
                    && !adj.contains(&edge.peer_id)
                    && !self.is_too_close(&edge.peer_id)
                {
                    adj.insert(edge.clone());
                    existing += 1;
                    if existing >= self.cfg.max_long_distance_edges {
                        return;
                    }
                }
            }
        }

        for peer_id in
            self.long_distance_candidates(self.cfg.max_long_distance_edges - existing, rng)
        {
            if adj.contains(&peer_id) {
                continue;
            }
            // A peer already holding a non-successor edge keeps it; only
            // successors may be upgraded to a fresh long-distance edge.
            let upgradable = match current.get(&peer_id) {
                None => true,
                Some(edge) => edge.edge_type == EdgeType::Successor,
            };
            if upgradable {
                adj.insert(ConnectionEdge::new(
                    peer_id,
                    EdgeType::LongDistance,
                    Role::Initiator,
                ));
            }
        }
    }

    fn long_distance_candidates(&self, count: usize, rng: &mut impl Rng) -> Vec<NodeId> {
        let net_sz = self.nodes.len();
        if net_sz <= 1 {
            return Vec::new();
        }

        symphony_sample(net_sz, count.min(net_sz), rng)
            .into_iter()
            .map(|offset| {
                let idx = (net_sz as f64 * offset).floor() as usize;
                self.nodes[(self.my_idx + idx) % net_sz].clone()
            })
            .collect()
    }

    fn distance(&self, peer_id: &NodeId) -> usize {
        let net_sz = self.nodes.len().max(1);
        match self.nodes.iter().position(|n| n == peer_id) {
            Some(idx) => (idx + net_sz - self.my_idx) % net_sz,
            None => {
                tracing::warn!(peer = %peer_id.brief(), "Peer is not on the ring, continuing ...");
                0
            }
        }
    }

    fn ideal_closest_distance(&self) -> usize {
        let net_sz = self.nodes.len().max(1) as f64;

        (net_sz * (-net_sz.log10()).exp()).floor() as usize
    }

    /// A long-distance edge to a near neighbour is wasted; successors cover
    /// that range already.
    pub fn is_too_close(&self, peer_id: &NodeId) -> bool {
        self.distance(peer_id) < self.ideal_closest_distance()
    }

    fn build_on_demand(
        &self,
        adj: &mut AdjacencyList,
        current: &AdjacencyList,
        requests: &mut Vec<OnDemandRequest>,
    ) {
        let mut planned: Vec<ConnectionEdge> = Vec::new();

        for edge in current.select(EdgeType::OnDemand, None) {
            if edge.edge_state.is_live() && !adj.contains(&edge.peer_id) {
                planned.push(edge.clone());
            }
        }

        requests.retain(|request| match request.op {
            OnDemandOp::Add => {
                if self.peers.contains(&request.peer_id)
                    && (!adj.contains(&request.peer_id) || !current.contains(&request.peer_id))
                {
                    planned.retain(|e| e.peer_id != request.peer_id);
                    planned.push(ConnectionEdge::new(
                        request.peer_id.clone(),
                        EdgeType::OnDemand,
                        Role::Initiator,
                    ));
                }
                false
            }
            OnDemandOp::Remove => {
                tracing::debug!(peer = %request.peer_id.brief(), "Processing on-demand removal");
                planned.retain(|e| e.peer_id != request.peer_id);
                // Keep the request queued until the tunnel has fully cleared.
                current.contains(&request.peer_id)
            }
        });

        for edge in planned.into_iter().take(self.cfg.max_on_demand_edges) {
            if !adj.contains(&edge.peer_id) {
                adj.insert(edge);
            }
        }
    }
}

/// Draws `samples` Symphony offsets for a ring of `network_size` nodes:
/// `exp(log₁₀(n) · (U − 1))` for `U` uniform on `[0, 1)`, biased toward
/// short distances while occasionally reaching far around the ring.
pub fn symphony_sample(network_size: usize, samples: usize, rng: &mut impl Rng) -> Vec<f64> {
    let log_sz = (network_size as f64).log10();

    (0..samples)
        .map(|_| (log_sz * (rng.r#gen::<f64>() - 1.0)).exp())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn builder(node: &str, min_successors: usize, max_ldl: usize) -> GraphBuilder {
        GraphBuilder::new(BuilderConfig {
            overlay_id: OverlayId::from("ol001"),
            node_id: NodeId::from(node),
            static_edges: Vec::new(),
            manual_topology: false,
            min_successors,
            max_long_distance_edges: max_ldl,
            max_on_demand_edges: 3,
        })
    }

    fn empty(node: &str) -> AdjacencyList {
        AdjacencyList::new(OverlayId::from("ol001"), NodeId::from(node))
    }

    fn shape(adj: &AdjacencyList) -> Vec<(NodeId, EdgeType)> {
        adj.iter()
            .map(|e| (e.peer_id.clone(), e.edge_type))
            .collect()
    }

    #[test]
    fn successors_wrap_around_the_ring() {
        let mut b = builder("n4", 2, 0);
        let peers = ids(&["n1", "n2", "n3"]);

        let adj = b.build(&peers, &empty("n4"), &mut Vec::new(), false, &mut rng(1));

        // Ring is [n1 n2 n3 n4]; successors of n4 wrap to n1, n2.
        assert!(adj.contains(&NodeId::from("n1")));
        assert!(adj.contains(&NodeId::from("n2")));
        assert!(!adj.contains(&NodeId::from("n3")));
    }

    #[test]
    fn fewer_peers_than_min_successors_connects_to_all() {
        let mut b = builder("n1", 3, 0);
        let peers = ids(&["n2"]);

        let adj = b.build(&peers, &empty("n1"), &mut Vec::new(), false, &mut rng(1));

        assert_eq!(adj.len(), 1);
        assert!(adj.contains(&NodeId::from("n2")));
    }

    #[test]
    fn manual_topology_builds_only_static_edges() {
        let mut b = GraphBuilder::new(BuilderConfig {
            overlay_id: OverlayId::from("ol001"),
            node_id: NodeId::from("n1"),
            static_edges: ids(&["n3"]),
            manual_topology: true,
            min_successors: 2,
            max_long_distance_edges: 4,
            max_on_demand_edges: 3,
        });
        let peers = ids(&["n2", "n3", "n4"]);

        let adj = b.build(&peers, &empty("n1"), &mut Vec::new(), false, &mut rng(1));

        assert_eq!(shape(&adj), vec![(NodeId::from("n3"), EdgeType::Static)]);
    }

    #[test]
    fn existing_successor_is_kept_until_replacement_connects() {
        let mut b = builder("n1", 1, 0);
        // n5 used to be our successor and is connected; n2 has joined since
        // and is the new ideal successor.
        let mut current = empty("n1");
        let mut old = ConnectionEdge::new(NodeId::from("n5"), EdgeType::Successor, Role::Initiator);
        old.edge_state = EdgeState::Connected;
        current.insert(old);

        let peers = ids(&["n2", "n5"]);
        let adj = b.build(&peers, &current, &mut Vec::new(), false, &mut rng(1));

        // Both stay: the new ideal one, and the old one until the new one is
        // online.
        assert!(adj.contains(&NodeId::from("n2")));
        assert!(adj.contains(&NodeId::from("n5")));
    }

    #[test]
    fn connected_ideal_successors_are_preserved_not_reissued() {
        let mut b = builder("n1", 1, 0);
        let mut current = empty("n1");
        let mut edge = ConnectionEdge::new(NodeId::from("n2"), EdgeType::Successor, Role::Initiator);
        edge.edge_state = EdgeState::Connected;
        let edge_id = edge.edge_id;
        current.insert(edge);

        let peers = ids(&["n2", "n3"]);
        let adj = b.build(&peers, &current, &mut Vec::new(), false, &mut rng(1));

        let kept = adj.get(&NodeId::from("n2")).unwrap();
        assert_eq!(kept.edge_id, edge_id);
        assert_eq!(kept.edge_state, EdgeState::Connected);
    }

    #[test]
    fn successor_monotonicity_under_peer_growth() {
        // With the ideal successors of `p` already connected, growing the
        // peer set must not drop them.
        let mut b = builder("a", 2, 0);
        let peers = ids(&["b", "c"]);
        let adj1 = b.build(&peers, &empty("a"), &mut Vec::new(), false, &mut rng(1));
        let mut current = empty("a");
        for edge in adj1.iter() {
            let mut edge = edge.clone();
            edge.edge_state = EdgeState::Connected;
            current.insert(edge);
        }

        let grown = ids(&["b", "c", "d", "e"]);
        let adj2 = b.build(&grown, &current, &mut Vec::new(), false, &mut rng(2));

        assert!(adj2.contains(&NodeId::from("b")));
        assert!(adj2.contains(&NodeId::from("c")));
    }

    #[test]
    fn no_long_distance_edges_in_small_networks() {
        let mut b = builder("n1", 2, 4);
        // 2 * min_successors > |peers|.
        let peers = ids(&["n2", "n3"]);

        let adj = b.build(&peers, &empty("n1"), &mut Vec::new(), false, &mut rng(1));

        assert!(adj.select(EdgeType::LongDistance, None).next().is_none());
    }

    #[test]
    fn long_distance_edges_respect_the_cap() {
        let mut b = builder("n001", 1, 2);
        let peers = (2..40).map(|i| NodeId::from(format!("n{i:03}"))).collect::<Vec<_>>();

        let adj = b.build(&peers, &empty("n001"), &mut Vec::new(), false, &mut rng(7));

        assert!(adj.select(EdgeType::LongDistance, None).count() <= 2);
    }

    #[test]
    fn build_is_idempotent_for_a_fixed_seed() {
        let mut b = builder("n001", 2, 3);
        let peers = (2..30).map(|i| NodeId::from(format!("n{i:03}"))).collect::<Vec<_>>();

        let once = b.build(&peers, &empty("n001"), &mut Vec::new(), false, &mut rng(42));
        let twice = b.build(&peers, &once, &mut Vec::new(), false, &mut rng(42));

        assert_eq!(shape(&once), shape(&twice));
    }

    #[test]
    fn on_demand_add_is_consumed_and_scheduled() {
        let mut b = builder("n1", 1, 0);
        let peers = ids(&["n2", "n3"]);
        let mut requests = vec![OnDemandRequest {
            peer_id: NodeId::from("n3"),
            op: OnDemandOp::Add,
        }];

        let adj = b.build(&peers, &empty("n1"), &mut requests, false, &mut rng(1));

        assert!(requests.is_empty());
        assert_eq!(
            adj.get(&NodeId::from("n3")).map(|e| e.edge_type),
            Some(EdgeType::OnDemand)
        );
    }

    #[test]
    fn on_demand_remove_is_consumed_only_after_the_tunnel_cleared() {
        let mut b = builder("n1", 1, 0);
        let peers = ids(&["n2", "n3"]);
        let mut current = empty("n1");
        let mut edge = ConnectionEdge::new(NodeId::from("n3"), EdgeType::OnDemand, Role::Initiator);
        edge.edge_state = EdgeState::Connected;
        current.insert(edge);
        let mut requests = vec![OnDemandRequest {
            peer_id: NodeId::from("n3"),
            op: OnDemandOp::Remove,
        }];

        // Tunnel still present: edge dropped from the plan, request kept.
        let adj = b.build(&peers, &current, &mut requests, false, &mut rng(1));
        assert!(!adj.contains(&NodeId::from("n3")));
        assert_eq!(requests.len(), 1);

        // Tunnel cleared: the request is consumed.
        let adj = b.build(&peers, &empty("n1"), &mut requests, false, &mut rng(1));
        assert!(!adj.contains(&NodeId::from("n3")));
        assert!(requests.is_empty());
    }

    #[test]
    fn symphony_draws_match_the_analytical_cdf() {
        // r = e^(log₁₀(n)·(U−1)) gives P(⌊n·r⌋ ≤ x) = 1 + ln((x+1)/n)/log₁₀(n),
        // and no draw below ⌊n·e^(−log₁₀ n)⌋ or above n − 1.
        let n = 1000;
        let samples = 10_000;
        let offsets = symphony_sample(n, samples, &mut rng(1234));

        let indexes = offsets
            .iter()
            .map(|o| (n as f64 * o).floor() as usize)
            .collect::<Vec<_>>();

        assert!(indexes.iter().all(|idx| *idx <= n - 1));
        assert!(indexes.iter().all(|idx| *idx >= 49));

        for x in [99_usize, 299, 599] {
            let expected = 1.0 + ((x + 1) as f64 / n as f64).ln() / (n as f64).log10();
            let fraction =
                indexes.iter().filter(|idx| **idx <= x).count() as f64 / samples as f64;
            assert!(
                (fraction - expected).abs() < 0.03,
                "P(idx <= {x}) = {fraction}, expected ≈ {expected}"
            );
        }
    }

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }
}
