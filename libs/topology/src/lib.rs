//! The overlay graph: which peers this node keeps edges to, and how the
//! desired edge set is computed.
//!
//! The builder is a pure function over `(self id, peer set, current
//! adjacency, on-demand requests)`; the only nondeterminism is the injected
//! RNG used for the Symphony long-distance draw.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod builder;
mod graph;

pub use builder::{symphony_sample, BuilderConfig, GraphBuilder};
pub use graph::{
    AdjacencyList, ConnectionEdge, EdgeId, EdgeState, EdgeType, GraphTransformation, OnDemandOp,
    OnDemandRequest, Role,
};
