//! Graph entities: nodes, edges and the key-indexed store.

mod core;
mod edge;
mod error;
mod node;

pub use self::core::{Graph, GraphEvent, PrimaryStage, Stage};
pub use edge::{
    compute_sequence_edges, compute_spatial_edges, Direction, Edge, EdgeSet, NeighborCandidate,
    SpatialEdgeConfig, SpatialOrigin,
};
pub use error::GraphError;
pub use node::{Node, NodeAssets};
