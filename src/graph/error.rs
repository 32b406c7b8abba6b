//! Error types for the graph core.

use crate::api::{ApiError, NodeKey};
use crate::graph::Stage;
use thiserror::Error;

/// Errors that can occur while caching graph data.
///
/// Fetch, fill and asset errors are primary-path failures and surface
/// to the caller awaiting the node. Spatial stage errors never do;
/// they are logged and the spatial track simply stays incomplete until
/// a later request re-attempts it. Stage flags are cleared on every
/// failure path so retries stay possible.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// The minimal metadata fetch for a key failed.
    #[error("failed to fetch node {key}: {source}")]
    Fetch { key: NodeKey, source: ApiError },

    /// The fill fetch for a key failed.
    #[error("failed to fill node {key}: {source}")]
    Fill { key: NodeKey, source: ApiError },

    /// Image or mesh download failed.
    #[error("failed to cache assets for node {key}: {source}")]
    Asset { key: NodeKey, source: ApiError },

    /// A background spatial caching stage failed.
    #[error("spatial stage {stage} failed for node {key}: {source}")]
    SpatialStage {
        key: NodeKey,
        stage: Stage,
        source: ApiError,
    },

    /// A reset invalidated this request while it was in flight. The
    /// graph was not mutated by the stale completion.
    #[error("request for node {key} was superseded by a reset")]
    Superseded { key: NodeKey },

    /// A stage completed for a node the graph no longer tracks within
    /// the same generation.
    #[error("node {key} disappeared from the graph")]
    NodeMissing { key: NodeKey },
}

impl GraphError {
    /// The key the error concerns.
    pub fn key(&self) -> &NodeKey {
        match self {
            Self::Fetch { key, .. }
            | Self::Fill { key, .. }
            | Self::Asset { key, .. }
            | Self::SpatialStage { key, .. }
            | Self::Superseded { key }
            | Self::NodeMissing { key } => key,
        }
    }

    /// Whether the error belongs to the background spatial track.
    pub fn is_spatial(&self) -> bool {
        matches!(self, Self::SpatialStage { .. })
    }
}
