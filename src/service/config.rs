//! Service configuration.

use crate::graph::SpatialEdgeConfig;
use std::time::Duration;

/// Configuration for the graph service.
#[derive(Debug, Clone)]
pub struct GraphServiceConfig {
    /// Capacity of the change-notification channel.
    ///
    /// Slow receivers observe a lag error and re-query graph state.
    /// Default: 64
    pub event_capacity: usize,

    /// Capacity of the per-stage result broadcast used to replay a
    /// stage outcome to coalesced callers.
    ///
    /// The typical case is a handful of concurrent callers per stage.
    /// Default: 16
    pub coalesce_capacity: usize,

    /// Fallback re-check interval for the spatial prefetch loop.
    ///
    /// The loop is normally driven by change notifications; the tick
    /// lets it notice that the primary fetch it was waiting on never
    /// materialized. Default: 500ms
    pub spatial_check_interval: Duration,

    /// Tunables for spatial edge computation.
    pub edges: SpatialEdgeConfig,
}

impl Default for GraphServiceConfig {
    fn default() -> Self {
        Self {
            event_capacity: 64,
            coalesce_capacity: 16,
            spatial_check_interval: Duration::from_millis(500),
            edges: SpatialEdgeConfig::default(),
        }
    }
}

impl GraphServiceConfig {
    /// Set the change-notification channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the stage-result broadcast capacity.
    pub fn with_coalesce_capacity(mut self, capacity: usize) -> Self {
        self.coalesce_capacity = capacity;
        self
    }

    /// Set the spatial loop fallback re-check interval.
    pub fn with_spatial_check_interval(mut self, interval: Duration) -> Self {
        self.spatial_check_interval = interval;
        self
    }

    /// Set the spatial edge tunables.
    pub fn with_edges(mut self, edges: SpatialEdgeConfig) -> Self {
        self.edges = edges;
        self
    }
}
