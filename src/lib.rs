//! Panograph - street-level panorama graph streaming
//!
//! This library provides the graph-streaming core of a street-level
//! panorama viewer: a key-indexed store of geotagged image nodes, an
//! orchestration service that drives nodes through their caching state
//! machines, and a background spatial prefetcher that opportunistically
//! widens the cached shell of graph metadata around the current node.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module provides the entry point:
//!
//! ```ignore
//! use panograph::api::NodeKey;
//! use panograph::service::GraphService;
//!
//! let service = GraphService::new(metadata, tiles, sequences, assets);
//!
//! // Resolve a node: fetch, fill and asset caching are driven for us,
//! // spatial prefetch advances in the background.
//! let node = service.cache_node(&NodeKey::from("node-a")).await?;
//! assert!(node.assets_cached());
//! ```

pub mod api;
pub mod coord;
pub mod graph;
pub mod logging;
pub mod service;

/// Version of the panograph library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
