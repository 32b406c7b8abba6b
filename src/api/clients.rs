//! Collaborator traits.
//!
//! All calls are asynchronous and may fail. The traits are object-safe
//! (boxed futures) so the orchestrator can hold them as trait objects
//! and share them with background tasks.

use crate::api::{ApiError, CoreNodeRecord, FillNodeRecord, MeshGeometry, NodeKey, SequenceKey,
                 TileFetchResult};
use crate::coord::GeoPoint;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by collaborator calls.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Fetches node metadata.
pub trait MetadataClient: Send + Sync {
    /// Fetch the minimal index entry for a key.
    ///
    /// Fails with [`ApiError::NotFound`] when the key does not exist
    /// upstream.
    fn fetch_core<'a>(&'a self, key: &'a NodeKey) -> ApiFuture<'a, CoreNodeRecord>;

    /// Fetch the complete metadata for a key.
    fn fetch_fill<'a>(&'a self, key: &'a NodeKey) -> ApiFuture<'a, FillNodeRecord>;
}

/// Fetches geographic tile membership.
pub trait TileClient: Send + Sync {
    /// Fetch the tiles covering `position`, with the nodes discovered
    /// in them, on behalf of `key`.
    fn fetch_tiles_for<'a>(
        &'a self,
        key: &'a NodeKey,
        position: GeoPoint,
    ) -> ApiFuture<'a, TileFetchResult>;
}

/// Fetches ordered sequence membership.
pub trait SequenceClient: Send + Sync {
    /// Fetch the ordered node keys of a sequence.
    fn fetch_sequence<'a>(&'a self, sequence_key: &'a SequenceKey) -> ApiFuture<'a, Vec<NodeKey>>;
}

/// Downloads the heavy per-node assets.
pub trait AssetLoader: Send + Sync {
    /// Download the raw image bytes for a node.
    fn load_image<'a>(&'a self, key: &'a NodeKey) -> ApiFuture<'a, Bytes>;

    /// Download the mesh geometry for a node.
    fn load_mesh<'a>(&'a self, key: &'a NodeKey) -> ApiFuture<'a, MeshGeometry>;
}
