//! The node entity.
//!
//! A node carries three independently cached layers: fill metadata
//! (everything beyond the minimal index entry), assets (image bytes
//! plus mesh geometry) and edges (sequence and spatial). The layers
//! are guarded separately so the orchestrator can advance them in any
//! interleaving the collaborators allow, while `assets_cached` stays
//! monotonic for the lifetime of the node.

use crate::api::{AssetLoader, CoreNodeRecord, FillNodeRecord, MeshGeometry, NodeKey, SequenceKey};
use crate::coord::GeoPoint;
use crate::graph::edge::EdgeSet;
use crate::graph::error::GraphError;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::trace;

/// Image bytes and mesh geometry for a node.
#[derive(Clone)]
pub struct NodeAssets {
    /// Raw encoded image bytes.
    pub image: Bytes,
    /// Mesh geometry, shared since it can be large.
    pub mesh: Arc<MeshGeometry>,
}

impl std::fmt::Debug for NodeAssets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAssets")
            .field("image_bytes", &self.image.len())
            .field("mesh", &self.mesh)
            .finish()
    }
}

/// A single cacheable image node.
///
/// Created by the graph when its key is first seen; shared as
/// `Arc<Node>` with consumers, which observe the caching layers fill
/// in. All mutations are serialized by the orchestrator; the interior
/// locks only make the concurrent reads safe.
#[derive(Debug)]
pub struct Node {
    key: NodeKey,
    sequence_key: Option<SequenceKey>,
    core: CoreNodeRecord,
    fill: RwLock<Option<FillNodeRecord>>,
    assets: RwLock<Option<NodeAssets>>,
    assets_cached: AtomicBool,
    sequence_edges: RwLock<Option<EdgeSet>>,
    spatial_edges: RwLock<Option<EdgeSet>>,
}

impl Node {
    /// Create a partial node from its index entry.
    pub fn new(core: CoreNodeRecord) -> Self {
        Self {
            key: core.key.clone(),
            sequence_key: core.sequence_key.clone(),
            core,
            fill: RwLock::new(None),
            assets: RwLock::new(None),
            assets_cached: AtomicBool::new(false),
            sequence_edges: RwLock::new(None),
            spatial_edges: RwLock::new(None),
        }
    }

    /// Node key.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Sequence this node belongs to, when known.
    pub fn sequence_key(&self) -> Option<&SequenceKey> {
        self.sequence_key.as_ref()
    }

    /// Best known position: the SfM-adjusted one when filled and
    /// merged, the capture position otherwise.
    pub fn position(&self) -> GeoPoint {
        self.fill
            .read()
            .unwrap()
            .as_ref()
            .and_then(|f| f.merged_position)
            .unwrap_or(self.core.position)
    }

    /// Compass angle of the camera in degrees.
    pub fn ca(&self) -> f64 {
        self.core.ca
    }

    /// Whether the image is a full panorama. False until filled.
    pub fn pano(&self) -> bool {
        self.fill.read().unwrap().as_ref().is_some_and(|f| f.pano)
    }

    /// Whether complete metadata has been loaded.
    pub fn full(&self) -> bool {
        self.fill.read().unwrap().is_some()
    }

    /// Complete metadata, when loaded.
    pub fn fill(&self) -> Option<FillNodeRecord> {
        self.fill.read().unwrap().clone()
    }

    /// Promote the node to full. The first record wins; a repeated
    /// promotion is ignored.
    pub(crate) fn set_fill(&self, record: FillNodeRecord) {
        let mut fill = self.fill.write().unwrap();
        if fill.is_none() {
            *fill = Some(record);
        }
    }

    /// Whether image and mesh are both resident. Monotonic: never
    /// reverts to false for the lifetime of the node.
    pub fn assets_cached(&self) -> bool {
        self.assets_cached.load(Ordering::Acquire)
    }

    /// Cached image bytes, when resident.
    pub fn image(&self) -> Option<Bytes> {
        self.assets.read().unwrap().as_ref().map(|a| a.image.clone())
    }

    /// Cached mesh geometry, when resident.
    pub fn mesh(&self) -> Option<Arc<MeshGeometry>> {
        self.assets.read().unwrap().as_ref().map(|a| a.mesh.clone())
    }

    /// Download image and mesh through `loader`.
    ///
    /// Both downloads run concurrently; the node stores them only when
    /// both succeed. Returns immediately when assets are already
    /// resident. Coalescing concurrent callers is the orchestrator's
    /// job, not the node's.
    ///
    /// # Panics
    ///
    /// Panics when called before the node is full; asset URLs live in
    /// fill metadata, so this is a caller ordering bug.
    pub async fn cache_assets(&self, loader: &dyn AssetLoader) -> Result<(), GraphError> {
        if self.assets_cached() {
            return Ok(());
        }
        assert!(
            self.full(),
            "assets requested for node {} before fill metadata",
            self.key
        );

        trace!(key = %self.key, "downloading node assets");

        let (image, mesh) =
            tokio::try_join!(loader.load_image(&self.key), loader.load_mesh(&self.key)).map_err(
                |source| GraphError::Asset {
                    key: self.key.clone(),
                    source,
                },
            )?;

        *self.assets.write().unwrap() = Some(NodeAssets {
            image,
            mesh: Arc::new(mesh),
        });
        self.assets_cached.store(true, Ordering::Release);

        Ok(())
    }

    /// Whether sequence edges have been computed.
    pub fn sequence_edges_cached(&self) -> bool {
        self.sequence_edges.read().unwrap().is_some()
    }

    /// Whether spatial edges have been computed.
    pub fn spatial_edges_cached(&self) -> bool {
        self.spatial_edges.read().unwrap().is_some()
    }

    /// Whether both edge families have been computed.
    pub fn edges_cached(&self) -> bool {
        self.sequence_edges_cached() && self.spatial_edges_cached()
    }

    /// Cached sequence edges, when computed.
    pub fn sequence_edges(&self) -> Option<EdgeSet> {
        self.sequence_edges.read().unwrap().clone()
    }

    /// Cached spatial edges, when computed.
    pub fn spatial_edges(&self) -> Option<EdgeSet> {
        self.spatial_edges.read().unwrap().clone()
    }

    /// Store computed sequence edges. The first computation wins.
    pub(crate) fn set_sequence_edges(&self, edges: EdgeSet) {
        let mut slot = self.sequence_edges.write().unwrap();
        if slot.is_none() {
            *slot = Some(edges);
        }
    }

    /// Store computed spatial edges. The first computation wins.
    pub(crate) fn set_spatial_edges(&self, edges: EdgeSet) {
        let mut slot = self.spatial_edges.write().unwrap();
        if slot.is_none() {
            *slot = Some(edges);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ApiFuture};
    use std::sync::atomic::AtomicUsize;

    fn core_record(key: &str) -> CoreNodeRecord {
        CoreNodeRecord {
            key: NodeKey::from(key),
            sequence_key: Some(SequenceKey::from("s1")),
            position: GeoPoint::new(52.0, 13.0),
            ca: 0.0,
        }
    }

    fn fill_record() -> FillNodeRecord {
        FillNodeRecord {
            captured_at: Some(1_700_000_000_000),
            merge_cc: Some(1),
            merged_position: Some(GeoPoint::new(52.000_01, 13.0)),
            image_url: "https://img/n1".to_string(),
            mesh_url: "https://mesh/n1".to_string(),
            width: 2048,
            height: 1024,
            pano: false,
        }
    }

    /// Asset loader that counts calls and can be told to fail.
    struct CountingLoader {
        image_calls: AtomicUsize,
        mesh_calls: AtomicUsize,
        fail_image: bool,
    }

    impl CountingLoader {
        fn new() -> Self {
            Self {
                image_calls: AtomicUsize::new(0),
                mesh_calls: AtomicUsize::new(0),
                fail_image: false,
            }
        }
    }

    impl AssetLoader for CountingLoader {
        fn load_image<'a>(&'a self, key: &'a NodeKey) -> ApiFuture<'a, Bytes> {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_image;
            let key = key.clone();
            Box::pin(async move {
                if fail {
                    Err(ApiError::Http(format!("image for {} unavailable", key)))
                } else {
                    Ok(Bytes::from_static(b"jpeg"))
                }
            })
        }

        fn load_mesh<'a>(&'a self, _key: &'a NodeKey) -> ApiFuture<'a, MeshGeometry> {
            self.mesh_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(MeshGeometry::default()) })
        }
    }

    #[test]
    fn test_new_node_is_partial() {
        let node = Node::new(core_record("n1"));
        assert!(!node.full());
        assert!(!node.assets_cached());
        assert!(!node.edges_cached());
        assert_eq!(node.key(), &NodeKey::from("n1"));
    }

    #[test]
    fn test_fill_promotes_and_first_wins() {
        let node = Node::new(core_record("n1"));
        node.set_fill(fill_record());
        assert!(node.full());

        let mut second = fill_record();
        second.image_url = "https://img/other".to_string();
        node.set_fill(second);
        assert_eq!(node.fill().unwrap().image_url, "https://img/n1");
    }

    #[test]
    fn test_position_prefers_merged() {
        let node = Node::new(core_record("n1"));
        assert_eq!(node.position().lat, 52.0);
        node.set_fill(fill_record());
        assert_eq!(node.position().lat, 52.000_01);
    }

    #[tokio::test]
    async fn test_cache_assets_stores_both() {
        let node = Node::new(core_record("n1"));
        node.set_fill(fill_record());
        let loader = CountingLoader::new();

        node.cache_assets(&loader).await.unwrap();

        assert!(node.assets_cached());
        assert_eq!(node.image().unwrap(), Bytes::from_static(b"jpeg"));
        assert!(node.mesh().is_some());
    }

    #[tokio::test]
    async fn test_cache_assets_second_call_is_noop() {
        let node = Node::new(core_record("n1"));
        node.set_fill(fill_record());
        let loader = CountingLoader::new();

        node.cache_assets(&loader).await.unwrap();
        node.cache_assets(&loader).await.unwrap();

        assert_eq!(loader.image_calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.mesh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_assets_failure_leaves_node_retryable() {
        let node = Node::new(core_record("n1"));
        node.set_fill(fill_record());
        let mut loader = CountingLoader::new();
        loader.fail_image = true;

        let err = node.cache_assets(&loader).await.unwrap_err();
        assert!(matches!(err, GraphError::Asset { .. }));
        assert!(!node.assets_cached());
        assert!(node.image().is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "before fill metadata")]
    async fn test_cache_assets_before_fill_panics() {
        let node = Node::new(core_record("n1"));
        let loader = CountingLoader::new();
        let _ = node.cache_assets(&loader).await;
    }

    #[test]
    fn test_edge_sets_first_computation_wins() {
        let node = Node::new(core_record("n1"));
        node.set_sequence_edges(EdgeSet::empty());
        assert!(node.sequence_edges_cached());
        assert!(!node.edges_cached());

        node.set_spatial_edges(EdgeSet::empty());
        assert!(node.edges_cached());
    }
}
