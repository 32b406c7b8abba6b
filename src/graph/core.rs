//! The graph store.
//!
//! A key-indexed store of nodes plus the per-key caching state the
//! orchestrator drives: a primary track (fetch → fill → assets) and an
//! orthogonal spatial track (tiles → spatial nodes → sequence →
//! spatial edges). The graph itself is synchronous; every asynchronous
//! stage is expressed as a begin/complete/fail triple so the service
//! can perform collaborator I/O outside the graph lock and commit the
//! result in a short critical section. In-flight markers are cleared
//! on success and failure alike, so a failed stage can always be
//! re-attempted.
//!
//! Every mutation emits a [`GraphEvent`] on a broadcast channel. The
//! events are a notification channel only: receivers re-query graph
//! state rather than trusting the event payload.

use crate::api::{CoreNodeRecord, FillNodeRecord, NodeKey, SequenceKey, TileFetchResult, TileId};
use crate::graph::edge::{
    compute_sequence_edges, compute_spatial_edges, Direction, NeighborCandidate, SpatialEdgeConfig,
    SpatialOrigin,
};
use crate::graph::error::GraphError;
use crate::graph::node::Node;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// An asynchronous caching stage.
///
/// Fetch, fill and assets form the primary track; the rest form the
/// spatial track advanced by the background prefetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Minimal metadata fetch.
    Fetch,
    /// Full metadata fill.
    Fill,
    /// Image and mesh download.
    Assets,
    /// Geographic tile membership.
    Tiles,
    /// Fill metadata for nodes sharing a tile.
    SpatialNodes,
    /// Sequence membership.
    Sequence,
    /// Spatial edge computation.
    SpatialEdges,
}

impl Stage {
    /// Whether the stage belongs to the background spatial track.
    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            Stage::Tiles | Stage::SpatialNodes | Stage::Sequence | Stage::SpatialEdges
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Fill => "fill",
            Stage::Assets => "assets",
            Stage::Tiles => "tiles",
            Stage::SpatialNodes => "spatial-nodes",
            Stage::Sequence => "sequence",
            Stage::SpatialEdges => "spatial-edges",
        };
        f.write_str(name)
    }
}

/// Position of a key on the primary caching track.
///
/// The transient states (`Fetching`, `Filling`, `AssetCaching`) are
/// explicit markers; the steady states are derived from what the node
/// actually holds, which keeps illegal combinations (cached assets on
/// a non-full node) unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryStage {
    /// The key has never been seen.
    Unknown,
    /// A minimal metadata fetch is outstanding.
    Fetching,
    /// The node exists with index data only.
    Partial,
    /// A fill fetch is outstanding.
    Filling,
    /// Complete metadata is loaded.
    Full,
    /// An asset download is outstanding.
    AssetCaching,
    /// Assets are resident; the node is usable.
    Ready,
}

/// Notification of a graph mutation.
///
/// Consumers must re-query graph state; receiving an event guarantees
/// nothing about current cached state.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// A node's index entry was inserted.
    NodeFetched(NodeKey),
    /// A node was promoted to full.
    NodeFilled(NodeKey),
    /// A node's assets became resident.
    AssetsCached(NodeKey),
    /// Tile membership for a node was cached.
    TilesCached(NodeKey),
    /// All nodes sharing a tile with the node are now full.
    SpatialNodesCached(NodeKey),
    /// The node's sequence membership was cached.
    SequenceCached(NodeKey),
    /// The node's sequence edges were computed.
    SequenceEdgesCached(NodeKey),
    /// The node's spatial edges were computed.
    SpatialEdgesCached(NodeKey),
    /// The graph was cleared.
    Reset,
}

impl GraphEvent {
    /// The key the event concerns, if any.
    pub fn key(&self) -> Option<&NodeKey> {
        match self {
            Self::NodeFetched(key)
            | Self::NodeFilled(key)
            | Self::AssetsCached(key)
            | Self::TilesCached(key)
            | Self::SpatialNodesCached(key)
            | Self::SequenceCached(key)
            | Self::SequenceEdgesCached(key)
            | Self::SpatialEdgesCached(key) => Some(key),
            Self::Reset => None,
        }
    }
}

/// Key-indexed node store with per-key caching state.
///
/// One instance lives per viewer session, owned by the orchestration
/// service and mutated only through it. Nodes are created on first
/// sight and removed only by [`Graph::reset`]; there is no eviction
/// policy beyond that.
pub struct Graph {
    nodes: HashMap<NodeKey, Arc<Node>>,
    /// Transient primary-track markers. Steady states are derived.
    transients: HashMap<NodeKey, PrimaryStage>,
    /// Spatial-track stages currently outstanding.
    spatial_in_flight: HashSet<(NodeKey, Stage)>,
    /// Tiles covering each node whose tile fetch completed.
    node_tiles: HashMap<NodeKey, Vec<TileId>>,
    /// Node membership of each known tile.
    tile_nodes: HashMap<TileId, Vec<NodeKey>>,
    /// Cached sequence membership.
    sequences: HashMap<SequenceKey, Vec<NodeKey>>,
    events: broadcast::Sender<GraphEvent>,
    edge_config: SpatialEdgeConfig,
}

impl Graph {
    /// Create an empty graph.
    ///
    /// `event_capacity` bounds the change-notification channel; slow
    /// receivers observe a lag error and re-query, per the event
    /// contract.
    pub fn new(edge_config: SpatialEdgeConfig, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            nodes: HashMap::new(),
            transients: HashMap::new(),
            spatial_in_flight: HashSet::new(),
            node_tiles: HashMap::new(),
            tile_nodes: HashMap::new(),
            sequences: HashMap::new(),
            events,
            edge_config,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: GraphEvent) {
        // No receivers is fine; the graph does not care who listens.
        let _ = self.events.send(event);
    }

    /// Whether a node exists for `key`.
    pub fn has_node(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// The node for `key`, when present.
    pub fn node(&self, key: &NodeKey) -> Option<Arc<Node>> {
        self.nodes.get(key).cloned()
    }

    /// Number of nodes currently in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The key's position on the primary caching track.
    pub fn stage(&self, key: &NodeKey) -> PrimaryStage {
        if let Some(transient) = self.transients.get(key) {
            return *transient;
        }
        match self.nodes.get(key) {
            Some(node) if node.assets_cached() => PrimaryStage::Ready,
            Some(node) if node.full() => PrimaryStage::Full,
            Some(_) => PrimaryStage::Partial,
            None => PrimaryStage::Unknown,
        }
    }

    // ------------------------------------------------------------------
    // Primary track: fetch
    // ------------------------------------------------------------------

    /// Mark a fetch outstanding for `key`.
    pub fn begin_fetch(&mut self, key: &NodeKey) {
        self.transients.insert(key.clone(), PrimaryStage::Fetching);
    }

    /// Commit a completed fetch: insert the node and clear the marker.
    ///
    /// When the node already exists (discovered through a neighbor's
    /// tiles while the fetch was in flight) the existing node is kept.
    pub fn complete_fetch(&mut self, record: CoreNodeRecord) {
        let key = record.key.clone();
        self.transients.remove(&key);
        self.nodes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Node::new(record)));
        self.emit(GraphEvent::NodeFetched(key));
    }

    /// Clear the fetch marker after a failed fetch.
    pub fn fail_fetch(&mut self, key: &NodeKey) {
        self.transients.remove(key);
    }

    // ------------------------------------------------------------------
    // Primary track: fill
    // ------------------------------------------------------------------

    /// Mark a fill outstanding for `key`.
    pub fn begin_fill(&mut self, key: &NodeKey) {
        self.transients.insert(key.clone(), PrimaryStage::Filling);
    }

    /// Commit a completed fill: promote the node to full.
    pub fn complete_fill(
        &mut self,
        key: &NodeKey,
        record: FillNodeRecord,
    ) -> Result<(), GraphError> {
        self.transients.remove(key);
        let node = self
            .nodes
            .get(key)
            .ok_or_else(|| GraphError::NodeMissing { key: key.clone() })?;
        node.set_fill(record);
        self.emit(GraphEvent::NodeFilled(key.clone()));
        Ok(())
    }

    /// Clear the fill marker after a failed fill.
    pub fn fail_fill(&mut self, key: &NodeKey) {
        self.transients.remove(key);
    }

    // ------------------------------------------------------------------
    // Primary track: assets
    // ------------------------------------------------------------------

    /// Mark an asset download outstanding for `key`.
    ///
    /// # Panics
    ///
    /// Panics when the node is not full; assets cannot be cached
    /// before fill metadata is known.
    pub fn begin_assets(&mut self, key: &NodeKey) {
        assert!(
            self.nodes.get(key).is_some_and(|n| n.full()),
            "asset caching started for node {} before it is full",
            key
        );
        self.transients
            .insert(key.clone(), PrimaryStage::AssetCaching);
    }

    /// Clear the asset marker after the node stored its assets.
    pub fn complete_assets(&mut self, key: &NodeKey) {
        self.transients.remove(key);
        self.emit(GraphEvent::AssetsCached(key.clone()));
    }

    /// Clear the asset marker after a failed download.
    pub fn fail_assets(&mut self, key: &NodeKey) {
        self.transients.remove(key);
    }

    // ------------------------------------------------------------------
    // Spatial track
    // ------------------------------------------------------------------

    /// Whether the given spatial stage is outstanding for `key`.
    pub fn spatial_in_flight(&self, key: &NodeKey, stage: Stage) -> bool {
        self.spatial_in_flight.contains(&(key.clone(), stage))
    }

    /// Mark a spatial stage outstanding.
    pub fn begin_spatial(&mut self, key: &NodeKey, stage: Stage) {
        debug_assert!(stage.is_spatial(), "{stage} is not a spatial stage");
        self.spatial_in_flight.insert((key.clone(), stage));
    }

    /// Clear a spatial stage marker, on success or failure.
    pub fn end_spatial(&mut self, key: &NodeKey, stage: Stage) {
        self.spatial_in_flight.remove(&(key.clone(), stage));
    }

    /// Whether tile membership has been cached for `key`.
    pub fn tiles_cached(&self, key: &NodeKey) -> bool {
        self.node_tiles.contains_key(key)
    }

    /// Commit a completed tile fetch for `key`.
    ///
    /// Inserts index entries for newly discovered nodes; nodes already
    /// in the graph are kept as they are.
    pub fn complete_cache_tiles(&mut self, key: &NodeKey, result: TileFetchResult) {
        let mut ids = Vec::with_capacity(result.tiles.len());
        for tile in result.tiles {
            let members = self.tile_nodes.entry(tile.id.clone()).or_default();
            for record in tile.nodes {
                if !members.contains(&record.key) {
                    members.push(record.key.clone());
                }
                self.nodes
                    .entry(record.key.clone())
                    .or_insert_with(|| Arc::new(Node::new(record)));
            }
            ids.push(tile.id);
        }
        debug!(key = %key, tiles = ids.len(), "tile membership cached");
        self.node_tiles.insert(key.clone(), ids);
        self.emit(GraphEvent::TilesCached(key.clone()));
    }

    /// Keys of every node sharing a tile with `key`, in key order.
    fn tile_member_keys(&self, key: &NodeKey) -> BTreeSet<NodeKey> {
        let mut members = BTreeSet::new();
        if let Some(tiles) = self.node_tiles.get(key) {
            for tile in tiles {
                if let Some(keys) = self.tile_nodes.get(tile) {
                    members.extend(keys.iter().cloned());
                }
            }
        }
        members
    }

    /// Whether every node sharing a tile with `key` is full.
    ///
    /// False until tiles are cached; the spatial walk orders the two
    /// stages accordingly.
    pub fn spatial_nodes_cached(&self, key: &NodeKey) -> bool {
        if !self.tiles_cached(key) {
            return false;
        }
        self.tile_member_keys(key)
            .iter()
            .filter_map(|k| self.nodes.get(k))
            .all(|node| node.full())
    }

    /// Keys sharing a tile with `key` that still need a fill, in key
    /// order.
    pub fn missing_spatial_fills(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.tile_member_keys(key)
            .into_iter()
            .filter(|k| self.nodes.get(k).is_some_and(|node| !node.full()))
            .collect()
    }

    /// Mark the spatial-node shell of `key` complete.
    ///
    /// The neighbor fills themselves are committed one by one through
    /// [`Graph::complete_fill`]; this only announces that the shell
    /// as a whole is done.
    pub fn complete_cache_spatial_nodes(&mut self, key: &NodeKey) {
        self.emit(GraphEvent::SpatialNodesCached(key.clone()));
    }

    /// Whether sequence membership is cached for `key`.
    ///
    /// Trivially true for nodes that belong to no sequence.
    pub fn sequence_cached(&self, key: &NodeKey) -> bool {
        match self.nodes.get(key).and_then(|n| n.sequence_key().cloned()) {
            Some(sequence_key) => self.sequences.contains_key(&sequence_key),
            None => self.has_node(key),
        }
    }

    /// Cached membership of a sequence, when present.
    pub fn sequence(&self, sequence_key: &SequenceKey) -> Option<&[NodeKey]> {
        self.sequences.get(sequence_key).map(|v| v.as_slice())
    }

    /// Commit a completed sequence fetch on behalf of `key`.
    pub fn complete_cache_sequence(
        &mut self,
        key: &NodeKey,
        sequence_key: SequenceKey,
        members: Vec<NodeKey>,
    ) {
        self.sequences.insert(sequence_key, members);
        self.emit(GraphEvent::SequenceCached(key.clone()));
    }

    /// Compute and store sequence edges for `key` from its cached
    /// sequence. Nodes without a sequence get an empty edge set.
    /// No-op when already computed.
    pub fn cache_sequence_edges(&self, key: &NodeKey) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get(key)
            .ok_or_else(|| GraphError::NodeMissing { key: key.clone() })?;
        if node.sequence_edges_cached() {
            return Ok(());
        }

        let edges = match node.sequence_key() {
            Some(sequence_key) => match self.sequences.get(sequence_key) {
                Some(members) => compute_sequence_edges(key, members),
                None => return Ok(()), // sequence not cached yet
            },
            None => Default::default(),
        };

        debug!(key = %key, edges = edges.len(), "sequence edges cached");
        node.set_sequence_edges(edges);
        self.emit(GraphEvent::SequenceEdgesCached(key.clone()));
        Ok(())
    }

    /// Compute and store spatial edges for `key` from the full nodes
    /// sharing a tile with it. No-op when already computed.
    ///
    /// The computation sees the neighbors known right now; neighbors
    /// discovered later do not trigger a recomputation.
    pub fn cache_spatial_edges(&self, key: &NodeKey) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get(key)
            .ok_or_else(|| GraphError::NodeMissing { key: key.clone() })?;
        if node.spatial_edges_cached() {
            return Ok(());
        }

        let origin = SpatialOrigin {
            key: key.clone(),
            position: node.position(),
            ca: node.ca(),
        };
        let neighbors: Vec<NeighborCandidate> = self
            .tile_member_keys(key)
            .iter()
            .filter(|k| *k != key)
            .filter_map(|k| self.nodes.get(k))
            .filter(|n| n.full())
            .map(|n| NeighborCandidate {
                key: n.key().clone(),
                position: n.position(),
                ca: n.ca(),
                pano: n.pano(),
            })
            .collect();

        let edges = compute_spatial_edges(&origin, &neighbors, &self.edge_config);
        debug!(key = %key, edges = edges.len(), candidates = neighbors.len(), "spatial edges cached");
        node.set_spatial_edges(edges);
        self.emit(GraphEvent::SpatialEdgesCached(key.clone()));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The key one step from `node` in `direction`, if the graph holds
    /// a cached edge that way.
    ///
    /// # Panics
    ///
    /// Panics when the node's edges are not yet cached. Callers must
    /// resolve the node through the service first; querying earlier is
    /// an ordering bug, not a retryable condition.
    pub fn next_key(&self, node: &Node, direction: Direction) -> Option<NodeKey> {
        assert!(
            node.edges_cached(),
            "navigation queried for node {} before its edges are cached",
            node.key()
        );
        let edges = if direction.is_sequence() {
            node.sequence_edges()
        } else {
            node.spatial_edges()
        };
        edges.and_then(|set| set.get(direction).map(|e| e.to.clone()))
    }

    /// Clear all nodes, markers and bookkeeping.
    ///
    /// Asynchronous work outstanding at reset time is the service's
    /// problem: it discards stale completions against its generation
    /// counter.
    pub fn reset(&mut self) {
        let nodes = self.nodes.len();
        self.nodes.clear();
        self.transients.clear();
        self.spatial_in_flight.clear();
        self.node_tiles.clear();
        self.tile_nodes.clear();
        self.sequences.clear();
        debug!(dropped_nodes = nodes, "graph reset");
        self.emit(GraphEvent::Reset);
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("transients", &self.transients.len())
            .field("spatial_in_flight", &self.spatial_in_flight.len())
            .field("tiles", &self.tile_nodes.len())
            .field("sequences", &self.sequences.len())
            .finish()
    }
}
