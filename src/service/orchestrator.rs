//! The graph orchestration service.
//!
//! Given a node key, [`GraphService::cache_node`] drives the graph
//! through the minimum necessary caching stages and yields the node
//! once its assets are resident. De-duplication, background spatial
//! prefetch and reset cancellation all live here.
//!
//! # Architecture
//!
//! ```text
//! cache_node(K) ──► StageCoalescer ──► fetch ─► fill ─► assets ──► Node
//!      │                                  (graph commits are
//!      │                                   generation-checked)
//!      └────────► SpatialPrefetcher task
//!                   tiles ─► spatial nodes ─► sequence ─► edges
//!                   (cancellable, failures logged, never surfaced)
//! ```
//!
//! The graph is the single shared mutable resource. Collaborator I/O
//! always happens outside the graph lock; results are committed in
//! short critical sections that first compare their captured
//! generation against the service's counter. `reset` bumps the
//! counter, so stale completions commit nothing.
//!
//! Stage work runs in spawned tasks. A caller that drops its future
//! mid-stage therefore cannot strand the stage: the work completes,
//! broadcasts its outcome and clears its markers regardless.

use crate::api::{AssetLoader, MetadataClient, NodeKey, SequenceClient, TileClient};
use crate::graph::{Direction, Graph, GraphError, GraphEvent, Node, PrimaryStage, Stage};
use crate::service::coalesce::{CoalescerStats, StageCoalescer, StageTicket};
use crate::service::config::GraphServiceConfig;
use crate::service::spatial::SpatialPrefetcher;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared state behind the service facade.
///
/// Held in an `Arc` so stage tasks and background spatial loops can
/// outlive the call that spawned them.
pub(crate) struct ServiceInner {
    pub(crate) graph: Mutex<Graph>,
    metadata: Arc<dyn MetadataClient>,
    tiles: Arc<dyn TileClient>,
    sequences: Arc<dyn SequenceClient>,
    assets: Arc<dyn AssetLoader>,
    coalescer: StageCoalescer,
    generation: AtomicU64,
    /// Root token for spatial prefetch loops; replaced on reset.
    spatial_root: Mutex<CancellationToken>,
    /// Number of live spatial prefetch loops.
    spatial_tasks: AtomicUsize,
    pub(crate) config: GraphServiceConfig,
}

impl ServiceInner {
    /// Current generation. Bumped by reset.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run a caching stage through the coalescer.
    ///
    /// The lead spawns `work` as a task, awaits it and broadcasts the
    /// outcome; followers await the broadcast. A closed broadcast
    /// means the registry was cleared by a reset, which supersedes
    /// the request.
    async fn run_stage<F>(
        self: Arc<Self>,
        key: NodeKey,
        stage: Stage,
        generation: u64,
        work: F,
    ) -> Result<(), GraphError>
    where
        F: Future<Output = Result<(), GraphError>> + Send + 'static,
    {
        match self.coalescer.register(&key, stage, generation) {
            StageTicket::Lead => {
                let inner = Arc::clone(&self);
                let task_key = key.clone();
                let handle = tokio::spawn(async move {
                    let outcome = work.await;
                    inner
                        .coalescer
                        .complete(&task_key, stage, generation, outcome.clone());
                    outcome
                });
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(join_error) if join_error.is_panic() => {
                        std::panic::resume_unwind(join_error.into_panic())
                    }
                    Err(_) => Err(GraphError::Superseded { key }),
                }
            }
            StageTicket::Follower(mut rx) => match rx.recv().await {
                Ok(outcome) => outcome,
                Err(_) => Err(GraphError::Superseded { key }),
            },
            StageTicket::Superseded => Err(GraphError::Superseded { key }),
        }
    }

    /// Fetch the minimal index entry for `key`, if still needed.
    async fn stage_fetch(self: Arc<Self>, key: NodeKey, generation: u64) -> Result<(), GraphError> {
        let inner = Arc::clone(&self);
        let work_key = key.clone();
        let work = async move {
            {
                let mut graph = inner.graph.lock().unwrap();
                if inner.generation() != generation {
                    return Err(GraphError::Superseded { key: work_key });
                }
                match graph.stage(&work_key) {
                    PrimaryStage::Unknown => graph.begin_fetch(&work_key),
                    PrimaryStage::Fetching => {}
                    _ => return Ok(()),
                }
            }

            let fetched = inner.metadata.fetch_core(&work_key).await;

            let mut graph = inner.graph.lock().unwrap();
            if inner.generation() != generation {
                return Err(GraphError::Superseded { key: work_key });
            }
            match fetched {
                Ok(record) => {
                    graph.complete_fetch(record);
                    Ok(())
                }
                Err(source) => {
                    graph.fail_fetch(&work_key);
                    Err(GraphError::Fetch {
                        key: work_key,
                        source,
                    })
                }
            }
        };
        self.run_stage(key, Stage::Fetch, generation, work).await
    }

    /// Promote `key` to full, if still needed.
    ///
    /// Shared by the primary track and by spatial neighbor caching,
    /// so a fill for a given key is in flight at most once no matter
    /// who asks for it.
    pub(crate) async fn stage_fill(
        self: Arc<Self>,
        key: NodeKey,
        generation: u64,
    ) -> Result<(), GraphError> {
        let inner = Arc::clone(&self);
        let work_key = key.clone();
        let work = async move {
            {
                let mut graph = inner.graph.lock().unwrap();
                if inner.generation() != generation {
                    return Err(GraphError::Superseded { key: work_key });
                }
                let node = graph.node(&work_key).ok_or_else(|| GraphError::NodeMissing {
                    key: work_key.clone(),
                })?;
                if node.full() {
                    return Ok(());
                }
                graph.begin_fill(&work_key);
            }

            let fetched = inner.metadata.fetch_fill(&work_key).await;

            let mut graph = inner.graph.lock().unwrap();
            if inner.generation() != generation {
                return Err(GraphError::Superseded { key: work_key });
            }
            match fetched {
                Ok(record) => graph.complete_fill(&work_key, record),
                Err(source) => {
                    graph.fail_fill(&work_key);
                    Err(GraphError::Fill {
                        key: work_key,
                        source,
                    })
                }
            }
        };
        self.run_stage(key, Stage::Fill, generation, work).await
    }

    /// Download assets for `key`, if still needed.
    async fn stage_assets(self: Arc<Self>, key: NodeKey, generation: u64) -> Result<(), GraphError> {
        let inner = Arc::clone(&self);
        let work_key = key.clone();
        let work = async move {
            let node = {
                let mut graph = inner.graph.lock().unwrap();
                if inner.generation() != generation {
                    return Err(GraphError::Superseded { key: work_key });
                }
                let node = graph.node(&work_key).ok_or_else(|| GraphError::NodeMissing {
                    key: work_key.clone(),
                })?;
                if node.assets_cached() {
                    return Ok(());
                }
                graph.begin_assets(&work_key);
                node
            };

            let cached = node.cache_assets(inner.assets.as_ref()).await;

            let mut graph = inner.graph.lock().unwrap();
            if inner.generation() != generation {
                return Err(GraphError::Superseded { key: work_key });
            }
            match cached {
                Ok(()) => {
                    graph.complete_assets(&work_key);
                    Ok(())
                }
                Err(err) => {
                    graph.fail_assets(&work_key);
                    Err(err)
                }
            }
        };
        self.run_stage(key, Stage::Assets, generation, work).await
    }

    /// Cache tile membership for `key`, if still needed.
    pub(crate) async fn stage_tiles(
        self: Arc<Self>,
        key: NodeKey,
        generation: u64,
    ) -> Result<(), GraphError> {
        let inner = Arc::clone(&self);
        let work_key = key.clone();
        let work = async move {
            let position = {
                let mut graph = inner.graph.lock().unwrap();
                if inner.generation() != generation {
                    return Err(GraphError::Superseded { key: work_key });
                }
                if graph.tiles_cached(&work_key) {
                    return Ok(());
                }
                let node = graph.node(&work_key).ok_or_else(|| GraphError::NodeMissing {
                    key: work_key.clone(),
                })?;
                graph.begin_spatial(&work_key, Stage::Tiles);
                node.position()
            };

            let fetched = inner.tiles.fetch_tiles_for(&work_key, position).await;

            let mut graph = inner.graph.lock().unwrap();
            if inner.generation() != generation {
                return Err(GraphError::Superseded { key: work_key });
            }
            graph.end_spatial(&work_key, Stage::Tiles);
            match fetched {
                Ok(result) => {
                    graph.complete_cache_tiles(&work_key, result);
                    Ok(())
                }
                Err(source) => Err(GraphError::SpatialStage {
                    key: work_key,
                    stage: Stage::Tiles,
                    source,
                }),
            }
        };
        self.run_stage(key, Stage::Tiles, generation, work).await
    }

    /// Fill the nodes sharing a tile with `key`, if still needed.
    ///
    /// Each neighbor fill rides [`ServiceInner::stage_fill`], so a
    /// concurrent primary fill of the same key shares one
    /// collaborator call with it.
    pub(crate) async fn stage_spatial_nodes(
        self: Arc<Self>,
        key: NodeKey,
        generation: u64,
    ) -> Result<(), GraphError> {
        let inner = Arc::clone(&self);
        let work_key = key.clone();
        let work = async move {
            let missing = {
                let mut graph = inner.graph.lock().unwrap();
                if inner.generation() != generation {
                    return Err(GraphError::Superseded { key: work_key });
                }
                if graph.spatial_nodes_cached(&work_key) {
                    return Ok(());
                }
                graph.begin_spatial(&work_key, Stage::SpatialNodes);
                graph.missing_spatial_fills(&work_key)
            };

            let outcomes = futures::future::join_all(
                missing
                    .iter()
                    .map(|k| Arc::clone(&inner).stage_fill(k.clone(), generation)),
            )
            .await;

            {
                let mut graph = inner.graph.lock().unwrap();
                if inner.generation() != generation {
                    return Err(GraphError::Superseded { key: work_key });
                }
                graph.end_spatial(&work_key, Stage::SpatialNodes);
            }

            for outcome in outcomes {
                match outcome {
                    Ok(()) => {}
                    Err(err @ GraphError::Superseded { .. }) => return Err(err),
                    Err(GraphError::Fill { source, .. }) => {
                        return Err(GraphError::SpatialStage {
                            key: work_key,
                            stage: Stage::SpatialNodes,
                            source,
                        });
                    }
                    Err(other) => return Err(other),
                }
            }

            let mut graph = inner.graph.lock().unwrap();
            if inner.generation() != generation {
                return Err(GraphError::Superseded { key: work_key });
            }
            graph.complete_cache_spatial_nodes(&work_key);
            Ok(())
        };
        self.run_stage(key, Stage::SpatialNodes, generation, work)
            .await
    }

    /// Cache sequence membership for `key`, if still needed.
    pub(crate) async fn stage_sequence(
        self: Arc<Self>,
        key: NodeKey,
        generation: u64,
    ) -> Result<(), GraphError> {
        let inner = Arc::clone(&self);
        let work_key = key.clone();
        let work = async move {
            let sequence_key = {
                let mut graph = inner.graph.lock().unwrap();
                if inner.generation() != generation {
                    return Err(GraphError::Superseded { key: work_key });
                }
                if graph.sequence_cached(&work_key) {
                    return Ok(());
                }
                let node = graph.node(&work_key).ok_or_else(|| GraphError::NodeMissing {
                    key: work_key.clone(),
                })?;
                let Some(sequence_key) = node.sequence_key().cloned() else {
                    return Ok(());
                };
                graph.begin_spatial(&work_key, Stage::Sequence);
                sequence_key
            };

            let fetched = inner.sequences.fetch_sequence(&sequence_key).await;

            let mut graph = inner.graph.lock().unwrap();
            if inner.generation() != generation {
                return Err(GraphError::Superseded { key: work_key });
            }
            graph.end_spatial(&work_key, Stage::Sequence);
            match fetched {
                Ok(members) => {
                    graph.complete_cache_sequence(&work_key, sequence_key, members);
                    Ok(())
                }
                Err(source) => Err(GraphError::SpatialStage {
                    key: work_key,
                    stage: Stage::Sequence,
                    source,
                }),
            }
        };
        self.run_stage(key, Stage::Sequence, generation, work).await
    }

    /// Compute spatial edges for `key`, if still needed.
    ///
    /// Purely local: the computation runs from already-cached
    /// neighbors, but it is routed through the same stage plumbing so
    /// its marker and de-duplication behave like every other stage.
    pub(crate) async fn stage_spatial_edges(
        self: Arc<Self>,
        key: NodeKey,
        generation: u64,
    ) -> Result<(), GraphError> {
        let inner = Arc::clone(&self);
        let work_key = key.clone();
        let work = async move {
            let mut graph = inner.graph.lock().unwrap();
            if inner.generation() != generation {
                return Err(GraphError::Superseded { key: work_key });
            }
            let node = graph.node(&work_key).ok_or_else(|| GraphError::NodeMissing {
                key: work_key.clone(),
            })?;
            if node.spatial_edges_cached() {
                return Ok(());
            }
            graph.begin_spatial(&work_key, Stage::SpatialEdges);
            let computed = graph.cache_spatial_edges(&work_key);
            graph.end_spatial(&work_key, Stage::SpatialEdges);
            computed
        };
        self.run_stage(key, Stage::SpatialEdges, generation, work)
            .await
    }

    /// Resolve `key` through the primary track: fetch, fill, assets.
    pub(crate) async fn resolve(
        self: Arc<Self>,
        key: NodeKey,
        generation: u64,
    ) -> Result<Arc<Node>, GraphError> {
        let needs_fetch = {
            let graph = self.graph.lock().unwrap();
            if self.generation() != generation {
                return Err(GraphError::Superseded { key });
            }
            matches!(
                graph.stage(&key),
                PrimaryStage::Unknown | PrimaryStage::Fetching
            )
        };
        if needs_fetch {
            Arc::clone(&self)
                .stage_fetch(key.clone(), generation)
                .await?;
        }

        let needs_fill = {
            let graph = self.graph.lock().unwrap();
            if self.generation() != generation {
                return Err(GraphError::Superseded { key });
            }
            match graph.node(&key) {
                Some(node) => !node.full(),
                None => return Err(GraphError::NodeMissing { key }),
            }
        };
        if needs_fill {
            Arc::clone(&self)
                .stage_fill(key.clone(), generation)
                .await?;
        }

        let node = {
            let graph = self.graph.lock().unwrap();
            if self.generation() != generation {
                return Err(GraphError::Superseded { key });
            }
            match graph.node(&key) {
                Some(node) => node,
                None => return Err(GraphError::NodeMissing { key }),
            }
        };
        if node.assets_cached() {
            return Ok(node);
        }

        Arc::clone(&self).stage_assets(key, generation).await?;
        Ok(node)
    }
}

/// Orchestrates node and graph caching.
///
/// One instance per viewer session; share it behind an `Arc` when
/// multiple components resolve nodes.
pub struct GraphService {
    inner: Arc<ServiceInner>,
}

impl GraphService {
    /// Create a service with default configuration.
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        tiles: Arc<dyn TileClient>,
        sequences: Arc<dyn SequenceClient>,
        assets: Arc<dyn AssetLoader>,
    ) -> Self {
        Self::with_config(
            metadata,
            tiles,
            sequences,
            assets,
            GraphServiceConfig::default(),
        )
    }

    /// Create a service with custom configuration.
    pub fn with_config(
        metadata: Arc<dyn MetadataClient>,
        tiles: Arc<dyn TileClient>,
        sequences: Arc<dyn SequenceClient>,
        assets: Arc<dyn AssetLoader>,
        config: GraphServiceConfig,
    ) -> Self {
        let graph = Graph::new(config.edges.clone(), config.event_capacity);
        let coalescer = StageCoalescer::new(config.coalesce_capacity);
        Self {
            inner: Arc::new(ServiceInner {
                graph: Mutex::new(graph),
                metadata,
                tiles,
                sequences,
                assets,
                coalescer,
                generation: AtomicU64::new(0),
                spatial_root: Mutex::new(CancellationToken::new()),
                spatial_tasks: AtomicUsize::new(0),
                config,
            }),
        }
    }

    /// Resolve `key` to a usable node.
    ///
    /// Drives fetch, fill and asset caching as needed; concurrent
    /// calls for the same key share the same in-flight collaborator
    /// calls and observe identical results. The returned node has
    /// `full() && assets_cached()`.
    ///
    /// A spatial prefetch loop for the key is launched alongside and
    /// advances tiles, neighbor fills, sequence membership and edges
    /// in the background. Its failures are logged, never surfaced
    /// here.
    pub async fn cache_node(&self, key: &NodeKey) -> Result<Arc<Node>, GraphError> {
        let generation = self.inner.generation();
        debug!(key = %key, generation, "node requested");

        self.spawn_spatial(key.clone(), generation);

        let resolved = Arc::clone(&self.inner).resolve(key.clone(), generation).await;
        match &resolved {
            Ok(node) => debug!(key = %node.key(), "node ready"),
            Err(err) => warn!(key = %key, error = %err, "node caching failed"),
        }
        resolved
    }

    /// Cancel background work, clear the graph and resolve `key`
    /// against the fresh graph.
    ///
    /// Primary-path work in flight at reset time completes against
    /// the old generation and is discarded; callers awaiting it
    /// observe [`GraphError::Superseded`].
    pub async fn reset(&self, key: &NodeKey) -> Result<Arc<Node>, GraphError> {
        info!(key = %key, "graph reset requested");

        {
            let mut root = self.inner.spatial_root.lock().unwrap();
            root.cancel();
            *root = CancellationToken::new();
        }

        // Clear the registry before bumping the generation: an entry
        // registered under the new generation arrives after the bump
        // and must survive this clear.
        self.inner.coalescer.clear();

        let generation = {
            let mut graph = self.inner.graph.lock().unwrap();
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            graph.reset();
            generation
        };

        self.spawn_spatial(key.clone(), generation);
        Arc::clone(&self.inner).resolve(key.clone(), generation).await
    }

    /// Launch a background spatial prefetch loop for `key`.
    fn spawn_spatial(&self, key: NodeKey, generation: u64) {
        let token = self.inner.spatial_root.lock().unwrap().child_token();
        let prefetcher = SpatialPrefetcher::new(Arc::clone(&self.inner), key, generation, token);

        self.inner.spatial_tasks.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            prefetcher.run().await;
            inner.spatial_tasks.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// The key one step from `node` in `direction`, if the graph
    /// holds a cached edge that way.
    ///
    /// # Panics
    ///
    /// Panics when the node's edges are not cached yet; see
    /// [`Graph::next_key`].
    pub fn next_key(&self, node: &Node, direction: Direction) -> Option<NodeKey> {
        self.inner.graph.lock().unwrap().next_key(node, direction)
    }

    /// Subscribe to graph change notifications.
    ///
    /// Purely a notification channel: receivers must re-query state.
    pub fn events(&self) -> broadcast::Receiver<GraphEvent> {
        self.inner.graph.lock().unwrap().subscribe()
    }

    /// Whether a node exists for `key`.
    pub fn has_node(&self, key: &NodeKey) -> bool {
        self.inner.graph.lock().unwrap().has_node(key)
    }

    /// The node for `key`, when present.
    pub fn node(&self, key: &NodeKey) -> Option<Arc<Node>> {
        self.inner.graph.lock().unwrap().node(key)
    }

    /// The key's position on the primary caching track.
    pub fn stage(&self, key: &NodeKey) -> PrimaryStage {
        self.inner.graph.lock().unwrap().stage(key)
    }

    /// Whether tile membership is cached for `key`.
    pub fn tiles_cached(&self, key: &NodeKey) -> bool {
        self.inner.graph.lock().unwrap().tiles_cached(key)
    }

    /// Whether every node sharing a tile with `key` is full.
    pub fn spatial_nodes_cached(&self, key: &NodeKey) -> bool {
        self.inner.graph.lock().unwrap().spatial_nodes_cached(key)
    }

    /// Whether sequence membership is cached for `key`.
    pub fn sequence_cached(&self, key: &NodeKey) -> bool {
        self.inner.graph.lock().unwrap().sequence_cached(key)
    }

    /// Number of live spatial prefetch loops.
    pub fn spatial_task_count(&self) -> usize {
        self.inner.spatial_tasks.load(Ordering::SeqCst)
    }

    /// Stage de-duplication statistics.
    pub fn stage_stats(&self) -> CoalescerStats {
        self.inner.coalescer.stats()
    }
}
