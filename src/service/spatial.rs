//! Background spatial prefetch.
//!
//! One loop per `cache_node` invocation walks the spatial gate for its
//! key: tiles → spatial nodes → sequence → spatial edges. The loop
//! re-evaluates the gate on every graph change, issues the first
//! missing stage (attaching to in-flight work when another loop got
//! there first) and terminates once the gate is fully satisfied.
//!
//! The loop runs on a child of the service's root cancellation token;
//! a reset cancels the root, and a cancelled loop stops before its
//! next stage call without touching the cleared graph. Stage failures
//! are logged and abandon the loop for this invocation; the stage
//! markers were cleared, so a later request may re-attempt.

use crate::api::NodeKey;
use crate::graph::{GraphError, Stage};
use crate::service::orchestrator::ServiceInner;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What the gate evaluation decided.
enum GateStep {
    /// All four spatial stages are satisfied.
    Complete,
    /// Issue (or attach to) the given stage.
    Run(Stage),
    /// Nothing to do yet; wait for a graph change.
    Wait,
}

/// A cancellable background walk of the spatial caching gate.
pub(crate) struct SpatialPrefetcher {
    inner: Arc<ServiceInner>,
    key: NodeKey,
    generation: u64,
    token: CancellationToken,
}

impl SpatialPrefetcher {
    pub(crate) fn new(
        inner: Arc<ServiceInner>,
        key: NodeKey,
        generation: u64,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner,
            key,
            generation,
            token,
        }
    }

    /// Run the prefetch loop to completion, cancellation or abandon.
    pub(crate) async fn run(self) {
        debug!(key = %self.key, "spatial prefetch started");

        let mut changed = self.inner.graph.lock().unwrap().subscribe();
        let check_interval = self.inner.config.spatial_check_interval;

        loop {
            if self.token.is_cancelled() || self.inner.generation() != self.generation {
                debug!(key = %self.key, "spatial prefetch cancelled");
                return;
            }

            let step = match self.evaluate() {
                Ok(step) => step,
                Err(err) => {
                    debug!(key = %self.key, error = %err, "spatial prefetch stopped");
                    return;
                }
            };

            match step {
                GateStep::Complete => {
                    debug!(key = %self.key, "spatial caching complete");
                    return;
                }
                GateStep::Run(stage) => {
                    let outcome = tokio::select! {
                        biased;

                        _ = self.token.cancelled() => return,
                        outcome = self.advance(stage) => outcome,
                    };
                    match outcome {
                        Ok(()) => {}
                        Err(GraphError::Superseded { .. }) => return,
                        Err(err) => {
                            warn!(
                                key = %self.key,
                                stage = %stage,
                                error = %err,
                                "spatial stage failed, abandoning prefetch"
                            );
                            return;
                        }
                    }
                }
                GateStep::Wait => {
                    let woken_by_tick = tokio::select! {
                        biased;

                        _ = self.token.cancelled() => return,
                        received = changed.recv() => {
                            if matches!(received, Err(broadcast::error::RecvError::Closed)) {
                                return;
                            }
                            // A lagged receiver is fine: state is
                            // re-queried either way.
                            false
                        }
                        _ = tokio::time::sleep(check_interval) => true,
                    };

                    if woken_by_tick && !self.inner.graph.lock().unwrap().has_node(&self.key) {
                        // The primary fetch this loop was waiting on
                        // never produced a node; nothing spatial can
                        // happen for the key.
                        debug!(key = %self.key, "spatial prefetch abandoned, node never appeared");
                        return;
                    }
                }
            }
        }
    }

    /// Evaluate the spatial gate under the graph lock.
    ///
    /// Sequence edges are computed inline the moment the sequence is
    /// cached; everything else is reported back as a stage to run.
    fn evaluate(&self) -> Result<GateStep, GraphError> {
        let graph = self.inner.graph.lock().unwrap();

        if !graph.has_node(&self.key) {
            return Ok(GateStep::Wait);
        }
        if !graph.tiles_cached(&self.key) {
            return Ok(GateStep::Run(Stage::Tiles));
        }
        if !graph.spatial_nodes_cached(&self.key) {
            return Ok(GateStep::Run(Stage::SpatialNodes));
        }
        if !graph.sequence_cached(&self.key) {
            return Ok(GateStep::Run(Stage::Sequence));
        }

        let node = graph.node(&self.key).ok_or_else(|| GraphError::NodeMissing {
            key: self.key.clone(),
        })?;
        if !node.sequence_edges_cached() {
            graph.cache_sequence_edges(&self.key)?;
        }
        if !node.spatial_edges_cached() {
            return Ok(GateStep::Run(Stage::SpatialEdges));
        }

        Ok(GateStep::Complete)
    }

    /// Issue one spatial stage through the shared stage plumbing.
    async fn advance(&self, stage: Stage) -> Result<(), GraphError> {
        let inner = Arc::clone(&self.inner);
        let key = self.key.clone();
        match stage {
            Stage::Tiles => inner.stage_tiles(key, self.generation).await,
            Stage::SpatialNodes => inner.stage_spatial_nodes(key, self.generation).await,
            Stage::Sequence => inner.stage_sequence(key, self.generation).await,
            Stage::SpatialEdges => inner.stage_spatial_edges(key, self.generation).await,
            // The primary track never reaches the spatial gate.
            Stage::Fetch | Stage::Fill | Stage::Assets => unreachable!("{stage} is not spatial"),
        }
    }
}
