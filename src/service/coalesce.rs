//! Stage coalescing.
//!
//! Guarantees the core de-duplication invariant: for a given key, at
//! most one collaborator call per caching stage is in flight at any
//! time, no matter how many callers concurrently request that key.
//! The first caller to register becomes the lead and performs the
//! work; everyone arriving while it is outstanding subscribes to the
//! same broadcast and receives the identical outcome.
//!
//! # Architecture
//!
//! ```text
//! cache_node(K) ─┐
//!                │                                 one
//! cache_node(K) ─┼──► StageCoalescer ──────► collaborator call
//!                │        │                        │
//! cache_node(K) ─┘        │                        │
//!                         ▼                        ▼
//!                 [all three receive          [lead commits,
//!                  the same outcome]◄──────────broadcasts]
//! ```
//!
//! Entries are tagged with the generation they were registered under.
//! A reset clears the registry; a lead completing after that finds its
//! entry gone and broadcasts to nobody, while its former followers see
//! the channel close and report the request as superseded.

use crate::api::NodeKey;
use crate::graph::{GraphError, Stage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Outcome of a caching stage, replayed to every coalesced caller.
pub(crate) type StageOutcome = Result<(), GraphError>;

struct InFlight {
    generation: u64,
    tx: broadcast::Sender<StageOutcome>,
}

/// What a caller got when registering for a stage.
pub(crate) enum StageTicket {
    /// First caller in: run the work and call [`StageCoalescer::complete`].
    Lead,
    /// The stage is outstanding: await the broadcast outcome.
    Follower(broadcast::Receiver<StageOutcome>),
    /// The caller's generation predates an in-flight newer stage; the
    /// request was superseded by a reset.
    Superseded,
}

impl StageTicket {
    /// Whether this ticket makes the caller the lead.
    pub(crate) fn is_lead(&self) -> bool {
        matches!(self, Self::Lead)
    }
}

/// Statistics for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone)]
pub struct CoalescerStats {
    /// Stage registrations received.
    pub total: u64,
    /// Registrations that led new work.
    pub leads: u64,
    /// Registrations that attached to in-flight work.
    pub coalesced: u64,
}

impl CoalescerStats {
    /// Fraction of registrations that avoided duplicate work.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.coalesced as f64 / self.total as f64
        }
    }
}

/// Tracks in-flight caching stages per (key, stage).
pub(crate) struct StageCoalescer {
    in_flight: DashMap<(NodeKey, Stage), InFlight>,
    capacity: usize,
    total: AtomicU64,
    leads: AtomicU64,
    coalesced: AtomicU64,
}

impl StageCoalescer {
    /// Create a coalescer whose result broadcasts hold `capacity`
    /// buffered outcomes.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            in_flight: DashMap::new(),
            capacity,
            total: AtomicU64::new(0),
            leads: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Register a caller for `(key, stage)` under `generation`.
    pub(crate) fn register(&self, key: &NodeKey, stage: Stage, generation: u64) -> StageTicket {
        self.total.fetch_add(1, Ordering::Relaxed);

        match self.in_flight.entry((key.clone(), stage)) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.generation == generation {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, stage = %stage, "coalescing onto in-flight stage");
                    StageTicket::Follower(current.tx.subscribe())
                } else if current.generation < generation {
                    // Leftover from before a reset; replace it. Its
                    // followers see the channel close.
                    let (tx, _rx) = broadcast::channel(self.capacity);
                    entry.insert(InFlight { generation, tx });
                    self.leads.fetch_add(1, Ordering::Relaxed);
                    StageTicket::Lead
                } else {
                    StageTicket::Superseded
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(self.capacity);
                entry.insert(InFlight { generation, tx });
                self.leads.fetch_add(1, Ordering::Relaxed);
                StageTicket::Lead
            }
        }
    }

    /// Complete a stage as its lead, broadcasting the outcome to all
    /// followers. A no-op when the entry was cleared by a reset or
    /// replaced under a newer generation.
    pub(crate) fn complete(
        &self,
        key: &NodeKey,
        stage: Stage,
        generation: u64,
        outcome: StageOutcome,
    ) {
        let removed = self
            .in_flight
            .remove_if(&(key.clone(), stage), |_, v| v.generation == generation);
        if let Some((_, entry)) = removed {
            let waiters = entry.tx.receiver_count();
            if waiters > 0 {
                debug!(key = %key, stage = %stage, waiters, "broadcasting stage outcome");
            }
            let _ = entry.tx.send(outcome);
        }
    }

    /// Drop every in-flight entry. Followers of dropped entries see
    /// their channel close and report the request as superseded.
    pub(crate) fn clear(&self) {
        self.in_flight.clear();
    }

    /// Number of stages currently in flight.
    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// A snapshot of the current statistics.
    pub(crate) fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            total: self.total.load(Ordering::Relaxed),
            leads: self.leads.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> NodeKey {
        NodeKey::from(k)
    }

    #[tokio::test]
    async fn test_first_registration_leads() {
        let coalescer = StageCoalescer::new(16);
        assert!(coalescer.register(&key("a"), Stage::Fetch, 0).is_lead());
        assert_eq!(coalescer.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_second_registration_follows() {
        let coalescer = StageCoalescer::new(16);
        let _lead = coalescer.register(&key("a"), Stage::Fetch, 0);
        let second = coalescer.register(&key("a"), Stage::Fetch, 0);
        assert!(!second.is_lead());
    }

    #[tokio::test]
    async fn test_stages_coalesce_independently() {
        let coalescer = StageCoalescer::new(16);
        assert!(coalescer.register(&key("a"), Stage::Fetch, 0).is_lead());
        assert!(coalescer.register(&key("a"), Stage::Fill, 0).is_lead());
        assert!(coalescer.register(&key("b"), Stage::Fetch, 0).is_lead());
    }

    #[tokio::test]
    async fn test_followers_receive_lead_outcome() {
        let coalescer = StageCoalescer::new(16);
        let _lead = coalescer.register(&key("a"), Stage::Assets, 0);
        let follower = coalescer.register(&key("a"), Stage::Assets, 0);

        coalescer.complete(&key("a"), Stage::Assets, 0, Ok(()));

        match follower {
            StageTicket::Follower(mut rx) => {
                assert!(rx.recv().await.unwrap().is_ok());
            }
            _ => panic!("expected follower"),
        }
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_closes_follower_channels() {
        let coalescer = StageCoalescer::new(16);
        let _lead = coalescer.register(&key("a"), Stage::Fetch, 0);
        let follower = coalescer.register(&key("a"), Stage::Fetch, 0);

        coalescer.clear();

        match follower {
            StageTicket::Follower(mut rx) => {
                assert!(rx.recv().await.is_err());
            }
            _ => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn test_stale_lead_completion_is_ignored() {
        let coalescer = StageCoalescer::new(16);
        let _old = coalescer.register(&key("a"), Stage::Fetch, 0);
        coalescer.clear();

        // New generation takes the slot.
        assert!(coalescer.register(&key("a"), Stage::Fetch, 1).is_lead());

        // Old lead completes late; the new entry must survive.
        coalescer.complete(&key("a"), Stage::Fetch, 0, Ok(()));
        assert_eq!(coalescer.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_older_generation_is_superseded() {
        let coalescer = StageCoalescer::new(16);
        let _new = coalescer.register(&key("a"), Stage::Fetch, 5);
        let old = coalescer.register(&key("a"), Stage::Fetch, 4);
        assert!(matches!(old, StageTicket::Superseded));
    }

    #[tokio::test]
    async fn test_newer_generation_replaces_leftover() {
        let coalescer = StageCoalescer::new(16);
        let _old = coalescer.register(&key("a"), Stage::Fetch, 0);
        let new = coalescer.register(&key("a"), Stage::Fetch, 1);
        assert!(new.is_lead());
    }

    #[tokio::test]
    async fn test_stats_tracking() {
        let coalescer = StageCoalescer::new(16);
        let _lead = coalescer.register(&key("a"), Stage::Fetch, 0);
        let _f1 = coalescer.register(&key("a"), Stage::Fetch, 0);
        let _f2 = coalescer.register(&key("a"), Stage::Fetch, 0);

        let stats = coalescer.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.leads, 1);
        assert_eq!(stats.coalesced, 2);
        assert!((stats.coalescing_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }
}
