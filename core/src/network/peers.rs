//! Peer membership, reputation, and lifecycle tracking
//!
//! Every known peer carries a reputation score and a lifecycle status.
//! Failed sessions and invalid operations push a peer toward suspicion and
//! eventually eviction; evicted peers re-enter through the Suspected state
//! after a cooldown and must complete a successful session before they are
//! trusted again.

use crate::config::FabricConfig;
use crate::crdt::VectorClock;
use crate::types::PeerId;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::HashMap;
use std::sync::RwLock;

/// Lifecycle status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Participates in gossip normally
    Active,
    /// Deprioritized for sampling; one successful session restores Active
    Suspected,
    /// Excluded from gossip until the cooldown deadline
    Evicted { until_ms: u64 },
}

/// Tracked state for one remote peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Highest vector clock this peer has advertised
    pub last_clock: VectorClock,
    /// Reputation in [0.0, 1.0]; starts at 1.0
    pub reputation: f64,
    pub consecutive_failures: u32,
    pub status: PeerStatus,
    pub last_seen_ms: u64,
}

impl PeerRecord {
    fn new(id: PeerId, now_ms: u64) -> Self {
        Self {
            id,
            last_clock: VectorClock::new(),
            reputation: 1.0,
            consecutive_failures: 0,
            status: PeerStatus::Active,
            last_seen_ms: now_ms,
        }
    }
}

/// Shared table of known peers
///
/// Interior mutability lets the gossip loop, the admission filter, and test
/// harnesses share one table behind an `Arc`.
pub struct PeerTable {
    records: RwLock<HashMap<PeerId, PeerRecord>>,
    failure_threshold: u32,
    reputation_penalty: f64,
    suspect_threshold: f64,
    reputation_floor: f64,
    eviction_cooldown_ms: u64,
}

impl PeerTable {
    pub fn new(cfg: &FabricConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            failure_threshold: cfg.failure_threshold,
            reputation_penalty: cfg.reputation_penalty,
            suspect_threshold: cfg.suspect_threshold,
            reputation_floor: cfg.reputation_floor,
            eviction_cooldown_ms: cfg.eviction_cooldown.as_millis() as u64,
        }
    }

    /// Register a peer if unknown
    pub fn ensure(&self, id: PeerId, now_ms: u64) {
        let mut records = self.records.write().unwrap();
        records.entry(id).or_insert_with(|| PeerRecord::new(id, now_ms));
    }

    /// Record a successful exchange with a peer
    ///
    /// A suspected peer is restored to Active; an evicted peer stays evicted
    /// until its cooldown has elapsed.
    pub fn mark_seen(&self, id: &PeerId, now_ms: u64) {
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(*id)
            .or_insert_with(|| PeerRecord::new(*id, now_ms));
        record.last_seen_ms = now_ms;
        record.consecutive_failures = 0;
        match record.status {
            PeerStatus::Active | PeerStatus::Suspected => {
                record.status = PeerStatus::Active;
                tracing::trace!(peer = %id, "peer session succeeded");
            }
            PeerStatus::Evicted { until_ms } if now_ms >= until_ms => {
                record.status = PeerStatus::Active;
                record.reputation = record.reputation.max(self.suspect_threshold);
                tracing::info!(peer = %id, "evicted peer readmitted after cooldown");
            }
            PeerStatus::Evicted { .. } => {}
        }
    }

    /// Record a failed exchange with a peer
    pub fn mark_failed(&self, id: &PeerId, now_ms: u64) {
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(*id)
            .or_insert_with(|| PeerRecord::new(*id, now_ms));
        record.consecutive_failures += 1;
        match record.status {
            PeerStatus::Active => {
                record.status = PeerStatus::Suspected;
                tracing::debug!(peer = %id, "peer suspected after failed session");
            }
            PeerStatus::Suspected if record.consecutive_failures >= self.failure_threshold => {
                record.status = PeerStatus::Evicted {
                    until_ms: now_ms + self.eviction_cooldown_ms,
                };
                tracing::warn!(
                    peer = %id,
                    failures = record.consecutive_failures,
                    "peer evicted after repeated failures"
                );
            }
            _ => {}
        }
    }

    /// Lower a peer's reputation after it relayed or authored an invalid
    /// operation
    pub fn penalize(&self, id: &PeerId, now_ms: u64) {
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(*id)
            .or_insert_with(|| PeerRecord::new(*id, now_ms));
        record.reputation = (record.reputation - self.reputation_penalty).max(0.0);
        if record.reputation < self.reputation_floor {
            record.status = PeerStatus::Evicted {
                until_ms: now_ms + self.eviction_cooldown_ms,
            };
            tracing::warn!(peer = %id, reputation = record.reputation, "peer evicted, reputation below floor");
        } else if record.reputation < self.suspect_threshold {
            if record.status == PeerStatus::Active {
                record.status = PeerStatus::Suspected;
            }
            tracing::debug!(peer = %id, reputation = record.reputation, "peer suspected, low reputation");
        }
    }

    /// Remember the highest vector clock a peer has advertised
    pub fn note_clock(&self, id: &PeerId, clock: &VectorClock, now_ms: u64) {
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(*id)
            .or_insert_with(|| PeerRecord::new(*id, now_ms));
        record.last_clock.merge(clock);
    }

    /// Sample up to `fanout` gossip partners
    ///
    /// Sampling is weighted by `1 / (1 + consecutive_failures)` so flaky
    /// peers are contacted less often without being starved entirely.
    /// Evicted peers whose cooldown has passed become eligible again as
    /// Suspected.
    pub fn sample(&self, rng: &mut StdRng, fanout: usize, now_ms: u64) -> Vec<PeerId> {
        let mut records = self.records.write().unwrap();

        let mut eligible: Vec<(PeerId, f64)> = Vec::new();
        for record in records.values_mut() {
            if let PeerStatus::Evicted { until_ms } = record.status {
                if now_ms >= until_ms {
                    record.status = PeerStatus::Suspected;
                    record.consecutive_failures = 0;
                } else {
                    continue;
                }
            }
            let weight = 1.0 / (1.0 + record.consecutive_failures as f64);
            eligible.push((record.id, weight));
        }

        let mut picked = Vec::new();
        while picked.len() < fanout && !eligible.is_empty() {
            let weights: Vec<f64> = eligible.iter().map(|(_, w)| *w).collect();
            let Ok(dist) = WeightedIndex::new(&weights) else {
                break;
            };
            let idx = dist.sample(rng);
            picked.push(eligible.swap_remove(idx).0);
        }
        picked
    }

    /// Snapshot of one peer's record
    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.records.read().unwrap().get(id).cloned()
    }

    /// Current status of a peer
    pub fn status(&self, id: &PeerId) -> Option<PeerStatus> {
        self.records.read().unwrap().get(id).map(|r| r.status)
    }

    /// Ids of all peers currently eligible for gossip
    pub fn active_peers(&self, now_ms: u64) -> Vec<PeerId> {
        self.records
            .read()
            .unwrap()
            .values()
            .filter(|r| match r.status {
                PeerStatus::Active | PeerStatus::Suspected => true,
                PeerStatus::Evicted { until_ms } => now_ms >= until_ms,
            })
            .map(|r| r.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}
