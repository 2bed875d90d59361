//! Vector clocks for causal ordering
//!
//! Each peer increments only its own component; merging takes the pointwise
//! maximum. Comparison yields the standard happened-before partial order and
//! drives both causal-dependency checks in the DAG and conflict detection in
//! the merge engine.

use crate::types::PeerId;
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of comparing two vector clocks
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CausalOrder {
    /// Left strictly precedes right
    Before,
    /// Left strictly follows right
    After,
    /// Neither precedes the other (includes identical clocks)
    Concurrent,
}

/// Vector clock: per-peer monotonically non-decreasing counters
///
/// Counters are kept in a `BTreeMap` so the canonical CBOR encoding is
/// deterministic; operation ids are content hashes over bytes that include
/// this clock.
#[derive(Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize, Debug)]
#[cbor(transparent)]
pub struct VectorClock(#[n(0)] pub BTreeMap<PeerId, u64>);

impl VectorClock {
    /// Create a new empty clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for a peer (0 if absent)
    pub fn get(&self, peer: &PeerId) -> u64 {
        self.0.get(peer).copied().unwrap_or(0)
    }

    /// Increment the caller's own counter and return the new value
    pub fn tick(&mut self, self_id: &PeerId) -> u64 {
        let counter = self.0.entry(*self_id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Merge another clock into this one (pointwise maximum)
    pub fn merge(&mut self, other: &VectorClock) {
        for (peer, &count) in &other.0 {
            let entry = self.0.entry(*peer).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Pointwise maximum of two clocks, as a new clock
    pub fn merged(a: &VectorClock, b: &VectorClock) -> VectorClock {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    /// Check if this clock happens strictly before another: every component
    /// is <= the other's and at least one is strictly less
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut strictly_less = false;

        for (peer, &count) in &self.0 {
            let other_count = other.get(peer);
            if count > other_count {
                return false;
            }
            if count < other_count {
                strictly_less = true;
            }
        }

        for (peer, &count) in &other.0 {
            if count > 0 && !self.0.contains_key(peer) {
                strictly_less = true;
            }
        }

        strictly_less
    }

    /// Compare two clocks under the happened-before partial order
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        if self.happens_before(other) {
            CausalOrder::Before
        } else if other.happens_before(self) {
            CausalOrder::After
        } else {
            CausalOrder::Concurrent
        }
    }

    /// Check if two clocks are concurrent
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// Number of peers with a nonzero counter
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
