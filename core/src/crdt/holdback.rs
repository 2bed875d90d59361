//! Holdback queue for operations awaiting causal dependencies
//!
//! Operations can arrive over gossip before their parents do. Rather than
//! rejecting them, the replica buffers them here indexed by the missing
//! dependency ids; each accepted operation releases whatever was blocked
//! only on it. Capacity and age limits bound the buffer so a peer cannot
//! exhaust memory by streaming orphans.

use crate::crdt::Operation;
use crate::types::OpId;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Holdback queue for operations with unresolved parents
pub struct HoldbackQueue {
    /// Buffered operations indexed by id
    buffered: HashMap<OpId, BufferedOp>,

    /// Index: missing dependency id -> ids of operations waiting on it
    waiting_for: HashMap<OpId, HashSet<OpId>>,

    /// FIFO order for age-based expiry
    insertion_order: VecDeque<OpId>,

    capacity: usize,
    max_age_ms: u64,
}

#[derive(Debug, Clone)]
struct BufferedOp {
    op: Operation,
    buffered_at_ms: u64,
    missing: HashSet<OpId>,
}

impl HoldbackQueue {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            buffered: HashMap::new(),
            waiting_for: HashMap::new(),
            insertion_order: VecDeque::new(),
            capacity,
            max_age_ms: max_age.as_millis() as u64,
        }
    }

    /// Buffer an operation until its missing parents arrive
    pub fn buffer(&mut self, op: Operation, missing: Vec<OpId>, now_ms: u64) -> Result<()> {
        if self.buffered.len() >= self.capacity {
            return Err(Error::HoldbackFull);
        }
        if self.buffered.contains_key(&op.id) {
            return Ok(());
        }

        let op_id = op.id;
        let missing: HashSet<OpId> = missing.into_iter().collect();
        for dep in &missing {
            self.waiting_for.entry(*dep).or_default().insert(op_id);
        }

        self.buffered.insert(
            op_id,
            BufferedOp {
                op,
                buffered_at_ms: now_ms,
                missing,
            },
        );
        self.insertion_order.push_back(op_id);
        Ok(())
    }

    /// Notify that an operation entered the DAG
    ///
    /// Returns buffered operations whose dependency sets are now empty. The
    /// caller re-ingests them, which may cascade further releases.
    pub fn on_op_accepted(&mut self, accepted: &OpId) -> Vec<Operation> {
        let mut ready = Vec::new();

        if let Some(waiting) = self.waiting_for.remove(accepted) {
            for waiting_id in waiting {
                if let Some(buffered) = self.buffered.get_mut(&waiting_id) {
                    buffered.missing.remove(accepted);
                    if buffered.missing.is_empty() {
                        ready.push(buffered.op.clone());
                    }
                }
            }
        }

        for op in &ready {
            self.remove(&op.id);
        }
        ready
    }

    /// Drop operations buffered longer than the age limit
    pub fn expire_old(&mut self, now_ms: u64) -> Vec<Operation> {
        let mut expired = Vec::new();

        while let Some(&op_id) = self.insertion_order.front() {
            match self.buffered.get(&op_id) {
                Some(buffered) if now_ms.saturating_sub(buffered.buffered_at_ms) > self.max_age_ms => {
                    expired.push(buffered.op.clone());
                    self.insertion_order.pop_front();
                    self.remove(&op_id);
                }
                Some(_) => break,
                None => {
                    // Released earlier; drop the stale order entry
                    self.insertion_order.pop_front();
                }
            }
        }

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "expired stale held-back ops");
        }
        expired
    }

    /// Dependency ids the queue is still waiting on, for anti-entropy fetch
    pub fn missing_deps(&self) -> Vec<OpId> {
        self.waiting_for.keys().copied().collect()
    }

    /// Whether an operation is currently buffered
    pub fn contains(&self, id: &OpId) -> bool {
        self.buffered.contains_key(id)
    }

    fn remove(&mut self, id: &OpId) {
        if let Some(buffered) = self.buffered.remove(id) {
            for dep in &buffered.missing {
                if let Some(waiting) = self.waiting_for.get_mut(dep) {
                    waiting.remove(id);
                    if waiting.is_empty() {
                        self.waiting_for.remove(dep);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}
