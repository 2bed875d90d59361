//! Content-addressed causal operation DAG
//!
//! Operations reference their causal parents by id, forming an append-only
//! DAG. Insertion is parent-first: an operation whose parents are not all
//! present is refused with the missing ids so the caller can buffer it. The
//! childless tip set (frontier) doubles as the summary exchanged during
//! anti-entropy.

use crate::crdt::{Operation, VectorClock};
use crate::storage::OpStorage;
use crate::types::{OpId, PeerId};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Result of appending an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Operation entered the DAG
    Inserted,
    /// Operation was already present; nothing changed
    Duplicate,
}

/// Causal DAG layered over an operation store
///
/// The store holds the operations themselves; the DAG keeps the structural
/// indexes (children, frontier, per-originator log) in memory and rebuilds
/// them from a scan on open.
pub struct OpDag<S: OpStorage> {
    store: S,
    ids: HashSet<OpId>,
    children: HashMap<OpId, HashSet<OpId>>,
    frontier: HashSet<OpId>,
    /// Per-originator log: clock counter -> op id, in counter order.
    /// Supports delta sync against a remote vector clock.
    by_originator: BTreeMap<PeerId, BTreeMap<u64, OpId>>,
}

impl<S: OpStorage> OpDag<S> {
    /// Open a DAG, rebuilding indexes from whatever the store holds
    pub fn open(store: S) -> Result<Self> {
        let mut dag = Self {
            store,
            ids: HashSet::new(),
            children: HashMap::new(),
            frontier: HashSet::new(),
            by_originator: BTreeMap::new(),
        };

        let ops = dag.store.scan()?;
        for op in &ops {
            dag.index(op);
        }
        if !ops.is_empty() {
            tracing::info!(ops = ops.len(), frontier = dag.frontier.len(), "rebuilt dag indexes");
        }
        Ok(dag)
    }

    /// Append an operation
    ///
    /// Parents must already be present; otherwise the missing ids come back
    /// in `Error::MissingDependency` and nothing is written. Re-appending a
    /// known operation is a no-op.
    pub fn append(&mut self, op: &Operation) -> Result<Appended> {
        if self.ids.contains(&op.id) {
            return Ok(Appended::Duplicate);
        }
        if op.parents.contains(&op.id) {
            return Err(Error::CyclicDependency(op.id));
        }

        let missing = self.missing_parents(op);
        if !missing.is_empty() {
            return Err(Error::MissingDependency(missing));
        }

        self.store.put(op)?;
        self.index(op);
        Ok(Appended::Inserted)
    }

    fn index(&mut self, op: &Operation) {
        self.ids.insert(op.id);
        self.frontier.insert(op.id);
        for parent in &op.parents {
            self.children.entry(*parent).or_default().insert(op.id);
            self.frontier.remove(parent);
        }
        // An op indexed out of scan order may already have known children
        if self.children.get(&op.id).is_some_and(|c| !c.is_empty()) {
            self.frontier.remove(&op.id);
        }
        let counter = op.clock.get(&op.originator);
        if counter > 0 {
            self.by_originator
                .entry(op.originator)
                .or_default()
                .insert(counter, op.id);
        }
    }

    /// Parents of `op` not yet present
    pub fn missing_parents(&self, op: &Operation) -> Vec<OpId> {
        op.parents
            .iter()
            .filter(|p| !self.ids.contains(p))
            .copied()
            .collect()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &OpId) -> Result<Option<Operation>> {
        self.store.get(id)
    }

    /// Current childless tips, in stable order
    pub fn frontier(&self) -> Vec<OpId> {
        let mut tips: Vec<OpId> = self.frontier.iter().copied().collect();
        tips.sort();
        tips
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// All operation ids in a topological (parents before children) order
    ///
    /// Ties are broken by id so every replica with the same DAG produces the
    /// same order.
    pub fn topo_ids(&self) -> Result<Vec<OpId>> {
        // Indegree counts only parents actually present in the DAG
        let mut indegree: HashMap<OpId, usize> = HashMap::new();
        for id in &self.ids {
            let op = self
                .store
                .get(id)?
                .ok_or_else(|| Error::Storage(format!("indexed op {} missing from store", id)))?;
            let known_parents = op.parents.iter().filter(|p| self.ids.contains(p)).count();
            indegree.insert(*id, known_parents);
        }

        let mut roots: Vec<OpId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        roots.sort();
        let mut queue: VecDeque<OpId> = roots.into();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            let mut released: Vec<OpId> = Vec::new();
            if let Some(children) = self.children.get(&id) {
                for child in children {
                    if !self.ids.contains(child) {
                        continue;
                    }
                    let d = indegree.get_mut(child).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        released.push(*child);
                    }
                }
            }
            released.sort();
            queue.extend(released);
        }

        if order.len() != self.ids.len() {
            // Should be unreachable: append refuses cycles and orphans
            return Err(Error::CyclicDependency(
                *self.ids.iter().find(|id| !order.contains(id)).unwrap(),
            ));
        }
        Ok(order)
    }

    /// All operations in topological order
    pub fn topo_ops(&self) -> Result<Vec<Operation>> {
        let mut ops = Vec::with_capacity(self.ids.len());
        for id in self.topo_ids()? {
            let op = self
                .store
                .get(&id)?
                .ok_or_else(|| Error::Storage(format!("indexed op {} missing from store", id)))?;
            ops.push(op);
        }
        Ok(ops)
    }

    /// Operations the remote has not yet observed, per its vector clock
    ///
    /// Returns at most `limit` operations in topological order, so a
    /// receiver ingesting the batch front to back never sees a child before
    /// its in-batch parents.
    pub fn ops_since(&self, remote: &VectorClock, limit: usize) -> Result<Vec<Operation>> {
        let mut wanted: HashSet<OpId> = HashSet::new();
        for (originator, log) in &self.by_originator {
            let seen = remote.get(originator);
            for (_, id) in log.range(seen + 1..) {
                wanted.insert(*id);
            }
        }
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut ops = Vec::new();
        for id in self.topo_ids()? {
            if ops.len() >= limit {
                break;
            }
            if wanted.contains(&id) {
                let op = self
                    .store
                    .get(&id)?
                    .ok_or_else(|| Error::Storage(format!("indexed op {} missing from store", id)))?;
                ops.push(op);
            }
        }
        Ok(ops)
    }

    /// Merged clock over every stored operation
    pub fn observed_clock(&self) -> Result<VectorClock> {
        let mut clock = VectorClock::new();
        for op in self.store.scan()? {
            clock.merge(&op.clock);
        }
        Ok(clock)
    }
}
