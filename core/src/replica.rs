//! The replica: local writes, remote ingest, and materialized state
//!
//! A `Replica` ties the pieces together: every operation, local or remote,
//! passes through the admission filter, lands in the causal DAG, and is
//! folded into the merge engine. Operations with unresolved parents wait in
//! the holdback queue and are released in cascade as their parents arrive.
//!
//! All shared state sits behind one `std::sync::Mutex` that is never held
//! across an await point; the async gossip layer collects what it needs
//! under the lock and performs network exchanges without it.

use crate::config::FabricConfig;
use crate::crdt::{
    Admission, AdmissionFilter, HoldbackQueue, MergeEngine, Mutation, Operation, Payload,
    RejectionReason, VectorClock,
};
use crate::crypto::{Ed25519Verifier, Sign, Verify};
use crate::network::gossip::GossipMessage;
use crate::network::{MessageHandler, PeerTable};
use crate::storage::{OpDag, OpStorage};
use crate::types::{OpId, PeerId, StateDigest};
use crate::{Error, Result};
use std::sync::{Arc, Mutex};

/// Outcome of ingesting a remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Entered the DAG and was folded into state
    Applied,
    /// Already known; nothing changed
    Duplicate,
    /// Valid but missing these parents; buffered until they arrive
    Buffered(Vec<OpId>),
    /// Valid but short of its corroboration quorum
    Held { have: usize, need: usize },
    /// Refused by the admission filter
    Rejected(RejectionReason),
    /// Entered the DAG but carries a payload no merge policy understands
    Excluded,
}

/// Snapshot of a replica's externally visible state
#[derive(Debug, Clone)]
pub struct ReplicaSummary {
    pub id: PeerId,
    pub ops: usize,
    pub frontier: Vec<OpId>,
    pub clock: VectorClock,
    pub digest: StateDigest,
    pub buffered: usize,
}

struct Inner<S: OpStorage> {
    dag: OpDag<S>,
    engine: MergeEngine,
    filter: AdmissionFilter,
    holdback: HoldbackQueue,
    clock: VectorClock,
}

/// One participant in the fabric
pub struct Replica<S: OpStorage> {
    id: PeerId,
    signer: Arc<dyn Sign>,
    cfg: FabricConfig,
    peers: Arc<PeerTable>,
    inner: Mutex<Inner<S>>,
}

impl<S: OpStorage> Replica<S> {
    /// Open a replica over a store, rebuilding state from whatever it holds
    pub fn open(signer: Arc<dyn Sign>, store: S, cfg: FabricConfig) -> Result<Self> {
        Self::open_with_verifier(signer, Arc::new(Ed25519Verifier), store, cfg)
    }

    /// Open with an explicit verification capability
    pub fn open_with_verifier(
        signer: Arc<dyn Sign>,
        verifier: Arc<dyn Verify>,
        store: S,
        cfg: FabricConfig,
    ) -> Result<Self> {
        let id = signer.peer_id();
        let peers = Arc::new(PeerTable::new(&cfg));
        let dag = OpDag::open(store)?;

        // Refold persisted operations in causal order
        let mut engine = MergeEngine::new();
        let mut filter = AdmissionFilter::new(verifier, Arc::clone(&peers), &cfg);
        let mut clock = VectorClock::new();
        for op in dag.topo_ops()? {
            clock.merge(&op.clock);
            match filter.admit(&op, None, 0) {
                Admission::Accepted | Admission::Duplicate => {}
                verdict => {
                    return Err(Error::Storage(format!(
                        "stored op {} failed admission on reload: {:?}",
                        op.id, verdict
                    )))
                }
            }
            match engine.apply(&op) {
                Ok(_) | Err(Error::UnsupportedType(_)) | Err(Error::InvalidPayload(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if !dag.is_empty() {
            tracing::info!(replica = %id, ops = dag.len(), "replica state rebuilt from store");
        }

        let holdback = HoldbackQueue::new(cfg.holdback_capacity, cfg.holdback_max_age);
        Ok(Self {
            id,
            signer,
            cfg,
            peers,
            inner: Mutex::new(Inner {
                dag,
                engine,
                filter,
                holdback,
                clock,
            }),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn config(&self) -> &FabricConfig {
        &self.cfg
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Introduce a peer the replica should gossip with
    pub fn add_peer(&self, peer: PeerId) {
        self.peers.ensure(peer, now_ms());
    }

    /// Author, admit, and apply a local mutation
    ///
    /// The new operation's parents are the current frontier, so it causally
    /// dominates everything this replica had observed.
    pub fn write(&self, mutation: Mutation) -> Result<Operation> {
        let mut inner = self.inner.lock().unwrap();

        inner.clock.tick(&self.id);
        let clock = inner.clock.clone();
        let parents = inner.dag.frontier();
        let payload = Payload::from_mutation(&mutation)?;
        let op = Operation::signed(self.signer.as_ref(), payload, parents, clock)?;

        match inner.filter.admit(&op, None, now_ms()) {
            Admission::Accepted => {}
            verdict => {
                return Err(Error::Other(anyhow::anyhow!(
                    "local op refused admission: {:?}",
                    verdict
                )))
            }
        }
        inner.dag.append(&op)?;
        inner.engine.apply(&op)?;

        tracing::debug!(replica = %self.id, op = %op.id, key = mutation.key(), "local write");
        Ok(op)
    }

    /// Overwrite a last-writer-wins register
    pub fn set_register(&self, key: &str, value: Vec<u8>) -> Result<Operation> {
        self.write(Mutation::LwwWrite {
            key: key.to_string(),
            value,
        })
    }

    /// Add an element to an observed-remove set
    pub fn add_to_set(&self, key: &str, element: Vec<u8>) -> Result<Operation> {
        self.write(Mutation::SetAdd {
            key: key.to_string(),
            element,
        })
    }

    /// Remove an element, retracting the add-tags currently visible here
    pub fn remove_from_set(&self, key: &str, element: Vec<u8>) -> Result<Operation> {
        let observed = {
            let inner = self.inner.lock().unwrap();
            inner.engine.set_live_tags(key, &element)
        };
        self.write(Mutation::SetRemove {
            key: key.to_string(),
            element,
            observed,
        })
    }

    /// Increment a positive-negative counter
    pub fn incr_counter(&self, key: &str, amount: u64) -> Result<Operation> {
        self.write(Mutation::CounterAdd {
            key: key.to_string(),
            amount,
        })
    }

    /// Decrement a positive-negative counter
    pub fn decr_counter(&self, key: &str, amount: u64) -> Result<Operation> {
        self.write(Mutation::CounterSub {
            key: key.to_string(),
            amount,
        })
    }

    /// Ingest an operation received from the network
    pub fn ingest(&self, op: &Operation, relayer: Option<PeerId>) -> Result<IngestOutcome> {
        let mut inner = self.inner.lock().unwrap();
        self.ingest_locked(&mut inner, op, relayer, now_ms())
    }

    /// Ingest a batch, returning how many operations were newly applied
    ///
    /// Per-op refusals do not abort the batch; only backend failures do.
    pub fn ingest_batch(&self, ops: &[Operation], relayer: Option<PeerId>) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let mut applied = 0;
        for op in ops {
            match self.ingest_locked(&mut inner, op, relayer, now) {
                Ok(IngestOutcome::Applied) => applied += 1,
                Ok(_) => {}
                Err(Error::HoldbackFull) => {
                    tracing::warn!(replica = %self.id, op = %op.id, "holdback full, dropping op");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(applied)
    }

    fn ingest_locked(
        &self,
        inner: &mut Inner<S>,
        op: &Operation,
        relayer: Option<PeerId>,
        now: u64,
    ) -> Result<IngestOutcome> {
        if inner.dag.contains(&op.id) {
            return Ok(IngestOutcome::Duplicate);
        }
        if let Some(relayer) = relayer {
            self.peers.ensure(relayer, now);
        }

        match inner.filter.admit(op, relayer, now) {
            Admission::Accepted => {}
            Admission::Duplicate => {
                // Admitted before but still waiting on parents
                if inner.holdback.contains(&op.id) {
                    return Ok(IngestOutcome::Buffered(inner.dag.missing_parents(op)));
                }
                // Admitted earlier but never reached the DAG: holdback expiry
                // or overflow dropped it. Re-delivery gets a fresh pass.
            }
            Admission::Held { have, need } => return Ok(IngestOutcome::Held { have, need }),
            Admission::Rejected(reason) => {
                tracing::warn!(replica = %self.id, op = %op.id, ?reason, "op rejected");
                return Ok(IngestOutcome::Rejected(reason));
            }
        }

        let missing = inner.dag.missing_parents(op);
        if !missing.is_empty() {
            inner.holdback.buffer(op.clone(), missing.clone(), now)?;
            tracing::trace!(replica = %self.id, op = %op.id, missing = missing.len(), "op buffered");
            return Ok(IngestOutcome::Buffered(missing));
        }

        self.accept_locked(inner, op)
    }

    /// Insert an admitted, dependency-complete op and drain the cascade of
    /// holdback releases it unblocks
    fn accept_locked(&self, inner: &mut Inner<S>, op: &Operation) -> Result<IngestOutcome> {
        let first_outcome = self.insert_locked(inner, op)?;

        let mut pending = inner.holdback.on_op_accepted(&op.id);
        while let Some(released) = pending.pop() {
            if inner.dag.contains(&released.id) {
                continue;
            }
            let missing = inner.dag.missing_parents(&released);
            if !missing.is_empty() {
                // Raced with another missing parent; keep waiting
                let _ = inner.holdback.buffer(released, missing, now_ms());
                continue;
            }
            let released_id = released.id;
            self.insert_locked(inner, &released)?;
            tracing::trace!(replica = %self.id, op = %released_id, "released from holdback");
            pending.extend(inner.holdback.on_op_accepted(&released_id));
        }

        Ok(first_outcome)
    }

    fn insert_locked(&self, inner: &mut Inner<S>, op: &Operation) -> Result<IngestOutcome> {
        inner.dag.append(op)?;
        inner.clock.merge(&op.clock);
        match inner.engine.apply(op) {
            Ok(_) => Ok(IngestOutcome::Applied),
            Err(Error::UnsupportedType(tag)) => {
                tracing::debug!(replica = %self.id, op = %op.id, %tag, "op excluded from state");
                Ok(IngestOutcome::Excluded)
            }
            Err(Error::InvalidPayload(reason)) => {
                tracing::debug!(replica = %self.id, op = %op.id, %reason, "op excluded from state");
                Ok(IngestOutcome::Excluded)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop holdback entries older than the configured age
    pub fn expire_holdback(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.holdback.expire_old(now_ms()).len()
    }

    /// Parents the holdback queue is still waiting on
    pub fn missing_dependencies(&self) -> Vec<OpId> {
        self.inner.lock().unwrap().holdback.missing_deps()
    }

    /// Operations a remote peer at `clock` has not observed
    pub fn ops_since(&self, clock: &VectorClock, limit: usize) -> Result<Vec<Operation>> {
        self.inner.lock().unwrap().dag.ops_since(clock, limit)
    }

    /// Look up stored operations by id
    pub fn fetch_ops(&self, ids: &[OpId]) -> Result<Vec<Operation>> {
        let inner = self.inner.lock().unwrap();
        let mut ops = Vec::new();
        for id in ids {
            if let Some(op) = inner.dag.get(id)? {
                ops.push(op);
            }
        }
        Ok(ops)
    }

    pub fn frontier(&self) -> Vec<OpId> {
        self.inner.lock().unwrap().dag.frontier()
    }

    pub fn clock(&self) -> VectorClock {
        self.inner.lock().unwrap().clock.clone()
    }

    pub fn state_digest(&self) -> StateDigest {
        self.inner.lock().unwrap().engine.digest()
    }

    pub fn summary(&self) -> ReplicaSummary {
        let inner = self.inner.lock().unwrap();
        ReplicaSummary {
            id: self.id,
            ops: inner.dag.len(),
            frontier: inner.dag.frontier(),
            clock: inner.clock.clone(),
            digest: inner.engine.digest(),
            buffered: inner.holdback.len(),
        }
    }

    /// Register value for a key
    pub fn register(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .engine
            .register(key)
            .map(|v| v.to_vec())
    }

    /// Visible elements of an observed-remove set
    pub fn set_elements(&self, key: &str) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().engine.set_elements(key)
    }

    pub fn set_contains(&self, key: &str, element: &[u8]) -> bool {
        self.inner.lock().unwrap().engine.set_contains(key, element)
    }

    /// Counter value for a key
    pub fn counter(&self, key: &str) -> i64 {
        self.inner.lock().unwrap().engine.counter(key)
    }

    /// Serve one gossip request from a remote peer
    pub fn handle_message(&self, from: PeerId, payload: &[u8]) -> Result<Vec<u8>> {
        let message: GossipMessage = minicbor::decode(payload)
            .map_err(|e| Error::Serialization(format!("failed to decode gossip message: {}", e)))?;
        self.peers.ensure(from, now_ms());

        let reply = match message {
            GossipMessage::SyncRequest { clock, .. } => {
                self.peers.note_clock(&from, &clock, now_ms());
                let ops = self.ops_since(&clock, self.cfg.max_ops_per_message)?;
                GossipMessage::SyncResponse {
                    frontier: self.frontier(),
                    clock: self.clock(),
                    digest: self.state_digest(),
                    ops,
                }
            }
            GossipMessage::FetchRequest { ids } => GossipMessage::FetchResponse {
                ops: self.fetch_ops(&ids)?,
            },
            GossipMessage::Push { ops } => {
                let capped = &ops[..ops.len().min(self.cfg.max_ops_per_message)];
                let accepted = self.ingest_batch(capped, Some(from))? as u64;
                GossipMessage::PushAck { accepted }
            }
            other => {
                return Err(Error::Transport(format!(
                    "unexpected gossip request: {:?}",
                    other.kind()
                )))
            }
        };

        minicbor::to_vec(&reply)
            .map_err(|e| Error::Serialization(format!("failed to encode gossip reply: {}", e)))
    }
}

impl<S: OpStorage + 'static> MessageHandler for Replica<S> {
    fn handle(&self, from: PeerId, payload: &[u8]) -> Result<Vec<u8>> {
        self.handle_message(from, payload)
    }
}

/// Milliseconds since the unix epoch
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::storage::MemoryStore;

    fn replica() -> Replica<MemoryStore> {
        Replica::open(
            Arc::new(Keypair::generate()),
            MemoryStore::new(),
            FabricConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_local_write_applies() {
        let replica = replica();
        replica.set_register("name", b"alpha".to_vec()).unwrap();
        assert_eq!(replica.register("name"), Some(b"alpha".to_vec()));
        assert_eq!(replica.summary().ops, 1);
    }

    #[test]
    fn test_writes_chain_causally() {
        let replica = replica();
        let first = replica.incr_counter("score", 1).unwrap();
        let second = replica.incr_counter("score", 2).unwrap();

        assert!(second.depends_on(&first.id));
        assert_eq!(replica.frontier(), vec![second.id]);
        assert_eq!(replica.counter("score"), 3);
    }

    #[test]
    fn test_ingest_applies_remote_op() {
        let a = replica();
        let b = replica();

        let op = a.set_register("name", b"from-a".to_vec()).unwrap();
        assert_eq!(b.ingest(&op, Some(a.id())).unwrap(), IngestOutcome::Applied);
        assert_eq!(b.register("name"), Some(b"from-a".to_vec()));
        assert_eq!(a.state_digest(), b.state_digest());
    }

    #[test]
    fn test_ingest_duplicate() {
        let a = replica();
        let b = replica();

        let op = a.set_register("name", b"v".to_vec()).unwrap();
        assert_eq!(b.ingest(&op, None).unwrap(), IngestOutcome::Applied);
        assert_eq!(b.ingest(&op, None).unwrap(), IngestOutcome::Duplicate);
    }

    #[test]
    fn test_ingest_buffers_until_parent_arrives() {
        let a = replica();
        let b = replica();

        let parent = a.set_register("k", b"1".to_vec()).unwrap();
        let child = a.set_register("k", b"2".to_vec()).unwrap();

        match b.ingest(&child, None).unwrap() {
            IngestOutcome::Buffered(missing) => assert_eq!(missing, vec![parent.id]),
            other => panic!("expected Buffered, got {:?}", other),
        }
        assert_eq!(b.register("k"), None);

        // Parent arrival releases the buffered child
        assert_eq!(b.ingest(&parent, None).unwrap(), IngestOutcome::Applied);
        assert_eq!(b.register("k"), Some(b"2".to_vec()));
        assert_eq!(b.summary().buffered, 0);
    }

    #[test]
    fn test_expired_buffered_op_can_be_redelivered() {
        let a = replica();
        let mut cfg = FabricConfig::default();
        cfg.holdback_max_age = std::time::Duration::from_millis(0);
        let b = Replica::open(
            Arc::new(Keypair::generate()),
            MemoryStore::new(),
            cfg,
        )
        .unwrap();

        let parent = a.incr_counter("n", 1).unwrap();
        let child = a.incr_counter("n", 2).unwrap();

        assert!(matches!(b.ingest(&child, None).unwrap(), IngestOutcome::Buffered(_)));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(b.expire_holdback(), 1);

        // The expired op is gone, not poisoned: a later re-delivery applies
        assert_eq!(b.ingest(&parent, None).unwrap(), IngestOutcome::Applied);
        assert_eq!(b.ingest(&child, None).unwrap(), IngestOutcome::Applied);
        assert_eq!(b.counter("n"), 3);
        assert_eq!(b.summary().buffered, 0);
    }

    #[test]
    fn test_cascade_release() {
        let a = replica();
        let b = replica();

        let op1 = a.incr_counter("n", 1).unwrap();
        let op2 = a.incr_counter("n", 2).unwrap();
        let op3 = a.incr_counter("n", 3).unwrap();

        // Deliver deepest first
        assert!(matches!(b.ingest(&op3, None).unwrap(), IngestOutcome::Buffered(_)));
        assert!(matches!(b.ingest(&op2, None).unwrap(), IngestOutcome::Buffered(_)));
        assert_eq!(b.ingest(&op1, None).unwrap(), IngestOutcome::Applied);

        assert_eq!(b.counter("n"), 6);
        assert_eq!(b.summary().buffered, 0);
        assert_eq!(b.frontier(), vec![op3.id]);
    }

    #[test]
    fn test_forged_op_rejected() {
        let a = replica();
        let b = replica();

        let mut op = a.set_register("k", b"honest".to_vec()).unwrap();
        op.payload.body = b"forged".to_vec();

        assert!(matches!(
            b.ingest(&op, Some(a.id())).unwrap(),
            IngestOutcome::Rejected(_)
        ));
        assert_eq!(b.summary().ops, 0);
    }

    #[test]
    fn test_reopen_rebuilds_state() {
        let store = Arc::new(MemoryStore::new());
        let signer = Arc::new(Keypair::generate());

        {
            let replica = Replica::open(
                signer.clone() as Arc<dyn Sign>,
                Arc::clone(&store),
                FabricConfig::default(),
            )
            .unwrap();
            replica.incr_counter("score", 5).unwrap();
            replica.set_register("name", b"kept".to_vec()).unwrap();
        }

        let reopened = Replica::open(
            signer as Arc<dyn Sign>,
            store,
            FabricConfig::default(),
        )
        .unwrap();
        assert_eq!(reopened.counter("score"), 5);
        assert_eq!(reopened.register("name"), Some(b"kept".to_vec()));
        assert_eq!(reopened.summary().ops, 2);
    }
}
