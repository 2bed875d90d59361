//! Byzantine admission filter
//!
//! Every operation passes through this gate before it may enter the DAG:
//! 1. Signature verification against the originator's identity
//! 2. Content-id integrity (the id must equal the hash of the content)
//! 3. Duplicate suppression (idempotent, not an error)
//! 4. Corroboration quorum for operation types that require witnesses
//!
//! Failing signature or integrity checks penalizes the originator's
//! reputation. Operations short of their corroboration quorum are held, not
//! rejected; re-receipt from another relayer grows the witness count. The
//! witness table is bounded by capacity and age so unquorated ops cannot
//! grow it without limit.

use crate::config::FabricConfig;
use crate::crdt::Operation;
use crate::crypto::Verify;
use crate::network::PeerTable;
use crate::types::{OpId, PeerId, TypeTag};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outcome of running an operation through the admission filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Passed all checks; safe to insert into the DAG
    Accepted,
    /// Already admitted; safe to acknowledge and drop
    Duplicate,
    /// Short of its corroboration quorum; waiting for more witnesses
    Held { have: usize, need: usize },
    /// Failed a hard check; must not enter the DAG
    Rejected(RejectionReason),
}

/// Reason an operation was refused admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// Signature does not verify against the originator identity
    InvalidSignature,
    /// Claimed id does not match the hash of the operation content
    IdMismatch,
    /// Operation lists itself among its own dependencies
    CyclicDependency,
    /// Clock does not record the originator's own event
    InconsistentClock,
}

/// Distinct relayers seen for one not-yet-admitted operation
struct Witnesses {
    relayers: HashSet<PeerId>,
    first_seen_ms: u64,
}

/// Admission filter shared by local writes and gossip ingest
pub struct AdmissionFilter {
    verifier: Arc<dyn Verify>,
    peers: Arc<PeerTable>,
    /// Required witness count per operation type; absent tags need none
    corroboration: HashMap<TypeTag, usize>,
    witnesses: HashMap<OpId, Witnesses>,
    witness_capacity: usize,
    witness_max_age_ms: u64,
    admitted: HashSet<OpId>,
}

impl AdmissionFilter {
    pub fn new(verifier: Arc<dyn Verify>, peers: Arc<PeerTable>, cfg: &FabricConfig) -> Self {
        Self {
            verifier,
            peers,
            corroboration: cfg.corroboration.clone(),
            witnesses: HashMap::new(),
            witness_capacity: cfg.witness_capacity,
            witness_max_age_ms: cfg.witness_max_age.as_millis() as u64,
            admitted: HashSet::new(),
        }
    }

    /// Run an operation through the admission checks
    ///
    /// `relayer` is the peer the operation arrived from, or `None` for
    /// locally authored operations. Local operations skip corroboration;
    /// their author vouches for them.
    pub fn admit(&mut self, op: &Operation, relayer: Option<PeerId>, now_ms: u64) -> Admission {
        // An unserializable op can neither be verified nor re-hashed
        let Ok(canonical) = op.signing_bytes() else {
            return Admission::Rejected(RejectionReason::IdMismatch);
        };

        if !self.verifier.verify(&canonical, &op.signature, &op.originator) {
            tracing::warn!(op = %op.id, originator = %op.originator, "rejected op with invalid signature");
            self.peers.penalize(&op.originator, now_ms);
            if let Some(relayer) = relayer {
                if relayer != op.originator {
                    self.peers.penalize(&relayer, now_ms);
                }
            }
            return Admission::Rejected(RejectionReason::InvalidSignature);
        }

        if OpId(*blake3::hash(&canonical).as_bytes()) != op.id {
            tracing::warn!(op = %op.id, originator = %op.originator, "rejected op with forged id");
            self.peers.penalize(&op.originator, now_ms);
            return Admission::Rejected(RejectionReason::IdMismatch);
        }

        if op.parents.contains(&op.id) {
            return Admission::Rejected(RejectionReason::CyclicDependency);
        }

        // An op whose clock omits its own author can never be offered over
        // clock-delta anti-entropy; admitting it would strand it locally.
        if op.clock.get(&op.originator) == 0 {
            tracing::warn!(op = %op.id, originator = %op.originator, "rejected op whose clock omits its originator");
            self.peers.penalize(&op.originator, now_ms);
            return Admission::Rejected(RejectionReason::InconsistentClock);
        }

        if self.admitted.contains(&op.id) {
            return Admission::Duplicate;
        }

        let need = self
            .corroboration
            .get(&op.payload.type_tag)
            .copied()
            .unwrap_or(0);
        if need > 0 {
            if let Some(relayer) = relayer {
                self.expire_witnesses(now_ms);
                if !self.witnesses.contains_key(&op.id)
                    && self.witnesses.len() >= self.witness_capacity
                {
                    // At capacity: do not track a new entry; the op can retry
                    // once older entries expire
                    tracing::debug!(op = %op.id, "witness table full, not tracking");
                    return Admission::Held { have: 0, need };
                }
                let witnesses = self.witnesses.entry(op.id).or_insert_with(|| Witnesses {
                    relayers: HashSet::new(),
                    first_seen_ms: now_ms,
                });
                witnesses.relayers.insert(relayer);
                let have = witnesses.relayers.len();
                if have < need {
                    tracing::debug!(op = %op.id, have, need, "holding op pending corroboration");
                    return Admission::Held { have, need };
                }
            }
        }

        self.admitted.insert(op.id);
        self.witnesses.remove(&op.id);
        Admission::Accepted
    }

    /// Drop witness entries older than the age limit
    fn expire_witnesses(&mut self, now_ms: u64) {
        let max_age = self.witness_max_age_ms;
        let before = self.witnesses.len();
        self.witnesses
            .retain(|_, w| now_ms.saturating_sub(w.first_seen_ms) <= max_age);
        let dropped = before - self.witnesses.len();
        if dropped > 0 {
            tracing::debug!(dropped, "expired stale witness entries");
        }
    }

    /// Whether an operation has already been admitted
    pub fn is_admitted(&self, id: &OpId) -> bool {
        self.admitted.contains(id)
    }

    /// Operations currently held for corroboration
    pub fn held_ops(&self) -> Vec<OpId> {
        self.witnesses.keys().copied().collect()
    }
}
