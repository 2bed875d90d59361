//! Operation envelope and mutation payloads
//!
//! Every mutation in the fabric is wrapped in an [`Operation`] providing:
//! - Content-addressed identity (Blake3 over the canonical CBOR encoding)
//! - Causal ordering via parent ids
//! - Cryptographic attribution via originator and signature
//! - Vector-clock timestamps

use crate::crdt::VectorClock;
use crate::crypto::Sign;
use crate::types::{OpId, PeerId, Signature, TypeTag};
use crate::{Error, Result};
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Opaque payload bytes plus the CRDT type tag that tells the merge engine
/// how to interpret them
#[derive(Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize, Debug)]
pub struct Payload {
    /// Declared CRDT type tag
    #[n(0)]
    pub type_tag: TypeTag,

    /// Canonical CBOR encoding of a [`Mutation`]
    #[cbor(n(1), with = "minicbor::bytes")]
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Payload {
    /// Encode a mutation into a tagged payload
    pub fn from_mutation(mutation: &Mutation) -> Result<Self> {
        let body = minicbor::to_vec(mutation)
            .map_err(|e| Error::Serialization(format!("failed to encode mutation: {}", e)))?;
        Ok(Self {
            type_tag: mutation.type_tag(),
            body,
        })
    }

    /// Decode the mutation carried by this payload
    pub fn mutation(&self) -> Result<Mutation> {
        minicbor::decode(&self.body)
            .map_err(|e| Error::InvalidPayload(format!("failed to decode mutation: {}", e)))
    }
}

/// Typed mutation bodies for the supported CRDT kinds
///
/// One tagged variant per kind rather than per-module ad hoc dispatch; the
/// merge engine matches on these.
#[derive(Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize, Debug)]
pub enum Mutation {
    /// Overwrite a last-writer-wins register
    #[n(0)]
    LwwWrite {
        #[n(0)]
        key: String,
        #[cbor(n(1), with = "minicbor::bytes")]
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },

    /// Add an element to an observed-remove set
    #[n(1)]
    SetAdd {
        #[n(0)]
        key: String,
        #[cbor(n(1), with = "minicbor::bytes")]
        #[serde(with = "serde_bytes")]
        element: Vec<u8>,
    },

    /// Remove an element from an observed-remove set, retracting only the
    /// add-tags the writer had causally observed
    #[n(2)]
    SetRemove {
        #[n(0)]
        key: String,
        #[cbor(n(1), with = "minicbor::bytes")]
        #[serde(with = "serde_bytes")]
        element: Vec<u8>,
        #[n(2)]
        observed: Vec<OpId>,
    },

    /// Increment a positive-negative counter
    #[n(3)]
    CounterAdd {
        #[n(0)]
        key: String,
        #[n(1)]
        amount: u64,
    },

    /// Decrement a positive-negative counter
    #[n(4)]
    CounterSub {
        #[n(0)]
        key: String,
        #[n(1)]
        amount: u64,
    },
}

impl Mutation {
    /// The CRDT type tag this mutation belongs to
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Mutation::LwwWrite { .. } => TypeTag::LWW_REGISTER,
            Mutation::SetAdd { .. } | Mutation::SetRemove { .. } => TypeTag::OR_SET,
            Mutation::CounterAdd { .. } | Mutation::CounterSub { .. } => TypeTag::PN_COUNTER,
        }
    }

    /// The data key this mutation targets
    pub fn key(&self) -> &str {
        match self {
            Mutation::LwwWrite { key, .. }
            | Mutation::SetAdd { key, .. }
            | Mutation::SetRemove { key, .. }
            | Mutation::CounterAdd { key, .. }
            | Mutation::CounterSub { key, .. } => key,
        }
    }
}

/// Immutable unit of mutation
///
/// Once validated and stored an operation is permanent; deletion is modeled
/// as a new tombstone-style operation, never removal.
#[derive(Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize, Debug)]
pub struct Operation {
    /// Content hash of (payload, parents, originator, clock)
    #[n(0)]
    pub id: OpId,

    /// Opaque payload and its declared CRDT type tag
    #[n(1)]
    pub payload: Payload,

    /// Operation ids that causally precede this one (empty for roots)
    #[n(2)]
    pub parents: Vec<OpId>,

    /// Peer identity that created the operation
    #[n(3)]
    pub originator: PeerId,

    /// Vector clock snapshot at creation
    #[n(4)]
    pub clock: VectorClock,

    /// Ed25519 signature over the canonical encoding of the fields above
    #[n(5)]
    pub signature: Signature,
}

impl Operation {
    /// Build and sign a new operation
    ///
    /// The id is the Blake3 hash of the same canonical bytes the signature
    /// covers, so the same logical operation hashes identically regardless of
    /// which peer serialized it.
    pub fn signed(
        signer: &dyn Sign,
        payload: Payload,
        parents: Vec<OpId>,
        clock: VectorClock,
    ) -> Result<Self> {
        let originator = signer.peer_id();
        let bytes = canonical_bytes(&payload, &parents, &originator, &clock)?;
        let id = OpId(*blake3::hash(&bytes).as_bytes());
        let signature = signer.sign(&bytes);

        Ok(Self {
            id,
            payload,
            parents,
            originator,
            clock,
            signature,
        })
    }

    /// Canonical bytes covered by the signature and the content id
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        canonical_bytes(&self.payload, &self.parents, &self.originator, &self.clock)
    }

    /// Recompute the content id from the operation's fields
    pub fn content_id(&self) -> Result<OpId> {
        let bytes = self.signing_bytes()?;
        Ok(OpId(*blake3::hash(&bytes).as_bytes()))
    }

    /// Check if this operation directly depends on another
    pub fn depends_on(&self, other: &OpId) -> bool {
        self.parents.contains(other)
    }

    /// Compute transitive causal dependencies within a known set of ops
    pub fn transitive_deps<'a>(&'a self, ops: &'a [Operation]) -> HashSet<OpId> {
        let mut deps = HashSet::new();
        let mut to_visit: Vec<&OpId> = self.parents.iter().collect();

        while let Some(dep_id) = to_visit.pop() {
            if deps.insert(*dep_id) {
                if let Some(dep_op) = ops.iter().find(|op| &op.id == dep_id) {
                    to_visit.extend(&dep_op.parents);
                }
            }
        }

        deps
    }
}

fn canonical_bytes(
    payload: &Payload,
    parents: &[OpId],
    originator: &PeerId,
    clock: &VectorClock,
) -> Result<Vec<u8>> {
    #[derive(Encode)]
    struct SigningData<'a> {
        #[n(0)]
        payload: &'a Payload,
        #[n(1)]
        parents: &'a [OpId],
        #[n(2)]
        originator: &'a PeerId,
        #[n(3)]
        clock: &'a VectorClock,
    }

    let data = SigningData {
        payload,
        parents,
        originator,
        clock,
    };

    minicbor::to_vec(&data)
        .map_err(|e| Error::Serialization(format!("failed to encode operation: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn sample_op(signer: &Keypair, parents: Vec<OpId>) -> Operation {
        let mut clock = VectorClock::new();
        clock.tick(&signer.peer_id());
        let payload = Payload::from_mutation(&Mutation::LwwWrite {
            key: "title".to_string(),
            value: b"hello".to_vec(),
        })
        .unwrap();
        Operation::signed(signer, payload, parents, clock).unwrap()
    }

    #[test]
    fn test_content_id_matches() {
        let keypair = Keypair::generate();
        let op = sample_op(&keypair, vec![]);
        assert_eq!(op.content_id().unwrap(), op.id);
    }

    #[test]
    fn test_same_content_same_id() {
        let keypair = Keypair::generate();
        let a = sample_op(&keypair, vec![]);
        let b = sample_op(&keypair, vec![]);
        // Identical payload, parents, originator, and clock hash identically
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_parents_change_id() {
        let keypair = Keypair::generate();
        let root = sample_op(&keypair, vec![]);
        let child = sample_op(&keypair, vec![root.id]);
        assert_ne!(root.id, child.id);
        assert!(child.depends_on(&root.id));
    }

    #[test]
    fn test_cbor_roundtrip() {
        let keypair = Keypair::generate();
        let op = sample_op(&keypair, vec![OpId([4u8; 32])]);

        let bytes = minicbor::to_vec(&op).unwrap();
        let decoded: Operation = minicbor::decode(&bytes).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn test_mutation_roundtrip_through_payload() {
        let mutation = Mutation::SetRemove {
            key: "members".to_string(),
            element: b"item1".to_vec(),
            observed: vec![OpId([1u8; 32]), OpId([2u8; 32])],
        };
        let payload = Payload::from_mutation(&mutation).unwrap();
        assert_eq!(payload.type_tag, TypeTag::OR_SET);
        assert_eq!(payload.mutation().unwrap(), mutation);
    }

    #[test]
    fn test_transitive_deps() {
        let keypair = Keypair::generate();
        let a = sample_op(&keypair, vec![]);
        let b = sample_op(&keypair, vec![a.id]);
        let c = sample_op(&keypair, vec![b.id]);

        let ops = vec![a.clone(), b.clone(), c.clone()];
        let deps = c.transitive_deps(&ops);
        assert!(deps.contains(&a.id));
        assert!(deps.contains(&b.id));
        assert!(!deps.contains(&c.id));
    }
}
