//! Byzantine behavior: forged operations, reputation decay, eviction, and
//! corroboration quorums

use std::sync::Arc;
use weft_core::crdt::{Mutation, Operation, Payload, RejectionReason, VectorClock};
use weft_core::crypto::{Keypair, Sign};
use weft_core::network::{InMemoryNetwork, PeerStatus};
use weft_core::replica::IngestOutcome;
use weft_core::storage::MemoryStore;
use weft_core::{FabricConfig, PeerId, Replica, TypeTag};

fn replica_with(cfg: FabricConfig) -> Arc<Replica<MemoryStore>> {
    Arc::new(Replica::open(Arc::new(Keypair::generate()), MemoryStore::new(), cfg).unwrap())
}

fn replica() -> Arc<Replica<MemoryStore>> {
    replica_with(FabricConfig::default())
}

/// A validly signed op whose payload was swapped after signing
fn forged_op(mallory: &Keypair) -> Operation {
    let mut clock = VectorClock::new();
    clock.tick(&mallory.peer_id());
    let payload = Payload::from_mutation(&Mutation::LwwWrite {
        key: "balance".into(),
        value: b"100".to_vec(),
    })
    .unwrap();
    let mut op = Operation::signed(mallory, payload, vec![], clock).unwrap();
    op.payload.body = Payload::from_mutation(&Mutation::LwwWrite {
        key: "balance".into(),
        value: b"1000000".to_vec(),
    })
    .unwrap()
    .body;
    op
}

#[tokio::test]
async fn test_forged_op_rejected_and_never_stored() {
    let mallory = Keypair::generate();
    let honest = replica();
    let bystander = replica();

    let forged = forged_op(&mallory);

    for target in [&honest, &bystander] {
        assert_eq!(
            target.ingest(&forged, Some(mallory.peer_id())).unwrap(),
            IngestOutcome::Rejected(RejectionReason::InvalidSignature)
        );
        assert_eq!(target.summary().ops, 0);
        assert_eq!(target.register("balance"), None);
    }
}

#[tokio::test]
async fn test_forgery_penalizes_reputation() {
    let mallory = Keypair::generate();
    let honest = replica();

    let before = 1.0;
    honest.ingest(&forged_op(&mallory), Some(mallory.peer_id())).unwrap();

    let record = honest.peers().get(&mallory.peer_id()).unwrap();
    assert!(record.reputation < before);
}

#[tokio::test]
async fn test_repeated_forgery_evicts_originator() {
    let mallory = Keypair::generate();
    let honest = replica();

    // Default penalty 0.1 against a floor of 0.2: repeated forgeries walk
    // the reputation down until eviction
    for _ in 0..12 {
        let _ = honest.ingest(&forged_op(&mallory), Some(mallory.peer_id()));
    }

    let status = honest.peers().status(&mallory.peer_id()).unwrap();
    assert!(matches!(status, PeerStatus::Evicted { .. }));
}

#[tokio::test]
async fn test_relayer_of_forged_op_penalized() {
    let mallory = Keypair::generate();
    let relayer = PeerId([7u8; 32]);
    let honest = replica();

    honest.ingest(&forged_op(&mallory), Some(relayer)).unwrap();

    let record = honest.peers().get(&relayer).unwrap();
    assert!(record.reputation < 1.0);
}

#[tokio::test]
async fn test_op_whose_clock_omits_author_rejected() {
    let mallory = Keypair::generate();
    let honest = replica();

    // Validly signed, but with an empty clock: such an op would merge into
    // state yet never match any clock delta, so it must not enter the DAG
    let payload = Payload::from_mutation(&Mutation::LwwWrite {
        key: "k".into(),
        value: b"v".to_vec(),
    })
    .unwrap();
    let op = Operation::signed(&mallory, payload, vec![], VectorClock::new()).unwrap();

    assert_eq!(
        honest.ingest(&op, Some(mallory.peer_id())).unwrap(),
        IngestOutcome::Rejected(RejectionReason::InconsistentClock)
    );
    assert_eq!(honest.summary().ops, 0);
    assert_eq!(honest.register("k"), None);
}

#[tokio::test]
async fn test_corroboration_quorum_holds_then_admits() {
    let author = replica();
    let receiver = replica_with(
        FabricConfig::default().with_corroboration(TypeTag::LWW_REGISTER, 2),
    );

    let op = author.set_register("role", b"admin".to_vec()).unwrap();
    let witness_a = PeerId([1u8; 32]);
    let witness_b = PeerId([2u8; 32]);

    assert_eq!(
        receiver.ingest(&op, Some(witness_a)).unwrap(),
        IngestOutcome::Held { have: 1, need: 2 }
    );
    assert_eq!(receiver.register("role"), None);

    // Second distinct relayer satisfies the quorum
    assert_eq!(
        receiver.ingest(&op, Some(witness_b)).unwrap(),
        IngestOutcome::Applied
    );
    assert_eq!(receiver.register("role"), Some(b"admin".to_vec()));
}

#[tokio::test]
async fn test_local_writes_skip_corroboration() {
    let replica = replica_with(
        FabricConfig::default().with_corroboration(TypeTag::PN_COUNTER, 3),
    );
    replica.incr_counter("votes", 1).unwrap();
    assert_eq!(replica.counter("votes"), 1);
}

#[tokio::test]
async fn test_poisoned_gossip_does_not_spread() {
    // Mallory relays a forged op to Alice over the wire path; Alice must not
    // forward it to Bob because it never enters her DAG
    let network = InMemoryNetwork::new();

    let alice = replica();
    let bob = replica();
    network.register(alice.id(), alice.clone());
    network.register(bob.id(), bob.clone());

    let mallory = Keypair::generate();
    let forged = forged_op(&mallory);
    assert!(matches!(
        alice.ingest(&forged, Some(mallory.peer_id())).unwrap(),
        IngestOutcome::Rejected(_)
    ));

    // Alice has nothing to offer Bob
    let delta = alice.ops_since(&bob.clock(), 100).unwrap();
    assert!(delta.is_empty());
}
