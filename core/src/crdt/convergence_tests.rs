//! Property-based tests for merge convergence
//!
//! Verify the algebraic properties the whole fabric stands on:
//! - Commutativity: delivery order does not change the merged state
//! - Idempotence: re-applying an operation has no further effect
//! - Eventual consistency: replicas with the same operation set share a
//!   state digest

use crate::crdt::{MergeEngine, Mutation, Operation, Payload, VectorClock};
use crate::crypto::{Keypair, Sign};
use proptest::prelude::*;

/// Abstract mutation descriptor; materialized into signed ops per author
#[derive(Debug, Clone)]
enum Step {
    Write { key: u8, value: u8 },
    Add { key: u8, element: u8 },
    Remove { key: u8, element: u8 },
    Incr { key: u8, amount: u8 },
    Decr { key: u8, amount: u8 },
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..3u8, any::<u8>()).prop_map(|(key, value)| Step::Write { key, value }),
        (0..3u8, 0..8u8).prop_map(|(key, element)| Step::Add { key, element }),
        (0..3u8, 0..8u8).prop_map(|(key, element)| Step::Remove { key, element }),
        (0..3u8, 1..16u8).prop_map(|(key, amount)| Step::Incr { key, amount }),
        (0..3u8, 1..16u8).prop_map(|(key, amount)| Step::Decr { key, amount }),
    ]
}

/// Materialize abstract steps into signed operations
///
/// Each step is attributed round-robin to one of `authors` peers, each of
/// which advances its own vector clock. Removes retract the tags the author
/// has observed so far, mirroring how a live replica builds them.
fn materialize(steps: &[Step], authors: usize) -> Vec<Operation> {
    let keypairs: Vec<Keypair> = (0..authors).map(|_| Keypair::generate()).collect();
    let mut clocks: Vec<VectorClock> = vec![VectorClock::new(); authors];
    // Each author folds what it has produced so far to derive observed tags
    let mut views: Vec<MergeEngine> = vec![MergeEngine::new(); authors];

    let mut ops = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let who = i % authors;
        let keypair = &keypairs[who];
        let mutation = match step {
            Step::Write { key, value } => Mutation::LwwWrite {
                key: format!("reg{key}"),
                value: vec![*value],
            },
            Step::Add { key, element } => Mutation::SetAdd {
                key: format!("set{key}"),
                element: vec![*element],
            },
            Step::Remove { key, element } => {
                let set_key = format!("set{key}");
                let observed = views[who].set_live_tags(&set_key, &[*element]);
                Mutation::SetRemove {
                    key: set_key,
                    element: vec![*element],
                    observed,
                }
            }
            Step::Incr { key, amount } => Mutation::CounterAdd {
                key: format!("ctr{key}"),
                amount: *amount as u64,
            },
            Step::Decr { key, amount } => Mutation::CounterSub {
                key: format!("ctr{key}"),
                amount: *amount as u64,
            },
        };

        clocks[who].tick(&keypair.peer_id());
        let payload = Payload::from_mutation(&mutation).unwrap();
        let op = Operation::signed(keypair, payload, vec![], clocks[who].clone()).unwrap();
        let _ = views[who].apply(&op);
        ops.push(op);
    }
    ops
}

fn fold(ops: &[&Operation]) -> MergeEngine {
    let mut engine = MergeEngine::new();
    for op in ops {
        let _ = engine.apply(op);
    }
    engine
}

proptest! {
    /// Applying the same operations in opposite orders converges
    #[test]
    fn test_commutativity(steps in prop::collection::vec(arb_step(), 1..24)) {
        let ops = materialize(&steps, 3);

        let forward: Vec<&Operation> = ops.iter().collect();
        let backward: Vec<&Operation> = ops.iter().rev().collect();

        let e1 = fold(&forward);
        let e2 = fold(&backward);
        prop_assert_eq!(e1.digest(), e2.digest());
    }

    /// Duplicated deliveries leave the state unchanged
    #[test]
    fn test_idempotence(steps in prop::collection::vec(arb_step(), 1..16)) {
        let ops = materialize(&steps, 2);

        let once: Vec<&Operation> = ops.iter().collect();
        let mut twice: Vec<&Operation> = ops.iter().collect();
        twice.extend(ops.iter());

        prop_assert_eq!(fold(&once).digest(), fold(&twice).digest());
    }

    /// Replicas receiving interleaved subsets converge once both hold all ops
    #[test]
    fn test_eventual_consistency(
        steps in prop::collection::vec(arb_step(), 2..24),
        split in any::<u64>(),
    ) {
        let ops = materialize(&steps, 3);

        // Partition deliveries between two replicas, then exchange
        let mut first: Vec<&Operation> = Vec::new();
        let mut second: Vec<&Operation> = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            if (split >> (i % 64)) & 1 == 0 {
                first.push(op);
                second.insert(0, op);
            } else {
                second.push(op);
                first.insert(0, op);
            }
        }

        let e1 = fold(&first);
        let e2 = fold(&second);
        prop_assert_eq!(e1.digest(), e2.digest());
        prop_assert_eq!(e1.counter("ctr0"), e2.counter("ctr0"));
    }
}

/// Deterministic regression alongside the property tests: per-author views
/// let a materialized remove retract exactly the tags it observed.
#[test]
fn test_materialized_remove_retracts_observed_tags() {
    let steps = vec![
        Step::Add { key: 0, element: 1 },
        Step::Add { key: 0, element: 1 },
        Step::Remove { key: 0, element: 1 },
    ];
    let ops = materialize(&steps, 1);
    let refs: Vec<&Operation> = ops.iter().collect();
    let engine = fold(&refs);
    assert!(!engine.set_contains("set0", &[1]));
}
