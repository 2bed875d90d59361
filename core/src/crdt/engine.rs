//! CRDT merge engine
//!
//! Folds DAG operations into per-key materialized state. The fold is
//! commutative, associative, and idempotent over the set of operations
//! applied so far: any delivery order or duplication of the same operation
//! set yields an identical final state, which is what lets replicas converge
//! without coordination. Keys are namespaced per CRDT kind, so ops of
//! different kinds on the same key materialize independently instead of
//! racing for the key.

use crate::crdt::{CausalOrder, Mutation, Operation, VectorClock};
use crate::types::{OpId, PeerId, StateDigest, TypeTag};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Last-writer-wins register state
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RegisterState {
    pub value: Vec<u8>,
    clock: VectorClock,
    originator: PeerId,
    op: OpId,
}

/// Observed-remove set state
///
/// Add-tags are the ids of the add operations; a tag stays suppressed once
/// retracted even if its add arrives later, so the fold is order-independent.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct SetState {
    tags: BTreeMap<Vec<u8>, BTreeSet<OpId>>,
    retracted: BTreeSet<OpId>,
}

impl SetState {
    /// Live (unretracted) add-tags for an element
    pub fn live_tags(&self, element: &[u8]) -> Vec<OpId> {
        self.tags
            .get(element)
            .map(|tags| tags.iter().filter(|t| !self.retracted.contains(t)).copied().collect())
            .unwrap_or_default()
    }

    /// An element is present iff it has at least one unretracted add-tag
    pub fn contains(&self, element: &[u8]) -> bool {
        !self.live_tags(element).is_empty()
    }

    /// Visible elements in deterministic order
    pub fn elements(&self) -> Vec<Vec<u8>> {
        self.tags
            .keys()
            .filter(|element| self.contains(element))
            .cloned()
            .collect()
    }
}

/// Positive-negative counter state
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct CounterState {
    incr: BTreeMap<PeerId, u64>,
    decr: BTreeMap<PeerId, u64>,
}

impl CounterState {
    /// Merged value: sum of all peers' contributions, saturating at the
    /// i64 bounds
    pub fn value(&self) -> i64 {
        let plus: i128 = self.incr.values().map(|&v| v as i128).sum();
        let minus: i128 = self.decr.values().map(|&v| v as i128).sum();
        (plus - minus).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

/// Materialized state for one data key
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum KeyState {
    Register(RegisterState),
    Set(SetState),
    Counter(CounterState),
}

/// Folds operations into materialized replica state
///
/// The state map is keyed by `(key, kind)`: a register, a set, and a
/// counter under the same key name coexist without interfering, and the
/// materialized state stays a pure function of the applied operation set
/// whatever order the operations arrive in.
#[derive(Clone, Default)]
pub struct MergeEngine {
    keys: BTreeMap<(String, TypeTag), KeyState>,
    applied: HashSet<OpId>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one operation to the materialized state
    ///
    /// Returns `Ok(true)` if the operation changed state, `Ok(false)` if it
    /// was already applied (idempotent re-delivery). Payloads with an
    /// unregistered type tag fail with `UnsupportedType` and are excluded
    /// from state; this is fatal for the operation, not the system.
    pub fn apply(&mut self, op: &Operation) -> Result<bool> {
        if self.applied.contains(&op.id) {
            return Ok(false);
        }

        match op.payload.type_tag {
            TypeTag::LWW_REGISTER | TypeTag::OR_SET | TypeTag::PN_COUNTER => {}
            tag => return Err(Error::UnsupportedType(tag)),
        }

        let mutation = op.payload.mutation()?;
        if mutation.type_tag() != op.payload.type_tag {
            return Err(Error::InvalidPayload(format!(
                "declared tag {} does not match mutation body",
                op.payload.type_tag
            )));
        }

        self.fold(op, mutation);
        self.applied.insert(op.id);
        Ok(true)
    }

    /// Whether an operation has already been folded
    pub fn has_applied(&self, id: &OpId) -> bool {
        self.applied.contains(id)
    }

    fn fold(&mut self, op: &Operation, mutation: Mutation) {
        let slot = (mutation.key().to_string(), mutation.type_tag());

        match mutation {
            Mutation::LwwWrite { value, .. } => {
                let candidate = RegisterState {
                    value,
                    clock: op.clock.clone(),
                    originator: op.originator,
                    op: op.id,
                };
                match self.keys.get_mut(&slot) {
                    None => {
                        self.keys.insert(slot, KeyState::Register(candidate));
                    }
                    Some(KeyState::Register(current)) => {
                        if register_wins(&candidate, current) {
                            *current = candidate;
                        }
                    }
                    Some(_) => unreachable!("slot is keyed by kind"),
                }
            }

            Mutation::SetAdd { element, .. } => {
                let state = self
                    .keys
                    .entry(slot)
                    .or_insert_with(|| KeyState::Set(SetState::default()));
                if let KeyState::Set(set) = state {
                    set.tags.entry(element).or_default().insert(op.id);
                }
            }

            Mutation::SetRemove { element, observed, .. } => {
                let state = self
                    .keys
                    .entry(slot)
                    .or_insert_with(|| KeyState::Set(SetState::default()));
                if let KeyState::Set(set) = state {
                    // Retract only the tags this remove causally observed;
                    // concurrent adds carry fresh tags and survive.
                    set.retracted.extend(observed);
                    set.tags.entry(element).or_default();
                }
            }

            Mutation::CounterAdd { amount, .. } => {
                let state = self
                    .keys
                    .entry(slot)
                    .or_insert_with(|| KeyState::Counter(CounterState::default()));
                if let KeyState::Counter(counter) = state {
                    let entry = counter.incr.entry(op.originator).or_insert(0);
                    *entry = entry.saturating_add(amount);
                }
            }

            Mutation::CounterSub { amount, .. } => {
                let state = self
                    .keys
                    .entry(slot)
                    .or_insert_with(|| KeyState::Counter(CounterState::default()));
                if let KeyState::Counter(counter) = state {
                    let entry = counter.decr.entry(op.originator).or_insert(0);
                    *entry = entry.saturating_add(amount);
                }
            }
        }
    }

    /// State for one key under one CRDT kind, if materialized
    pub fn key_state(&self, key: &str, kind: TypeTag) -> Option<&KeyState> {
        self.keys.get(&(key.to_string(), kind))
    }

    /// Register value for a key
    pub fn register(&self, key: &str) -> Option<&[u8]> {
        match self.key_state(key, TypeTag::LWW_REGISTER) {
            Some(KeyState::Register(reg)) => Some(&reg.value),
            _ => None,
        }
    }

    /// Visible elements of an observed-remove set
    pub fn set_elements(&self, key: &str) -> Vec<Vec<u8>> {
        match self.key_state(key, TypeTag::OR_SET) {
            Some(KeyState::Set(set)) => set.elements(),
            _ => Vec::new(),
        }
    }

    /// Whether a set contains an element
    pub fn set_contains(&self, key: &str, element: &[u8]) -> bool {
        match self.key_state(key, TypeTag::OR_SET) {
            Some(KeyState::Set(set)) => set.contains(element),
            _ => false,
        }
    }

    /// Live add-tags for a set element (used to build observed removes)
    pub fn set_live_tags(&self, key: &str, element: &[u8]) -> Vec<OpId> {
        match self.key_state(key, TypeTag::OR_SET) {
            Some(KeyState::Set(set)) => set.live_tags(element),
            _ => Vec::new(),
        }
    }

    /// Counter value for a key
    pub fn counter(&self, key: &str) -> i64 {
        match self.key_state(key, TypeTag::PN_COUNTER) {
            Some(KeyState::Counter(counter)) => counter.value(),
            _ => 0,
        }
    }

    /// Deterministic digest of one key's materialized values, across every
    /// kind present under it
    pub fn key_digest(&self, key: &str) -> Option<StateDigest> {
        let lo = (key.to_string(), TypeTag(u16::MIN));
        let hi = (key.to_string(), TypeTag(u16::MAX));
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.as_bytes());
        let mut found = false;
        for state in self.keys.range(lo..=hi).map(|(_, state)| state) {
            found = true;
            hash_key_state(&mut hasher, state);
        }
        found.then(|| StateDigest(*hasher.finalize().as_bytes()))
    }

    /// Deterministic digest of the whole materialized state
    ///
    /// Slots are folded in sorted order so any two replicas holding the same
    /// DAG produce an identical digest.
    pub fn digest(&self) -> StateDigest {
        let mut hasher = blake3::Hasher::new();
        for ((key, _), state) in &self.keys {
            hasher.update(&(key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hash_key_state(&mut hasher, state);
        }
        StateDigest(*hasher.finalize().as_bytes())
    }

    /// Number of materialized key slots
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Deterministic conflict resolution for LWW registers: later vector clock
/// wins; concurrent writes are broken by originator identity (lexicographic),
/// then by operation id.
fn register_wins(candidate: &RegisterState, current: &RegisterState) -> bool {
    match candidate.clock.compare(&current.clock) {
        CausalOrder::After => true,
        CausalOrder::Before => false,
        CausalOrder::Concurrent => match candidate.originator.cmp(&current.originator) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => candidate.op > current.op,
        },
    }
}

fn hash_key_state(hasher: &mut blake3::Hasher, state: &KeyState) {
    match state {
        KeyState::Register(reg) => {
            hasher.update(b"reg");
            hasher.update(&(reg.value.len() as u64).to_be_bytes());
            hasher.update(&reg.value);
        }
        KeyState::Set(set) => {
            hasher.update(b"set");
            for element in set.elements() {
                hasher.update(&(element.len() as u64).to_be_bytes());
                hasher.update(&element);
            }
        }
        KeyState::Counter(counter) => {
            hasher.update(b"ctr");
            hasher.update(&counter.value().to_be_bytes());
        }
    }
}
