//! Durable and in-memory operation storage
//!
//! The DAG layers over an `OpStorage` backend. `MemoryStore` backs tests and
//! ephemeral replicas; `RocksStore` persists operations across restarts.

pub mod dag;
pub mod store;

pub use dag::{Appended, OpDag};
pub use store::RocksStore;

use crate::crdt::Operation;
use crate::types::OpId;
use crate::Result;
use std::collections::HashMap;
use std::sync::RwLock;

/// Backend for durable operation records
pub trait OpStorage: Send + Sync {
    /// Persist an operation under its id
    fn put(&self, op: &Operation) -> Result<()>;

    /// Fetch an operation by id
    fn get(&self, id: &OpId) -> Result<Option<Operation>>;

    /// Whether an operation is present
    fn has(&self, id: &OpId) -> Result<bool>;

    /// All stored operations, in unspecified order
    fn scan(&self) -> Result<Vec<Operation>>;
}

impl<S: OpStorage + ?Sized> OpStorage for std::sync::Arc<S> {
    fn put(&self, op: &Operation) -> Result<()> {
        (**self).put(op)
    }

    fn get(&self, id: &OpId) -> Result<Option<Operation>> {
        (**self).get(id)
    }

    fn has(&self, id: &OpId) -> Result<bool> {
        (**self).has(id)
    }

    fn scan(&self) -> Result<Vec<Operation>> {
        (**self).scan()
    }
}

/// Volatile in-process store
#[derive(Default)]
pub struct MemoryStore {
    ops: RwLock<HashMap<OpId, Operation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OpStorage for MemoryStore {
    fn put(&self, op: &Operation) -> Result<()> {
        self.ops.write().unwrap().insert(op.id, op.clone());
        Ok(())
    }

    fn get(&self, id: &OpId) -> Result<Option<Operation>> {
        Ok(self.ops.read().unwrap().get(id).cloned())
    }

    fn has(&self, id: &OpId) -> Result<bool> {
        Ok(self.ops.read().unwrap().contains_key(id))
    }

    fn scan(&self) -> Result<Vec<Operation>> {
        Ok(self.ops.read().unwrap().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Mutation, Payload, VectorClock};
    use crate::crypto::{Keypair, Sign};

    #[test]
    fn test_memory_store_roundtrip() {
        let keypair = Keypair::generate();
        let mut clock = VectorClock::new();
        clock.tick(&keypair.peer_id());
        let payload = Payload::from_mutation(&Mutation::LwwWrite {
            key: "k".into(),
            value: b"v".to_vec(),
        })
        .unwrap();
        let op = Operation::signed(&keypair, payload, vec![], clock).unwrap();

        let store = MemoryStore::new();
        assert!(!store.has(&op.id).unwrap());
        store.put(&op).unwrap();
        assert!(store.has(&op.id).unwrap());
        assert_eq!(store.get(&op.id).unwrap(), Some(op));
    }
}
