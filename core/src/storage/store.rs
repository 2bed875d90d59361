//! RocksDB-backed persistent operation store

use crate::crdt::Operation;
use crate::storage::OpStorage;
use crate::types::OpId;
use crate::{Error, Result};
use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;

const OP_PREFIX: &[u8] = b"op:";

/// Durable store; operations survive restarts and the DAG indexes are
/// rebuilt from a scan on open
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path)
            .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;

        Ok(Self { db })
    }

    fn op_key(id: &OpId) -> Vec<u8> {
        let mut key = OP_PREFIX.to_vec();
        key.extend_from_slice(id.as_bytes());
        key
    }
}

impl OpStorage for RocksStore {
    fn put(&self, op: &Operation) -> Result<()> {
        let value = minicbor::to_vec(op)
            .map_err(|e| Error::Serialization(format!("failed to encode op: {}", e)))?;
        self.db
            .put(Self::op_key(&op.id), value)
            .map_err(|e| Error::Storage(format!("failed to store op: {}", e)))
    }

    fn get(&self, id: &OpId) -> Result<Option<Operation>> {
        match self.db.get(Self::op_key(id)) {
            Ok(Some(value)) => {
                let op = minicbor::decode(&value)
                    .map_err(|e| Error::Serialization(format!("failed to decode op: {}", e)))?;
                Ok(Some(op))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(format!("failed to get op: {}", e))),
        }
    }

    fn has(&self, id: &OpId) -> Result<bool> {
        self.db
            .get(Self::op_key(id))
            .map(|v| v.is_some())
            .map_err(|e| Error::Storage(format!("failed to probe op: {}", e)))
    }

    fn scan(&self) -> Result<Vec<Operation>> {
        let mut ops = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(OP_PREFIX, rocksdb::Direction::Forward));

        for item in iter {
            let (key, value) =
                item.map_err(|e| Error::Storage(format!("iterator error: {}", e)))?;
            if !key.starts_with(OP_PREFIX) {
                break;
            }
            let op: Operation = minicbor::decode(&value)
                .map_err(|e| Error::Serialization(format!("failed to decode op: {}", e)))?;
            ops.push(op);
        }

        Ok(ops)
    }
}
