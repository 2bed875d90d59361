//! Weft Core Library
//!
//! A coordinator-free replication fabric for long-lived distributed state.
//! Independent peers replicate an append-only causal operation graph,
//! materialize it through conflict-free merge policies, and reconcile with
//! each other via gossip anti-entropy, tolerating partition, message loss,
//! reordering, and a bounded fraction of adversarial participants.

pub mod config;
pub mod crdt;
pub mod crypto;
pub mod network;
pub mod replica;
pub mod storage;
pub mod types;

pub use config::FabricConfig;
pub use replica::Replica;
pub use types::*;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing causal dependencies: {0:?}")]
    MissingDependency(Vec<OpId>),

    #[error("cyclic dependency at {0}")]
    CyclicDependency(OpId),

    #[error("unsupported CRDT type tag: {0}")]
    UnsupportedType(TypeTag),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("holdback queue full")]
    HoldbackFull,

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("storage operation failed: {0}")]
    Storage(String),

    #[error("transport operation failed: {0}")]
    Transport(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
