//! Cryptographic primitives and the signing/verification seam
//!
//! The fabric never generates or stores private keys itself; it is handed a
//! [`Sign`] capability by its owner and verifies provenance through a
//! [`Verify`] capability keyed by peer identity.

pub mod signing;

pub use signing::{Ed25519Verifier, Keypair, PublicKey, Sign, Verify};
