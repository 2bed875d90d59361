//! Ed25519 signing and verification

use crate::types::{PeerId, Signature};
use crate::{Error, Result};
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;

/// Signing capability handed to the fabric by its owner
///
/// The peer identity is the verifying key, so a signer also fixes which peer
/// the local replica speaks as.
pub trait Sign: Send + Sync {
    /// Identity the produced signatures verify against
    fn peer_id(&self) -> PeerId;

    /// Sign a canonical message encoding
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Verification capability keyed by peer identity
pub trait Verify: Send + Sync {
    /// Check `signature` over `message` against the claimed signer's key
    fn verify(&self, message: &[u8], signature: &Signature, signer: &PeerId) -> bool;
}

/// Ed25519 keypair
#[derive(Clone)]
pub struct Keypair {
    inner: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let inner = ed25519_dalek::SigningKey::generate(&mut rng);
        Self { inner }
    }

    /// Create keypair from secret key bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let inner = ed25519_dalek::SigningKey::from_bytes(bytes);
        Ok(Self { inner })
    }

    /// Get the secret key bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Get the public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }
}

impl Sign for Keypair {
    fn peer_id(&self) -> PeerId {
        PeerId(self.public_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.inner.sign(message);
        Signature(sig.to_bytes())
    }
}

/// Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Create public key from bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|e| Error::Crypto(format!("Invalid public key: {}", e)))?;
        Ok(Self { inner })
    }

    /// Get the public key bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Get the peer identity
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.to_bytes())
    }

    /// Verify a signature
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.inner
            .verify(message, &sig)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// Stateless verifier resolving keys directly from peer identities
///
/// Peer identities are Ed25519 public key bytes, so no key directory is
/// needed; identities that do not parse as valid keys simply never verify.
#[derive(Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl Verify for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &Signature, signer: &PeerId) -> bool {
        match PublicKey::from_bytes(signer.as_bytes()) {
            Ok(key) => key.verify(message, signature).is_ok(),
            Err(_) => false,
        }
    }
}
