//! Identity module for contact keypair management.
//!
//! An identity is an Ed25519 signing key plus an X25519 key-agreement key.
//! The public halves together form the [`PublicKey`] that addresses a contact.
//! Both secret key types zeroize themselves on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use kith_proto::v1::PublicKeyV1;

use crate::hash::fingerprint;
use crate::transcript::{domains, tags, Transcript};

/// Length of an encoded [`PublicKey`].
pub const PUBLIC_KEY_LEN: usize = 64;

/// Error type for identity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Shareable identifier of an identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey {
    sign: [u8; 32],
    kex: [u8; 32],
}

impl PublicKey {
    pub fn from_parts(sign: [u8; 32], kex: [u8; 32]) -> Self {
        Self { sign, kex }
    }

    /// Parse the 64-byte `sign_pub || kex_pub` encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(IdentityError::InvalidKeyLength { expected: PUBLIC_KEY_LEN, got: bytes.len() });
        }
        let mut sign = [0u8; 32];
        let mut kex = [0u8; 32];
        sign.copy_from_slice(&bytes[..32]);
        kex.copy_from_slice(&bytes[32..]);
        Ok(Self { sign, kex })
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out[..32].copy_from_slice(&self.sign);
        out[32..].copy_from_slice(&self.kex);
        out
    }

    pub fn sign_pub(&self) -> &[u8; 32] {
        &self.sign
    }

    pub fn kex_pub(&self) -> &[u8; 32] {
        &self.kex
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Short stable fingerprint used in logs.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.to_bytes())
    }

    /// Append both halves of the key to a transcript.
    pub fn append_to(&self, t: &mut Transcript) {
        t.append_bytes(tags::SIGN_KEY, &self.sign);
        t.append_bytes(tags::KEX_KEY, &self.kex);
    }

    /// Verify an Ed25519 signature made by this key's signing half.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), IdentityError> {
        verify_signature(&self.sign, message, signature)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl From<&PublicKey> for PublicKeyV1 {
    fn from(key: &PublicKey) -> Self {
        Self { sign_pub: key.sign.to_vec(), kex_pub: key.kex.to_vec() }
    }
}

impl TryFrom<&PublicKeyV1> for PublicKey {
    type Error = IdentityError;

    fn try_from(value: &PublicKeyV1) -> Result<Self, Self::Error> {
        let sign: [u8; 32] = value
            .sign_pub
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength { expected: 32, got: value.sign_pub.len() })?;
        let kex: [u8; 32] = value
            .kex_pub
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength { expected: 32, got: value.kex_pub.len() })?;
        Ok(Self { sign, kex })
    }
}

/// A cryptographic identity: Ed25519 signing key and X25519 key exchange key.
pub struct Identity {
    sign_key: SigningKey,
    kex_key: StaticSecret,
    public: PublicKey,
}

impl Identity {
    /// Generate a new random identity using a secure random source.
    pub fn generate() -> Self {
        let sign_key = SigningKey::generate(&mut OsRng);
        let kex_key = StaticSecret::random_from_rng(OsRng);
        Self::from_keys(sign_key, kex_key)
    }

    /// Rebuild an identity from its two 32-byte secrets.
    pub fn from_bytes(sign_key_bytes: &[u8; 32], kex_key_bytes: &[u8; 32]) -> Self {
        let sign_key = SigningKey::from_bytes(sign_key_bytes);
        let kex_key = StaticSecret::from(*kex_key_bytes);
        Self::from_keys(sign_key, kex_key)
    }

    fn from_keys(sign_key: SigningKey, kex_key: StaticSecret) -> Self {
        let public = PublicKey::from_parts(
            sign_key.verifying_key().to_bytes(),
            X25519PublicKey::from(&kex_key).to_bytes(),
        );
        Self { sign_key, kex_key, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Sign a message using Ed25519.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    /// X25519 secret for unwrapping session keys sealed to this identity.
    pub(crate) fn kex_secret(&self) -> &StaticSecret {
        &self.kex_key
    }

    /// Signature proving possession of this identity's signing key, presented
    /// to the relay when connecting.
    pub fn ownership_proof(&self) -> [u8; 64] {
        self.sign(&ownership_digest(&self.public))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("public", &self.public).finish_non_exhaustive()
    }
}

fn ownership_digest(key: &PublicKey) -> [u8; 32] {
    let mut t = Transcript::new(domains::KEY_OWNERSHIP);
    key.append_to(&mut t);
    t.finalize()
}

/// Check a proof produced by [`Identity::ownership_proof`].
pub fn verify_ownership_proof(key: &PublicKey, proof: &[u8; 64]) -> Result<(), IdentityError> {
    key.verify(&ownership_digest(key), proof)
}

/// Verify an Ed25519 signature.
pub fn verify_signature(pub_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<(), IdentityError> {
    let verifying_key = VerifyingKey::from_bytes(pub_key).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}
