//! Envelope module for sealed, recipient-bound messages.
//!
//! Hybrid scheme:
//! - a fresh [`SessionKey`] per message, wrapped for the recipient with an
//!   ephemeral X25519 agreement + HKDF-SHA256 + ChaCha20Poly1305;
//! - a [`SignedMessage`] whose Ed25519 signature covers a hash of
//!   `(recipient, data)`, so it cannot be replayed to someone else;
//! - the encoded signed message encrypted under the session key, with the
//!   wrapped key as AAD.
//!
//! The envelope proves who signed a message and for whom. Whether the signer
//! is trusted is for the caller to decide.

use bytes::Bytes;
use hkdf::Hkdf;
use prost::Message;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use kith_proto::v1::{EnvelopeV1, SignedMessageV1, ENVELOPE_VERSION};

use crate::identity::{Identity, PublicKey};
use crate::session_key::{SessionKey, SESSION_KEY_LEN, TAG_LEN};
use crate::transcript::{domains, tags, Transcript};

/// Wrapped session key: ephemeral public key followed by ciphertext and tag.
pub const WRAPPED_KEY_LEN: usize = 32 + SESSION_KEY_LEN + TAG_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("invalid key bytes")]
    InvalidKeyBytes,
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Plaintext sealed inside an [`Envelope`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedMessage {
    pub from: PublicKey,
    pub data: Bytes,
    pub signed_hash: [u8; 64],
}

impl SignedMessage {
    pub fn to_proto(&self) -> SignedMessageV1 {
        SignedMessageV1 {
            from: Some((&self.from).into()),
            data: self.data.to_vec(),
            signed_hash: self.signed_hash.to_vec(),
        }
    }

    /// Convert a decoded wire message. A missing or malformed signer key or
    /// signature cannot be verified and reports `InvalidSignature`.
    pub fn from_proto(msg: SignedMessageV1) -> Result<Self, EnvelopeError> {
        msg.validate().map_err(|_| EnvelopeError::InvalidSignature)?;
        let from = msg
            .from
            .as_ref()
            .ok_or(EnvelopeError::InvalidSignature)
            .and_then(|k| PublicKey::try_from(k).map_err(|_| EnvelopeError::InvalidSignature))?;
        let signed_hash: [u8; 64] = msg
            .signed_hash
            .as_slice()
            .try_into()
            .map_err(|_| EnvelopeError::InvalidSignature)?;
        Ok(Self { from, data: Bytes::from(msg.data), signed_hash })
    }
}

/// The only artifact placed on the wire for a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub encrypted_session_key: Vec<u8>,
    pub encrypted_message: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Bytes {
        let proto = EnvelopeV1 {
            version: ENVELOPE_VERSION,
            encrypted_session_key: self.encrypted_session_key.clone(),
            encrypted_message: self.encrypted_message.clone(),
        };
        Bytes::from(proto.encode_to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let proto = EnvelopeV1::decode(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        proto.validate().map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        Ok(Self {
            encrypted_session_key: proto.encrypted_session_key,
            encrypted_message: proto.encrypted_message,
        })
    }
}

/// Result of a successful [`open`].
#[derive(Debug)]
pub struct Opened {
    pub session_key: SessionKey,
    pub message: SignedMessage,
}

fn message_hash(to: &PublicKey, data: &[u8]) -> [u8; 32] {
    let mut t = Transcript::new(domains::SIGNED_MESSAGE);
    to.append_to(&mut t);
    t.append_bytes(tags::PAYLOAD, data);
    t.finalize()
}

/// Sign `data` for `to`. The recipient is bound into the signed hash.
pub fn sign(me: &Identity, to: &PublicKey, data: impl Into<Bytes>) -> SignedMessage {
    let data = data.into();
    let signed_hash = me.sign(&message_hash(to, &data));
    SignedMessage { from: *me.public_key(), data, signed_hash }
}

/// Verify that `message` was signed by `message.from` and addressed to `me`.
pub fn verify<'a>(me: &Identity, message: &'a SignedMessage) -> Result<&'a Bytes, EnvelopeError> {
    let expected = message_hash(me.public_key(), &message.data);
    message
        .from
        .verify(&expected, &message.signed_hash)
        .map_err(|_| EnvelopeError::InvalidSignature)?;
    Ok(&message.data)
}

fn kdf_key_nonce(shared_secret: &[u8; 32], eph_pub: &[u8; 32], recipient_kex: &[u8; 32]) -> Result<([u8; 32], [u8; 12]), hkdf::InvalidLength> {
    let mut salt = Transcript::new(domains::KEY_WRAP);
    salt.append_bytes(tags::EPHEMERAL, eph_pub);
    salt.append_bytes(tags::KEX_KEY, recipient_kex);

    let hk = Hkdf::<Sha256>::new(Some(&salt.finalize()), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(b"kith_wrap_v1_key", &mut key)?;
    let mut nonce = [0u8; 12];
    hk.expand(b"kith_wrap_v1_nonce", &mut nonce)?;
    Ok((key, nonce))
}

/// Asymmetrically encrypt `key` for `to`.
pub fn wrap_session_key(to: &PublicKey, key: &SessionKey) -> Result<Vec<u8>, EnvelopeError> {
    use chacha20poly1305::{aead::{Aead, KeyInit, Payload}, ChaCha20Poly1305, Key, Nonce};

    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519PublicKey::from(&eph);
    let shared = eph.diffie_hellman(&X25519PublicKey::from(*to.kex_pub()));
    if !shared.was_contributory() {
        return Err(EnvelopeError::InvalidKeyBytes);
    }

    let (key32, nonce12) = kdf_key_nonce(shared.as_bytes(), eph_pub.as_bytes(), to.kex_pub())
        .map_err(|_| EnvelopeError::EncryptFailed)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key32));
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce12),
            Payload { msg: key.as_bytes(), aad: eph_pub.as_bytes() },
        )
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Recover a session key wrapped for `me`.
pub fn unwrap_session_key(me: &Identity, wrapped: &[u8]) -> Result<SessionKey, EnvelopeError> {
    use chacha20poly1305::{aead::{Aead, KeyInit, Payload}, ChaCha20Poly1305, Key, Nonce};

    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(EnvelopeError::DecryptionFailed);
    }
    let (eph_bytes, ct) = wrapped.split_at(32);
    let eph_arr: [u8; 32] = eph_bytes.try_into().map_err(|_| EnvelopeError::DecryptionFailed)?;

    let shared = me.kex_secret().diffie_hellman(&X25519PublicKey::from(eph_arr));
    let (key32, nonce12) = kdf_key_nonce(shared.as_bytes(), &eph_arr, me.public_key().kex_pub())
        .map_err(|_| EnvelopeError::DecryptionFailed)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key32));
    let pt = cipher
        .decrypt(Nonce::from_slice(&nonce12), Payload { msg: ct, aad: &eph_arr })
        .map_err(|_| EnvelopeError::DecryptionFailed)?;

    let key: [u8; SESSION_KEY_LEN] = pt.as_slice().try_into().map_err(|_| EnvelopeError::DecryptionFailed)?;
    Ok(SessionKey::from_bytes(key))
}

/// Seal an already signed message for `to` under `key`.
pub fn seal_signed(to: &PublicKey, message: &SignedMessage, key: &SessionKey) -> Result<Envelope, EnvelopeError> {
    let encrypted_session_key = wrap_session_key(to, key)?;
    let encrypted_message = key.encrypt(&message.to_proto().encode_to_vec(), &encrypted_session_key)?;
    Ok(Envelope { encrypted_session_key, encrypted_message })
}

/// Sign `data` for `to` and seal it under a caller-supplied session key.
pub fn seal_with_key(me: &Identity, to: &PublicKey, data: impl Into<Bytes>, key: &SessionKey) -> Result<Envelope, EnvelopeError> {
    let message = sign(me, to, data);
    seal_signed(to, &message, key)
}

/// Sign `data` for `to` and seal it under a fresh one-time session key.
pub fn seal(me: &Identity, to: &PublicKey, data: impl Into<Bytes>) -> Result<Envelope, EnvelopeError> {
    seal_with_key(me, to, data, &SessionKey::generate())
}

/// Unwrap, decrypt and verify an envelope addressed to `me`.
pub fn open(me: &Identity, envelope: &Envelope) -> Result<Opened, EnvelopeError> {
    let session_key = unwrap_session_key(me, &envelope.encrypted_session_key)?;
    let plaintext = session_key.decrypt(&envelope.encrypted_message, &envelope.encrypted_session_key)?;
    let proto = SignedMessageV1::decode(plaintext.as_slice()).map_err(|_| EnvelopeError::DecryptionFailed)?;
    let message = SignedMessage::from_proto(proto)?;
    verify(me, &message)?;
    Ok(Opened { session_key, message })
}
