//! Self-signed contact invites for first-contact exchange.
//!
//! An invite carries a display name and a public key, signed by the key it
//! names. It is shared out of band as URL-safe base64 text. A valid invite
//! proves the holder of the key chose that name for it; whether to trust the
//! key is still the user's decision.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use prost::Message;
use thiserror::Error;

use kith_crypto::transcript::{domains, tags, Transcript};
use kith_crypto::{Identity, PublicKey};
use kith_proto::v1::ContactInviteV1;
use kith_proto::validation::MAX_NAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InviteError {
    #[error("invite is not valid base64: {0}")]
    Encoding(String),
    #[error("malformed invite: {0}")]
    Malformed(String),
    #[error("invite signature does not match its key")]
    InvalidSignature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactInvite {
    pub name: String,
    pub public_key: PublicKey,
    signature: [u8; 64],
}

fn signing_hash(name: &str, key: &PublicKey) -> [u8; 32] {
    let mut t = Transcript::new(domains::CONTACT_INVITE);
    key.append_to(&mut t);
    t.append_str(tags::NAME, name);
    t.finalize()
}

impl ContactInvite {
    pub fn create(identity: &Identity, name: impl Into<String>) -> Result<Self, InviteError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(InviteError::Malformed(format!("name must be 1..={} bytes", MAX_NAME_LEN)));
        }
        let public_key = *identity.public_key();
        let signature = identity.sign(&signing_hash(&name, &public_key));
        Ok(Self { name, public_key, signature })
    }

    pub fn encode(&self) -> String {
        let proto = ContactInviteV1 {
            name: self.name.clone(),
            public_key: Some((&self.public_key).into()),
            signature: self.signature.to_vec(),
        };
        URL_SAFE_NO_PAD.encode(proto.encode_to_vec())
    }

    /// Parse and verify an encoded invite.
    pub fn decode(text: &str) -> Result<Self, InviteError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| InviteError::Encoding(e.to_string()))?;
        let proto = ContactInviteV1::decode(bytes.as_slice()).map_err(|e| InviteError::Malformed(e.to_string()))?;
        proto.validate().map_err(|e| InviteError::Malformed(e.to_string()))?;

        let public_key = proto
            .public_key
            .as_ref()
            .ok_or_else(|| InviteError::Malformed("missing public key".into()))
            .and_then(|k| PublicKey::try_from(k).map_err(|e| InviteError::Malformed(e.to_string())))?;
        let signature: [u8; 64] = proto
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| InviteError::Malformed("signature length".into()))?;

        public_key
            .verify(&signing_hash(&proto.name, &public_key), &signature)
            .map_err(|_| InviteError::InvalidSignature)?;

        Ok(Self { name: proto.name, public_key, signature })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let alice = Identity::generate();
        let invite = ContactInvite::create(&alice, "alice").unwrap();
        let text = invite.encode();
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        let decoded = ContactInvite::decode(&text).unwrap();
        assert_eq!(decoded, invite);
        assert_eq!(decoded.public_key, *alice.public_key());
    }

    #[test]
    fn renamed_invite_fails_verification() {
        let alice = Identity::generate();
        let invite = ContactInvite::create(&alice, "alice").unwrap();
        let forged = ContactInvite { name: "bank".into(), ..invite };
        assert_eq!(ContactInvite::decode(&forged.encode()), Err(InviteError::InvalidSignature));
    }

    #[test]
    fn invite_signed_by_another_key_fails() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let mut invite = ContactInvite::create(&mallory, "alice").unwrap();
        invite.public_key = *alice.public_key();
        assert_eq!(ContactInvite::decode(&invite.encode()), Err(InviteError::InvalidSignature));
    }

    #[test]
    fn rejects_junk() {
        assert!(matches!(ContactInvite::decode("not base64!"), Err(InviteError::Encoding(_))));
        assert!(matches!(ContactInvite::decode("AAAA"), Err(InviteError::Malformed(_))));
    }

    #[test]
    fn name_length_is_bounded() {
        let alice = Identity::generate();
        assert!(ContactInvite::create(&alice, "").is_err());
        assert!(ContactInvite::create(&alice, "x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
