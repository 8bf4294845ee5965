//! Structural validation for decoded wire messages.
//!
//! Decoding with `prost` only checks that bytes parse; these helpers check the
//! sizes and required fields the higher layers rely on.

use crate::v1::*;

/// Ed25519 and X25519 public keys are both 32 bytes.
pub const KEY_LEN: usize = 32;
/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;
/// Upper bound on a contact display name inside an invite.
pub const MAX_NAME_LEN: usize = 128;

/// Validation error types for protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Field has invalid size (expected, actual)
    InvalidSize { field: &'static str, expected: usize, actual: usize },
    /// Field size is out of allowed range
    SizeOutOfRange { field: &'static str, min: usize, max: usize, actual: usize },
    /// Required field is empty
    EmptyField { field: &'static str },
    /// Version not understood by this build
    UnsupportedVersion { field: &'static str, version: u32 },
    /// Field contains invalid data
    InvalidData { field: &'static str, reason: &'static str },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize { field, expected, actual } => {
                write!(f, "field '{}' has invalid size: expected {}, got {}", field, expected, actual)
            }
            Self::SizeOutOfRange { field, min, max, actual } => {
                write!(f, "field '{}' size {} is out of range [{}, {}]", field, actual, min, max)
            }
            Self::EmptyField { field } => write!(f, "required field '{}' is empty", field),
            Self::UnsupportedVersion { field, version } => {
                write!(f, "field '{}' carries unsupported version {}", field, version)
            }
            Self::InvalidData { field, reason } => {
                write!(f, "field '{}' contains invalid data: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

fn exact(field: &'static str, bytes: &[u8], expected: usize) -> Result<(), ValidationError> {
    if bytes.len() != expected {
        return Err(ValidationError::InvalidSize { field, expected, actual: bytes.len() });
    }
    Ok(())
}

impl PublicKeyV1 {
    pub fn validate(&self) -> Result<(), ValidationError> {
        exact("sign_pub", &self.sign_pub, KEY_LEN)?;
        exact("kex_pub", &self.kex_pub, KEY_LEN)
    }
}

impl SignedMessageV1 {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.from
            .as_ref()
            .ok_or(ValidationError::EmptyField { field: "from" })?
            .validate()?;
        exact("signed_hash", &self.signed_hash, SIGNATURE_LEN)
    }
}

impl EnvelopeV1 {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.version != ENVELOPE_VERSION {
            return Err(ValidationError::UnsupportedVersion { field: "version", version: self.version });
        }
        if self.encrypted_session_key.is_empty() {
            return Err(ValidationError::EmptyField { field: "encrypted_session_key" });
        }
        if self.encrypted_message.is_empty() {
            return Err(ValidationError::EmptyField { field: "encrypted_message" });
        }
        Ok(())
    }
}

impl SignalV1 {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match SignalRoleV1::try_from(self.sender_role) {
            Ok(SignalRoleV1::Initiator) | Ok(SignalRoleV1::Responder) => {}
            _ => {
                return Err(ValidationError::InvalidData {
                    field: "sender_role",
                    reason: "must be initiator or responder",
                })
            }
        }
        if self.attempt_id == 0 {
            return Err(ValidationError::InvalidData { field: "attempt_id", reason: "must be non-zero" });
        }
        if self.payload.is_empty() {
            return Err(ValidationError::EmptyField { field: "payload" });
        }
        Ok(())
    }
}

impl ContactInviteV1 {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(ValidationError::SizeOutOfRange {
                field: "name",
                min: 1,
                max: MAX_NAME_LEN,
                actual: self.name.len(),
            });
        }
        self.public_key
            .as_ref()
            .ok_or(ValidationError::EmptyField { field: "public_key" })?
            .validate()?;
        exact("signature", &self.signature, SIGNATURE_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PublicKeyV1 {
        PublicKeyV1 { sign_pub: vec![1; 32], kex_pub: vec![2; 32] }
    }

    #[test]
    fn public_key_sizes_are_checked() {
        assert!(key().validate().is_ok());

        let short = PublicKeyV1 { sign_pub: vec![1; 31], kex_pub: vec![2; 32] };
        assert_eq!(
            short.validate(),
            Err(ValidationError::InvalidSize { field: "sign_pub", expected: 32, actual: 31 })
        );
    }

    #[test]
    fn envelope_rejects_unknown_version() {
        let env = EnvelopeV1 {
            version: 7,
            encrypted_session_key: vec![0; 80],
            encrypted_message: vec![0; 40],
        };
        assert!(matches!(env.validate(), Err(ValidationError::UnsupportedVersion { version: 7, .. })));
    }

    #[test]
    fn signal_requires_role_and_attempt() {
        let mut signal = SignalV1 {
            attempt_id: 3,
            sender_role: SignalRoleV1::Initiator as i32,
            payload: b"addr".to_vec(),
        };
        assert!(signal.validate().is_ok());

        signal.sender_role = SignalRoleV1::Unspecified as i32;
        assert!(signal.validate().is_err());

        signal.sender_role = SignalRoleV1::Responder as i32;
        signal.attempt_id = 0;
        assert!(signal.validate().is_err());
    }

    #[test]
    fn invite_name_bounds() {
        let mut invite = ContactInviteV1 {
            name: "bob".into(),
            public_key: Some(key()),
            signature: vec![0; 64],
        };
        assert!(invite.validate().is_ok());

        invite.name = String::new();
        assert!(invite.validate().is_err());

        invite.name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(invite.validate().is_err());
    }
}
