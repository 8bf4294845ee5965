#![forbid(unsafe_code)]

pub mod hash;
pub mod transcript;
pub mod identity;
pub mod session_key;
pub mod envelope;

pub use envelope::{open, seal, seal_signed, seal_with_key, sign, verify, Envelope, EnvelopeError, Opened, SignedMessage};
pub use identity::{Identity, IdentityError, PublicKey};
pub use session_key::SessionKey;

#[cfg(test)]
mod proptests;
