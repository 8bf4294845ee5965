//! Transcript module for deterministic hashing.
//!
//! Every signed or derived value in Kith is computed over a transcript of
//! tagged, length-prefixed fields, so two different field sequences can never
//! produce the same bytes.

use bytes::{BufMut, BytesMut};

use crate::hash::sha256;

/// Tags used by Kith transcripts.
pub mod tags {
    pub const DOMAIN: u32 = 0;
    pub const SIGN_KEY: u32 = 1;
    pub const KEX_KEY: u32 = 2;
    pub const PAYLOAD: u32 = 3;
    pub const NAME: u32 = 4;
    pub const EPHEMERAL: u32 = 5;
}

/// Domain separators. Changing any of these breaks wire compatibility.
pub mod domains {
    pub const SIGNED_MESSAGE: &str = "kith_signed_msg_v1";
    pub const KEY_WRAP: &str = "kith_key_wrap_v1";
    pub const KEY_OWNERSHIP: &str = "kith_key_ownership_v1";
    pub const CONTACT_INVITE: &str = "kith_contact_invite_v1";
}

/// Appends (tag, len, bytes) tuples so the same logical data hashes the same everywhere.
#[derive(Clone, Debug)]
pub struct Transcript {
    buf: BytesMut,
}

impl Transcript {
    pub fn new(domain: &'static str) -> Self {
        let mut t = Self { buf: BytesMut::with_capacity(256) };
        t.append_bytes(tags::DOMAIN, domain.as_bytes());
        t
    }

    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        // tag (u32 be) + len (u32 be) + data
        self.buf.put_u32(tag);
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn append_str(&mut self, tag: u32, s: &str) -> &mut Self {
        self.append_bytes(tag, s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// SHA-256 of the transcript contents.
    pub fn finalize(&self) -> [u8; 32] {
        sha256(&self.buf)
    }
}
