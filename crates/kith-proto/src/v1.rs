//! Version 1 of the Kith wire format.

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Public half of an identity: Ed25519 verifying key and X25519 key.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct PublicKeyV1 {
    #[prost(bytes = "vec", tag = "1")]
    pub sign_pub: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub kex_pub: Vec<u8>,
}

/// Plaintext structure sealed inside an envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedMessageV1 {
    #[prost(message, optional, tag = "1")]
    pub from: Option<PublicKeyV1>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    /// Ed25519 signature over the recipient-bound message hash.
    #[prost(bytes = "vec", tag = "3")]
    pub signed_hash: Vec<u8>,
}

/// The only artifact placed on the wire for a message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvelopeV1 {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Ephemeral X25519 public key followed by the AEAD-wrapped session key.
    #[prost(bytes = "vec", tag = "2")]
    pub encrypted_session_key: Vec<u8>,
    /// Nonce followed by the AEAD ciphertext of an encoded `SignedMessageV1`.
    #[prost(bytes = "vec", tag = "3")]
    pub encrypted_message: Vec<u8>,
}

/// Role of the side that produced a signaling payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SignalRoleV1 {
    Unspecified = 0,
    Initiator = 1,
    Responder = 2,
}

/// Transport offer exchanged over the relay while a connection is negotiated.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalV1 {
    /// Attempt id of the initiator's negotiation. Responders echo it back.
    #[prost(uint64, tag = "1")]
    pub attempt_id: u64,
    #[prost(enumeration = "SignalRoleV1", tag = "2")]
    pub sender_role: i32,
    /// Opaque transport address.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Body of every sealed envelope exchanged between two clients.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PacketV1 {
    #[prost(oneof = "packet_v1::Body", tags = "1, 2")]
    pub body: Option<packet_v1::Body>,
}

pub mod packet_v1 {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Signal(super::SignalV1),
        #[prost(bytes, tag = "2")]
        Message(Vec<u8>),
    }
}

/// Self-signed first-contact card shared out of band.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContactInviteV1 {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub public_key: Option<PublicKeyV1>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
}
