//! Relay and transport traits.
//!
//! Callback registration (`onDisconnect`, `onOffer`, ...) is expressed as an
//! event sink handed over at construction time, so no event can fire before
//! its handler exists.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use kith_crypto::identity::verify_ownership_proof;
use kith_crypto::{Identity, PublicKey};

/// Proof that the connecting client owns `public_key`.
#[derive(Clone, Debug)]
pub struct RelayCredentials {
    pub public_key: PublicKey,
    pub signature: [u8; 64],
}

impl RelayCredentials {
    pub fn for_identity(identity: &Identity) -> Self {
        Self { public_key: *identity.public_key(), signature: identity.ownership_proof() }
    }

    pub fn verify(&self) -> Result<(), TransportError> {
        verify_ownership_proof(&self.public_key, &self.signature).map_err(|_| TransportError::Unauthorized)
    }
}

/// Notifications from a relay connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    /// Opaque payload addressed to this client.
    Message(Bytes),
    /// The relay connection dropped. No further events follow.
    Disconnected,
}

pub type RelayEventSink = Arc<dyn Fn(RelayEvent) + Send + Sync>;

/// Message broker that forwards payloads by recipient public key.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn connect(
        &self,
        credentials: RelayCredentials,
        events: RelayEventSink,
    ) -> Result<Arc<dyn RelayConnection>, TransportError>;
}

#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Hand `payload` to the relay for delivery to `to`.
    async fn send(&self, to: &PublicKey, payload: Bytes) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Leave the relay. Does not emit `Disconnected`.
    async fn close(&self);
}

/// Which side of a negotiation a transport plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportRole {
    Initiator,
    Responder,
}

/// Notifications from a peer transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Locally generated signaling payload to deliver to the peer.
    Offer(Bytes),
    /// The direct channel is live.
    Connected,
    /// Negotiation or the channel failed.
    Failed(String),
    /// Payload received from the peer.
    Data(Bytes),
    /// The peer closed the channel.
    Closed,
}

pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Creates one transport per negotiation attempt.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        peer: &PublicKey,
        role: TransportRole,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

/// Direct channel to one peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn role(&self) -> TransportRole;

    /// Feed a signaling payload produced by the remote transport.
    async fn receive_offer(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Send a payload over the live channel.
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Common transport error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Transport not connected yet")]
    NotConnected,

    #[error("Relay refused credentials")]
    Unauthorized,

    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    #[error("Peer unreachable")]
    Unreachable,

    #[error("Other error: {0}")]
    Other(String),
}
