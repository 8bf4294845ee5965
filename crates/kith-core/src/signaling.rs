//! Packets exchanged between two clients, sealed in envelopes.
//!
//! Both transport offers (over the relay) and conversation payloads (over the
//! direct channel, or the relay when falling back) travel as a `PacketV1`
//! inside an envelope addressed to the peer. The relay only ever sees
//! envelope bytes.

use bytes::Bytes;
use prost::Message;

use kith_crypto::{open, seal, Envelope, Identity, PublicKey};
use kith_proto::v1::{packet_v1, PacketV1, SignalRoleV1, SignalV1};

use crate::connection::{AttemptId, ConnectionRole};
use crate::errors::{ConnectionError, CoreError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// Transport offer produced while negotiating `attempt`.
    Signal { attempt: AttemptId, role: ConnectionRole, payload: Bytes },
    /// Conversation payload.
    Message(Bytes),
}

impl Packet {
    fn to_proto(&self) -> PacketV1 {
        let body = match self {
            Packet::Signal { attempt, role, payload } => packet_v1::Body::Signal(SignalV1 {
                attempt_id: attempt.get(),
                sender_role: match role {
                    ConnectionRole::Initiator => SignalRoleV1::Initiator,
                    ConnectionRole::Responder => SignalRoleV1::Responder,
                } as i32,
                payload: payload.to_vec(),
            }),
            Packet::Message(data) => packet_v1::Body::Message(data.to_vec()),
        };
        PacketV1 { body: Some(body) }
    }

    fn from_proto(proto: PacketV1) -> Result<Self, ConnectionError> {
        match proto.body {
            Some(packet_v1::Body::Signal(signal)) => {
                signal.validate().map_err(|e| ConnectionError::MalformedPacket(e.to_string()))?;
                let role = match SignalRoleV1::try_from(signal.sender_role) {
                    Ok(SignalRoleV1::Initiator) => ConnectionRole::Initiator,
                    Ok(SignalRoleV1::Responder) => ConnectionRole::Responder,
                    _ => return Err(ConnectionError::MalformedPacket("unknown signal role".into())),
                };
                let attempt = AttemptId::new(signal.attempt_id)
                    .ok_or_else(|| ConnectionError::MalformedPacket("zero attempt id".into()))?;
                Ok(Packet::Signal { attempt, role, payload: Bytes::from(signal.payload) })
            }
            Some(packet_v1::Body::Message(data)) => Ok(Packet::Message(Bytes::from(data))),
            None => Err(ConnectionError::MalformedPacket("empty packet".into())),
        }
    }
}

/// Seal `packet` for `to`, returning encoded envelope bytes.
pub fn seal_packet(me: &Identity, to: &PublicKey, packet: &Packet) -> Result<Bytes, CoreError> {
    let envelope = seal(me, to, packet.to_proto().encode_to_vec())?;
    Ok(envelope.encode())
}

/// Open envelope bytes addressed to `me`, returning the verified sender and
/// the packet. Whether the sender is trusted is left to the caller.
pub fn open_packet(me: &Identity, bytes: &[u8]) -> Result<(PublicKey, Packet), CoreError> {
    let envelope = Envelope::decode(bytes)?;
    let opened = open(me, &envelope)?;
    let proto = PacketV1::decode(opened.message.data.as_ref())
        .map_err(|e| ConnectionError::MalformedPacket(e.to_string()))?;
    Ok((opened.message.from, Packet::from_proto(proto)?))
}
