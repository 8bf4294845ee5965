//! Named state transitions dispatched through the client store.

use bytes::Bytes;

use kith_crypto::PublicKey;

use crate::errors::StateError;
use crate::state::ClientState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    AddContact { name: String, public_key: PublicKey },
    DeleteContact { public_key: PublicKey },
    RotateKey { old: PublicKey, new: PublicKey },
    RecordOutgoing { to: PublicKey, payload: Bytes },
    RecordIncoming { from: PublicKey, payload: Bytes },
    AdvanceSendCursor { to: PublicKey, cursor: usize },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::AddContact { .. } => "add_contact",
            Action::DeleteContact { .. } => "delete_contact",
            Action::RotateKey { .. } => "rotate_key",
            Action::RecordOutgoing { .. } => "record_outgoing",
            Action::RecordIncoming { .. } => "record_incoming",
            Action::AdvanceSendCursor { .. } => "advance_send_cursor",
        }
    }

    /// Contact the action is about.
    pub fn subject(&self) -> &PublicKey {
        match self {
            Action::AddContact { public_key, .. } | Action::DeleteContact { public_key } => public_key,
            Action::RotateKey { old, .. } => old,
            Action::RecordOutgoing { to, .. } | Action::AdvanceSendCursor { to, .. } => to,
            Action::RecordIncoming { from, .. } => from,
        }
    }
}

/// Apply `action` to `state`, producing the next snapshot.
pub fn reduce(state: &ClientState, action: &Action) -> Result<ClientState, StateError> {
    match action {
        Action::AddContact { name, public_key } => state.add_contact(name.clone(), *public_key),
        Action::DeleteContact { public_key } => Ok(state.delete_contact(public_key)),
        Action::RotateKey { old, new } => state.rotate_key(old, *new),
        Action::RecordOutgoing { to, payload } => state.record_outgoing(to, payload.clone()),
        Action::RecordIncoming { from, payload } => state.record_incoming(from, payload.clone()),
        Action::AdvanceSendCursor { to, cursor } => state.advance_send_cursor(to, *cursor),
    }
}
