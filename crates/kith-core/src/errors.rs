//! Error types for Kith core.
//!
//! Each module boundary has its own enum; [`CoreError`] is what the messenger
//! surfaces to callers.

use thiserror::Error;

use kith_crypto::{EnvelopeError, PublicKey};
use kith_transport::TransportError;

use crate::config::ConfigError;
use crate::connection::ConnectionStage;
use crate::invite::InviteError;

// ============================================================================
// State store
// ============================================================================

/// Reducer rejections. The state before the rejected call is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("contact already exists: {0}")]
    DuplicateContact(PublicKey),

    #[error("unknown contact: {0}")]
    UnknownContact(PublicKey),

    #[error("invalid send cursor {requested} (current {current}, send log length {len})")]
    InvalidCursor { requested: usize, current: usize, len: usize },

    #[error("dispatch called from inside a state listener")]
    ReentrantDispatch,
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("cannot {action} connection to {peer} in stage {stage}")]
    InvalidTransition {
        peer: PublicKey,
        stage: ConnectionStage,
        action: &'static str,
    },

    #[error("relay unavailable")]
    RelayUnavailable,

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

// ============================================================================
// Umbrella
// ============================================================================

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Invite(#[from] InviteError),

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        CoreError::Connection(ConnectionError::Transport(e))
    }
}

impl CoreError {
    /// Whether the caller can simply correct its input and try again.
    ///
    /// Envelope failures are fatal to the message that produced them and
    /// must not be retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CoreError::State(_) => true,
            CoreError::Envelope(_) => false,
            CoreError::Connection(ConnectionError::MalformedPacket(_)) => false,
            CoreError::Connection(_) => true,
            CoreError::Config(_) => false,
            CoreError::Invite(_) => false,
            CoreError::PayloadTooLarge { .. } => true,
        }
    }
}
