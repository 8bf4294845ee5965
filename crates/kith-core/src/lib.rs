//! Kith Core - client logic for contact-based encrypted messaging.
//!
//! This crate implements:
//! - Immutable client state and its reducers (contacts, conversation logs)
//! - The client store with serialized dispatch and subscriptions
//! - The per-contact connection state machine and its driver
//! - Sealed signaling and message packets
//! - Contact invites and the messenger facade

#![forbid(unsafe_code)]

// State
pub mod state;
pub mod reducer;
pub mod store;

// Connections
pub mod connection;
pub mod signaling;
pub mod manager;

// Facade
pub mod client;
pub mod invite;

// Supporting modules
pub mod config;
pub mod errors;
pub mod harness;

pub use client::Messenger;
pub use config::ClientConfig;
pub use connection::{AttemptId, ConnectionRecord, ConnectionRole, ConnectionStage, ConnectionTable};
pub use errors::{ConnectionError, CoreError, StateError};
pub use invite::ContactInvite;
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionOutcome};
pub use reducer::Action;
pub use state::{ClientState, Contact, ContactId, ConversationLog};
pub use store::{ClientStore, Subscription};
