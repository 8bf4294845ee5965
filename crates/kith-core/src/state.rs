//! Immutable client state snapshots and the reducers that derive new ones.
//!
//! Contacts live in an arena keyed by [`ContactId`]; the public key is a
//! mutable attribute resolved through a secondary index, so rotating a key
//! keeps the contact's position and its conversation history. Every reducer
//! borrows the current snapshot and returns a new one that shares all
//! untouched maps and logs with it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;

use kith_crypto::{Identity, PublicKey};

use crate::errors::StateError;

/// Stable internal handle for a contact. Ids are never reused, so ordering by
/// id is insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContactId(u64);

impl ContactId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub id: ContactId,
    pub name: String,
    pub public_key: PublicKey,
}

/// Outgoing and incoming payloads exchanged with one contact.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversationLog {
    send_log: Vec<Bytes>,
    send_cursor: usize,
    receive_log: Vec<Bytes>,
}

impl ConversationLog {
    pub fn send_log(&self) -> &[Bytes] {
        &self.send_log
    }

    /// Number of leading send-log items already handed to a transport.
    pub fn send_cursor(&self) -> usize {
        self.send_cursor
    }

    pub fn receive_log(&self) -> &[Bytes] {
        &self.receive_log
    }

    /// Items still awaiting delivery, in send order.
    pub fn pending(&self) -> &[Bytes] {
        &self.send_log[self.send_cursor..]
    }
}

/// Snapshot of identity, contacts and conversation logs.
#[derive(Clone, Debug)]
pub struct ClientState {
    identity: Arc<Identity>,
    contacts: Arc<BTreeMap<ContactId, Contact>>,
    key_index: Arc<HashMap<PublicKey, ContactId>>,
    logs: Arc<HashMap<ContactId, Arc<ConversationLog>>>,
    next_id: u64,
}

impl PartialEq for ClientState {
    fn eq(&self, other: &Self) -> bool {
        self.identity.public_key() == other.identity.public_key()
            && self.next_id == other.next_id
            && self.contacts == other.contacts
            && self.key_index == other.key_index
            && self.logs == other.logs
    }
}

impl ClientState {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            contacts: Arc::default(),
            key_index: Arc::default(),
            logs: Arc::default(),
            next_id: 1,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    /// Contacts in insertion order.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn contact(&self, key: &PublicKey) -> Option<&Contact> {
        self.key_index.get(key).and_then(|id| self.contacts.get(id))
    }

    pub fn contact_by_id(&self, id: ContactId) -> Option<&Contact> {
        self.contacts.get(&id)
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.key_index.contains_key(key)
    }

    /// Conversation with `key`. `None` until the first message is recorded.
    pub fn log(&self, key: &PublicKey) -> Option<&ConversationLog> {
        self.key_index
            .get(key)
            .and_then(|id| self.logs.get(id))
            .map(|log| log.as_ref())
    }

    fn id_of(&self, key: &PublicKey) -> Result<ContactId, StateError> {
        self.key_index.get(key).copied().ok_or(StateError::UnknownContact(*key))
    }

    // ------------------------------------------------------------------------
    // Reducers
    // ------------------------------------------------------------------------

    pub fn add_contact(&self, name: impl Into<String>, key: PublicKey) -> Result<Self, StateError> {
        if self.key_index.contains_key(&key) {
            return Err(StateError::DuplicateContact(key));
        }
        let id = ContactId(self.next_id);

        let mut contacts = (*self.contacts).clone();
        contacts.insert(id, Contact { id, name: name.into(), public_key: key });
        let mut key_index = (*self.key_index).clone();
        key_index.insert(key, id);

        Ok(Self {
            identity: self.identity.clone(),
            contacts: Arc::new(contacts),
            key_index: Arc::new(key_index),
            logs: self.logs.clone(),
            next_id: self.next_id + 1,
        })
    }

    /// Remove the contact and its log together. Missing contacts are a no-op.
    pub fn delete_contact(&self, key: &PublicKey) -> Self {
        let Some(id) = self.key_index.get(key).copied() else {
            return self.clone();
        };

        let mut contacts = (*self.contacts).clone();
        contacts.remove(&id);
        let mut key_index = (*self.key_index).clone();
        key_index.remove(key);
        let logs = if self.logs.contains_key(&id) {
            let mut logs = (*self.logs).clone();
            logs.remove(&id);
            Arc::new(logs)
        } else {
            self.logs.clone()
        };

        Self {
            identity: self.identity.clone(),
            contacts: Arc::new(contacts),
            key_index: Arc::new(key_index),
            logs,
            next_id: self.next_id,
        }
    }

    /// Move a contact to a new key, keeping its name, position and log.
    pub fn rotate_key(&self, old: &PublicKey, new: PublicKey) -> Result<Self, StateError> {
        let id = self.id_of(old)?;
        if *old == new {
            return Ok(self.clone());
        }
        if self.key_index.contains_key(&new) {
            return Err(StateError::DuplicateContact(new));
        }

        let mut contacts = (*self.contacts).clone();
        if let Some(contact) = contacts.get_mut(&id) {
            contact.public_key = new;
        }
        let mut key_index = (*self.key_index).clone();
        key_index.remove(old);
        key_index.insert(new, id);

        Ok(Self {
            identity: self.identity.clone(),
            contacts: Arc::new(contacts),
            key_index: Arc::new(key_index),
            logs: self.logs.clone(),
            next_id: self.next_id,
        })
    }

    pub fn record_outgoing(&self, to: &PublicKey, payload: Bytes) -> Result<Self, StateError> {
        let id = self.id_of(to)?;
        Ok(self.with_log(id, |log| log.send_log.push(payload)))
    }

    /// Unknown senders are rejected; accepting a stranger means adding them
    /// as a contact first.
    pub fn record_incoming(&self, from: &PublicKey, payload: Bytes) -> Result<Self, StateError> {
        let id = self.id_of(from)?;
        Ok(self.with_log(id, |log| log.receive_log.push(payload)))
    }

    pub fn advance_send_cursor(&self, to: &PublicKey, cursor: usize) -> Result<Self, StateError> {
        let id = self.id_of(to)?;
        let (current, len) = self
            .logs
            .get(&id)
            .map(|log| (log.send_cursor, log.send_log.len()))
            .unwrap_or((0, 0));
        if cursor < current || cursor > len {
            return Err(StateError::InvalidCursor { requested: cursor, current, len });
        }
        if cursor == current {
            return Ok(self.clone());
        }
        Ok(self.with_log(id, |log| log.send_cursor = cursor))
    }

    /// Copy of `self` with only `id`'s log rebuilt.
    fn with_log(&self, id: ContactId, edit: impl FnOnce(&mut ConversationLog)) -> Self {
        let mut log = self.logs.get(&id).map(|l| (**l).clone()).unwrap_or_default();
        edit(&mut log);
        let mut logs = (*self.logs).clone();
        logs.insert(id, Arc::new(log));

        Self {
            identity: self.identity.clone(),
            contacts: self.contacts.clone(),
            key_index: self.key_index.clone(),
            logs: Arc::new(logs),
            next_id: self.next_id,
        }
    }
}
