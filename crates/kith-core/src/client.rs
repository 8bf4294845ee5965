//! Messenger: the client facade tying the store, envelopes and connections
//! together.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use kith_crypto::{Identity, PublicKey};
use kith_transport::{Relay, TransportFactory};

use crate::config::ClientConfig;
use crate::connection::ConnectionStage;
use crate::errors::CoreError;
use crate::invite::ContactInvite;
use crate::manager::{ConnectionManager, ConnectionOutcome};
use crate::reducer::Action;
use crate::state::ClientState;
use crate::store::{ClientStore, Subscription};

pub struct Messenger {
    identity: Arc<Identity>,
    store: ClientStore,
    manager: ConnectionManager,
    config: ClientConfig,
}

impl Messenger {
    /// Messenger with no relay attached yet.
    pub fn new(identity: Identity, factory: Arc<dyn TransportFactory>, config: ClientConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let identity = Arc::new(identity);
        let store = ClientStore::new(identity.clone());
        let manager = ConnectionManager::new(identity.clone(), store.clone(), factory, config.clone());
        Ok(Self { identity, store, manager, config })
    }

    pub async fn connect(
        identity: Identity,
        relay: &dyn Relay,
        factory: Arc<dyn TransportFactory>,
        config: ClientConfig,
    ) -> Result<Self, CoreError> {
        let mut messenger = Self::new(identity, factory, config)?;
        messenger.reconnect_relay(relay).await?;
        Ok(messenger)
    }

    /// Attach to `relay`, replacing a lost or old relay connection.
    pub async fn reconnect_relay(&mut self, relay: &dyn Relay) -> Result<(), CoreError> {
        self.manager.attach_relay(relay).await?;
        Ok(())
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    pub fn state(&self) -> Arc<ClientState> {
        self.store.state()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ClientState, &ClientState) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn relay_connected(&self) -> bool {
        self.manager.relay_connected()
    }

    // ------------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------------

    pub fn add_contact(&self, name: impl Into<String>, public_key: PublicKey) -> Result<(), CoreError> {
        let name = name.into();
        self.store.dispatch(Action::AddContact { name: name.clone(), public_key })?;
        info!(peer = %public_key, name = %name, "contact added");
        Ok(())
    }

    /// Remove the contact, its log and any connection to it.
    pub async fn delete_contact(&mut self, public_key: &PublicKey) -> Result<(), CoreError> {
        self.store.dispatch(Action::DeleteContact { public_key: *public_key })?;
        self.manager.forget(public_key).await;
        Ok(())
    }

    /// Re-key a contact. Its connection under the old key is torn down.
    pub async fn rotate_contact_key(&mut self, old: &PublicKey, new: PublicKey) -> Result<(), CoreError> {
        self.store.dispatch(Action::RotateKey { old: *old, new })?;
        if *old != new {
            self.manager.forget(old).await;
            info!(old = %old, new = %new, "contact key rotated");
        }
        Ok(())
    }

    /// Invite others to add this identity under `name`.
    pub fn invite(&self, name: impl Into<String>) -> Result<ContactInvite, CoreError> {
        Ok(ContactInvite::create(&self.identity, name)?)
    }

    /// Verify an encoded invite and add its key as a contact.
    pub fn accept_invite(&self, encoded: &str) -> Result<PublicKey, CoreError> {
        let invite = ContactInvite::decode(encoded)?;
        self.add_contact(invite.name, invite.public_key)?;
        Ok(invite.public_key)
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Record `payload` for `to` and push it toward delivery. Succeeds as
    /// soon as the item is in the send log.
    pub async fn send(&mut self, to: &PublicKey, payload: impl Into<Bytes>) -> Result<ConnectionOutcome, CoreError> {
        let payload = payload.into();
        if payload.len() > self.config.max_payload_bytes {
            return Err(CoreError::PayloadTooLarge { size: payload.len(), max: self.config.max_payload_bytes });
        }
        let len = payload.len();
        self.store.dispatch(Action::RecordOutgoing { to: *to, payload })?;
        debug!(peer = %to, bytes = len, "message recorded");
        self.manager.deliver(to).await
    }

    /// Wait for the next relay or transport callback and apply it.
    pub async fn process_next_event(&mut self) -> Option<Result<ConnectionOutcome, CoreError>> {
        let event = self.manager.next_event().await?;
        Some(self.manager.handle_event(event).await)
    }

    /// Apply every callback that is already queued.
    pub async fn process_pending_events(&mut self) -> Result<Vec<ConnectionOutcome>, CoreError> {
        let mut outcomes = Vec::new();
        while let Some(event) = self.manager.try_next_event() {
            outcomes.push(self.manager.handle_event(event).await?);
        }
        Ok(outcomes)
    }

    // ------------------------------------------------------------------------
    // Connection control
    // ------------------------------------------------------------------------

    pub fn connection_stage(&self, peer: &PublicKey) -> ConnectionStage {
        self.manager.stage(peer)
    }

    pub async fn retry(&mut self, peer: &PublicKey) -> Result<ConnectionOutcome, CoreError> {
        self.manager.retry(peer).await
    }

    pub async fn timeout(&mut self, peer: &PublicKey) -> Result<ConnectionOutcome, CoreError> {
        self.manager.timeout(peer).await
    }

    pub async fn cancel(&mut self, peer: &PublicKey) -> Result<(), CoreError> {
        self.manager.cancel(peer).await
    }

    pub async fn shutdown(mut self) {
        self.manager.shutdown().await;
        info!(me = %self.identity.public_key(), "messenger shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StateError;
    use kith_transport::testing::MemoryTransportFactory;

    fn messenger() -> Messenger {
        Messenger::new(Identity::generate(), Arc::new(MemoryTransportFactory::new()), ClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn send_to_unknown_contact_is_rejected() {
        let mut m = messenger();
        let stranger = *Identity::generate().public_key();
        let err = m.send(&stranger, &b"hi"[..]).await.unwrap_err();
        assert!(matches!(err, CoreError::State(StateError::UnknownContact(k)) if k == stranger));
        assert_eq!(m.connection_stage(&stranger), ConnectionStage::ShouldConnect);
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected_before_recording() {
        let mut m = messenger();
        let bob = *Identity::generate().public_key();
        m.add_contact("bob", bob).unwrap();
        let big = vec![0u8; ClientConfig::default().max_payload_bytes + 1];
        assert!(matches!(m.send(&bob, big).await, Err(CoreError::PayloadTooLarge { .. })));
        assert!(m.state().log(&bob).is_none());
    }

    #[tokio::test]
    async fn invites_add_contacts() {
        let alice = messenger();
        let bob = messenger();
        let invite = alice.invite("alice").unwrap().encode();

        assert_eq!(bob.accept_invite(&invite).unwrap(), *alice.public_key());
        assert_eq!(bob.state().contact(alice.public_key()).unwrap().name, "alice");
        assert!(matches!(bob.accept_invite(&invite), Err(CoreError::State(StateError::DuplicateContact(_)))));
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let config = ClientConfig { max_flush_batch: 0, ..Default::default() };
        assert!(matches!(
            Messenger::new(Identity::generate(), Arc::new(MemoryTransportFactory::new()), config),
            Err(CoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn rotate_and_delete() {
        let mut m = messenger();
        let (old, new) = (*Identity::generate().public_key(), *Identity::generate().public_key());
        m.add_contact("bob", old).unwrap();
        m.rotate_contact_key(&old, new).await.unwrap();
        assert!(m.state().contains(&new));
        m.delete_contact(&new).await.unwrap();
        assert_eq!(m.state().contact_count(), 0);
    }
}
