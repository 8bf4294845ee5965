//! Test harness for Kith core.
//!
//! Helpers that run several messengers against the in-memory relay and
//! transport, used by the integration tests and the demo binary.

use std::sync::Arc;

use anyhow::{ensure, Context};

use kith_crypto::Identity;
use kith_transport::testing::{MemoryRelay, MemoryTransportFactory};

use crate::client::Messenger;
use crate::config::ClientConfig;
use crate::errors::CoreError;
use crate::manager::ConnectionOutcome;

/// Upper bound on pump rounds before giving up on quiescence.
const MAX_PUMP_ROUNDS: usize = 256;

/// Shared in-memory relay and transport switchboard.
#[derive(Clone, Default)]
pub struct Network {
    pub relay: MemoryRelay,
    pub transports: MemoryTransportFactory,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messenger for a fresh identity, connected to this network's relay.
    pub async fn join(&self, config: ClientConfig) -> Result<Messenger, CoreError> {
        Messenger::connect(Identity::generate(), &self.relay, Arc::new(self.transports.clone()), config).await
    }
}

/// Exchange invites so each messenger has the other as a contact.
pub fn introduce(a: &Messenger, a_name: &str, b: &Messenger, b_name: &str) -> Result<(), CoreError> {
    b.accept_invite(&a.invite(a_name)?.encode())?;
    a.accept_invite(&b.invite(b_name)?.encode())?;
    Ok(())
}

/// Process queued callbacks on every messenger until none has work left.
pub async fn pump(peers: &mut [&mut Messenger]) -> Result<Vec<ConnectionOutcome>, CoreError> {
    let mut all = Vec::new();
    for _ in 0..MAX_PUMP_ROUNDS {
        let mut progressed = false;
        for messenger in peers.iter_mut() {
            let outcomes = messenger.process_pending_events().await?;
            progressed |= !outcomes.is_empty();
            all.extend(outcomes);
        }
        if !progressed {
            break;
        }
    }
    Ok(all)
}

/// Alice and Bob meet through invites, Alice says "hi", Bob reads it.
pub async fn run_hello_exchange(config: ClientConfig) -> anyhow::Result<()> {
    let network = Network::new();
    let mut alice = network.join(config.clone()).await.context("alice joins")?;
    let mut bob = network.join(config).await.context("bob joins")?;
    introduce(&alice, "alice", &bob, "bob")?;

    let bob_key = *bob.public_key();
    let alice_key = *alice.public_key();
    alice.send(&bob_key, &b"hi"[..]).await?;
    pump(&mut [&mut alice, &mut bob]).await?;

    let state = bob.state();
    let log = state.log(&alice_key).context("bob has no log for alice")?;
    ensure!(log.receive_log() == [bytes::Bytes::from_static(b"hi")], "bob did not receive hi");
    ensure!(
        alice.state().log(&bob_key).map(|l| l.pending().is_empty()) == Some(true),
        "alice still has undelivered items"
    );
    Ok(())
}
