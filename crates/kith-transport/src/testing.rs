//! In-memory relay and transport for tests and the demo.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use kith_crypto::PublicKey;

use crate::traits::*;

// ============================================================================
// Relay
// ============================================================================

struct RelaySlot {
    session: u64,
    sink: RelayEventSink,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct RelayHub {
    clients: DashMap<PublicKey, RelaySlot>,
    /// Payloads for recipients that are not connected, delivered on connect.
    mailboxes: DashMap<PublicKey, VecDeque<Bytes>>,
    next_session: AtomicU64,
    forwarded: AtomicU64,
}

/// Relay hub shared by every client in a test.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<RelayHub>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `key`'s connection as if the network failed.
    pub fn disconnect(&self, key: &PublicKey) {
        if let Some((_, slot)) = self.hub.clients.remove(key) {
            slot.connected.store(false, Ordering::SeqCst);
            (slot.sink)(RelayEvent::Disconnected);
        }
    }

    pub fn is_online(&self, key: &PublicKey) -> bool {
        self.hub.clients.contains_key(key)
    }

    /// Number of payloads handed to a live recipient so far.
    pub fn forwarded(&self) -> u64 {
        self.hub.forwarded.load(Ordering::Relaxed)
    }

    pub fn queued_for(&self, key: &PublicKey) -> usize {
        self.hub.mailboxes.get(key).map(|m| m.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn connect(
        &self,
        credentials: RelayCredentials,
        events: RelayEventSink,
    ) -> Result<Arc<dyn RelayConnection>, TransportError> {
        credentials.verify()?;
        let key = credentials.public_key;
        let session = self.hub.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let connected = Arc::new(AtomicBool::new(true));

        let previous = self.hub.clients.insert(
            key,
            RelaySlot { session, sink: events.clone(), connected: connected.clone() },
        );
        if let Some(old) = previous {
            old.connected.store(false, Ordering::SeqCst);
            (old.sink)(RelayEvent::Disconnected);
        }

        if let Some((_, queued)) = self.hub.mailboxes.remove(&key) {
            debug!(peer = %key, count = queued.len(), "delivering queued relay payloads");
            for payload in queued {
                events(RelayEvent::Message(payload));
            }
        }

        Ok(Arc::new(MemoryRelayConnection { key, session, connected, hub: self.hub.clone() }))
    }
}

struct MemoryRelayConnection {
    key: PublicKey,
    session: u64,
    connected: Arc<AtomicBool>,
    hub: Arc<RelayHub>,
}

#[async_trait]
impl RelayConnection for MemoryRelayConnection {
    async fn send(&self, to: &PublicKey, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let sink = self.hub.clients.get(to).map(|slot| slot.sink.clone());
        match sink {
            Some(sink) => {
                self.hub.forwarded.fetch_add(1, Ordering::Relaxed);
                sink(RelayEvent::Message(payload));
            }
            None => self.hub.mailboxes.entry(*to).or_default().push_back(payload),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.hub.clients.remove_if(&self.key, |_, slot| slot.session == self.session);
    }
}

// ============================================================================
// Transport
// ============================================================================

struct Endpoint {
    sink: TransportEventSink,
    peer: Mutex<Option<u64>>,
}

#[derive(Default)]
struct Switchboard {
    endpoints: DashMap<u64, Arc<Endpoint>>,
    next_id: AtomicU64,
    unreachable: AtomicBool,
}

impl Switchboard {
    fn link(&self, a: u64, b: u64) -> Result<(Arc<Endpoint>, Arc<Endpoint>), TransportError> {
        let ea = self.endpoints.get(&a).map(|e| e.clone()).ok_or(TransportError::Disconnected)?;
        let eb = self.endpoints.get(&b).map(|e| e.clone()).ok_or(TransportError::Unreachable)?;
        *ea.peer.lock() = Some(b);
        *eb.peer.lock() = Some(a);
        Ok((ea, eb))
    }
}

/// Builds transports that connect through a shared in-process switchboard.
/// An offer is the 8-byte big-endian id of the offering endpoint.
#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    board: Arc<Switchboard>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every `receive_offer` fails with `Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.board.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Tear down every live channel; both ends observe `Closed`.
    pub fn sever_all(&self) {
        let endpoints: Vec<Arc<Endpoint>> = self.board.endpoints.iter().map(|e| e.value().clone()).collect();
        self.board.endpoints.clear();
        for endpoint in endpoints {
            if endpoint.peer.lock().take().is_some() {
                (endpoint.sink)(TransportEvent::Closed);
            }
        }
    }

    pub fn live_endpoints(&self) -> usize {
        self.board.endpoints.len()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(
        &self,
        peer: &PublicKey,
        role: TransportRole,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let id = self.board.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.board
            .endpoints
            .insert(id, Arc::new(Endpoint { sink: events.clone(), peer: Mutex::new(None) }));
        debug!(peer = %peer, endpoint = id, ?role, "memory transport created");

        if role == TransportRole::Initiator {
            events(TransportEvent::Offer(Bytes::copy_from_slice(&id.to_be_bytes())));
        }
        Ok(Box::new(MemoryTransport { id, role, board: self.board.clone() }))
    }
}

struct MemoryTransport {
    id: u64,
    role: TransportRole,
    board: Arc<Switchboard>,
}

fn parse_offer(payload: &[u8]) -> Result<u64, TransportError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| TransportError::InvalidOffer(format!("expected 8 bytes, got {}", payload.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn role(&self) -> TransportRole {
        self.role
    }

    async fn receive_offer(&self, payload: Bytes) -> Result<(), TransportError> {
        let remote = parse_offer(&payload)?;
        if self.board.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable);
        }
        let me = self.board.endpoints.get(&self.id).map(|e| e.clone()).ok_or(TransportError::Disconnected)?;
        if *me.peer.lock() == Some(remote) {
            return Ok(());
        }

        let (local, peer) = self.board.link(self.id, remote)?;
        if self.role == TransportRole::Responder {
            (local.sink)(TransportEvent::Offer(Bytes::copy_from_slice(&self.id.to_be_bytes())));
        }
        (local.sink)(TransportEvent::Connected);
        (peer.sink)(TransportEvent::Connected);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let me = self.board.endpoints.get(&self.id).map(|e| e.clone()).ok_or(TransportError::Disconnected)?;
        let peer_id = (*me.peer.lock()).ok_or(TransportError::NotConnected)?;
        let peer = self.board.endpoints.get(&peer_id).map(|e| e.clone()).ok_or(TransportError::Disconnected)?;
        (peer.sink)(TransportEvent::Data(payload));
        Ok(())
    }

    async fn close(&self) {
        let Some((_, me)) = self.board.endpoints.remove(&self.id) else {
            return;
        };
        let peer_id = me.peer.lock().take();
        if let Some(peer) = peer_id.and_then(|p| self.board.endpoints.get(&p).map(|e| e.clone())) {
            *peer.peer.lock() = None;
            (peer.sink)(TransportEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kith_crypto::Identity;

    fn collector<T: Send + 'static>() -> (Arc<dyn Fn(T) + Send + Sync>, Arc<Mutex<Vec<T>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        (Arc::new(move |e| sink_seen.lock().push(e)), seen)
    }

    #[tokio::test]
    async fn relay_forwards_and_queues() {
        let relay = MemoryRelay::new();
        let alice = Identity::generate();
        let bob = Identity::generate();

        let (alice_sink, _) = collector();
        let alice_conn = relay.connect(RelayCredentials::for_identity(&alice), alice_sink).await.unwrap();

        alice_conn.send(bob.public_key(), Bytes::from_static(b"early")).await.unwrap();
        assert_eq!(relay.queued_for(bob.public_key()), 1);

        let (bob_sink, bob_seen) = collector();
        let _bob_conn = relay.connect(RelayCredentials::for_identity(&bob), bob_sink).await.unwrap();
        alice_conn.send(bob.public_key(), Bytes::from_static(b"live")).await.unwrap();

        assert_eq!(
            *bob_seen.lock(),
            vec![
                RelayEvent::Message(Bytes::from_static(b"early")),
                RelayEvent::Message(Bytes::from_static(b"live")),
            ]
        );
        assert_eq!(relay.forwarded(), 1);
    }

    #[tokio::test]
    async fn relay_rejects_forged_credentials() {
        let relay = MemoryRelay::new();
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let forged = RelayCredentials {
            public_key: *alice.public_key(),
            signature: mallory.ownership_proof(),
        };
        let (sink, _) = collector();
        assert_eq!(relay.connect(forged, sink).await.err(), Some(TransportError::Unauthorized));
    }

    #[tokio::test]
    async fn relay_disconnect_notifies_and_blocks_send() {
        let relay = MemoryRelay::new();
        let alice = Identity::generate();
        let (sink, seen) = collector();
        let conn = relay.connect(RelayCredentials::for_identity(&alice), sink).await.unwrap();

        relay.disconnect(alice.public_key());
        assert_eq!(*seen.lock(), vec![RelayEvent::Disconnected]);
        assert!(!conn.is_connected());
        assert_eq!(
            conn.send(alice.public_key(), Bytes::new()).await,
            Err(TransportError::Disconnected)
        );
    }

    #[tokio::test]
    async fn transports_negotiate_and_exchange_data() {
        let factory = MemoryTransportFactory::new();
        let a_key = *Identity::generate().public_key();
        let b_key = *Identity::generate().public_key();

        let (a_sink, a_seen) = collector();
        let a = factory.create(&b_key, TransportRole::Initiator, a_sink).unwrap();
        let offer = match a_seen.lock().first().cloned() {
            Some(TransportEvent::Offer(o)) => o,
            other => panic!("expected offer, got {:?}", other),
        };

        let (b_sink, b_seen) = collector();
        let b = factory.create(&a_key, TransportRole::Responder, b_sink).unwrap();
        b.receive_offer(offer).await.unwrap();

        let answer = match b_seen.lock().first().cloned() {
            Some(TransportEvent::Offer(o)) => o,
            other => panic!("expected answer, got {:?}", other),
        };
        a.receive_offer(answer).await.unwrap();

        assert!(a_seen.lock().contains(&TransportEvent::Connected));
        assert!(b_seen.lock().contains(&TransportEvent::Connected));

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b_seen.lock().last(), Some(&TransportEvent::Data(Bytes::from_static(b"ping"))));

        a.close().await;
        assert_eq!(b_seen.lock().last(), Some(&TransportEvent::Closed));
        assert_eq!(b.send(Bytes::from_static(b"x")).await, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn malformed_and_unreachable_offers_fail() {
        let factory = MemoryTransportFactory::new();
        let key = *Identity::generate().public_key();
        let (sink, _) = collector();
        let t = factory.create(&key, TransportRole::Responder, sink).unwrap();

        assert!(matches!(t.receive_offer(Bytes::from_static(b"abc")).await, Err(TransportError::InvalidOffer(_))));
        assert_eq!(t.receive_offer(Bytes::copy_from_slice(&999u64.to_be_bytes())).await, Err(TransportError::Unreachable));

        factory.set_unreachable(true);
        assert_eq!(t.receive_offer(Bytes::copy_from_slice(&1u64.to_be_bytes())).await, Err(TransportError::Unreachable));
    }
}
