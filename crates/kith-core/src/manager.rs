//! Connection manager: drives the connection table against the relay and
//! peer transports.
//!
//! Relay and transport callbacks are pushed onto an unbounded queue as
//! [`ConnectionEvent`]s and applied one at a time by [`ConnectionManager::handle_event`],
//! always against the current table and store snapshot. Transport callbacks
//! are tagged with the attempt they were created under; anything tagged with
//! an attempt that is no longer current is discarded.
//!
//! Delivery always resumes from the contact's send cursor, so items reach the
//! transport in send-log order across reconnects and are never skipped.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kith_crypto::{Identity, PublicKey};
use kith_transport::{
    PeerTransport, Relay, RelayConnection, RelayCredentials, RelayEvent, RelayEventSink, TransportError,
    TransportEvent, TransportEventSink, TransportFactory, TransportRole,
};

use crate::config::ClientConfig;
use crate::connection::{AttemptId, ConnectionRecord, ConnectionRole, ConnectionStage, ConnectionTable};
use crate::errors::{ConnectionError, CoreError, StateError};
use crate::reducer::Action;
use crate::signaling::{open_packet, seal_packet, Packet};
use crate::store::ClientStore;

/// Asynchronous completion delivered back to the manager.
#[derive(Debug)]
pub enum ConnectionEvent {
    Relay(RelayEvent),
    Transport {
        peer: PublicKey,
        attempt: AttemptId,
        event: TransportEvent,
    },
    /// Continue delivering a send log longer than one flush batch.
    Flush(PublicKey),
}

/// What handling an operation or event did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Nothing to do.
    Idle,
    /// A negotiation started or progressed.
    Negotiating { peer: PublicKey, role: ConnectionRole, attempt: AttemptId },
    /// A local offer was sealed and handed to the relay.
    OfferSent { peer: PublicKey, attempt: AttemptId },
    /// The item waits for a connection.
    Queued { peer: PublicKey, pending: usize },
    /// Items were handed to a transport or the relay.
    Delivered { peer: PublicKey, count: usize },
    Connected { peer: PublicKey, delivered: usize },
    Failed { peer: PublicKey, reason: String },
    /// The peer closed the direct channel.
    Closed { peer: PublicKey },
    Received { from: PublicKey, payload: Bytes },
    /// Inbound bytes that failed to open or came from a stranger.
    Rejected { from: Option<PublicKey>, reason: String },
    RelayLost { failed: Vec<PublicKey> },
    /// A callback for an attempt that is no longer current.
    Stale { peer: PublicKey, attempt: AttemptId },
}

impl From<ConnectionRole> for TransportRole {
    fn from(role: ConnectionRole) -> Self {
        match role {
            ConnectionRole::Initiator => TransportRole::Initiator,
            ConnectionRole::Responder => TransportRole::Responder,
        }
    }
}

impl From<TransportRole> for ConnectionRole {
    fn from(role: TransportRole) -> Self {
        match role {
            TransportRole::Initiator => ConnectionRole::Initiator,
            TransportRole::Responder => ConnectionRole::Responder,
        }
    }
}

struct LiveTransport {
    attempt: AttemptId,
    transport: Arc<dyn PeerTransport>,
}

/// Where a flush sends sealed items.
enum Route {
    Direct(AttemptId, Arc<dyn PeerTransport>),
    Relay(Arc<dyn RelayConnection>),
}

impl Route {
    async fn send(&self, peer: &PublicKey, wire: Bytes) -> Result<(), TransportError> {
        match self {
            Route::Direct(_, transport) => transport.send(wire).await,
            Route::Relay(relay) => relay.send(peer, wire).await,
        }
    }
}

pub struct ConnectionManager {
    identity: Arc<Identity>,
    store: ClientStore,
    config: ClientConfig,
    table: ConnectionTable,
    relay: Option<Arc<dyn RelayConnection>>,
    factory: Arc<dyn TransportFactory>,
    transports: HashMap<PublicKey, LiveTransport>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        identity: Arc<Identity>,
        store: ClientStore,
        factory: Arc<dyn TransportFactory>,
        config: ClientConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            store,
            config,
            table: ConnectionTable::new(),
            relay: None,
            factory,
            transports: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Connect to `relay`, replacing any previous relay connection.
    pub async fn attach_relay(&mut self, relay: &dyn Relay) -> Result<(), ConnectionError> {
        if let Some(old) = self.relay.take() {
            old.close().await;
        }
        let credentials = RelayCredentials::for_identity(&self.identity);
        let connection = relay.connect(credentials, self.relay_sink()).await?;
        info!(me = %self.identity.public_key(), "relay connected");
        self.relay = Some(connection);
        Ok(())
    }

    pub fn relay_connected(&self) -> bool {
        self.relay.as_ref().is_some_and(|r| r.is_connected())
    }

    pub fn record(&self, peer: &PublicKey) -> ConnectionRecord {
        self.table.record(peer)
    }

    pub fn stage(&self, peer: &PublicKey) -> ConnectionStage {
        self.table.stage(peer)
    }

    /// Wait for the next queued callback.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events_rx.recv().await
    }

    /// Next queued callback, if one is ready.
    pub fn try_next_event(&mut self) -> Option<ConnectionEvent> {
        self.events_rx.try_recv().ok()
    }

    fn relay_sink(&self) -> RelayEventSink {
        let tx = self.events_tx.clone();
        Arc::new(move |event| {
            // Fails only once the manager is gone.
            if tx.send(ConnectionEvent::Relay(event)).is_err() {
                debug!("relay event after shutdown");
            }
        })
    }

    fn transport_sink(&self, peer: PublicKey, attempt: AttemptId) -> TransportEventSink {
        let tx = self.events_tx.clone();
        Arc::new(move |event| {
            if tx.send(ConnectionEvent::Transport { peer, attempt, event }).is_err() {
                debug!(peer = %peer, %attempt, "transport event after shutdown");
            }
        })
    }

    fn schedule_flush(&self, peer: PublicKey) {
        // The receiver lives in `self`, so this cannot fail.
        let _ = self.events_tx.send(ConnectionEvent::Flush(peer));
    }

    // ------------------------------------------------------------------------
    // Caller-driven operations
    // ------------------------------------------------------------------------

    /// Push `peer`'s pending items toward delivery. Called after every
    /// recorded send.
    pub async fn deliver(&mut self, peer: &PublicKey) -> Result<ConnectionOutcome, CoreError> {
        match self.table.stage(peer) {
            ConnectionStage::Connected => {
                let count = self.flush(peer).await?;
                Ok(ConnectionOutcome::Delivered { peer: *peer, count })
            }
            ConnectionStage::ShouldConnect => {
                let negotiating = self.initiate(peer).await?;
                match self.fallback(peer).await? {
                    Some(delivered) => Ok(delivered),
                    None => Ok(negotiating),
                }
            }
            ConnectionStage::Connecting | ConnectionStage::Error => match self.fallback(peer).await? {
                Some(delivered) => Ok(delivered),
                None => Ok(ConnectionOutcome::Queued { peer: *peer, pending: self.pending(peer) }),
            },
        }
    }

    /// `error | connected -> should-connect`, then reconnect if anything is
    /// still waiting for delivery.
    pub async fn retry(&mut self, peer: &PublicKey) -> Result<ConnectionOutcome, CoreError> {
        self.table.retry(peer)?;
        self.drop_transport(peer).await;
        if self.pending(peer) > 0 {
            self.initiate(peer).await
        } else {
            Ok(ConnectionOutcome::Idle)
        }
    }

    /// `connecting -> error` on the caller's deadline.
    pub async fn timeout(&mut self, peer: &PublicKey) -> Result<ConnectionOutcome, CoreError> {
        let attempt = self.table.timeout(peer)?;
        self.drop_transport(peer).await;
        warn!(peer = %peer, %attempt, "connection attempt timed out");
        Ok(ConnectionOutcome::Failed { peer: *peer, reason: "timed out".into() })
    }

    /// `connecting -> should-connect`, abandoning the attempt.
    pub async fn cancel(&mut self, peer: &PublicKey) -> Result<(), CoreError> {
        self.table.cancel(peer)?;
        self.drop_transport(peer).await;
        Ok(())
    }

    /// Tear down anything held for `peer` and re-arm its record.
    pub async fn forget(&mut self, peer: &PublicKey) {
        self.drop_transport(peer).await;
        self.table.reset(peer);
    }

    pub async fn shutdown(&mut self) {
        let peers: Vec<PublicKey> = self.transports.keys().copied().collect();
        for peer in peers {
            self.forget(&peer).await;
        }
        if let Some(relay) = self.relay.take() {
            relay.close().await;
        }
        debug!("connection manager shut down");
    }

    fn pending(&self, peer: &PublicKey) -> usize {
        self.store.state().log(peer).map(|log| log.pending().len()).unwrap_or(0)
    }

    async fn initiate(&mut self, peer: &PublicKey) -> Result<ConnectionOutcome, CoreError> {
        let attempt = self.table.begin_initiator(peer)?;
        Ok(self.open_transport(peer, attempt, ConnectionRole::Initiator).await)
    }

    async fn open_transport(&mut self, peer: &PublicKey, attempt: AttemptId, role: ConnectionRole) -> ConnectionOutcome {
        self.drop_transport(peer).await;
        let sink = self.transport_sink(*peer, attempt);
        match self.factory.create(peer, role.into(), sink) {
            Ok(transport) => {
                self.transports.insert(*peer, LiveTransport { attempt, transport: Arc::from(transport) });
                ConnectionOutcome::Negotiating { peer: *peer, role, attempt }
            }
            Err(e) => self.fail(*peer, attempt, e.to_string()).await,
        }
    }

    async fn drop_transport(&mut self, peer: &PublicKey) {
        if let Some(live) = self.transports.remove(peer) {
            debug!(peer = %peer, attempt = %live.attempt, "closing transport");
            live.transport.close().await;
        }
    }

    async fn fail(&mut self, peer: PublicKey, attempt: AttemptId, reason: String) -> ConnectionOutcome {
        if !self.table.mark_failed(&peer, attempt) {
            return ConnectionOutcome::Stale { peer, attempt };
        }
        warn!(peer = %peer, %attempt, reason = %reason, "connection failed");
        self.drop_transport(&peer).await;
        ConnectionOutcome::Failed { peer, reason }
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    async fn flush(&mut self, peer: &PublicKey) -> Result<usize, CoreError> {
        let Some(route) = self.transports.get(peer).map(|l| Route::Direct(l.attempt, l.transport.clone())) else {
            return Ok(0);
        };
        self.flush_over(peer, route).await
    }

    /// Deliver through the relay when configured to and no direct channel is
    /// live.
    async fn fallback(&mut self, peer: &PublicKey) -> Result<Option<ConnectionOutcome>, CoreError> {
        if !self.config.relay_fallback {
            return Ok(None);
        }
        let Some(relay) = self.relay.clone().filter(|r| r.is_connected()) else {
            return Ok(None);
        };
        let count = self.flush_over(peer, Route::Relay(relay)).await?;
        if count > 0 {
            debug!(peer = %peer, count, "delivered through relay fallback");
        }
        Ok(Some(ConnectionOutcome::Delivered { peer: *peer, count }))
    }

    async fn flush_over(&mut self, peer: &PublicKey, route: Route) -> Result<usize, CoreError> {
        let state = self.store.state();
        let Some(log) = state.log(peer) else {
            return Ok(0);
        };
        let cursor = log.send_cursor();
        let pending = log.pending();
        let batch = pending.len().min(self.config.max_flush_batch);

        let mut sent = 0;
        let mut failure = None;
        let mut seal_error = None;
        for item in &pending[..batch] {
            let wire = match seal_packet(&self.identity, peer, &Packet::Message(item.clone())) {
                Ok(wire) => wire,
                Err(e) => {
                    seal_error = Some(e);
                    break;
                }
            };
            if let Err(e) = route.send(peer, wire).await {
                failure = Some(e);
                break;
            }
            sent += 1;
        }

        // Whatever reached the route counts as flushed, even if a later item failed.
        if sent > 0 {
            self.store.dispatch(Action::AdvanceSendCursor { to: *peer, cursor: cursor + sent })?;
            debug!(peer = %peer, sent, cursor = cursor + sent, "send log flushed");
        }
        if let Some(e) = seal_error {
            warn!(peer = %peer, sent, error = %e, "could not seal send-log item");
            return Err(e);
        }

        match (failure, route) {
            (Some(e), Route::Direct(attempt, _)) => {
                self.fail(*peer, attempt, e.to_string()).await;
            }
            (Some(e), Route::Relay(_)) => {
                warn!(peer = %peer, error = %e, "relay fallback send failed");
            }
            (None, _) if batch < pending.len() => self.schedule_flush(*peer),
            (None, _) => {}
        }
        Ok(sent)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub async fn handle_event(&mut self, event: ConnectionEvent) -> Result<ConnectionOutcome, CoreError> {
        match event {
            ConnectionEvent::Relay(RelayEvent::Message(bytes)) => self.on_relay_message(bytes).await,
            ConnectionEvent::Relay(RelayEvent::Disconnected) => Ok(self.on_relay_lost().await),
            ConnectionEvent::Transport { peer, attempt, event } => self.on_transport_event(peer, attempt, event).await,
            ConnectionEvent::Flush(peer) => {
                if self.table.stage(&peer) != ConnectionStage::Connected {
                    return Ok(ConnectionOutcome::Idle);
                }
                let count = self.flush(&peer).await?;
                Ok(ConnectionOutcome::Delivered { peer, count })
            }
        }
    }

    async fn on_relay_lost(&mut self) -> ConnectionOutcome {
        self.relay = None;
        let failed = self.table.relay_lost();
        for peer in &failed {
            self.drop_transport(peer).await;
        }
        warn!(failed = failed.len(), "relay disconnected");
        ConnectionOutcome::RelayLost { failed }
    }

    async fn on_relay_message(&mut self, bytes: Bytes) -> Result<ConnectionOutcome, CoreError> {
        let (from, packet) = match open_packet(&self.identity, &bytes) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(error = %e, "dropping relay payload that failed to open");
                return Ok(ConnectionOutcome::Rejected { from: None, reason: e.to_string() });
            }
        };
        if !self.store.state().contains(&from) {
            warn!(peer = %from, "relay payload from unknown sender rejected");
            return Ok(ConnectionOutcome::Rejected {
                from: Some(from),
                reason: StateError::UnknownContact(from).to_string(),
            });
        }
        match packet {
            Packet::Message(data) => self.accept_message(from, data),
            Packet::Signal { attempt, role, payload } => self.on_signal(from, attempt, role, payload).await,
        }
    }

    fn accept_message(&mut self, from: PublicKey, payload: Bytes) -> Result<ConnectionOutcome, CoreError> {
        self.store.dispatch(Action::RecordIncoming { from, payload: payload.clone() })?;
        debug!(peer = %from, bytes = payload.len(), "message received");
        Ok(ConnectionOutcome::Received { from, payload })
    }

    async fn on_signal(
        &mut self,
        from: PublicKey,
        attempt: AttemptId,
        role: ConnectionRole,
        payload: Bytes,
    ) -> Result<ConnectionOutcome, CoreError> {
        let record = self.table.record(&from);
        let stale = ConnectionOutcome::Stale { peer: from, attempt };

        if role == ConnectionRole::Responder {
            // Answer to our own offer.
            let expected = record.stage == ConnectionStage::Connecting
                && record.role == Some(ConnectionRole::Initiator)
                && record.attempt == Some(attempt);
            if !expected {
                debug!(peer = %from, %attempt, "ignoring stale answer");
                return Ok(stale);
            }
            return Ok(self.feed_offer(from, attempt, payload).await);
        }

        match (record.stage, record.role) {
            (ConnectionStage::Connecting, Some(ConnectionRole::Responder)) if record.attempt == Some(attempt) => {
                Ok(self.feed_offer(from, attempt, payload).await)
            }
            (ConnectionStage::Connected, _) if record.attempt == Some(attempt) => Ok(stale),
            (ConnectionStage::Connecting, Some(ConnectionRole::Initiator)) if self.identity.public_key() < &from => {
                debug!(peer = %from, %attempt, "simultaneous offers; keeping initiator role");
                Ok(stale)
            }
            (ConnectionStage::Error, _) => {
                warn!(peer = %from, %attempt, "offer ignored until the connection is retried");
                Ok(stale)
            }
            (stage, _) => {
                if !self.table.note_offer(&from, attempt) {
                    warn!(peer = %from, %attempt, %stage, "ignoring replayed offer");
                    return Ok(stale);
                }
                if stage != ConnectionStage::ShouldConnect {
                    info!(peer = %from, %attempt, %stage, "peer started a new negotiation");
                    self.forget(&from).await;
                }
                self.table.begin_responder(&from, attempt)?;
                let outcome = self.open_transport(&from, attempt, ConnectionRole::Responder).await;
                if !matches!(outcome, ConnectionOutcome::Negotiating { .. }) {
                    return Ok(outcome);
                }
                match self.feed_offer(from, attempt, payload).await {
                    ConnectionOutcome::Failed { peer, reason } => Ok(ConnectionOutcome::Failed { peer, reason }),
                    _ => Ok(outcome),
                }
            }
        }
    }

    async fn feed_offer(&mut self, peer: PublicKey, attempt: AttemptId, payload: Bytes) -> ConnectionOutcome {
        let transport = self
            .transports
            .get(&peer)
            .filter(|live| live.attempt == attempt)
            .map(|live| live.transport.clone());
        let Some(transport) = transport else {
            return ConnectionOutcome::Stale { peer, attempt };
        };
        match transport.receive_offer(payload).await {
            Ok(()) => ConnectionOutcome::Negotiating { peer, role: transport.role().into(), attempt },
            Err(e) => self.fail(peer, attempt, e.to_string()).await,
        }
    }

    async fn on_transport_event(
        &mut self,
        peer: PublicKey,
        attempt: AttemptId,
        event: TransportEvent,
    ) -> Result<ConnectionOutcome, CoreError> {
        if !self.table.is_current(&peer, attempt) {
            debug!(peer = %peer, %attempt, ?event, "discarding stale transport event");
            return Ok(ConnectionOutcome::Stale { peer, attempt });
        }
        let record = self.table.record(&peer);

        match event {
            TransportEvent::Offer(payload) => {
                let (ConnectionStage::Connecting, Some(role)) = (record.stage, record.role) else {
                    return Ok(ConnectionOutcome::Stale { peer, attempt });
                };
                let Some(relay) = self.relay.clone().filter(|r| r.is_connected()) else {
                    return Ok(self.fail(peer, attempt, ConnectionError::RelayUnavailable.to_string()).await);
                };
                let wire = seal_packet(&self.identity, &peer, &Packet::Signal { attempt, role, payload })?;
                match relay.send(&peer, wire).await {
                    Ok(()) => {
                        debug!(peer = %peer, %attempt, ?role, "offer sent");
                        Ok(ConnectionOutcome::OfferSent { peer, attempt })
                    }
                    Err(e) => Ok(self.fail(peer, attempt, e.to_string()).await),
                }
            }
            TransportEvent::Connected => {
                if !self.table.mark_connected(&peer, attempt) {
                    return Ok(ConnectionOutcome::Stale { peer, attempt });
                }
                let delivered = self.flush(&peer).await?;
                Ok(ConnectionOutcome::Connected { peer, delivered })
            }
            TransportEvent::Failed(reason) => Ok(self.fail(peer, attempt, reason).await),
            TransportEvent::Closed => match self.fail(peer, attempt, "channel closed".into()).await {
                ConnectionOutcome::Failed { .. } => Ok(ConnectionOutcome::Closed { peer }),
                other => Ok(other),
            },
            TransportEvent::Data(bytes) => {
                if record.stage != ConnectionStage::Connected {
                    return Ok(ConnectionOutcome::Stale { peer, attempt });
                }
                match open_packet(&self.identity, &bytes) {
                    Ok((from, _)) if from != peer => {
                        warn!(peer = %peer, claimed = %from, "channel payload signed by another key");
                        Ok(ConnectionOutcome::Rejected {
                            from: Some(from),
                            reason: "sender does not match channel".into(),
                        })
                    }
                    Ok((from, Packet::Message(data))) => self.accept_message(from, data),
                    Ok((_, Packet::Signal { .. })) => {
                        debug!(peer = %peer, "ignoring signal on direct channel");
                        Ok(ConnectionOutcome::Idle)
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "dropping channel payload that failed to open");
                        Ok(ConnectionOutcome::Rejected { from: Some(peer), reason: e.to_string() })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kith_transport::testing::{MemoryRelay, MemoryTransportFactory};

    struct Side {
        identity: Arc<Identity>,
        store: ClientStore,
        manager: ConnectionManager,
    }

    async fn side(relay: &MemoryRelay, factory: &MemoryTransportFactory, config: ClientConfig) -> Side {
        let identity = Arc::new(Identity::generate());
        let store = ClientStore::new(identity.clone());
        let mut manager = ConnectionManager::new(identity.clone(), store.clone(), Arc::new(factory.clone()), config);
        manager.attach_relay(relay).await.unwrap();
        Side { identity, store, manager }
    }

    fn befriend(a: &Side, b: &Side) {
        a.store
            .dispatch(Action::AddContact { name: "b".into(), public_key: *b.identity.public_key() })
            .unwrap();
        b.store
            .dispatch(Action::AddContact { name: "a".into(), public_key: *a.identity.public_key() })
            .unwrap();
    }

    fn record_send(side: &Side, to: &Side, text: &'static str) {
        side.store
            .dispatch(Action::RecordOutgoing { to: *to.identity.public_key(), payload: Bytes::from_static(text.as_bytes()) })
            .unwrap();
    }

    async fn drain(side: &mut Side) -> Vec<ConnectionOutcome> {
        let mut out = Vec::new();
        while let Some(event) = side.manager.try_next_event() {
            out.push(side.manager.handle_event(event).await.unwrap());
        }
        out
    }

    async fn settle(a: &mut Side, b: &mut Side) -> Vec<ConnectionOutcome> {
        let mut all = Vec::new();
        for _ in 0..16 {
            let mut round = drain(a).await;
            round.extend(drain(b).await);
            if round.is_empty() {
                break;
            }
            all.extend(round);
        }
        all
    }

    #[tokio::test]
    async fn send_connects_and_delivers_in_order() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let mut a = side(&relay, &factory, ClientConfig::default()).await;
        let mut b = side(&relay, &factory, ClientConfig::default()).await;
        befriend(&a, &b);
        let (ak, bk) = (*a.identity.public_key(), *b.identity.public_key());

        record_send(&a, &b, "one");
        let outcome = a.manager.deliver(&bk).await.unwrap();
        assert!(matches!(outcome, ConnectionOutcome::Negotiating { role: ConnectionRole::Initiator, .. }));
        assert_eq!(a.manager.stage(&bk), ConnectionStage::Connecting);

        record_send(&a, &b, "two");
        assert_eq!(a.manager.deliver(&bk).await.unwrap(), ConnectionOutcome::Queued { peer: bk, pending: 2 });

        settle(&mut a, &mut b).await;
        assert_eq!(a.manager.stage(&bk), ConnectionStage::Connected);
        assert_eq!(b.manager.stage(&ak), ConnectionStage::Connected);
        assert_eq!(b.manager.record(&ak).role, Some(ConnectionRole::Responder));
        assert_eq!(a.manager.record(&bk).attempt, b.manager.record(&ak).attempt);

        let received = b.store.state();
        assert_eq!(
            received.log(&ak).unwrap().receive_log(),
            [Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert_eq!(a.store.state().log(&bk).unwrap().send_cursor(), 2);
    }

    #[tokio::test]
    async fn timed_out_attempt_ignores_late_completion() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let mut a = side(&relay, &factory, ClientConfig::default()).await;
        let mut b = side(&relay, &factory, ClientConfig::default()).await;
        befriend(&a, &b);
        let bk = *b.identity.public_key();

        record_send(&a, &b, "hi");
        let ConnectionOutcome::Negotiating { attempt, .. } = a.manager.deliver(&bk).await.unwrap() else {
            panic!("expected negotiation");
        };
        a.manager.timeout(&bk).await.unwrap();

        let late = ConnectionEvent::Transport { peer: bk, attempt, event: TransportEvent::Connected };
        assert_eq!(a.manager.handle_event(late).await.unwrap(), ConnectionOutcome::Stale { peer: bk, attempt });
        assert_eq!(a.manager.stage(&bk), ConnectionStage::Error);

        settle(&mut a, &mut b).await;
        assert_eq!(a.manager.stage(&bk), ConnectionStage::Error);
        assert_eq!(a.store.state().log(&bk).unwrap().send_cursor(), 0);
    }

    #[tokio::test]
    async fn retry_resumes_from_cursor() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let mut a = side(&relay, &factory, ClientConfig::default()).await;
        let mut b = side(&relay, &factory, ClientConfig::default()).await;
        befriend(&a, &b);
        let (ak, bk) = (*a.identity.public_key(), *b.identity.public_key());

        factory.set_unreachable(true);
        record_send(&a, &b, "first");
        a.manager.deliver(&bk).await.unwrap();
        settle(&mut a, &mut b).await;
        assert_eq!(b.manager.stage(&ak), ConnectionStage::Error);
        // a never hears back and gives up on its own deadline
        assert_eq!(a.manager.stage(&bk), ConnectionStage::Connecting);
        a.manager.timeout(&bk).await.unwrap();

        factory.set_unreachable(false);
        record_send(&a, &b, "second");
        assert!(matches!(a.manager.deliver(&bk).await.unwrap(), ConnectionOutcome::Queued { pending: 2, .. }));

        b.manager.retry(&ak).await.unwrap();
        assert!(matches!(a.manager.retry(&bk).await.unwrap(), ConnectionOutcome::Negotiating { .. }));
        settle(&mut a, &mut b).await;

        assert_eq!(
            b.store.state().log(&ak).unwrap().receive_log(),
            [Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[tokio::test]
    async fn relay_loss_fails_negotiation_but_not_live_channel() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let mut a = side(&relay, &factory, ClientConfig::default()).await;
        let mut b = side(&relay, &factory, ClientConfig::default()).await;
        let mut c = side(&relay, &factory, ClientConfig::default()).await;
        befriend(&a, &b);
        befriend(&a, &c);
        let (bk, ck) = (*b.identity.public_key(), *c.identity.public_key());

        record_send(&a, &b, "hello b");
        a.manager.deliver(&bk).await.unwrap();
        settle(&mut a, &mut b).await;
        assert_eq!(a.manager.stage(&bk), ConnectionStage::Connected);

        relay.disconnect(a.identity.public_key());
        record_send(&a, &c, "hello c");
        a.manager.deliver(&ck).await.unwrap();

        let outcomes = drain(&mut a).await;
        assert!(outcomes.contains(&ConnectionOutcome::RelayLost { failed: vec![ck] }));
        assert_eq!(a.manager.stage(&ck), ConnectionStage::Error);
        assert_eq!(a.manager.stage(&bk), ConnectionStage::Connected);
        assert!(!a.manager.relay_connected());

        record_send(&a, &b, "still here");
        assert_eq!(a.manager.deliver(&bk).await.unwrap(), ConnectionOutcome::Delivered { peer: bk, count: 1 });
        drain(&mut b).await;
        drain(&mut c).await;
        assert_eq!(b.store.state().log(a.identity.public_key()).unwrap().receive_log().len(), 2);
    }

    #[tokio::test]
    async fn relay_fallback_delivers_without_channel() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        factory.set_unreachable(true);
        let config = ClientConfig { relay_fallback: true, ..Default::default() };
        let mut a = side(&relay, &factory, config.clone()).await;
        let mut b = side(&relay, &factory, config).await;
        befriend(&a, &b);
        let (ak, bk) = (*a.identity.public_key(), *b.identity.public_key());

        record_send(&a, &b, "via relay");
        assert_eq!(a.manager.deliver(&bk).await.unwrap(), ConnectionOutcome::Delivered { peer: bk, count: 1 });
        settle(&mut a, &mut b).await;

        assert_eq!(b.store.state().log(&ak).unwrap().receive_log(), [Bytes::from_static(b"via relay")]);
        assert_eq!(a.store.state().log(&bk).unwrap().send_cursor(), 1);
    }

    #[tokio::test]
    async fn large_backlog_is_flushed_in_batches() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let config = ClientConfig { max_flush_batch: 2, ..Default::default() };
        let mut a = side(&relay, &factory, config.clone()).await;
        let mut b = side(&relay, &factory, config).await;
        befriend(&a, &b);
        let (ak, bk) = (*a.identity.public_key(), *b.identity.public_key());

        for i in 0..5 {
            a.store
                .dispatch(Action::RecordOutgoing { to: bk, payload: Bytes::from(format!("m{i}")) })
                .unwrap();
        }
        a.manager.deliver(&bk).await.unwrap();
        let outcomes = settle(&mut a, &mut b).await;
        assert!(outcomes.contains(&ConnectionOutcome::Connected { peer: bk, delivered: 2 }));

        let state = b.store.state();
        let got: Vec<&[u8]> = state.log(&ak).unwrap().receive_log().iter().map(|b| &b[..]).collect();
        let expected: [&[u8]; 5] = [b"m0", b"m1", b"m2", b"m3", b"m4"];
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn signals_from_strangers_are_rejected() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let mut a = side(&relay, &factory, ClientConfig::default()).await;
        let mut b = side(&relay, &factory, ClientConfig::default()).await;
        // only a knows b
        a.store
            .dispatch(Action::AddContact { name: "b".into(), public_key: *b.identity.public_key() })
            .unwrap();
        let (ak, bk) = (*a.identity.public_key(), *b.identity.public_key());

        record_send(&a, &b, "hi");
        a.manager.deliver(&bk).await.unwrap();
        drain(&mut a).await;
        let outcomes = drain(&mut b).await;
        assert!(matches!(outcomes.as_slice(), [ConnectionOutcome::Rejected { from: Some(k), .. }] if *k == ak));
        assert_eq!(b.manager.stage(&ak), ConnectionStage::ShouldConnect);
    }

    #[tokio::test]
    async fn simultaneous_offers_resolve_to_one_channel() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let mut a = side(&relay, &factory, ClientConfig::default()).await;
        let mut b = side(&relay, &factory, ClientConfig::default()).await;
        befriend(&a, &b);
        let (ak, bk) = (*a.identity.public_key(), *b.identity.public_key());

        record_send(&a, &b, "from a");
        record_send(&b, &a, "from b");
        a.manager.deliver(&bk).await.unwrap();
        b.manager.deliver(&ak).await.unwrap();
        settle(&mut a, &mut b).await;

        assert_eq!(a.manager.stage(&bk), ConnectionStage::Connected);
        assert_eq!(b.manager.stage(&ak), ConnectionStage::Connected);
        let (low, high) = if ak < bk { (&a, &b) } else { (&b, &a) };
        assert_eq!(low.manager.record(high.identity.public_key()).role, Some(ConnectionRole::Initiator));
        assert_eq!(high.manager.record(low.identity.public_key()).role, Some(ConnectionRole::Responder));

        assert_eq!(a.store.state().log(&bk).unwrap().receive_log(), [Bytes::from_static(b"from b")]);
        assert_eq!(b.store.state().log(&ak).unwrap().receive_log(), [Bytes::from_static(b"from a")]);
    }

    #[tokio::test]
    async fn closed_channel_moves_to_error() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let mut a = side(&relay, &factory, ClientConfig::default()).await;
        let mut b = side(&relay, &factory, ClientConfig::default()).await;
        befriend(&a, &b);
        let (ak, bk) = (*a.identity.public_key(), *b.identity.public_key());

        record_send(&a, &b, "hi");
        a.manager.deliver(&bk).await.unwrap();
        settle(&mut a, &mut b).await;

        b.manager.forget(&ak).await;
        let outcomes = drain(&mut a).await;
        assert_eq!(outcomes, vec![ConnectionOutcome::Closed { peer: bk }]);
        assert_eq!(a.manager.stage(&bk), ConnectionStage::Error);
    }

    #[tokio::test]
    async fn replayed_offer_does_not_reset_live_channel() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let mut a = side(&relay, &factory, ClientConfig::default()).await;
        let mut b = side(&relay, &factory, ClientConfig::default()).await;
        befriend(&a, &b);
        let (ak, bk) = (*a.identity.public_key(), *b.identity.public_key());

        record_send(&a, &b, "one");
        a.manager.deliver(&bk).await.unwrap();
        settle(&mut a, &mut b).await;
        let first = a.manager.record(&bk).attempt.unwrap();

        a.manager.retry(&bk).await.unwrap();
        settle(&mut a, &mut b).await;
        assert_eq!(b.manager.stage(&ak), ConnectionStage::Error);
        b.manager.retry(&ak).await.unwrap();

        record_send(&a, &b, "two");
        a.manager.deliver(&bk).await.unwrap();
        settle(&mut a, &mut b).await;
        let second = b.manager.record(&ak).attempt.unwrap();
        assert_ne!(first, second);
        assert_eq!(b.manager.stage(&ak), ConnectionStage::Connected);

        // the first offer, delivered again by the relay
        let old = Packet::Signal { attempt: first, role: ConnectionRole::Initiator, payload: Bytes::from_static(&[0; 8]) };
        let wire = seal_packet(&a.identity, &bk, &old).unwrap();
        let outcome = b.manager.handle_event(ConnectionEvent::Relay(RelayEvent::Message(wire))).await.unwrap();
        assert_eq!(outcome, ConnectionOutcome::Stale { peer: ak, attempt: first });
        assert_eq!(b.manager.record(&ak).attempt, Some(second));
        assert_eq!(b.manager.stage(&ak), ConnectionStage::Connected);

        record_send(&a, &b, "three");
        assert_eq!(a.manager.deliver(&bk).await.unwrap(), ConnectionOutcome::Delivered { peer: bk, count: 1 });
        drain(&mut b).await;
        assert_eq!(b.store.state().log(&ak).unwrap().receive_log().len(), 3);
    }

    #[tokio::test]
    async fn seal_failure_is_reported_without_moving_cursor() {
        let relay = MemoryRelay::new();
        let factory = MemoryTransportFactory::new();
        let config = ClientConfig { relay_fallback: true, ..Default::default() };
        let mut a = side(&relay, &factory, config).await;
        // a low-order key-agreement key cannot be sealed to
        let broken = PublicKey::from_parts(*Identity::generate().public_key().sign_pub(), [0u8; 32]);
        a.store.dispatch(Action::AddContact { name: "broken".into(), public_key: broken }).unwrap();
        a.store.dispatch(Action::RecordOutgoing { to: broken, payload: Bytes::from_static(b"lost?") }).unwrap();

        let err = a.manager.deliver(&broken).await.unwrap_err();
        assert!(matches!(err, CoreError::Envelope(kith_crypto::EnvelopeError::InvalidKeyBytes)));
        let state = a.store.state();
        let log = state.log(&broken).unwrap();
        assert_eq!(log.send_cursor(), 0);
        assert_eq!(log.pending().len(), 1);
    }
}
