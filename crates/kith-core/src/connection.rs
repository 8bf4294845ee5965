//! Per-contact connection records and their legal transitions.
//!
//! ```text
//!                 begin                 transport live
//! should-connect ───────▶ connecting ───────────────────▶ connected
//!       ▲                  │    │                            │
//!       │ cancel           │    │ failure, relay loss,       │ channel lost
//!       └──────────────────┘    │ timeout                    ▼
//!       ▲                       └──────────────────────────▶ error
//!       │                 retry                              │
//!       └────────────────────────────────────────────────────┘ (also from connected)
//! ```
//!
//! Every negotiation carries an [`AttemptId`]. Callbacks tagged with an
//! attempt that is no longer current are refused, so a late completion can
//! never move a record that has already timed out or been reset.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

use kith_crypto::PublicKey;

use crate::errors::ConnectionError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStage {
    #[default]
    ShouldConnect,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionStage::ShouldConnect => "should-connect",
            ConnectionStage::Connecting => "connecting",
            ConnectionStage::Connected => "connected",
            ConnectionStage::Error => "error",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Initiator,
    Responder,
}

/// Identifies one negotiation. Chosen by the initiator and echoed by the
/// responder in its signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub stage: ConnectionStage,
    /// Fixed when the record enters `connecting`.
    pub role: Option<ConnectionRole>,
    pub attempt: Option<AttemptId>,
}

impl ConnectionRecord {
    fn is_current(&self, attempt: AttemptId) -> bool {
        self.attempt == Some(attempt)
    }
}

/// Offer attempt ids remembered per peer.
const SEEN_OFFERS_PER_PEER: usize = 32;

/// Connection records for every contact this client has tried to reach or
/// been reached by.
#[derive(Debug)]
pub struct ConnectionTable {
    records: HashMap<PublicKey, ConnectionRecord>,
    /// Attempts each peer has already offered, oldest first. Survives resets.
    seen_offers: HashMap<PublicKey, VecDeque<AttemptId>>,
    next_attempt: u64,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    /// Table whose attempt ids start from a random point, so ids from two
    /// clients do not collide in practice.
    pub fn new() -> Self {
        let mut seed = [0u8; 8];
        // A fixed start only weakens collision resistance between peers.
        let _ = getrandom::getrandom(&mut seed);
        Self::with_seed(u64::from_be_bytes(seed))
    }

    pub fn with_seed(seed: u64) -> Self {
        Self { records: HashMap::new(), seen_offers: HashMap::new(), next_attempt: seed }
    }

    /// Record for `peer`; a fresh `should-connect` one if none exists yet.
    pub fn record(&self, peer: &PublicKey) -> ConnectionRecord {
        self.records.get(peer).copied().unwrap_or_default()
    }

    pub fn stage(&self, peer: &PublicKey) -> ConnectionStage {
        self.record(peer).stage
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PublicKey, &ConnectionRecord)> {
        self.records.iter()
    }

    /// Whether `attempt` is the live negotiation or channel for `peer`.
    pub fn is_current(&self, peer: &PublicKey, attempt: AttemptId) -> bool {
        self.records.get(peer).is_some_and(|r| {
            r.is_current(attempt) && matches!(r.stage, ConnectionStage::Connecting | ConnectionStage::Connected)
        })
    }

    fn allocate(&mut self) -> AttemptId {
        loop {
            self.next_attempt = self.next_attempt.wrapping_add(1);
            if let Some(id) = AttemptId::new(self.next_attempt) {
                return id;
            }
        }
    }

    /// Check `action` against the current stage. Yields the stored record, if
    /// any; a peer without one is in `should-connect` and stays absent.
    fn transition(
        &mut self,
        peer: &PublicKey,
        action: &'static str,
        allowed: &[ConnectionStage],
    ) -> Result<Option<&mut ConnectionRecord>, ConnectionError> {
        let stage = self.stage(peer);
        if !allowed.contains(&stage) {
            return Err(ConnectionError::InvalidTransition { peer: *peer, stage, action });
        }
        Ok(self.records.get_mut(peer))
    }

    /// Remember an initiator offer from `peer`. Returns false if that attempt
    /// was offered before.
    pub fn note_offer(&mut self, peer: &PublicKey, attempt: AttemptId) -> bool {
        let seen = self.seen_offers.entry(*peer).or_default();
        if seen.contains(&attempt) {
            return false;
        }
        if seen.len() == SEEN_OFFERS_PER_PEER {
            seen.pop_front();
        }
        seen.push_back(attempt);
        true
    }

    /// `should-connect -> connecting` as initiator under a new attempt.
    pub fn begin_initiator(&mut self, peer: &PublicKey) -> Result<AttemptId, ConnectionError> {
        self.transition(peer, "initiate", &[ConnectionStage::ShouldConnect])?;
        let attempt = self.allocate();
        self.records.insert(
            *peer,
            ConnectionRecord {
                stage: ConnectionStage::Connecting,
                role: Some(ConnectionRole::Initiator),
                attempt: Some(attempt),
            },
        );
        info!(peer = %peer, %attempt, "connecting as initiator");
        Ok(attempt)
    }

    /// `should-connect -> connecting` as responder to the initiator's attempt.
    pub fn begin_responder(&mut self, peer: &PublicKey, attempt: AttemptId) -> Result<(), ConnectionError> {
        self.transition(peer, "respond", &[ConnectionStage::ShouldConnect])?;
        self.records.insert(
            *peer,
            ConnectionRecord {
                stage: ConnectionStage::Connecting,
                role: Some(ConnectionRole::Responder),
                attempt: Some(attempt),
            },
        );
        info!(peer = %peer, %attempt, "connecting as responder");
        Ok(())
    }

    /// `connecting -> connected`. Returns false, changing nothing, when
    /// `attempt` is stale.
    pub fn mark_connected(&mut self, peer: &PublicKey, attempt: AttemptId) -> bool {
        match self.records.get_mut(peer) {
            Some(r) if r.stage == ConnectionStage::Connecting && r.is_current(attempt) => {
                r.stage = ConnectionStage::Connected;
                info!(peer = %peer, %attempt, "connected");
                true
            }
            _ => {
                debug!(peer = %peer, %attempt, "ignoring stale connected callback");
                false
            }
        }
    }

    /// `connecting | connected -> error` for the live attempt. Returns false
    /// when `attempt` is stale.
    pub fn mark_failed(&mut self, peer: &PublicKey, attempt: AttemptId) -> bool {
        if !self.is_current(peer, attempt) {
            debug!(peer = %peer, %attempt, "ignoring stale failure callback");
            return false;
        }
        if let Some(r) = self.records.get_mut(peer) {
            info!(peer = %peer, %attempt, from = %r.stage, "connection failed");
            r.stage = ConnectionStage::Error;
        }
        true
    }

    /// The relay dropped: every negotiation in flight fails. Established
    /// channels are unaffected. Returns the peers that moved to `error`.
    pub fn relay_lost(&mut self) -> Vec<PublicKey> {
        let mut failed = Vec::new();
        for (peer, record) in self.records.iter_mut() {
            if record.stage == ConnectionStage::Connecting {
                record.stage = ConnectionStage::Error;
                failed.push(*peer);
            }
        }
        if !failed.is_empty() {
            info!(count = failed.len(), "relay lost during negotiation");
        }
        failed
    }

    /// `error | connected -> should-connect`. A no-op on `should-connect`.
    pub fn retry(&mut self, peer: &PublicKey) -> Result<(), ConnectionError> {
        let record = self.transition(
            peer,
            "retry",
            &[ConnectionStage::Error, ConnectionStage::Connected, ConnectionStage::ShouldConnect],
        )?;
        if let Some(record) = record {
            *record = ConnectionRecord::default();
        }
        debug!(peer = %peer, "connection re-armed");
        Ok(())
    }

    /// `connecting -> error`, triggered by the caller's own deadline.
    pub fn timeout(&mut self, peer: &PublicKey) -> Result<AttemptId, ConnectionError> {
        let attempt = self
            .transition(peer, "time out", &[ConnectionStage::Connecting])?
            .and_then(|record| {
                record.stage = ConnectionStage::Error;
                record.attempt
            });
        info!(peer = %peer, "negotiation timed out");
        attempt.ok_or(ConnectionError::InvalidTransition {
            peer: *peer,
            stage: ConnectionStage::Connecting,
            action: "time out",
        })
    }

    /// `connecting -> should-connect`, abandoning the attempt.
    pub fn cancel(&mut self, peer: &PublicKey) -> Result<(), ConnectionError> {
        if let Some(record) = self.transition(peer, "cancel", &[ConnectionStage::Connecting])? {
            *record = ConnectionRecord::default();
        }
        debug!(peer = %peer, "negotiation cancelled");
        Ok(())
    }

    /// Re-arm from any stage. Used when the peer starts over or the contact
    /// goes away.
    pub fn reset(&mut self, peer: &PublicKey) {
        if let Some(record) = self.records.get_mut(peer) {
            *record = ConnectionRecord::default();
        }
    }
}
