//! The client store: current snapshot, serialized dispatch and listeners.
//!
//! Dispatches are serialized across threads. Listeners run synchronously on
//! the dispatching thread, in registration order, after the new snapshot is
//! installed. A listener registered while a notification round is running
//! first hears about the next dispatch; an unsubscribed listener is never
//! called again, even by the round currently notifying.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, trace};

use kith_crypto::Identity;

use crate::errors::StateError;
use crate::reducer::{reduce, Action};
use crate::state::ClientState;

/// Callback receiving `(previous, next)` for every applied action.
pub type Listener = Arc<dyn Fn(&ClientState, &ClientState) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    /// Rounds numbered above this one notify the listener.
    generation: u64,
    active: Arc<AtomicBool>,
    listener: Listener,
}

struct StoreInner {
    state: RwLock<Arc<ClientState>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    /// Number of the latest notification round.
    generation: AtomicU64,
    next_listener: AtomicU64,
    /// Serializes dispatch; the flag marks a notification round in progress
    /// on the owning thread.
    gate: ReentrantMutex<Cell<bool>>,
}

/// Clears the notifying flag even if a listener panics.
struct Notifying<'a>(&'a Cell<bool>);

impl Drop for Notifying<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[derive(Clone)]
pub struct ClientStore {
    inner: Arc<StoreInner>,
}

impl ClientStore {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self::with_state(ClientState::new(identity))
    }

    pub fn with_state(state: ClientState) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(Arc::new(state)),
                listeners: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                next_listener: AtomicU64::new(1),
                gate: ReentrantMutex::new(Cell::new(false)),
            }),
        }
    }

    /// Current snapshot.
    pub fn state(&self) -> Arc<ClientState> {
        self.inner.state.read().clone()
    }

    /// Apply `action` and notify listeners. On error nothing changes and no
    /// listener runs.
    pub fn dispatch(&self, action: Action) -> Result<Arc<ClientState>, StateError> {
        let gate = self.inner.gate.lock();
        if gate.get() {
            return Err(StateError::ReentrantDispatch);
        }

        let previous = self.state();
        let next = match reduce(&previous, &action) {
            Ok(next) => Arc::new(next),
            Err(e) => {
                debug!(action = action.name(), peer = %action.subject(), error = %e, "action rejected");
                return Err(e);
            }
        };
        *self.inner.state.write() = next.clone();
        trace!(action = action.name(), peer = %action.subject(), "action applied");

        gate.set(true);
        let _notifying = Notifying(&gate);
        let round = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let listeners: Vec<(Arc<AtomicBool>, Listener)> = self
            .inner
            .listeners
            .lock()
            .iter()
            .filter(|entry| entry.generation < round)
            .map(|entry| (entry.active.clone(), entry.listener.clone()))
            .collect();

        for (active, listener) in listeners {
            if active.load(Ordering::SeqCst) {
                listener(&previous, &next);
            }
        }
        Ok(next)
    }

    /// Register `listener` for every subsequent dispatch.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ClientState, &ClientState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.inner.listeners.lock().push(ListenerEntry {
            id,
            generation: self.inner.generation.load(Ordering::SeqCst),
            active: active.clone(),
            listener: Arc::new(listener),
        });
        debug!(listener = id, "state listener subscribed");
        Subscription { id, active, store: Arc::downgrade(&self.inner) }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

/// Handle returned by [`ClientStore::subscribe`].
#[must_use = "dropping the handle keeps the listener registered with no way to remove it"]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    store: Weak<StoreInner>,
}

impl Subscription {
    /// Stop notifications. Takes effect before the next listener call, even
    /// when invoked from inside a notification round. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            inner.listeners.lock().retain(|entry| entry.id != self.id);
            debug!(listener = self.id, "state listener unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
