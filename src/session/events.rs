//! Typed session events
//!
//! Every event goes to two audiences: broadcast receivers handed out by
//! [`EventHub::subscribe`] and callbacks registered with
//! [`EventHub::register`]. Callbacks run on the receive loop and must not
//! block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::market::{Instrument, MarketSnapshot};
use crate::order::{Order, OrderReply};

const DEFAULT_CAPACITY: usize = 1024;

/// Handle returned by [`EventHub::register`]
pub type ListenerId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Events produced by the market-data session
#[derive(Debug, Clone, Serialize)]
pub enum MarketEvent {
    InstrumentsReceived(Vec<Instrument>),
    SnapshotUpdated(Arc<MarketSnapshot>),
    Disconnected,
}

/// Events produced by the order-entry session
#[derive(Debug, Clone, Serialize)]
pub enum OrderEvent {
    Accepted(Order),
    Rejected(Order),
    Reply {
        reply: OrderReply,
        order: Option<Order>,
    },
    Disconnected,
}

pub struct EventHub<E> {
    sender: broadcast::Sender<E>,
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener<E>)>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// New receiver seeing every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn register<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    /// Returns false when `id` was not registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: E) {
        // Callbacks may unregister themselves, so call them outside the lock
        let listeners: Vec<Listener<E>> = self
            .listeners()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }
        // No receivers is not an error
        let _ = self.sender.send(event);
    }
}
