//! Host event bus
//!
//! Two ways to receive events:
//! - [`EventBus::subscribe`] hands out an [`EventReceiver`] for async
//!   consumers, backed by one broadcast channel;
//! - [`EventBus::listen`] registers a callback run synchronously inside
//!   [`EventBus::fire`], in registration order.
//!
//! A panicking callback is logged and skipped; the remaining callbacks still
//! run.

use embodied_core::{Context, Event, EventPayload, MATCH_ALL};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, error, trace, warn};

const CHANNEL_CAPACITY: usize = 1024;

pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    id: u64,
    /// `None` receives everything
    event_type: Option<String>,
    callback: EventCallback,
}

impl Listener {
    fn wants(&self, event: &Event) -> bool {
        self.event_type.as_deref().map_or(true, |t| event.is(t))
    }
}

type Listeners = RwLock<Vec<Listener>>;

fn read(listeners: &Listeners) -> RwLockReadGuard<'_, Vec<Listener>> {
    listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(listeners: &Listeners) -> RwLockWriteGuard<'_, Vec<Listener>> {
    listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn type_filter(event_type: &str) -> Option<String> {
    (event_type != MATCH_ALL).then(|| event_type.to_string())
}

/// Removes a callback registered with [`EventBus::listen`].
///
/// Dropping the handle keeps the callback registered.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<Listeners>,
}

impl ListenerHandle {
    pub fn remove(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            write(&listeners).retain(|l| l.id != self.id);
            trace!(listener = self.id, "Removed event listener");
        }
    }
}

/// Broadcast receiver narrowed to one event type
pub struct EventReceiver {
    inner: broadcast::Receiver<Event>,
    event_type: Option<String>,
}

impl EventReceiver {
    fn wants(&self, event: &Event) -> bool {
        self.event_type.as_deref().map_or(true, |t| event.is(t))
    }

    /// Next matching event; `None` once the bus is gone.
    ///
    /// Events dropped because the receiver lagged are logged and skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event receiver lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already queued, without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

pub struct EventBus {
    channel: broadcast::Sender<Event>,
    listeners: Arc<Listeners>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channel: broadcast::channel(capacity).0,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Receive events of one type, or all of them with [`MATCH_ALL`]
    pub fn subscribe(&self, event_type: &str) -> EventReceiver {
        EventReceiver {
            inner: self.channel.subscribe(),
            event_type: type_filter(event_type),
        }
    }

    /// Run `callback` inside `fire` for every event of `event_type`.
    ///
    /// The callback must not block.
    pub fn listen<F>(&self, event_type: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(event_type, listener = id, "Adding event listener");
        write(&self.listeners).push(Listener {
            id,
            event_type: type_filter(event_type),
            callback: Arc::new(callback),
        });
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listen_all<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listen(MATCH_ALL, callback)
    }

    pub fn fire(&self, event: Event) {
        trace!(event_type = %event.event_type, "Firing event");

        // Snapshot so callbacks can add or remove listeners
        let callbacks: Vec<(u64, EventCallback)> = read(&self.listeners)
            .iter()
            .filter(|l| l.wants(&event))
            .map(|l| (l.id, Arc::clone(&l.callback)))
            .collect();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(event_type = %event.event_type, listener = id, "Event listener panicked");
            }
        }

        // No receivers is not an error
        let _ = self.channel.send(event);
    }

    pub fn fire_payload<P: EventPayload>(&self, payload: &P, context: Context) {
        self.fire(Event::from_payload(payload, context));
    }

    pub fn listener_count(&self) -> usize {
        read(&self.listeners).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
