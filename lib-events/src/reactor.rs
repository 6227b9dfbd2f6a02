//! Event reactor
//!
//! A single dispatcher task that demultiplexes events from other tasks.
//! Handlers are registered per event id and called in registration order;
//! many handlers may share an id. Handlers must dispatch and return, never
//! block.

use lib_keys::KvpId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Errors surfaced by the reactor to event producers
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The bounded event queue is full. Fatal to the producer.
    #[error("event queue full")]
    QueueFull,
    /// The reactor has stopped and no longer accepts events
    #[error("event reactor stopped")]
    Stopped,
}

/// An identifier for a class of events.
///
/// Ids are process-unique; components allocate one per timer or channel they
/// own. The reserved [`EventId::STOP`] shuts the reactor down.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EventId(u64);

impl EventId {
    /// The identifier that stops the reactor
    pub const STOP: EventId = EventId(0);

    /// Allocate a fresh event id
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Data carried alongside an event id
#[derive(Clone, Debug)]
pub enum EventPayload {
    None,
    /// An inbound UDP datagram
    Datagram { address: SocketAddr, data: Vec<u8> },
    /// A transfer id for per-transfer timers
    Transfer(String),
    /// A key-value pair id for publish scheduling
    Kvp(KvpId),
}

/// An event queued on the reactor
#[derive(Clone, Debug)]
pub struct Event {
    pub id: EventId,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, payload: EventPayload) -> Self {
        Event { id, payload }
    }

    pub fn plain(id: EventId) -> Self {
        Event {
            id,
            payload: EventPayload::None,
        }
    }

    pub fn stop() -> Self {
        Event::plain(EventId::STOP)
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A reactor that demultiplexes events from other tasks
pub struct EventReactor {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    handlers: RwLock<HashMap<EventId, Vec<Handler>>>,
    max_queue_size: usize,
}

impl EventReactor {
    /// Create a reactor with a bounded queue
    pub fn new(max_queue_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(max_queue_size);

        Arc::new(EventReactor {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: RwLock::new(HashMap::new()),
            max_queue_size,
        })
    }

    /// The maximum size of the queue
    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Add an event to be dispatched.
    ///
    /// Queue overflow is fatal to the producer and surfaced as
    /// [`EventError::QueueFull`].
    pub fn put(&self, event: Event) -> Result<(), EventError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event_id = ?event.id, "event queue full");
                Err(EventError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EventError::Stopped),
        }
    }

    /// Queue the reserved stop event
    pub fn put_stop(&self) -> Result<(), EventError> {
        self.put(Event::stop())
    }

    /// Register a callback for an event id.
    ///
    /// Handlers for the same id are called in registration order.
    pub fn register_handler<F>(&self, event_id: EventId, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event_id)
            .or_default()
            .push(Arc::new(handler));

        debug!(?event_id, "registered handler");
    }

    /// Run the dispatch loop until the stop event is drained.
    ///
    /// May be called once; later calls return immediately.
    pub async fn run(&self) {
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };

        debug!("event reactor started");

        while let Some(event) = rx.recv().await {
            let handlers: Vec<Handler> = self
                .handlers
                .read()
                .get(&event.id)
                .map(|list| list.to_vec())
                .unwrap_or_default();

            for handler in handlers {
                handler(&event);
            }

            if event.id == EventId::STOP {
                break;
            }
        }

        debug!("event reactor finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let reactor = EventReactor::new(16);
        let id = EventId::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            reactor.register_handler(id, move |_| log.lock().push(tag));
        }

        reactor.put(Event::plain(id)).unwrap();
        reactor.put_stop().unwrap();
        reactor.run().await;

        assert_eq!(*log.lock(), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_stop_drains_and_exits() {
        let reactor = EventReactor::new(16);
        let id = EventId::new();
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = count.clone();
            reactor.register_handler(id, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        reactor.put(Event::plain(id)).unwrap();
        reactor.put_stop().unwrap();
        reactor.put(Event::plain(id)).unwrap();
        reactor.run().await;

        // The event queued after STOP is never dispatched
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_overflow_is_fatal_to_producer() {
        let reactor = EventReactor::new(2);
        let id = EventId::new();

        reactor.put(Event::plain(id)).unwrap();
        reactor.put(Event::plain(id)).unwrap();

        assert!(matches!(
            reactor.put(Event::plain(id)),
            Err(EventError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_unhandled_events_are_ignored() {
        let reactor = EventReactor::new(16);

        reactor.put(Event::plain(EventId::new())).unwrap();
        reactor.put_stop().unwrap();
        reactor.run().await;
    }
}
