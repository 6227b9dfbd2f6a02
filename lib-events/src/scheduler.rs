//! Deadline scheduler
//!
//! A timer task that maintains a min-heap of absolute deadlines and queues
//! events on the reactor when they fire. Periodic entries re-schedule
//! themselves.

use crate::reactor::{Event, EventError, EventReactor};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

struct SchedulerEntry {
    deadline: Instant,
    event: Event,
    periodic_interval: Option<Duration>,
}

impl PartialEq for SchedulerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for SchedulerEntry {}

impl PartialOrd for SchedulerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchedulerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first
        other.deadline.cmp(&self.deadline)
    }
}

/// Schedules events to be queued on a reactor at deadlines
#[derive(Clone)]
pub struct EventScheduler {
    tx: mpsc::UnboundedSender<SchedulerEntry>,
}

impl EventScheduler {
    /// Create a scheduler and spawn its timer task
    pub fn new(reactor: Arc<EventReactor>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::timer_loop(reactor, rx));

        EventScheduler { tx }
    }

    /// Schedule an event at an absolute wall-clock time.
    ///
    /// Times already in the past fire immediately.
    pub fn at(&self, time: SystemTime, event: Event) {
        let delay = time
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);

        self.after(delay, event);
    }

    /// Schedule an event once after a delay
    pub fn after(&self, delay: Duration, event: Event) {
        let _ = self.tx.send(SchedulerEntry {
            deadline: Instant::now() + delay,
            event,
            periodic_interval: None,
        });
    }

    /// Schedule an event to fire at a fixed interval
    pub fn every(&self, interval: Duration, event: Event) {
        let _ = self.tx.send(SchedulerEntry {
            deadline: Instant::now() + interval,
            event,
            periodic_interval: Some(interval),
        });
    }

    async fn timer_loop(
        reactor: Arc<EventReactor>,
        mut rx: mpsc::UnboundedReceiver<SchedulerEntry>,
    ) {
        let mut heap: BinaryHeap<SchedulerEntry> = BinaryHeap::new();

        debug!("scheduler started");

        loop {
            let next_deadline = heap.peek().map(|entry| entry.deadline);

            tokio::select! {
                entry = rx.recv() => {
                    match entry {
                        Some(entry) => heap.push(entry),
                        None => break,
                    }
                }
                _ = sleep_until_or_forever(next_deadline) => {
                    let now = Instant::now();

                    while heap.peek().is_some_and(|entry| entry.deadline <= now) {
                        let entry = heap.pop().expect("peeked entry");

                        match reactor.put(entry.event.clone()) {
                            Ok(()) => {}
                            Err(EventError::Stopped) => {
                                debug!("scheduler exiting, reactor stopped");
                                return;
                            }
                            Err(err) => {
                                error!(%err, event_id = ?entry.event.id, "dropping scheduled event");
                            }
                        }

                        if let Some(interval) = entry.periodic_interval {
                            heap.push(SchedulerEntry {
                                deadline: entry.deadline + interval,
                                event: entry.event,
                                periodic_interval: Some(interval),
                            });
                        }
                    }
                }
            }
        }

        debug!("scheduler finished");
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{EventId, EventPayload};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_one_shot_fires_once() {
        let reactor = EventReactor::new(16);
        let scheduler = EventScheduler::new(reactor.clone());
        let id = EventId::new();
        let fired = Arc::new(Mutex::new(0u32));

        {
            let fired = fired.clone();
            reactor.register_handler(id, move |_| *fired.lock() += 1);
        }

        scheduler.after(Duration::from_millis(10), Event::plain(id));

        tokio::time::sleep(Duration::from_millis(120)).await;
        reactor.put_stop().unwrap();
        reactor.run().await;

        assert_eq!(*fired.lock(), 1);
    }

    #[tokio::test]
    async fn test_periodic_reschedules() {
        let reactor = EventReactor::new(64);
        let scheduler = EventScheduler::new(reactor.clone());
        let id = EventId::new();
        let fired = Arc::new(Mutex::new(0u32));

        {
            let fired = fired.clone();
            reactor.register_handler(id, move |_| *fired.lock() += 1);
        }

        scheduler.every(Duration::from_millis(20), Event::plain(id));

        tokio::time::sleep(Duration::from_millis(130)).await;
        reactor.put_stop().unwrap();
        reactor.run().await;

        assert!(*fired.lock() >= 3, "periodic event fired {}", fired.lock());
    }

    #[tokio::test]
    async fn test_ordering_by_deadline() {
        let reactor = EventReactor::new(16);
        let scheduler = EventScheduler::new(reactor.clone());
        let early = EventId::new();
        let late = EventId::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (id, tag) in [(early, "early"), (late, "late")] {
            let log = log.clone();
            reactor.register_handler(id, move |_| log.lock().push(tag));
        }

        scheduler.after(Duration::from_millis(60), Event::plain(late));
        scheduler.after(Duration::from_millis(10), Event::plain(early));

        tokio::time::sleep(Duration::from_millis(150)).await;
        reactor.put_stop().unwrap();
        reactor.run().await;

        assert_eq!(*log.lock(), ["early", "late"]);
    }

    #[tokio::test]
    async fn test_event_payload_passes_through() {
        let reactor = EventReactor::new(16);
        let scheduler = EventScheduler::new(reactor.clone());
        let id = EventId::new();
        let seen = Arc::new(Mutex::new(None));

        {
            let seen = seen.clone();
            reactor.register_handler(id, move |event| {
                if let EventPayload::Transfer(transfer_id) = &event.payload {
                    *seen.lock() = Some(transfer_id.clone());
                }
            });
        }

        scheduler.after(
            Duration::from_millis(5),
            Event::new(id, EventPayload::Transfer("xfer-1".to_string())),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        reactor.put_stop().unwrap();
        reactor.run().await;

        assert_eq!(seen.lock().as_deref(), Some("xfer-1"));
    }
}
