//! Publishing and replication
//!
//! Two control loops keep values alive. The publisher watches the table
//! for original records and schedules each for republication when its
//! last update ages past the republish interval, feeding the work through
//! a disk-spilled queue and the bounded upload slot. The replicator
//! re-stores every unexpired replica on a fixed tick and sweeps expired
//! pairs afterwards.

use crate::network::DhtNode;
use crate::{TIME_REPLICATE, TIME_REPUBLISH};
use lib_events::{BigDiskQueue, Event, EventId, EventPayload, EventReactor, EventScheduler, TaskSlot};
use lib_keys::KvpId;
use lib_storage::table::unix_now;
use lib_storage::KvpTable;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// How often the publisher rescans the table for due records
pub const REPUBLISH_CHECK_INTERVAL: u64 = 3_600;

/// Replicates values stored into the cache by other nodes
pub struct Replicator {
    stopped: Arc<AtomicBool>,
}

impl Replicator {
    pub fn new(
        reactor: Arc<EventReactor>,
        dht: Arc<DhtNode>,
        kvp_table: Arc<dyn KvpTable>,
        upload_slot: Arc<TaskSlot>,
    ) -> Arc<Self> {
        let scheduler = EventScheduler::new(reactor.clone());
        let timer_id = EventId::new();
        let tick = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        scheduler.every(Duration::from_secs(TIME_REPLICATE), Event::plain(timer_id));

        {
            let tick = tick.clone();
            reactor.register_handler(timer_id, move |_| tick.notify_one());
        }

        {
            let tick = tick.clone();
            let stopped = stopped.clone();
            reactor.register_handler(EventId::STOP, move |_| {
                stopped.store(true, Ordering::SeqCst);
                tick.notify_one();
            });
        }

        {
            let stopped = stopped.clone();
            tokio::spawn(Self::replicate_loop(dht, kvp_table, upload_slot, tick, stopped));
        }

        Arc::new(Replicator { stopped })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn replicate_loop(
        dht: Arc<DhtNode>,
        kvp_table: Arc<dyn KvpTable>,
        upload_slot: Arc<TaskSlot>,
        tick: Arc<Notify>,
        stopped: Arc<AtomicBool>,
    ) {
        loop {
            tick.notified().await;

            if stopped.load(Ordering::SeqCst) {
                break;
            }

            debug!("replicating values");
            let now = unix_now();

            let keys = match kvp_table.keys() {
                Ok(keys) => keys,
                Err(err) => {
                    warn!(%err, "replication scan failed");
                    continue;
                }
            };

            for kvpid in keys {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }

                let record = match kvp_table.record(&kvpid) {
                    Ok(Some(record)) => record,
                    _ => continue,
                };

                if record.is_original {
                    continue;
                }

                let expired = match (record.timestamp, record.time_to_live) {
                    (Some(timestamp), Some(ttl)) => timestamp + ttl < now,
                    _ => false,
                };

                if expired {
                    continue;
                }

                debug!(%kvpid, "replicating value");

                let dht = dht.clone();
                upload_slot
                    .add(move || dht.store_value(&kvpid.key, &kvpid.index))
                    .await;
            }

            debug!("value replication finished");

            match kvp_table.clean() {
                Ok(removed) if removed > 0 => debug!(removed, "expired pairs swept"),
                Ok(_) => {}
                Err(err) => warn!(%err, "expiry sweep failed"),
            }
        }
    }
}

/// Publishes values created by this node
pub struct Publisher {
    scheduled: Arc<Mutex<HashSet<KvpId>>>,
    queue: Arc<BigDiskQueue<KvpId>>,
}

impl Publisher {
    pub fn new(
        reactor: Arc<EventReactor>,
        dht: Arc<DhtNode>,
        kvp_table: Arc<dyn KvpTable>,
        upload_slot: Arc<TaskSlot>,
    ) -> Arc<Self> {
        let scheduler = EventScheduler::new(reactor.clone());
        let timer_id = EventId::new();
        let schedule_id = EventId::new();
        let scan = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let publisher = Arc::new(Publisher {
            scheduled: Arc::new(Mutex::new(HashSet::new())),
            queue: Arc::new(BigDiskQueue::new()),
        });

        scheduler.every(
            Duration::from_secs(REPUBLISH_CHECK_INTERVAL),
            Event::plain(timer_id),
        );

        {
            let scan = scan.clone();
            reactor.register_handler(timer_id, move |_| scan.notify_one());
        }

        // A due record's schedule event moves it onto the publish queue
        {
            let queue = publisher.queue.clone();
            let scheduled = publisher.scheduled.clone();

            reactor.register_handler(schedule_id, move |event| {
                if let EventPayload::Kvp(kvpid) = &event.payload {
                    scheduled.lock().remove(kvpid);

                    if let Err(err) = queue.put(*kvpid) {
                        warn!(%err, "publish queue put failed");
                    }
                }
            });
        }

        {
            let scan = scan.clone();
            kvp_table
                .value_changed()
                .register(move |_: &Option<KvpId>| scan.notify_one());
        }

        let stop_notify = Arc::new(Notify::new());

        {
            let scan = scan.clone();
            let stopped = stopped.clone();
            let stop_notify = stop_notify.clone();
            reactor.register_handler(EventId::STOP, move |_| {
                stopped.store(true, Ordering::SeqCst);
                scan.notify_one();
                stop_notify.notify_waiters();
            });
        }

        tokio::spawn(Self::scan_loop(
            publisher.clone(),
            kvp_table,
            scheduler,
            schedule_id,
            scan,
            stopped.clone(),
        ));

        tokio::spawn(Self::publish_loop(
            publisher.queue.clone(),
            dht,
            upload_slot,
            stopped,
            stop_notify,
        ));

        publisher
    }

    /// Number of records waiting for their republish time
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    fn schedule_for_publish(
        &self,
        scheduler: &EventScheduler,
        schedule_id: EventId,
        republish_time: u64,
        kvpid: KvpId,
    ) {
        {
            let mut scheduled = self.scheduled.lock();

            if !scheduled.insert(kvpid) {
                return;
            }
        }

        debug!(%kvpid, republish_time, "scheduled for publish");

        scheduler.at(
            UNIX_EPOCH + Duration::from_secs(republish_time),
            Event::new(schedule_id, EventPayload::Kvp(kvpid)),
        );
    }

    async fn scan_loop(
        publisher: Arc<Publisher>,
        kvp_table: Arc<dyn KvpTable>,
        scheduler: EventScheduler,
        schedule_id: EventId,
        scan: Arc<Notify>,
        stopped: Arc<AtomicBool>,
    ) {
        loop {
            scan.notified().await;

            if stopped.load(Ordering::SeqCst) {
                break;
            }

            debug!("scanning table for publishing");

            let current_time = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();

            let keys = match kvp_table.keys() {
                Ok(keys) => keys,
                Err(err) => {
                    warn!(%err, "publish scan failed");
                    continue;
                }
            };

            for kvpid in keys {
                let record = match kvp_table.record(&kvpid) {
                    Ok(Some(record)) => record,
                    _ => continue,
                };

                if !record.is_original {
                    continue;
                }

                let republish_time = if record.last_update == 0 {
                    current_time
                } else {
                    record.last_update + TIME_REPUBLISH
                };

                if republish_time < current_time + REPUBLISH_CHECK_INTERVAL {
                    publisher.schedule_for_publish(
                        &scheduler,
                        schedule_id,
                        republish_time,
                        kvpid,
                    );
                }
            }
        }
    }

    async fn publish_loop(
        queue: Arc<BigDiskQueue<KvpId>>,
        dht: Arc<DhtNode>,
        upload_slot: Arc<TaskSlot>,
        stopped: Arc<AtomicBool>,
        stop_notify: Arc<Notify>,
    ) {
        loop {
            let kvpid = tokio::select! {
                result = queue.get() => match result {
                    Ok(kvpid) => kvpid,
                    Err(err) => {
                        warn!(%err, "publish queue read failed");
                        break;
                    }
                },
                _ = stop_notify.notified() => break,
            };

            if stopped.load(Ordering::SeqCst) {
                break;
            }

            debug!(%kvpid, "publishing");

            let dht = dht.clone();
            upload_slot
                .add(move || dht.store_value(&kvpid.key, &kvpid.index))
                .await;
        }
    }
}
