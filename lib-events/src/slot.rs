//! Bounded work slots
//!
//! A slot is a concurrency gate: callers block until fewer than
//! `max_in_flight` tasks are running, then their task starts and joins an
//! observable in-flight set. Upload and download pipelines are throttled
//! through slots so a front end can watch the active transfers.

use crate::observer::Observer;
use crate::task::{Stoppable, Task};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Fired when a task enters (`added = true`) or leaves the slot
#[derive(Clone)]
pub struct SlotEvent {
    pub added: bool,
    pub task: Arc<dyn Stoppable>,
}

/// A bounded concurrency gate with an observable set of in-flight tasks
pub struct TaskSlot {
    semaphore: Arc<Semaphore>,
    current: Arc<Mutex<Vec<Arc<dyn Stoppable>>>>,
    observer: Arc<Observer<SlotEvent>>,
    max_in_flight: usize,
}

impl TaskSlot {
    pub fn new(max_in_flight: usize) -> Arc<Self> {
        Arc::new(TaskSlot {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            current: Arc::new(Mutex::new(Vec::new())),
            observer: Arc::new(Observer::new()),
            max_in_flight,
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Wait for a free slot, then start the task the closure produces.
    ///
    /// The returned task is already tracked; when it completes it leaves the
    /// in-flight set and frees its slot.
    pub async fn add<T, F>(&self, start: F) -> Task<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Task<T>,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("slot semaphore closed");

        let task = start();
        let tracked = task.as_stoppable();

        self.current.lock().push(tracked.clone());
        self.observer.fire(&SlotEvent {
            added: true,
            task: tracked.clone(),
        });

        debug!(in_flight = self.current.lock().len(), "slot task started");

        let permit_cell = Mutex::new(Some(permit));
        let current = self.current.clone();
        let observer = self.observer.clone();

        task.on_complete(move |_| {
            if let Some(permit) = permit_cell.lock().take() {
                drop(permit);

                let mut tasks = current.lock();
                if let Some(pos) = tasks.iter().position(|t| Arc::ptr_eq(t, &tracked)) {
                    tasks.remove(pos);
                }
                drop(tasks);

                observer.fire(&SlotEvent {
                    added: false,
                    task: tracked.clone(),
                });
            }
        });

        task
    }

    /// Snapshot of the tasks currently in flight
    pub fn current_tasks(&self) -> Vec<Arc<dyn Stoppable>> {
        self.current.lock().clone()
    }

    /// The observer fired on add/remove transitions
    pub fn observer(&self) -> &Observer<SlotEvent> {
        &self.observer
    }

    /// Request every in-flight task to stop
    pub fn stop_all(&self) {
        for task in self.current.lock().iter() {
            task.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_slot_bounds_concurrency() {
        let slot = TaskSlot::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..6 {
            let peak = peak.clone();
            let active = active.clone();

            let task = slot
                .add(move || {
                    Task::spawn(move |_ctx| async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .await;

            tasks.push(task);
        }

        for task in &tasks {
            task.result().await;
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_observer_sees_both_transitions() {
        let slot = TaskSlot::new(1);
        let adds = Arc::new(AtomicUsize::new(0));
        let removes = Arc::new(AtomicUsize::new(0));

        {
            let adds = adds.clone();
            let removes = removes.clone();

            slot.observer().register(move |event| {
                if event.added {
                    adds.fetch_add(1, Ordering::SeqCst);
                } else {
                    removes.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let task = slot
            .add(|| Task::spawn(|_ctx| async { 1u32 }))
            .await;
        task.result().await;

        // The removal fires from the completion observer
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(adds.load(Ordering::SeqCst), 1);
        assert_eq!(removes.load(Ordering::SeqCst), 1);
        assert!(slot.current_tasks().is_empty());
    }
}
