//! Future-like tasks
//!
//! A [`Task`] wraps a unit of work with a one-shot result, a progress
//! counter, and a cooperative stop flag. Tasks form a hook relation: a
//! parent propagates `stop` to hooked children and receives their progress
//! updates. Completion observers registered after the fact receive the
//! stored result synchronously.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Type-erased view of a task, used for stop propagation and monitoring
pub trait Stoppable: Send + Sync {
    /// Request the task to stop cooperatively
    fn stop(&self);

    /// Whether the task has not yet been asked to stop or finished
    fn is_running(&self) -> bool;

    /// Whether the task has produced its result
    fn is_finished(&self) -> bool;

    /// The progress made so far
    fn progress(&self) -> u64;
}

trait ProgressSink: Send + Sync {
    fn push_progress(&self, value: u64);
}

trait HookList: Send + Sync {
    fn add_hooked(&self, child: Arc<dyn Stoppable>);
}

struct TaskShared<T> {
    running: AtomicBool,
    finished: AtomicBool,
    progress: AtomicU64,
    result: Mutex<Option<T>>,
    observers: Mutex<Vec<Arc<dyn Fn(&T) + Send + Sync>>>,
    hooked: Mutex<Vec<Arc<dyn Stoppable>>>,
    parents: Mutex<Vec<Weak<dyn ProgressSink>>>,
    done: Notify,
}

impl<T: Send + Clone> TaskShared<T> {
    fn new() -> Self {
        TaskShared {
            running: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            progress: AtomicU64::new(0),
            result: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            hooked: Mutex::new(Vec::new()),
            parents: Mutex::new(Vec::new()),
            done: Notify::new(),
        }
    }

    fn complete(&self, result: T) {
        *self.result.lock() = Some(result);
        self.finished.store(true, Ordering::SeqCst);

        // Drain under the lock so a racing registration is either drained
        // here or replayed there, never both
        let observers = std::mem::take(&mut *self.observers.lock());
        self.running.store(false, Ordering::SeqCst);

        if !observers.is_empty() {
            let value = self.result.lock().clone();

            if let Some(value) = value {
                for observer in observers {
                    observer(&value);
                }
            }
        }

        self.done.notify_waiters();
    }

    fn set_progress(&self, value: u64) {
        self.progress.store(value, Ordering::SeqCst);

        for parent in self.parents.lock().iter() {
            if let Some(parent) = parent.upgrade() {
                parent.push_progress(value);
            }
        }
    }
}

impl<T: Send> Stoppable for TaskShared<T> {
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let hooked = self.hooked.lock().clone();

        for child in hooked {
            child.stop();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn progress(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }
}

impl<T: Send + Clone> ProgressSink for TaskShared<T> {
    fn push_progress(&self, value: u64) {
        self.set_progress(value);
    }
}

impl<T: Send> HookList for TaskShared<T> {
    fn add_hooked(&self, child: Arc<dyn Stoppable>) {
        self.hooked.lock().push(child);
    }
}

/// Handle passed to a task body for cooperative scheduling
pub struct TaskContext {
    control: Arc<dyn Stoppable>,
    sink: Arc<dyn ProgressSink>,
    hooks: Arc<dyn HookList>,
}

impl TaskContext {
    /// Whether the task should keep going. Bodies poll this between steps.
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Update the progress counter, propagating to hooking parents
    pub fn set_progress(&self, value: u64) {
        self.sink.push_progress(value);
    }

    /// Hook a child task: stop requests propagate to it, and its progress
    /// updates flow back into this task
    pub fn hook<U: Clone + Send + 'static>(&self, child: &Task<U>) {
        self.hooks.add_hooked(child.shared.clone());
        child.shared.parents.lock().push(Arc::downgrade(&self.sink));
    }
}

/// A future-like unit of work with result, progress, and cooperative stop
pub struct Task<T: Clone + Send + 'static> {
    shared: Arc<TaskShared<T>>,
}

impl<T: Clone + Send + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Spawn a task body onto the runtime and return its handle.
    ///
    /// The body receives a [`TaskContext`] and must poll
    /// [`TaskContext::is_running`] between steps; its return value becomes
    /// the task result.
    pub fn spawn<F, Fut>(body: F) -> Task<T>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = Arc::new(TaskShared::new());

        let context = TaskContext {
            control: shared.clone(),
            sink: shared.clone(),
            hooks: shared.clone(),
        };

        {
            let shared = shared.clone();

            tokio::spawn(async move {
                let result = body(context).await;
                shared.complete(result);
            });
        }

        Task { shared }
    }

    /// Create an already-completed task
    pub fn completed(result: T) -> Task<T> {
        let shared = Arc::new(TaskShared::new());
        shared.complete(result);

        Task { shared }
    }

    /// Request the task and its hooked children to stop
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// The progress made so far
    pub fn progress(&self) -> u64 {
        self.shared.progress()
    }

    /// Register a completion observer.
    ///
    /// At-most-one-shot semantics: if the task already finished, the
    /// callback runs synchronously with the stored result.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Arc<dyn Fn(&T) + Send + Sync> = Arc::new(callback);

        let replay = {
            let mut observers = self.shared.observers.lock();

            if self.shared.is_finished() {
                self.shared.result.lock().clone()
            } else {
                observers.push(callback.clone());
                None
            }
        };

        if let Some(value) = replay {
            callback(&value);
        }
    }

    /// Wait for the task to finish and return a copy of its result
    pub async fn result(&self) -> T {
        loop {
            let notified = self.shared.done.notified();

            if self.shared.is_finished() {
                return self
                    .shared
                    .result
                    .lock()
                    .clone()
                    .expect("finished task has a result");
            }

            notified.await;
        }
    }

    /// The result, if the task has finished
    pub fn try_result(&self) -> Option<T> {
        if self.shared.is_finished() {
            self.shared.result.lock().clone()
        } else {
            None
        }
    }

    /// A type-erased handle for slot tracking and monitors
    pub fn as_stoppable(&self) -> Arc<dyn Stoppable> {
        self.shared.clone()
    }

    /// Hook a child from outside the body (used by drivers that fan out)
    pub fn hook<U: Clone + Send + 'static>(&self, child: &Task<U>) {
        self.shared.hooked.lock().push(child.shared.clone());

        let sink: Arc<dyn ProgressSink> = self.shared.clone();
        child.shared.parents.lock().push(Arc::downgrade(&sink));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_result_round_trip() {
        let task = Task::spawn(|_ctx| async { 41 + 1 });

        assert_eq!(task.result().await, 42);
        assert!(task.is_finished());
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_late_observer_replays() {
        let task = Task::spawn(|_ctx| async { "done".to_string() });
        task.result().await;

        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            task.on_complete(move |v| *seen.lock() = Some(v.clone()));
        }

        assert_eq!(seen.lock().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_cooperative_stop() {
        let task = Task::spawn(|ctx| async move {
            let mut steps = 0u64;

            while ctx.is_running() && steps < 1000 {
                steps += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            steps
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        task.stop();

        let steps = task.result().await;
        assert!(steps < 1000);
    }

    #[tokio::test]
    async fn test_stop_propagates_to_hooked_child() {
        let child = Task::spawn(|ctx| async move {
            while ctx.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            true
        });

        let parent = Task::spawn(|_ctx| async {});
        parent.hook(&child);

        parent.stop();
        assert!(child.result().await);
    }

    #[tokio::test]
    async fn test_context_hook_propagates_stop() {
        let parent = Task::spawn(|ctx| async move {
            let child = Task::spawn(|child_ctx| async move {
                while child_ctx.is_running() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }

                "stopped".to_string()
            });

            ctx.hook(&child);
            child.result().await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        parent.stop();

        assert_eq!(parent.result().await, "stopped");
    }

    #[tokio::test]
    async fn test_progress_flows_to_parent() {
        let parent = Task::spawn(|ctx| async move {
            while ctx.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let child = Task::spawn(|ctx| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.set_progress(128);
        });

        parent.hook(&child);
        child.result().await;

        assert_eq!(child.progress(), 128);
        assert_eq!(parent.progress(), 128);
        parent.stop();
    }

    #[tokio::test]
    async fn test_completed_constructor() {
        let task = Task::completed(7u64);

        assert!(task.is_finished());
        assert_eq!(task.try_result(), Some(7));
        assert_eq!(task.result().await, 7);
    }
}
