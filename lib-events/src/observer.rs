//! Observer fan-out
//!
//! A callback manager. A one-shot observer fires at most once and replays
//! its captured value to any later subscriber, which is what gives task
//! completion its at-most-once semantics.

use parking_lot::Mutex;
use std::sync::Arc;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ObserverState<T> {
    callbacks: Vec<Callback<T>>,
    one_shot: bool,
    fired: Option<T>,
}

/// A callback manager
pub struct Observer<T: Clone> {
    state: Mutex<ObserverState<T>>,
}

impl<T: Clone> Observer<T> {
    pub fn new() -> Self {
        Observer {
            state: Mutex::new(ObserverState {
                callbacks: Vec::new(),
                one_shot: false,
                fired: None,
            }),
        }
    }

    /// Create an observer that captures its first activation and replays it
    /// to late subscribers
    pub fn new_one_shot() -> Self {
        Observer {
            state: Mutex::new(ObserverState {
                callbacks: Vec::new(),
                one_shot: true,
                fired: None,
            }),
        }
    }

    /// Register a callback function.
    ///
    /// If the observer is one-shot and already fired, the callback is called
    /// synchronously with the captured value.
    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);

        let replay = {
            let mut state = self.state.lock();
            state.callbacks.push(callback.clone());

            if state.one_shot {
                state.fired.clone()
            } else {
                None
            }
        };

        if let Some(value) = replay {
            callback(&value);
        }
    }

    /// Execute all registered callbacks with the value
    pub fn fire(&self, value: &T) {
        let callbacks = {
            let mut state = self.state.lock();

            if state.one_shot {
                if state.fired.is_some() {
                    return;
                }

                state.fired = Some(value.clone());
            }

            state.callbacks.clone()
        };

        for callback in callbacks {
            callback(value);
        }
    }

    /// Whether the observer has fired at least once
    pub fn has_fired(&self) -> bool {
        self.state.lock().fired.is_some()
    }
}

impl<T: Clone> Default for Observer<T> {
    fn default() -> Self {
        Observer::new()
    }
}
