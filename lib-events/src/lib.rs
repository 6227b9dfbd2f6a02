//! Bytestag Event Runtime
//!
//! The shared machinery every long-lived component is built on: a typed
//! event reactor, a deadline scheduler, future-like tasks with cooperative
//! stop, observer fan-out, a bounded work slot, and a disk-spilled queue.
//!
//! The reactor is a shared, reference-counted context value passed into
//! component constructors; components hold it non-owningly and communicate
//! through typed events rather than free-form callbacks.

pub mod observer;
pub mod queue;
pub mod reactor;
pub mod scheduler;
pub mod slot;
pub mod task;

pub use observer::Observer;
pub use queue::{BigDiskQueue, QueueError};
pub use reactor::{Event, EventError, EventId, EventPayload, EventReactor};
pub use scheduler::EventScheduler;
pub use slot::{SlotEvent, TaskSlot};
pub use task::{Stoppable, Task, TaskContext};

/// Default bound of the reactor event queue
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Default number of tasks a slot lets run at once
pub const DEFAULT_SLOT_SIZE: usize = 3;
