#![deny(unsafe_code)]

//! Component runtime for the courier messaging framework.
//!
//! A [`Component`] is a single-threaded cooperative executor: it owns a
//! blocking priority [`MessageQueue`], a handler registry keyed by message
//! type, and a [`TimerManager`]. Concurrency between components is coarse
//! message passing; within a component, handlers never race each other.

mod component;
mod queue;
mod timer;

pub use component::{Component, PostError, StopMessage};
pub use queue::{MessageQueue, QueueClosed, DEFAULT_PRIORITY, TIMEOUT_PRIORITY};
pub use timer::{TimeoutMessage, TimerId, TimerManager};
