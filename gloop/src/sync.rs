//! In-process primitives: waiting strategy and the worker-to-event-loop queue.

pub mod backoff;
pub mod mpsc;

pub use backoff::Backoff;
