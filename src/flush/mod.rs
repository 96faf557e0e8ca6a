//! Deferred disk writes.
//!
//! The registry only queues closed windows; [`FlushScheduler`] writes them in
//! the background, woken by the registry or by its own roll-over ticker.

pub mod scheduler;

pub use scheduler::{FlushScheduler, FlushStats, SchedulerConfig};
