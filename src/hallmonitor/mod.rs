//! Metadata maintenance lane: leased queues, refresh cadence, worker pool.

pub mod cadence;
pub mod queue;
pub mod worker;

pub use queue::{CatalogQueue, Enqueuer, QueueJob};
pub use worker::{HallmonitorPool, PoolStats};
