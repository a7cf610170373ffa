//! Background progress monitor for long backfill runs.
//!
//! Periodically logs pipeline counters (hours finished, events scanned,
//! utterances and hits written) so operators can track a multi-day backfill
//! without parsing per-hour log lines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

/// Shared atomic counters incremented by the runner.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    hours_done: AtomicU64,
    hours_failed: AtomicU64,
    events: AtomicU64,
    utterances: AtomicU64,
    hits: AtomicU64,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hour_done(&self, ok: bool) {
        if ok {
            self.inner.hours_done.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.hours_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_events(&self, n: u64) {
        self.inner.events.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_utterances(&self, n: u64) {
        self.inner.utterances.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_hits(&self, n: u64) {
        self.inner.hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.inner.hours_done.load(Ordering::Relaxed),
            self.inner.hours_failed.load(Ordering::Relaxed),
            self.inner.events.load(Ordering::Relaxed),
            self.inner.utterances.load(Ordering::Relaxed),
            self.inner.hits.load(Ordering::Relaxed),
        )
    }
}

/// Spawned logger that wakes every `interval` and summarizes progress.
pub struct ProgressMonitor {
    handle: JoinHandle<()>,
}

impl ProgressMonitor {
    pub fn spawn(counters: ProgressCounters, interval: Duration) -> Self {
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let (done, failed, events, utterances, hits) = counters.snapshot();
                info!(
                    hours_done = done,
                    hours_failed = failed,
                    events,
                    utterances,
                    hits,
                    elapsed_secs = started.elapsed().as_secs(),
                    "backfill progress"
                );
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = ProgressCounters::new();
        counters.hour_done(true);
        counters.hour_done(false);
        counters.add_events(3);
        counters.add_utterances(5);
        counters.add_hits(1);
        assert_eq!(counters.snapshot(), (1, 1, 3, 5, 1));
    }

    #[test]
    fn clones_share_state() {
        let counters = ProgressCounters::new();
        let clone = counters.clone();
        clone.add_events(7);
        assert_eq!(counters.snapshot().2, 7);
    }
}
