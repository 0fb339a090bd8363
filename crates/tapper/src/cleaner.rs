//! Periodic idle-flow flush, matcher expiry and unidentified-stream GC

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    assembler::{Assembler, StreamFactory},
    registry::StreamRegistry,
};

/// What the cleaner did since the last report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanerStats {
    pub flushed: usize,
    pub closed:  usize,
    pub deleted: usize,
}

pub struct Cleaner<F: StreamFactory> {
    assembler:          Arc<Assembler<F>>,
    registry:           Arc<StreamRegistry>,
    connection_timeout: Duration,
    totals:             Mutex<CleanerStats>,
}

impl<F: StreamFactory + 'static> Cleaner<F> {
    pub fn new(
        assembler: Arc<Assembler<F>>,
        registry: Arc<StreamRegistry>,
        connection_timeout: Duration,
    ) -> Self {
        Self {
            assembler,
            registry,
            connection_timeout,
            totals: Mutex::new(CleanerStats::default()),
        }
    }

    /// One cleaning cycle at `now`.
    pub fn clean(&self, now: Instant) -> CleanerStats {
        // Nothing can be older than the process itself
        let Some(cutoff) = now.checked_sub(self.connection_timeout) else {
            return CleanerStats::default();
        };
        let flush = self.assembler.flush_older_than(cutoff);
        let deleted = self.registry.delete_matches_older_than(cutoff);
        let cycle = CleanerStats {
            flushed: flush.flushed,
            closed: flush.closed,
            deleted,
        };

        let mut totals = self.totals.lock();
        totals.flushed += cycle.flushed;
        totals.closed += cycle.closed;
        totals.deleted += cycle.deleted;
        debug!(
            event.name = "cleaner.cycle",
            flushed = cycle.flushed,
            closed = cycle.closed,
            deleted = cycle.deleted,
            "cleaner cycle finished"
        );
        cycle
    }

    /// Counts accumulated since the previous call; resets them.
    pub fn take_stats(&self) -> CleanerStats {
        std::mem::take(&mut *self.totals.lock())
    }

    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let cleaner = self.clone();
                    let joined = tokio::task::spawn_blocking(move || {
                        cleaner.clean(Instant::now());
                    })
                    .await;
                    if joined.is_err() {
                        break;
                    }
                }
            }
        }
        info!(event.name = "cleaner.stopped", "cleaner stopped");
    }
}

/// Drop streams that failed to identify a protocol within `timeout`,
/// checking every `interval`.
pub async fn collect_streams(
    registry: Arc<StreamRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let dropped = registry.collect_unidentified(Instant::now(), timeout);
                if dropped > 0 {
                    debug!(event.name = "registry.collected", dropped, "unidentified streams closed");
                }
            }
        }
    }
}
