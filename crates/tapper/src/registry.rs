//! Live stream registry and unidentified-stream collection

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;
use tap_api::Diagnostics;
use tracing::debug;

use crate::stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// FIN/RST or idle flush
    Finished,
    /// Never identified a protocol in time
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCounts {
    pub created: u64,
    pub closed:  u64,
    pub dropped: u64,
    pub live:    u64,
    pub next_id: i64,
}

/// Every tapped stream, keyed by id. Each stored stream is removed exactly
/// once, by whichever of FIN, idle flush, GC or shutdown gets there first.
pub struct StreamRegistry {
    streams:     DashMap<i64, Arc<Stream>>,
    next_id:     AtomicI64,
    created:     AtomicU64,
    closed:      AtomicU64,
    dropped:     AtomicU64,
    diagnostics: Arc<Diagnostics>,
}

impl StreamRegistry {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            streams: DashMap::new(),
            next_id: AtomicI64::new(1),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            diagnostics,
        }
    }

    /// Reserve the next stream id.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn store(&self, stream: Arc<Stream>) {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.diagnostics.stats.inc_live_streams();
        self.streams.insert(stream.id, stream);
    }

    pub fn get(&self, id: i64) -> Option<Arc<Stream>> {
        self.streams.get(&id).map(|s| s.value().clone())
    }

    /// Remove and close a stream. Returns false when it was already gone.
    pub fn close(&self, id: i64, reason: CloseReason) -> bool {
        let Some((_, stream)) = self.streams.remove(&id) else {
            return false;
        };
        stream.close();
        self.diagnostics.stats.dec_live_streams();
        match reason {
            CloseReason::Finished => {
                self.closed.fetch_add(1, Ordering::Relaxed);
            },
            CloseReason::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.diagnostics.stats.inc_dropped_tcp_streams();
            },
        }
        true
    }

    /// Close streams that have not identified a protocol within `timeout`
    /// of their creation.
    pub fn collect_unidentified(&self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<i64> = self
            .streams
            .iter()
            .filter(|s| {
                s.protocol().is_none() && now.saturating_duration_since(s.created_at) > timeout
            })
            .map(|s| s.id)
            .collect();
        let mut dropped = 0;
        for id in expired {
            if self.close(id, CloseReason::Dropped) {
                debug!(event.name = "stream.dropped", stream = id, "unidentified stream dropped");
                dropped += 1;
            }
        }
        dropped
    }

    /// Remove matcher entries stored before `cutoff` across every stream.
    pub fn delete_matches_older_than(&self, cutoff: Instant) -> usize {
        self.streams
            .iter()
            .map(|s| s.delete_matches_older_than(cutoff))
            .sum()
    }

    /// Messages waiting for their other half across every stream
    pub fn unmatched(&self) -> usize {
        self.streams.iter().map(|s| s.unmatched()).sum()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.streams.iter().map(|s| *s.key()).collect()
    }

    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            created: self.created.load(Ordering::Relaxed),
            closed:  self.closed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            live:    self.streams.len() as u64,
            next_id: self.next_id.load(Ordering::Relaxed),
        }
    }
}
