//! Error tallies and application counters

use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::SystemTime,
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error};

/// How loudly a tallied error is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    /// Always logged
    Error,
    /// Logged only in debug mode, always tallied
    SilentError,
    /// Logged only in debug mode
    Debug,
}

/// Counts error occurrences per tag.
#[derive(Debug, Default)]
pub struct ErrorMap {
    counts: Mutex<BTreeMap<String, u64>>,
    debug:  bool,
}

impl ErrorMap {
    pub fn new(debug: bool) -> Self {
        Self {
            counts: Mutex::new(BTreeMap::new()),
            debug,
        }
    }

    /// Tally `tag` and log according to `level`.
    pub fn log(&self, level: ErrorLevel, tag: &str, detail: impl Display) {
        {
            let mut counts = self.counts.lock();
            *counts.entry(tag.to_string()).or_insert(0) += 1;
        }
        match level {
            ErrorLevel::Error => error!(event.name = "tapper.error", tag, "{detail}"),
            ErrorLevel::SilentError | ErrorLevel::Debug if self.debug => {
                debug!(event.name = "tapper.error", tag, "{detail}")
            },
            _ => {},
        }
    }

    pub fn error(&self, tag: &str, detail: impl Display) {
        self.log(ErrorLevel::Error, tag, detail);
    }

    pub fn silent(&self, tag: &str, detail: impl Display) {
        self.log(ErrorLevel::SilentError, tag, detail);
    }

    pub fn count(&self, tag: &str) -> u64 {
        self.counts.lock().get(tag).copied().unwrap_or(0)
    }

    /// Total errors and number of distinct tags
    pub fn totals(&self) -> (u64, usize) {
        let counts = self.counts.lock();
        (counts.values().sum(), counts.len())
    }

    /// `(errors: N, errTypes: K) - Errors Summary: {tag: count, ...}`
    pub fn summary(&self) -> String {
        let counts = self.counts.lock();
        let total: u64 = counts.values().sum();
        let body = counts
            .iter()
            .map(|(tag, n)| format!("{tag}: {n}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "(errors: {total}, errTypes: {}) - Errors Summary: {{{body}}}",
            counts.len()
        )
    }
}

/// Process-wide counters; `dump_stats` returns and resets them.
#[derive(Debug)]
pub struct AppStats {
    start_time:                     SystemTime,
    matched_messages:               AtomicU64,
    total_packets:                  AtomicU64,
    total_processed_bytes:          AtomicU64,
    reassembled_tcp_payloads_count: AtomicU64,
    tls_connections_count:          AtomicU64,
    tcp_packets_count:              AtomicU64,
    ignored_packets_count:          AtomicU64,
    dropped_packets_count:          AtomicU64,
    dropped_tcp_streams:            AtomicU64,
    /// Gauge: not reset by `dump_stats`
    live_tcp_streams:               AtomicI64,
}

impl Default for AppStats {
    fn default() -> Self {
        Self {
            start_time:                     SystemTime::now(),
            matched_messages:               AtomicU64::new(0),
            total_packets:                  AtomicU64::new(0),
            total_processed_bytes:          AtomicU64::new(0),
            reassembled_tcp_payloads_count: AtomicU64::new(0),
            tls_connections_count:          AtomicU64::new(0),
            tcp_packets_count:              AtomicU64::new(0),
            ignored_packets_count:          AtomicU64::new(0),
            dropped_packets_count:          AtomicU64::new(0),
            dropped_tcp_streams:            AtomicU64::new(0),
            live_tcp_streams:               AtomicI64::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatsSnapshot {
    #[serde(with = "unix_millis")]
    pub start_time:                     SystemTime,
    pub matched_messages:               u64,
    pub total_packets:                  u64,
    pub total_processed_bytes:          u64,
    pub reassembled_tcp_payloads_count: u64,
    pub tls_connections_count:          u64,
    pub tcp_packets_count:              u64,
    pub ignored_packets_count:          u64,
    pub dropped_packets_count:          u64,
    pub dropped_tcp_streams:            u64,
    pub live_tcp_streams:               i64,
}

mod unix_millis {
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde::Serializer;

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let ms = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        s.serialize_u64(ms)
    }
}

impl AppStats {
    pub fn inc_matched_messages(&self) {
        self.matched_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// One captured packet of `bytes` length
    pub fn add_packet(&self, bytes: usize) {
        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_processed_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_reassembled_payloads(&self) {
        self.reassembled_tcp_payloads_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tls_connections(&self) {
        self.tls_connections_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tcp_packets(&self) {
        self.tcp_packets_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ignored_packets(&self) {
        self.ignored_packets_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_packets(&self) {
        self.dropped_packets_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_tcp_streams(&self) {
        self.dropped_tcp_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_live_streams(&self) {
        self.live_tcp_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_live_streams(&self) {
        self.live_tcp_streams.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current values without resetting.
    pub fn snapshot(&self) -> AppStatsSnapshot {
        self.collect(|c| c.load(Ordering::Relaxed))
    }

    /// Current values; counters restart from zero, the start time and the
    /// live stream gauge are kept.
    pub fn dump_stats(&self) -> AppStatsSnapshot {
        self.collect(|c| c.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> AppStatsSnapshot {
        AppStatsSnapshot {
            start_time:                     self.start_time,
            matched_messages:               read(&self.matched_messages),
            total_packets:                  read(&self.total_packets),
            total_processed_bytes:          read(&self.total_processed_bytes),
            reassembled_tcp_payloads_count: read(&self.reassembled_tcp_payloads_count),
            tls_connections_count:          read(&self.tls_connections_count),
            tcp_packets_count:              read(&self.tcp_packets_count),
            ignored_packets_count:          read(&self.ignored_packets_count),
            dropped_packets_count:          read(&self.dropped_packets_count),
            dropped_tcp_streams:            read(&self.dropped_tcp_streams),
            live_tcp_streams:               self.live_tcp_streams.load(Ordering::Relaxed),
        }
    }
}

/// Error map and counters shared by every pipeline stage.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub errors: ErrorMap,
    pub stats:  AppStats,
}

impl Diagnostics {
    pub fn new(debug: bool) -> Self {
        Self {
            errors: ErrorMap::new(debug),
            stats:  AppStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_map_summary_format() {
        let map = ErrorMap::new(false);
        map.silent("Request-Duplicate", "dup");
        map.silent("Request-Duplicate", "dup");
        map.silent("FSM-rejection", "bad state");

        assert_eq!(map.count("Request-Duplicate"), 2);
        assert_eq!(map.totals(), (3, 2));
        assert_eq!(
            map.summary(),
            "(errors: 3, errTypes: 2) - Errors Summary: {FSM-rejection: 1, Request-Duplicate: 2}"
        );
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(
            ErrorMap::default().summary(),
            "(errors: 0, errTypes: 0) - Errors Summary: {}"
        );
    }

    #[test]
    fn test_dump_stats_resets_counters_but_not_gauge() {
        let stats = AppStats::default();
        stats.add_packet(100);
        stats.add_packet(50);
        stats.inc_matched_messages();
        stats.inc_live_streams();

        let first = stats.dump_stats();
        assert_eq!(first.total_packets, 2);
        assert_eq!(first.total_processed_bytes, 150);
        assert_eq!(first.matched_messages, 1);
        assert_eq!(first.live_tcp_streams, 1);

        let second = stats.dump_stats();
        assert_eq!(second.total_packets, 0);
        assert_eq!(second.live_tcp_streams, 1);
        assert_eq!(second.start_time, first.start_time);
    }
}
