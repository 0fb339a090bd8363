//! Periodic stats report

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tap_api::{AppStatsSnapshot, Diagnostics};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    assembler::{Assembler, AssemblerStats, StreamFactory},
    capture::{SourceManager, SourceStats},
    cleaner::{Cleaner, CleanerStats},
    reader::ReaderPool,
    registry::{RegistryCounts, StreamRegistry},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub name:  String,
    #[serde(flatten)]
    pub stats: SourceStats,
}

/// One stats line. Counters in `app` and `cleaner` cover the interval since
/// the previous report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub app:                AppStatsSnapshot,
    pub assembler:          AssemblerStats,
    pub cleaner:            CleanerStats,
    pub registry:           RegistryCounts,
    pub live_readers:       usize,
    pub unmatched_messages: usize,
    pub sources:            Vec<SourceReport>,
    pub errors:             u64,
    pub error_types:        usize,
}

pub struct StatsReporter<F: StreamFactory> {
    pub diagnostics: Arc<Diagnostics>,
    pub assembler:   Arc<Assembler<F>>,
    pub cleaner:     Arc<Cleaner<F>>,
    pub registry:    Arc<StreamRegistry>,
    pub readers:     Arc<ReaderPool>,
    pub sources:     Arc<SourceManager>,
}

impl<F: StreamFactory + 'static> StatsReporter<F> {
    /// Collect a report, resetting the interval counters.
    pub fn collect(&self) -> StatsReport {
        let (errors, error_types) = self.diagnostics.errors.totals();
        StatsReport {
            app: self.diagnostics.stats.dump_stats(),
            assembler: self.assembler.stats(),
            cleaner: self.cleaner.take_stats(),
            registry: self.registry.counts(),
            live_readers: self.readers.live(),
            unmatched_messages: self.registry.unmatched(),
            sources: self
                .sources
                .stats()
                .into_iter()
                .map(|(name, stats)| SourceReport {
                    name: name.to_string(),
                    stats,
                })
                .collect(),
            errors,
            error_types,
        }
    }

    pub fn report(&self) -> StatsReport {
        let report = self.collect();
        let rendered = serde_json::to_string(&report).unwrap_or_default();
        info!(
            event.name = "stats.report",
            live_streams = report.app.live_tcp_streams,
            matched = report.app.matched_messages,
            packets = report.app.total_packets,
            stats = %rendered,
            "{}",
            self.diagnostics.errors.summary()
        );
        report
    }

    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.report();
                }
            }
        }
    }
}
