//! Wiring: capture sources feed the packet loop, the packet loop feeds the
//! assembler, readers feed the emitter. Background tasks clean, collect,
//! report and talk to the API server until the shutdown token fires.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use tap_api::Diagnostics;
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    assembler::Assembler,
    capture::{CaptureError, PACKET_CHANNEL_CAPACITY, PacketInfo, SourceManager},
    cleaner::{Cleaner, collect_streams},
    config::TapperConfig,
    control::{ControlClient, ControlHandler},
    emitter::{ChannelEmitter, EmitterOutput, LINE_BUFFER, Line, serve_lines},
    factory::TapStreamFactory,
    har::{HarError, HarWriter},
    packet::{Decoded, PacketDecoder},
    reader::{ReaderContext, ReaderPool},
    registry::StreamRegistry,
    stats::StatsReporter,
    target::TargetPolicy,
};

/// How long readers and the emitter get to finish at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const FRAGMENT_EXPIRY_EVERY: Duration = Duration::from_secs(1);
const PACKET_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),
    #[error("har output: {0}")]
    Har(#[from] HarError),
    #[error("{op}: {source}")]
    Io {
        op:     &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { op, source }
    }

    /// Tag logged with a fatal error.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Capture(_) => "Capture-Init",
            Self::Har(_) => "HAR-Init",
            Self::Io { .. } => "Startup",
        }
    }
}

/// Decodes captured frames and hands TCP segments to the assembler.
pub struct PacketProcessor {
    decoder:     PacketDecoder,
    assembler:   Arc<Assembler<TapStreamFactory>>,
    policy:      Arc<TargetPolicy>,
    diagnostics: Arc<Diagnostics>,
    last_expiry: Instant,
}

impl PacketProcessor {
    pub fn process(&mut self, info: &PacketInfo, now: Instant) {
        let stats = &self.diagnostics.stats;
        stats.add_packet(info.packet.data.len());

        match self.decoder.decode(&info.packet, now) {
            Ok(Decoded::Segment(segment)) => {
                if self.policy.is_ignored(segment.src_port, segment.dst_port) {
                    stats.inc_ignored_packets();
                } else {
                    stats.inc_tcp_packets();
                    self.assembler.assemble(segment, info.capture, now);
                }
            },
            Ok(Decoded::Fragment) => {},
            Ok(Decoded::Other) => stats.inc_ignored_packets(),
            Err(e) => self
                .diagnostics
                .errors
                .silent("Packet-Decode", format_args!("{}: {e}", info.source)),
        }

        if now.saturating_duration_since(self.last_expiry) >= FRAGMENT_EXPIRY_EVERY {
            self.decoder.expire_fragments(now);
            self.last_expiry = now;
        }
    }

    /// Process packets until `cancel` fires, then whatever is still queued.
    fn run(mut self, packets: Receiver<PacketInfo>, cancel: CancellationToken) {
        let mut processed = 0u64;
        while !cancel.is_cancelled() {
            match packets.recv_timeout(PACKET_POLL) {
                Ok(info) => {
                    self.process(&info, Instant::now());
                    processed += 1;
                },
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for info in packets.try_iter() {
            self.process(&info, Instant::now());
            processed += 1;
        }
        info!(event.name = "packets.loop_stopped", processed, "packet loop stopped");
    }
}

/// What the final shutdown did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub streams_closed:    usize,
    /// Readers still running when the grace period ran out
    pub readers_abandoned: usize,
    pub published:         usize,
}

/// The assembled tapper, ready to receive packets.
pub struct Pipeline {
    config:      TapperConfig,
    diagnostics: Arc<Diagnostics>,
    policy:      Arc<TargetPolicy>,
    registry:    Arc<StreamRegistry>,
    readers:     Arc<ReaderPool>,
    assembler:   Arc<Assembler<TapStreamFactory>>,
    cleaner:     Arc<Cleaner<TapStreamFactory>>,
    output:      EmitterOutput,
    lines:       broadcast::Sender<Line>,
    processor:   PacketProcessor,
}

impl Pipeline {
    pub fn new(config: TapperConfig, diagnostics: Arc<Diagnostics>) -> Result<Self, PipelineError> {
        let policy = Arc::new(TargetPolicy::new(&config));
        Self::with_policy(config, policy, diagnostics)
    }

    pub fn with_policy(
        config: TapperConfig,
        policy: Arc<TargetPolicy>,
        diagnostics: Arc<Diagnostics>,
    ) -> Result<Self, PipelineError> {
        info!(
            event.name = "config.http2_limit",
            bytes = config.http2_data_size_limit,
            "HTTP/2 body size limit"
        );
        let dissectors = tap_dissectors::all_dissectors(config.http2_data_size_limit);
        for dissector in &dissectors {
            dissector.ping();
        }

        let (emitter, exchanges) = ChannelEmitter::new(policy.clone(), diagnostics.clone());
        let har = match &config.har {
            Some(har) => Some(HarWriter::new(&har.dir, har.max_entries)?),
            None => None,
        };
        let (lines, _) = broadcast::channel(LINE_BUFFER);
        let output = EmitterOutput::spawn(exchanges, har, lines.clone(), diagnostics.clone())
            .map_err(PipelineError::io("spawn emitter output"))?;

        let registry = Arc::new(StreamRegistry::new(diagnostics.clone()));
        let readers = Arc::new(ReaderPool::default());
        let context = ReaderContext {
            dissectors:  Arc::new(dissectors),
            emitter:     Arc::new(emitter),
            options:     Arc::new(config.filtering.clone()),
            diagnostics: diagnostics.clone(),
        };
        let factory = TapStreamFactory::new(
            registry.clone(),
            policy.clone(),
            readers.clone(),
            context,
            config.max_live_streams,
        );
        let assembler = Arc::new(Assembler::new(
            factory,
            config.assembler.clone(),
            diagnostics.clone(),
        ));
        let cleaner = Arc::new(Cleaner::new(
            assembler.clone(),
            registry.clone(),
            config.connection_timeout,
        ));
        let processor = PacketProcessor {
            decoder: PacketDecoder::new(
                config.ipdefrag,
                config.assembler.checksum,
                diagnostics.clone(),
            ),
            assembler: assembler.clone(),
            policy: policy.clone(),
            diagnostics: diagnostics.clone(),
            last_expiry: Instant::now(),
        };

        Ok(Self {
            config,
            diagnostics,
            policy,
            registry,
            readers,
            assembler,
            cleaner,
            output,
            lines,
            processor,
        })
    }

    /// Receive every exchange published from now on as a JSON line.
    pub fn subscribe(&self) -> broadcast::Receiver<Line> {
        self.lines.subscribe()
    }

    pub fn policy(&self) -> &Arc<TargetPolicy> {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn assembler(&self) -> &Arc<Assembler<TapStreamFactory>> {
        &self.assembler
    }

    pub fn cleaner(&self) -> &Arc<Cleaner<TapStreamFactory>> {
        &self.cleaner
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Feed one packet synchronously.
    pub fn process(&mut self, info: &PacketInfo, now: Instant) {
        self.processor.process(info, now);
    }

    /// Close every stream, let readers finish and drain the emitter.
    pub fn shutdown(self, grace: Duration) -> Result<ShutdownSummary, PipelineError> {
        finish(self.assembler, &self.readers, self.output, grace)
    }

    /// Capture and process until `shutdown` fires or a replayed file ends.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ShutdownSummary, PipelineError> {
        let Self {
            config,
            diagnostics,
            policy,
            registry,
            readers,
            assembler,
            cleaner,
            output,
            lines,
            processor,
        } = self;

        let listener = match config.web_socket_port {
            Some(port) => {
                let bound = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await;
                match bound {
                    Ok(listener) => Some(listener),
                    Err(e) => {
                        let _ = finish(assembler, &readers, output, Duration::ZERO);
                        return Err(PipelineError::io("bind line listener")(e));
                    },
                }
            },
            None => None,
        };

        let (tx, packets) = channel::bounded(PACKET_CHANNEL_CAPACITY);
        let sources = Arc::new(SourceManager::new(
            tx,
            &config.interface,
            &config.procfs,
            config.service_mesh,
            shutdown.child_token(),
            diagnostics.clone(),
        ));
        let filter = policy.bpf_filter();
        if let Some(filter) = &filter {
            info!(event.name = "capture.filter", filter, "initial capture filter");
        }
        if let Err(e) = sources.open_host(config.pcap_file.as_deref(), filter.as_deref()) {
            // Nothing will ever be captured; release what is already running
            let _ = finish(assembler, &readers, output, Duration::ZERO);
            return Err(e.into());
        }
        if config.service_mesh {
            let sources = sources.clone();
            let pods = policy.pods();
            let filter = filter.clone();
            tokio::task::spawn_blocking(move || sources.sync_sidecars(&pods, filter.as_deref()));
        }

        let loop_cancel = CancellationToken::new();
        let packet_loop = spawn_packet_loop(processor, packets, loop_cancel.clone())?;

        let mut tasks = JoinSet::new();
        let tasks_cancel = shutdown.child_token();
        tasks.spawn(
            cleaner
                .clone()
                .run(config.clean_period, tasks_cancel.clone()),
        );
        tasks.spawn(collect_streams(
            registry.clone(),
            config.close_timed_out_interval,
            config.stream_channel_timeout,
            tasks_cancel.clone(),
        ));
        let reporter = Arc::new(StatsReporter {
            diagnostics: diagnostics.clone(),
            assembler:   assembler.clone(),
            cleaner:     cleaner.clone(),
            registry:    registry.clone(),
            readers:     readers.clone(),
            sources:     sources.clone(),
        });
        tasks.spawn(reporter.clone().run(config.stats_every, tasks_cancel.clone()));
        if let Some(listener) = listener {
            tasks.spawn(serve_lines(
                listener,
                lines.clone(),
                diagnostics.clone(),
                tasks_cancel.clone(),
            ));
        }
        if let Some(address) = config.api_server_address.clone() {
            let handler = Arc::new(ControlHandler::new(policy.clone(), Some(sources.clone())));
            let client = ControlClient::new(address, handler, lines.clone(), diagnostics.clone());
            tasks.spawn(client.run(tasks_cancel.clone()));
        }

        let host_ended = sources.host_ended();
        tokio::select! {
            _ = shutdown.cancelled() => info!(event.name = "tapper.interrupted", "shutting down"),
            _ = host_ended.cancelled() => info!(event.name = "capture.finished", "capture input exhausted"),
        }
        tasks_cancel.cancel();

        // Sources first so the packet loop sees everything they captured
        let stopping = sources.clone();
        let _ = tokio::task::spawn_blocking(move || stopping.close()).await;
        loop_cancel.cancel();
        let _ = tokio::task::spawn_blocking(move || packet_loop.join()).await;

        let summary = tokio::task::spawn_blocking(move || {
            finish(assembler, &readers, output, SHUTDOWN_GRACE)
        })
        .await
        .map_err(|e| PipelineError::Io {
            op:     "shutdown",
            source: std::io::Error::other(e),
        })??;

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "background task failed");
            }
        }
        reporter.report();
        Ok(summary)
    }
}

fn spawn_packet_loop(
    processor: PacketProcessor,
    packets: Receiver<PacketInfo>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, PipelineError> {
    std::thread::Builder::new()
        .name("packet-loop".to_string())
        .spawn(move || processor.run(packets, cancel))
        .map_err(PipelineError::io("spawn packet loop"))
}

fn finish(
    assembler: Arc<Assembler<TapStreamFactory>>,
    readers: &ReaderPool,
    output: EmitterOutput,
    grace: Duration,
) -> Result<ShutdownSummary, PipelineError> {
    let streams_closed = assembler.flush_all();
    debug!(streams_closed, "assembler flushed");
    let readers_abandoned = readers.join_all(grace);
    if readers_abandoned > 0 {
        warn!(
            event.name = "readers.abandoned",
            readers = readers_abandoned,
            "readers still running after grace period"
        );
    }
    let published = match output.shutdown(grace) {
        Ok(published) => published,
        Err(e) => {
            error!(event.name = "har.close_failed", error = %e, "HAR output not closed cleanly");
            return Err(e.into());
        },
    };
    info!(
        event.name = "tapper.stopped",
        streams_closed,
        readers_abandoned,
        published,
        "shutdown complete"
    );
    Ok(ShutdownSummary {
        streams_closed,
        readers_abandoned,
        published,
    })
}
