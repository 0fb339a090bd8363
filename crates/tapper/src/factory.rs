//! Turns connections seen by the assembler into tapped streams

use std::{
    sync::Arc,
    time::{Instant, SystemTime},
};

use tap_api::{Capture, Diagnostics, TcpId};
use tracing::{debug, info};

use crate::{
    assembler::{Chunk, FlowAddr, StreamFactory, StreamHandle},
    reader::{ChannelReader, ReaderContext, ReaderPool},
    registry::{CloseReason, StreamRegistry},
    stream::{SendOutcome, Stream},
    target::TargetPolicy,
    tls::{self, MAX_INSPECTED_CHUNKS},
};

/// Creates a registry stream and its two readers for every tap target.
pub struct TapStreamFactory {
    pub registry:     Arc<StreamRegistry>,
    pub policy:       Arc<TargetPolicy>,
    pub readers:      Arc<ReaderPool>,
    context:          ReaderContext,
    max_live_streams: usize,
}

impl TapStreamFactory {
    pub fn new(
        registry: Arc<StreamRegistry>,
        policy: Arc<TargetPolicy>,
        readers: Arc<ReaderPool>,
        context: ReaderContext,
        max_live_streams: usize,
    ) -> Self {
        Self {
            registry,
            policy,
            readers,
            context,
            max_live_streams,
        }
    }

    fn diagnostics(&self) -> &Diagnostics {
        &self.context.diagnostics
    }

    fn spawn_readers(&self, stream: &Arc<Stream>, rx: crate::stream::StreamReceivers) -> bool {
        let id = stream.id;
        let client = ChannelReader::new(rx.client, stream.clone(), true, self.context.clone());
        if let Err(e) = self.readers.spawn(format!("reader-{id}-c"), client) {
            self.diagnostics().errors.error("Reader-Spawn", e);
            return false;
        }
        let server = ChannelReader::new(rx.server, stream.clone(), false, self.context.clone());
        if let Err(e) = self.readers.spawn(format!("reader-{id}-s"), server) {
            self.diagnostics().errors.error("Reader-Spawn", e);
            return false;
        }
        true
    }
}

impl StreamFactory for TapStreamFactory {
    type Handle = TapHandle;

    fn new_stream(&self, flow: FlowAddr, capture: Capture, first_seen: SystemTime) -> TapHandle {
        let decision = self
            .policy
            .classify(flow.client.ip(), flow.server.ip(), flow.server.port());
        if !decision.is_tap_target {
            return TapHandle::Untapped;
        }
        if self.registry.len() >= self.max_live_streams {
            self.diagnostics().errors.silent(
                "Max-Live-Streams",
                format_args!("{} -> {} not tapped", flow.client, flow.server),
            );
            return TapHandle::Untapped;
        }

        let client_id = TcpId {
            src_ip:   flow.client.ip(),
            dst_ip:   flow.server.ip(),
            src_port: flow.client.port(),
            dst_port: flow.server.port(),
            id:       self.registry.next_id(),
        };
        let matchers = self
            .context
            .dissectors
            .iter()
            .map(|d| d.new_matcher())
            .collect();
        let (stream, rx) = Stream::new(
            client_id,
            capture,
            Instant::now(),
            first_seen,
            decision.is_outgoing,
            matchers,
        );
        let stream = Arc::new(stream);
        self.registry.store(stream.clone());
        debug!(
            event.name = "stream.created",
            stream = stream.id,
            client = %flow.client,
            server = %flow.server,
            %capture,
            outgoing = decision.is_outgoing,
            "tapping new stream"
        );

        if !self.spawn_readers(&stream, rx) {
            self.registry.close(stream.id, CloseReason::Finished);
            return TapHandle::Untapped;
        }
        TapHandle::Tapped {
            stream,
            registry: self.registry.clone(),
            diagnostics: self.context.diagnostics.clone(),
            inspected: 0,
            tls_seen: false,
        }
    }
}

/// The assembler's side of one connection.
pub enum TapHandle {
    Tapped {
        stream:      Arc<Stream>,
        registry:    Arc<StreamRegistry>,
        diagnostics: Arc<Diagnostics>,
        /// Client chunks checked for a ClientHello so far
        inspected:   usize,
        tls_seen:    bool,
    },
    /// Not a tap target; payload is discarded.
    Untapped,
}

impl StreamHandle for TapHandle {
    fn deliver(&mut self, from_client: bool, chunk: Chunk) {
        let TapHandle::Tapped {
            stream,
            diagnostics,
            inspected,
            tls_seen,
            ..
        } = self
        else {
            return;
        };
        if stream.is_closed() {
            return;
        }
        diagnostics.stats.inc_reassembled_payloads();

        if from_client && !*tls_seen && *inspected < MAX_INSPECTED_CHUNKS {
            *inspected += 1;
            if let Some(hello) = tls::parse_client_hello(&chunk.data) {
                *tls_seen = true;
                diagnostics.stats.inc_tls_connections();
                info!(
                    event.name = "tls.client_hello",
                    stream = stream.id,
                    server = %stream.client_id.dst_ip,
                    port = stream.client_id.dst_port,
                    sni = hello.server_name.as_deref().unwrap_or("-"),
                    version = format_args!("{:#06x}", hello.version),
                    "TLS connection detected"
                );
            }
        }

        match stream.send(from_client, chunk) {
            SendOutcome::Sent | SendOutcome::Closed => {},
            SendOutcome::TimedOut => {
                diagnostics.errors.silent(
                    "Reader-Queue-Full",
                    format_args!("stream {} dropped a chunk", stream.id),
                );
            },
        }
    }

    fn complete(&mut self) {
        if let TapHandle::Tapped {
            stream, registry, ..
        } = self
        {
            registry.close(stream.id, CloseReason::Finished);
        }
    }
}
