//! API-server connection: control messages in, exchange lines out.

use std::{sync::Arc, time::Duration};

use bytes::{Buf, BytesMut};
use serde::Deserialize;
use tap_api::Diagnostics;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::TcpStream,
    sync::broadcast,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    capture::SourceManager,
    config::{ConfigError, PodEntry, parse_pods},
    emitter::{Line, forward_lines},
    target::TargetPolicy,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_LINE: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Address(#[from] ConfigError),
    #[error("control connection: {0}")]
    Io(#[from] std::io::Error),
    #[error("control message exceeds {MAX_LINE} bytes")]
    TooLong,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum ControlMessage {
    SetPorts {
        #[serde(default)]
        ports: Vec<u16>,
    },
    SetAddresses {
        #[serde(default)]
        addresses: Vec<PodEntry>,
    },
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    pub fn parse(line: &[u8]) -> Result<Self, ControlError> {
        Ok(serde_json::from_slice(line)?)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::SetPorts { .. } => "setPorts",
            Self::SetAddresses { .. } => "setAddresses",
            Self::Unknown => "unknown",
        }
    }
}

/// Applies control messages to the running tapper. Updates only affect
/// flows created afterwards.
pub struct ControlHandler {
    policy:  Arc<TargetPolicy>,
    sources: Option<Arc<SourceManager>>,
}

impl ControlHandler {
    pub fn new(policy: Arc<TargetPolicy>, sources: Option<Arc<SourceManager>>) -> Self {
        Self { policy, sources }
    }

    pub fn apply(&self, message: ControlMessage) -> Result<(), ControlError> {
        match message {
            ControlMessage::SetPorts { ports } => self.policy.set_ports(ports),
            ControlMessage::SetAddresses { addresses } => {
                let pods = parse_pods(addresses)?;
                self.policy.set_pods(pods.clone());
                if let Some(sources) = &self.sources {
                    // An empty expression captures everything
                    let filter = self.policy.bpf_filter().unwrap_or_default();
                    sources.set_bpf_all(&filter);
                    let attached = sources.sync_sidecars(&pods, Some(&filter));
                    debug!(attached, "sidecars resynchronised");
                }
            },
            ControlMessage::Unknown => {},
        }
        Ok(())
    }
}

/// Persistent connection to the API server, redialled with backoff.
pub struct ControlClient {
    address:     String,
    handler:     Arc<ControlHandler>,
    lines:       broadcast::Sender<Line>,
    diagnostics: Arc<Diagnostics>,
}

impl ControlClient {
    pub fn new(
        address: String,
        handler: Arc<ControlHandler>,
        lines: broadcast::Sender<Line>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            address,
            handler,
            lines,
            diagnostics,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                connected = TcpStream::connect(&self.address) => connected,
            };
            match connected {
                Ok(stream) => {
                    backoff = INITIAL_BACKOFF;
                    info!(
                        event.name = "control.connected",
                        address = %self.address,
                        "connected to api server"
                    );
                    if let Err(e) = self.session(stream, &cancel).await {
                        self.diagnostics.errors.error("Control-Connection", e);
                    }
                    if cancel.is_cancelled() {
                        return;
                    }
                    warn!(
                        event.name = "control.disconnected",
                        address = %self.address,
                        "api server connection closed"
                    );
                },
                Err(e) => {
                    warn!(
                        event.name = "control.connect_failed",
                        address = %self.address,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "cannot reach api server"
                    );
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {},
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn session(&self, stream: TcpStream, cancel: &CancellationToken) -> Result<(), ControlError> {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let session = cancel.child_token();
        let writer = tokio::spawn(forward_lines(
            self.lines.subscribe(),
            write,
            self.diagnostics.clone(),
            session.clone(),
        ));
        let result = self.read_messages(read, cancel).await;
        session.cancel();
        if let Ok(Err(e)) = writer.await {
            debug!(error = %e, "exchange line writer stopped");
        }
        result
    }

    /// Read newline-framed messages until EOF or cancellation.
    async fn read_messages<R>(&self, mut read: R, cancel: &CancellationToken) -> Result<(), ControlError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            while let Some(end) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(end);
                buf.advance(1);
                self.handle_line(&line).await;
            }
            if buf.len() > MAX_LINE {
                return Err(ControlError::TooLong);
            }
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                n = read.read_buf(&mut buf) => n?,
            };
            if n == 0 {
                return Ok(());
            }
        }
    }

    async fn handle_line(&self, line: &[u8]) {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }
        let message = match ControlMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                self.diagnostics.errors.error("Control-Message", e);
                return;
            },
        };
        info!(event.name = "control.message", kind = message.kind(), "control message received");
        if message == ControlMessage::Unknown {
            debug!(raw = %String::from_utf8_lossy(line), "ignoring unknown control message");
            return;
        }
        // Discovery and filter updates block
        let handler = self.handler.clone();
        match tokio::task::spawn_blocking(move || handler.apply(message)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => self.diagnostics.errors.error("Control-Message", e),
            Err(e) => self.diagnostics.errors.error("Control-Message", e),
        }
    }
}
