//! Exchange output: the channel sink dissectors emit into, the output thread
//! behind it, and the JSON-line fan-out to connected consumers.

use std::{
    io,
    net::IpAddr,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, Sender};
use tap_api::{Diagnostics, Emitter, Endpoint, Exchange};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    har::{HarError, HarWriter},
    target::TargetPolicy,
};

/// Exchanges queued between dissectors and the output thread.
pub const EMITTER_QUEUE_CAPACITY: usize = 1024;

/// Lines a slow subscriber may fall behind before it starts losing them.
pub const LINE_BUFFER: usize = 4096;

/// One serialised exchange.
pub type Line = Arc<str>;

/// The sink handed to dissectors. Fills in pod names before queueing; a
/// full queue blocks the calling reader.
#[derive(Clone)]
pub struct ChannelEmitter {
    tx:          Sender<Exchange>,
    policy:      Arc<TargetPolicy>,
    diagnostics: Arc<Diagnostics>,
}

impl ChannelEmitter {
    pub fn new(policy: Arc<TargetPolicy>, diagnostics: Arc<Diagnostics>) -> (Self, Receiver<Exchange>) {
        let (tx, rx) = channel::bounded(EMITTER_QUEUE_CAPACITY);
        (
            Self {
                tx,
                policy,
                diagnostics,
            },
            rx,
        )
    }

    fn annotate(&self, exchange: &mut Exchange) {
        let src = self.name(&mut exchange.src);
        let dst = self.name(&mut exchange.dst);
        if let Some(namespace) = dst.or(src) {
            exchange.namespace = namespace;
        }
    }

    /// Name the endpoint after its pod; returns the pod's namespace.
    fn name(&self, endpoint: &mut Endpoint) -> Option<String> {
        let ip: IpAddr = endpoint.ip.parse().ok()?;
        let pod = self.policy.pod(&ip)?;
        if endpoint.name.is_empty() {
            endpoint.name = pod.name;
        }
        (!pod.namespace.is_empty()).then_some(pod.namespace)
    }
}

impl Emitter for ChannelEmitter {
    fn emit(&self, mut exchange: Exchange) {
        self.annotate(&mut exchange);
        if self.tx.send(exchange).is_err() {
            self.diagnostics
                .errors
                .silent("Emitter-Drop", "output thread has stopped");
        }
    }
}

struct Output {
    har:         Option<HarWriter>,
    lines:       broadcast::Sender<Line>,
    diagnostics: Arc<Diagnostics>,
    published:   usize,
}

impl Output {
    fn publish(&mut self, exchange: Exchange) {
        trace!(exchange = %exchange.summary(), "publishing exchange");
        if let Some(har) = &mut self.har
            && let Err(e) = har.write(&exchange)
        {
            self.diagnostics.errors.error("HAR-Write", e);
        }
        match serde_json::to_string(&exchange) {
            Ok(json) => {
                // No subscribers is not an error
                let _ = self.lines.send(Line::from(json));
            },
            Err(e) => self.diagnostics.errors.error("Exchange-Encode", e),
        }
        self.published += 1;
    }

    fn close(self) -> Result<usize, HarError> {
        if let Some(har) = self.har {
            har.close()?;
        }
        Ok(self.published)
    }
}

/// The running output thread.
pub struct EmitterOutput {
    stop:   Sender<Instant>,
    handle: JoinHandle<Result<usize, HarError>>,
}

impl EmitterOutput {
    /// Consume `rx` on a dedicated thread, writing HAR entries (when a
    /// writer is given) and publishing every exchange as a JSON line.
    pub fn spawn(
        rx: Receiver<Exchange>,
        har: Option<HarWriter>,
        lines: broadcast::Sender<Line>,
        diagnostics: Arc<Diagnostics>,
    ) -> io::Result<Self> {
        let (stop, stop_rx) = channel::bounded::<Instant>(1);
        let mut output = Output {
            har,
            lines,
            diagnostics,
            published: 0,
        };
        let handle = std::thread::Builder::new()
            .name("emitter-output".to_string())
            .spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(rx) -> msg => match msg {
                            Ok(exchange) => output.publish(exchange),
                            Err(_) => break,
                        },
                        recv(stop_rx) -> deadline => {
                            let deadline = deadline.unwrap_or_else(|_| Instant::now());
                            while Instant::now() < deadline {
                                match rx.try_recv() {
                                    Ok(exchange) => output.publish(exchange),
                                    Err(_) => break,
                                }
                            }
                            break;
                        },
                    }
                }
                let left = rx.len();
                if left > 0 {
                    warn!(
                        event.name = "emitter.abandoned",
                        exchanges = left,
                        "exchanges left unpublished at shutdown"
                    );
                }
                output.close()
            })?;
        Ok(Self { stop, handle })
    }

    /// Publish what is still queued, for at most `grace`, then stop and
    /// close the HAR file. Returns how many exchanges were published.
    pub fn shutdown(self, grace: Duration) -> Result<usize, HarError> {
        let _ = self.stop.send(Instant::now() + grace);
        match self.handle.join() {
            Ok(result) => {
                if let Ok(published) = &result {
                    info!(event.name = "emitter.stopped", published, "emitter drained");
                }
                result
            },
            Err(_) => {
                warn!(event.name = "emitter.panicked", "emitter output thread panicked");
                Ok(0)
            },
        }
    }
}

/// Copy broadcast lines to `out`, newline-terminated, until cancelled or
/// the broadcast closes. Lines lost to lag are tallied as `Emitter-Drop`.
pub async fn forward_lines<W>(
    mut rx: broadcast::Receiver<Line>,
    mut out: W,
    diagnostics: Arc<Diagnostics>,
    cancel: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = rx.recv() => line,
        };
        match line {
            Ok(line) => {
                out.write_all(line.as_bytes()).await?;
                out.write_all(b"\n").await?;
            },
            Err(RecvError::Lagged(missed)) => {
                diagnostics
                    .errors
                    .silent("Emitter-Drop", format_args!("subscriber lagged, {missed} lines lost"));
            },
            Err(RecvError::Closed) => break,
        }
    }
    out.flush().await
}

/// Accept consumers on `listener`; each receives every exchange line
/// published after it connects.
pub async fn serve_lines(
    listener: TcpListener,
    lines: broadcast::Sender<Line>,
    diagnostics: Arc<Diagnostics>,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(event.name = "lines.listening", %addr, "serving exchange lines");
    }
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                debug!(event.name = "lines.subscriber_connected", %peer, "line subscriber connected");
                let rx = lines.subscribe();
                let diagnostics = diagnostics.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _ = socket.set_nodelay(true);
                    if let Err(e) = forward_lines(rx, socket, diagnostics, cancel).await {
                        debug!(%peer, error = %e, "line subscriber went away");
                    }
                });
            },
            Err(e) => {
                diagnostics.errors.error("Lines-Accept", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }
}
