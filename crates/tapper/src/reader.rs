//! Readers: one per stream direction, each running the dissector chain

use std::{
    io::{self, BufRead, Read},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant, SystemTime},
};

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use tap_api::{
    Capture, CounterPair, Diagnostics, DissectError, Dissector, Emitter, ProtocolId,
    RequestResponseMatcher, TcpId, TcpReader, TrafficFilteringOptions,
};
use tracing::{debug, trace};

use crate::{assembler::Chunk, stream::Stream};

/// Bytes kept for replay while a stream is unidentified.
pub const MAX_REPLAY_BYTES: usize = 4 * 1024 * 1024;

/// Everything a reader needs besides its queue.
#[derive(Clone)]
pub struct ReaderContext {
    pub dissectors:  Arc<Vec<Box<dyn Dissector>>>,
    pub emitter:     Arc<dyn Emitter>,
    pub options:     Arc<TrafficFilteringOptions>,
    pub diagnostics: Arc<Diagnostics>,
}

/// One direction of a stream, fed by the assembler through a bounded queue.
///
/// Until the stream is identified every chunk read is also kept, so a
/// failed dissector can be followed by the next one starting from the
/// first byte.
pub struct ChannelReader {
    rx:        Receiver<Chunk>,
    stream:    Arc<Stream>,
    tcp_id:    TcpId,
    is_client: bool,
    context:   ReaderContext,
    current:   Vec<u8>,
    pos:       usize,
    time:      SystemTime,
    progress:  usize,
    history:   Vec<Chunk>,
    /// Next history chunk to replay
    replay:    usize,
    kept:      usize,
    /// History no longer holds every byte read
    truncated: bool,
    dissector: usize,
}

impl ChannelReader {
    pub fn new(rx: Receiver<Chunk>, stream: Arc<Stream>, is_client: bool, context: ReaderContext) -> Self {
        let tcp_id = if is_client {
            stream.client_id.clone()
        } else {
            stream.client_id.reversed()
        };
        Self {
            rx,
            time: stream.first_seen,
            stream,
            tcp_id,
            is_client,
            context,
            current: Vec::new(),
            pos: 0,
            progress: 0,
            history: Vec::new(),
            replay: 0,
            kept: 0,
            truncated: false,
            dissector: 0,
        }
    }

    fn next_chunk(&mut self) -> Option<Chunk> {
        if self.replay < self.history.len() {
            let chunk = self.history[self.replay].clone();
            self.replay += 1;
            return Some(chunk);
        }
        if self.stream.protocol().is_some() && !self.history.is_empty() {
            self.history = Vec::new();
            self.replay = 0;
            self.kept = 0;
        }

        let chunk = self.rx.recv().ok()?;
        if self.stream.protocol().is_none() && !self.truncated {
            if self.kept + chunk.data.len() <= MAX_REPLAY_BYTES {
                self.kept += chunk.data.len();
                self.history.push(chunk.clone());
                self.replay = self.history.len();
            } else {
                self.truncated = true;
                self.history = Vec::new();
                self.replay = 0;
                self.kept = 0;
            }
        }
        Some(chunk)
    }

    /// Start over from the first byte. False when the bytes are no longer
    /// all available.
    fn rewind(&mut self) -> bool {
        if self.truncated {
            return false;
        }
        self.replay = 0;
        self.current.clear();
        self.pos = 0;
        self.progress = 0;
        true
    }

    /// Read and discard until the queue closes.
    fn drain(&mut self) {
        self.history = Vec::new();
        self.replay = 0;
        self.truncated = true;
        self.current.clear();
        self.pos = 0;
        while self.rx.recv().is_ok() {}
    }

    /// Try dissectors in chain order until one consumes the stream, jumping
    /// straight to the other direction's choice once the stream is
    /// identified.
    pub fn run(mut self) {
        let dissectors = self.context.dissectors.clone();
        let mut tried = vec![false; dissectors.len()];

        loop {
            let next = match self.stream.protocol() {
                Some(p) if !tried[p.index()] => p.index(),
                Some(_) => break,
                None => match tried.iter().position(|t| !t) {
                    Some(i) => i,
                    None => break,
                },
            };
            tried[next] = true;
            self.dissector = next;
            let dissector = &dissectors[next];

            match dissector.dissect(&mut self) {
                Ok(()) => break,
                Err(e) => {
                    let locked = self.stream.protocol() == Some(dissector.id());
                    trace!(
                        stream = self.stream.id,
                        client = self.is_client,
                        protocol = %dissector.id(),
                        error = %e,
                        "dissector gave up"
                    );
                    if locked && !matches!(e, DissectError::Claimed(_)) {
                        debug!(
                            event.name = "reader.dissect_failed",
                            stream = self.stream.id,
                            protocol = %dissector.id(),
                            error = %e,
                            "identified stream stopped parsing"
                        );
                        break;
                    }
                    if !self.rewind() {
                        break;
                    }
                },
            }
        }
        self.drain();
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for ChannelReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pos >= self.current.len() {
            let Some(chunk) = self.next_chunk() else {
                return Ok(&[]);
            };
            self.current = chunk.data;
            self.pos = 0;
            self.time = chunk.timestamp;
        }
        Ok(&self.current[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.current.len() - self.pos);
        self.pos += amt;
        self.progress += amt;
    }
}

impl TcpReader for ChannelReader {
    fn is_client(&self) -> bool {
        self.is_client
    }

    fn tcp_id(&self) -> &TcpId {
        &self.tcp_id
    }

    fn capture_time(&self) -> SystemTime {
        self.time
    }

    fn read_progress(&self) -> usize {
        self.progress
    }

    fn capture(&self) -> Capture {
        self.stream.capture
    }

    fn is_outgoing(&self) -> bool {
        self.stream.is_outgoing
    }

    fn is_dns(&self) -> bool {
        self.stream.is_dns
    }

    fn matcher(&self) -> &RequestResponseMatcher {
        self.stream.matcher(self.dissector)
    }

    fn counter_pair(&self) -> &CounterPair {
        self.stream.counters(self.dissector)
    }

    fn emitter(&self) -> &dyn Emitter {
        self.context.emitter.as_ref()
    }

    fn options(&self) -> &TrafficFilteringOptions {
        &self.context.options
    }

    fn diagnostics(&self) -> &Diagnostics {
        &self.context.diagnostics
    }

    fn identify(&mut self, protocol: ProtocolId) -> bool {
        self.stream.identify(protocol)
    }

    fn identified(&self) -> Option<ProtocolId> {
        self.stream.protocol()
    }
}

/// Reader threads and how many are still running.
#[derive(Default)]
pub struct ReaderPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    live:    Arc<AtomicUsize>,
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ReaderPool {
    pub fn spawn(&self, name: String, reader: ChannelReader) -> io::Result<()> {
        self.live.fetch_add(1, Ordering::Relaxed);
        let guard = LiveGuard(self.live.clone());
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            let _guard = guard;
            reader.run();
        })?;
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Reader threads currently running
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Wait up to `grace` for every reader to finish; returns how many were
    /// still running when it ran out.
    pub fn join_all(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        loop {
            let mut handles = self.handles.lock();
            let (done, pending): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(JoinHandle::is_finished);
            *handles = pending;
            drop(handles);
            for handle in done {
                let _ = handle.join();
            }
            let remaining = self.handles.lock().len();
            if remaining == 0 || Instant::now() >= deadline {
                return remaining;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests;
