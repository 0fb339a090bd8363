//! In-memory reader pair for dissector tests

use std::{
    collections::VecDeque,
    io::{BufRead, Read},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tap_api::{
    Capture, CounterPair, Diagnostics, Emitter, Exchange, ProtocolId, RequestResponseMatcher,
    TcpId, TcpReader, TrafficFilteringOptions,
};

#[derive(Default)]
pub(crate) struct Collect(pub(crate) Mutex<Vec<Exchange>>);

impl Emitter for Collect {
    fn emit(&self, exchange: Exchange) {
        self.0.lock().unwrap().push(exchange);
    }
}

/// State the two readers of one stream share.
#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) matcher:     RequestResponseMatcher,
    pub(crate) counters:    CounterPair,
    pub(crate) emitted:     Collect,
    pub(crate) options:     TrafficFilteringOptions,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) protocol:    Mutex<Option<ProtocolId>>,
}

impl Shared {
    pub(crate) fn exchanges(&self) -> Vec<Exchange> {
        self.emitted.0.lock().unwrap().clone()
    }
}

pub(crate) struct MockReader {
    chunks:    VecDeque<(Vec<u8>, SystemTime)>,
    current:   Vec<u8>,
    pos:       usize,
    time:      SystemTime,
    progress:  usize,
    is_client: bool,
    tcp_id:    TcpId,
    shared:    Arc<Shared>,
}

/// Millisecond offsets from a fixed epoch, so elapsed times are predictable.
pub(crate) fn at(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_millis(ms)
}

pub(crate) fn client_id(server_port: u16) -> TcpId {
    TcpId {
        src_ip:   "10.0.0.1".parse().unwrap(),
        dst_ip:   "10.0.0.2".parse().unwrap(),
        src_port: 43210,
        dst_port: server_port,
        id:       1,
    }
}

impl MockReader {
    /// Reader pair over the given chunks, all timestamped in order.
    pub(crate) fn pair(
        server_port: u16,
        client: Vec<(Vec<u8>, SystemTime)>,
        server: Vec<(Vec<u8>, SystemTime)>,
        options: TrafficFilteringOptions,
    ) -> (MockReader, MockReader, Arc<Shared>) {
        let shared = Arc::new(Shared {
            options,
            ..Shared::default()
        });
        let id = client_id(server_port);
        let c = MockReader::new(true, id.clone(), client, shared.clone());
        let s = MockReader::new(false, id.reversed(), server, shared.clone());
        (c, s, shared)
    }

    fn new(
        is_client: bool,
        tcp_id: TcpId,
        chunks: Vec<(Vec<u8>, SystemTime)>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            chunks: chunks.into(),
            current: Vec::new(),
            pos: 0,
            time: UNIX_EPOCH,
            progress: 0,
            is_client,
            tcp_id,
            shared,
        }
    }
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for MockReader {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        while self.pos >= self.current.len() {
            let Some((data, time)) = self.chunks.pop_front() else {
                return Ok(&[]);
            };
            self.current = data;
            self.pos = 0;
            self.time = time;
        }
        Ok(&self.current[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos += amt;
        self.progress += amt;
    }
}

impl TcpReader for MockReader {
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
        Capture::Pcap
    }

    fn is_outgoing(&self) -> bool {
        false
    }

    fn is_dns(&self) -> bool {
        self.tcp_id.src_port == 53 || self.tcp_id.dst_port == 53
    }

    fn matcher(&self) -> &RequestResponseMatcher {
        &self.shared.matcher
    }

    fn counter_pair(&self) -> &CounterPair {
        &self.shared.counters
    }

    fn emitter(&self) -> &dyn Emitter {
        &self.shared.emitted
    }

    fn options(&self) -> &TrafficFilteringOptions {
        &self.shared.options
    }

    fn diagnostics(&self) -> &Diagnostics {
        &self.shared.diagnostics
    }

    fn identify(&mut self, protocol: ProtocolId) -> bool {
        let mut current = self.shared.protocol.lock().unwrap();
        match *current {
            Some(p) => p == protocol,
            None => {
                *current = Some(protocol);
                true
            },
        }
    }

    fn identified(&self) -> Option<ProtocolId> {
        *self.shared.protocol.lock().unwrap()
    }
}
