//! Fuzz target: HTTP/1 dissector over arbitrary client and server bytes
//!
//! Both directions are dissected against one shared matcher, so parsing,
//! body framing, redaction and pairing all see hostile input.

#![no_main]

use std::{
    io::{BufRead, Read},
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tap_api::{
    Capture, CounterPair, Diagnostics, Dissector, Emitter, Exchange, ProtocolId,
    RequestResponseMatcher, TcpId, TcpReader, TrafficFilteringOptions,
};
use tap_dissectors::Http1Dissector;

#[derive(Debug, Arbitrary)]
struct Input {
    client:            Vec<Vec<u8>>,
    server:            Vec<Vec<u8>>,
    body_limit:        u16,
    disable_redaction: bool,
}

struct Discard;

impl Emitter for Discard {
    fn emit(&self, exchange: Exchange) {
        let _ = exchange.summary();
    }
}

struct Shared {
    matcher:     RequestResponseMatcher,
    counters:    CounterPair,
    options:     TrafficFilteringOptions,
    diagnostics: Diagnostics,
    protocol:    Mutex<Option<ProtocolId>>,
}

struct ChunkReader<'a> {
    chunks:    std::slice::Iter<'a, Vec<u8>>,
    current:   &'a [u8],
    progress:  usize,
    time:      SystemTime,
    is_client: bool,
    tcp_id:    TcpId,
    shared:    &'a Shared,
}

impl<'a> ChunkReader<'a> {
    fn new(is_client: bool, chunks: &'a [Vec<u8>], shared: &'a Shared) -> Self {
        let tcp_id = TcpId {
            src_ip:   "10.0.0.1".parse().unwrap(),
            dst_ip:   "10.0.0.2".parse().unwrap(),
            src_port: 43210,
            dst_port: 80,
            id:       1,
        };
        Self {
            chunks: chunks.iter(),
            current: &[],
            progress: 0,
            time: UNIX_EPOCH,
            is_client,
            tcp_id: if is_client { tcp_id } else { tcp_id.reversed() },
            shared,
        }
    }
}

impl Read for ChunkReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for ChunkReader<'_> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        while self.current.is_empty() {
            let Some(next) = self.chunks.next() else {
                return Ok(&[]);
            };
            self.current = next;
            self.time += Duration::from_millis(1);
        }
        Ok(self.current)
    }

    fn consume(&mut self, amt: usize) {
        self.current = &self.current[amt.min(self.current.len())..];
        self.progress += amt;
    }
}

impl TcpReader for ChunkReader<'_> {
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
        false
    }

    fn matcher(&self) -> &RequestResponseMatcher {
        &self.shared.matcher
    }

    fn counter_pair(&self) -> &CounterPair {
        &self.shared.counters
    }

    fn emitter(&self) -> &dyn Emitter {
        &Discard
    }

    fn options(&self) -> &TrafficFilteringOptions {
        &self.shared.options
    }

    fn diagnostics(&self) -> &Diagnostics {
        &self.shared.diagnostics
    }

    fn identify(&mut self, protocol: ProtocolId) -> bool {
        let mut current = self.shared.protocol.lock().unwrap();
        *current.get_or_insert(protocol) == protocol
    }

    fn identified(&self) -> Option<ProtocolId> {
        *self.shared.protocol.lock().unwrap()
    }
}

fuzz_target!(|input: Input| {
    let shared = Shared {
        matcher:     RequestResponseMatcher::new(),
        counters:    CounterPair::default(),
        options:     TrafficFilteringOptions {
            disable_redaction: input.disable_redaction,
            ..TrafficFilteringOptions::default()
        },
        diagnostics: Diagnostics::default(),
        protocol:    Mutex::new(None),
    };
    let dissector = Http1Dissector::new(usize::from(input.body_limit));
    let _ = dissector.dissect(&mut ChunkReader::new(true, &input.client, &shared));
    let _ = dissector.dissect(&mut ChunkReader::new(false, &input.server, &shared));
});
