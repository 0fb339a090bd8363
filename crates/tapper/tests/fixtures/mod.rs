#![allow(dead_code)]
//! Packet and pipeline helpers for end-to-end tests
//!
//! Frames are Ethernet/IPv4/TCP built with `etherparse`; a [`Flow`] keeps
//! both sequence numbers so tests only deal in payloads.

use std::{
    collections::HashSet,
    net::SocketAddrV4,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use etherparse::PacketBuilder;
use tap_api::{Capture, Diagnostics};
use tapper::{
    Pipeline, TapperConfig,
    capture::{LinkType, PacketInfo, RawPacket},
    target::TargetPolicy,
};
use tokio::sync::broadcast::error::TryRecvError;

const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
const SERVER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub psh: bool,
}

/// Build one Ethernet frame carrying a TCP segment.
pub fn tcp_frame(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: Flags,
    payload: &[u8],
) -> Vec<u8> {
    let (src_mac, dst_mac) = if src.port() > dst.port() {
        (CLIENT_MAC, SERVER_MAC)
    } else {
        (SERVER_MAC, CLIENT_MAC)
    };
    let mut builder = PacketBuilder::ethernet2(src_mac, dst_mac)
        .ipv4(src.ip().octets(), dst.ip().octets(), 64)
        .tcp(src.port(), dst.port(), seq, 65535);
    if flags.syn {
        builder = builder.syn();
    }
    if flags.ack {
        builder = builder.ack(ack);
    }
    if flags.fin {
        builder = builder.fin();
    }
    if flags.psh {
        builder = builder.psh();
    }
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

pub fn packet(frame: Vec<u8>, timestamp: SystemTime) -> PacketInfo {
    PacketInfo {
        packet:  RawPacket {
            data: frame,
            timestamp,
            link_type: LinkType::Ethernet,
        },
        capture: Capture::Pcap,
        source:  Arc::from("file-test.pcap"),
    }
}

/// Both directions of one TCP connection.
pub struct Flow {
    pub client: SocketAddrV4,
    pub server: SocketAddrV4,
    client_seq: u32,
    server_seq: u32,
    clock:      SystemTime,
}

impl Flow {
    pub fn new(client: &str, server: &str) -> Self {
        Self {
            client:     client.parse().unwrap(),
            server:     server.parse().unwrap(),
            client_seq: 1000,
            server_seq: 5000,
            clock:      UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        }
    }

    fn tick(&mut self) -> SystemTime {
        self.clock += Duration::from_millis(1);
        self.clock
    }

    fn from_client(&mut self, flags: Flags, payload: &[u8]) -> PacketInfo {
        let frame = tcp_frame(
            self.client,
            self.server,
            self.client_seq,
            self.server_seq,
            flags,
            payload,
        );
        self.client_seq = self
            .client_seq
            .wrapping_add(payload.len() as u32 + u32::from(flags.syn || flags.fin));
        let at = self.tick();
        packet(frame, at)
    }

    fn from_server(&mut self, flags: Flags, payload: &[u8]) -> PacketInfo {
        let frame = tcp_frame(
            self.server,
            self.client,
            self.server_seq,
            self.client_seq,
            flags,
            payload,
        );
        self.server_seq = self
            .server_seq
            .wrapping_add(payload.len() as u32 + u32::from(flags.syn || flags.fin));
        let at = self.tick();
        packet(frame, at)
    }

    pub fn handshake(&mut self) -> Vec<PacketInfo> {
        vec![
            self.from_client(
                Flags {
                    syn: true,
                    ..Flags::default()
                },
                b"",
            ),
            self.from_server(
                Flags {
                    syn: true,
                    ack: true,
                    ..Flags::default()
                },
                b"",
            ),
            self.from_client(
                Flags {
                    ack: true,
                    ..Flags::default()
                },
                b"",
            ),
        ]
    }

    pub fn client(&mut self, payload: &[u8]) -> PacketInfo {
        self.from_client(Self::data(), payload)
    }

    pub fn server(&mut self, payload: &[u8]) -> PacketInfo {
        self.from_server(Self::data(), payload)
    }

    /// FIN from the client, answered by FIN from the server.
    pub fn close(&mut self) -> Vec<PacketInfo> {
        let fin = Flags {
            ack: true,
            fin: true,
            ..Flags::default()
        };
        vec![self.from_client(fin, b""), self.from_server(fin, b"")]
    }

    fn data() -> Flags {
        Flags {
            ack: true,
            psh: true,
            ..Flags::default()
        }
    }
}

/// A pipeline tapping every flow, with no local addresses.
pub fn pipeline(config: TapperConfig) -> Pipeline {
    let policy = Arc::new(TargetPolicy::with_own_addresses(&config, HashSet::new()));
    Pipeline::with_policy(config, policy, Arc::new(Diagnostics::default())).unwrap()
}

/// Feed `packets`, shut down and return every published exchange.
pub fn run(pipeline: Pipeline, packets: Vec<PacketInfo>) -> Vec<serde_json::Value> {
    let mut pipeline = pipeline;
    let mut lines = pipeline.subscribe();
    for info in &packets {
        pipeline.process(info, Instant::now());
    }
    let summary = pipeline.shutdown(Duration::from_secs(5)).unwrap();
    assert_eq!(summary.readers_abandoned, 0);

    let mut exchanges = Vec::new();
    loop {
        match lines.try_recv() {
            Ok(line) => exchanges.push(serde_json::from_str(&line).unwrap()),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    exchanges
}

// =========================================================================
// HTTP/2
// =========================================================================

pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_TYPE_DATA: u8 = 0x00;
const FRAME_TYPE_HEADERS: u8 = 0x01;
const FRAME_TYPE_SETTINGS: u8 = 0x04;
const FLAG_END_STREAM: u8 = 0x01;
const FLAG_END_HEADERS: u8 = 0x04;

fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, frame_type, flags];
    out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn settings_frame() -> Vec<u8> {
    frame(FRAME_TYPE_SETTINGS, 0, 0, &[])
}

pub fn headers_frame(stream_id: u32, block: &[u8], end_stream: bool) -> Vec<u8> {
    let flags = FLAG_END_HEADERS | if end_stream { FLAG_END_STREAM } else { 0 };
    frame(FRAME_TYPE_HEADERS, flags, stream_id, block)
}

pub fn data_frame(stream_id: u32, data: &[u8], end_stream: bool) -> Vec<u8> {
    let flags = if end_stream { FLAG_END_STREAM } else { 0 };
    frame(FRAME_TYPE_DATA, flags, stream_id, data)
}

/// Literal header field without indexing, new name, no Huffman.
pub fn hpack_literal(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![0x00, name.len() as u8];
    out.extend_from_slice(name.as_bytes());
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out
}

pub fn hpack_grpc_request(path: &str, authority: &str) -> Vec<u8> {
    // :method POST, :scheme http
    let mut block = vec![0x83, 0x86];
    block.extend(hpack_literal(":path", path));
    block.extend(hpack_literal(":authority", authority));
    block.extend(hpack_literal("content-type", "application/grpc"));
    block.extend(hpack_literal("te", "trailers"));
    block
}

pub fn hpack_grpc_response() -> Vec<u8> {
    // :status 200
    let mut block = vec![0x88];
    block.extend(hpack_literal("content-type", "application/grpc"));
    block
}

/// Length-prefixed gRPC message.
pub fn grpc_message(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
