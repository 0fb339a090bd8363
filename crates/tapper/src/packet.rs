//! Link, network and TCP decoding of captured packets

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Instant, SystemTime},
};

use etherparse::{IpNumber, NetSlice, SlicedPacket, TcpHeaderSlice, TcpOptionElement};
use tap_api::Diagnostics;
use thiserror::Error;

use crate::{
    capture::{LinkType, RawPacket},
    defrag::{Defragmenter, Fragment, FragmentKey},
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated {0} header")]
    Truncated(&'static str),
    #[error("unsupported link payload 0x{0:04x}")]
    EtherType(u16),
    #[error("{0}")]
    Slice(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// A decoded TCP segment, owning its payload.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_ip:       IpAddr,
    pub dst_ip:       IpAddr,
    pub src_port:     u16,
    pub dst_port:     u16,
    pub seq:          u32,
    pub ack:          u32,
    pub flags:        TcpFlags,
    pub window:       u16,
    pub mss:          Option<u16>,
    pub window_scale: Option<u8>,
    pub payload:      Vec<u8>,
    /// `None` when checksums are not verified
    pub checksum_ok:  Option<bool>,
    pub timestamp:    SystemTime,
    /// Full packet length on the wire
    pub wire_len:     usize,
    /// Rebuilt from IPv4 fragments
    pub defragmented: bool,
}

/// What a captured packet turned out to be.
#[derive(Debug)]
pub enum Decoded {
    Segment(TcpSegment),
    /// An IPv4 fragment retained by the defragmenter
    Fragment,
    /// Not TCP over IP
    Other,
}

/// Per-loop decoder; owns the defragmenter when enabled.
pub struct PacketDecoder {
    defrag:      Option<Defragmenter>,
    checksum:    bool,
    diagnostics: Arc<Diagnostics>,
}

impl PacketDecoder {
    pub fn new(ipdefrag: bool, checksum: bool, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            defrag: ipdefrag.then(Defragmenter::default),
            checksum,
            diagnostics,
        }
    }

    /// Drop stale fragments, tallying each as a timeout.
    pub fn expire_fragments(&mut self, now: Instant) {
        if let Some(defrag) = self.defrag.as_mut() {
            for _ in 0..defrag.expire(now) {
                self.diagnostics
                    .errors
                    .silent("Fragment-Timeout", "incomplete IPv4 datagram dropped");
            }
        }
    }

    pub fn decode(&mut self, packet: &RawPacket, now: Instant) -> Result<Decoded, DecodeError> {
        let sliced = slice_link(packet.link_type, &packet.data)?;

        let mut defragmented = false;
        let (src_ip, dst_ip, datagram) = match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                let payload = ipv4.payload();
                if payload.ip_number != IpNumber::TCP {
                    return Ok(Decoded::Other);
                }
                let (src, dst) = (header.source_addr(), header.destination_addr());
                if payload.fragmented {
                    let Some(defrag) = self.defrag.as_mut() else {
                        return Ok(Decoded::Other);
                    };
                    let key = FragmentKey {
                        src,
                        dst,
                        id: header.identification(),
                        protocol: payload.ip_number.0,
                    };
                    let fragment = Fragment {
                        offset:         usize::from(header.fragments_offset().value()) * 8,
                        more_fragments: header.more_fragments(),
                        data:           payload.payload,
                    };
                    match defrag.insert(key, fragment, now) {
                        Some(datagram) => {
                            defragmented = true;
                            (IpAddr::V4(src), IpAddr::V4(dst), datagram)
                        },
                        None => return Ok(Decoded::Fragment),
                    }
                } else {
                    (IpAddr::V4(src), IpAddr::V4(dst), payload.payload.to_vec())
                }
            },
            Some(NetSlice::Ipv6(ipv6)) => {
                let payload = ipv6.payload();
                if payload.ip_number != IpNumber::TCP || payload.fragmented {
                    return Ok(Decoded::Other);
                }
                let header = ipv6.header();
                (
                    IpAddr::V6(header.source_addr()),
                    IpAddr::V6(header.destination_addr()),
                    payload.payload.to_vec(),
                )
            },
            _ => return Ok(Decoded::Other),
        };

        let mut segment = self.decode_tcp(src_ip, dst_ip, &datagram, packet)?;
        segment.defragmented = defragmented;
        Ok(Decoded::Segment(segment))
    }

    fn decode_tcp(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        datagram: &[u8],
        packet: &RawPacket,
    ) -> Result<TcpSegment, DecodeError> {
        let tcp = TcpHeaderSlice::from_slice(datagram).map_err(|e| DecodeError::Slice(e.to_string()))?;
        let payload = &datagram[tcp.slice().len()..];

        let mut mss = None;
        let mut window_scale = None;
        for option in tcp.options_iterator().flatten() {
            match option {
                TcpOptionElement::MaximumSegmentSize(v) => mss = Some(v),
                TcpOptionElement::WindowScale(v) => window_scale = Some(v),
                _ => {},
            }
        }

        let checksum_ok = self.checksum.then(|| {
            let header = tcp.to_header();
            let expected = match (src_ip, dst_ip) {
                (IpAddr::V4(s), IpAddr::V4(d)) => {
                    header.calc_checksum_ipv4_raw(s.octets(), d.octets(), payload)
                },
                (IpAddr::V6(s), IpAddr::V6(d)) => {
                    header.calc_checksum_ipv6_raw(s.octets(), d.octets(), payload)
                },
                _ => return false,
            };
            expected.is_ok_and(|c| c == tcp.checksum())
        });

        Ok(TcpSegment {
            src_ip,
            dst_ip,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            flags: TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
            },
            window: tcp.window_size(),
            mss,
            window_scale,
            payload: payload.to_vec(),
            checksum_ok,
            timestamp: packet.timestamp,
            wire_len: packet.data.len(),
            defragmented: false,
        })
    }
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Slice the packet down to its network layer.
fn slice_link(link: LinkType, data: &[u8]) -> Result<SlicedPacket<'_>, DecodeError> {
    let slice_err = |e: etherparse::err::packet::SliceError| DecodeError::Slice(e.to_string());
    match link {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).map_err(slice_err),
        LinkType::RawIp => SlicedPacket::from_ip(data).map_err(slice_err),
        LinkType::LinuxSll => {
            cooked(data, 16, 14).and_then(|ip| SlicedPacket::from_ip(ip).map_err(slice_err))
        },
        LinkType::LinuxSll2 => {
            cooked(data, 20, 0).and_then(|ip| SlicedPacket::from_ip(ip).map_err(slice_err))
        },
        LinkType::Null => {
            let ip = data.get(4..).ok_or(DecodeError::Truncated("loopback"))?;
            SlicedPacket::from_ip(ip).map_err(slice_err)
        },
    }
}

/// Strip a Linux cooked header of `len` bytes whose protocol type sits at
/// `proto_at`.
fn cooked(data: &[u8], len: usize, proto_at: usize) -> Result<&[u8], DecodeError> {
    if data.len() < len {
        return Err(DecodeError::Truncated("linux cooked"));
    }
    let proto = u16::from_be_bytes([data[proto_at], data[proto_at + 1]]);
    match proto {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => Ok(&data[len..]),
        other => Err(DecodeError::EtherType(other)),
    }
}

#[cfg(test)]
mod tests {
    use etherparse::PacketBuilder;

    use super::*;

    fn raw(data: Vec<u8>, link_type: LinkType) -> RawPacket {
        RawPacket {
            data,
            timestamp: SystemTime::UNIX_EPOCH,
            link_type,
        }
    }

    fn decoder(checksum: bool) -> PacketDecoder {
        PacketDecoder::new(true, checksum, Arc::new(Diagnostics::default()))
    }

    fn ethernet_tcp(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(43210, 80, 1000, 65535)
            .syn()
            .options(&[TcpOptionElement::MaximumSegmentSize(1460)])
            .unwrap();
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    #[test]
    fn test_ethernet_tcp_segment() {
        let mut d = decoder(true);
        let packet = raw(ethernet_tcp(b"hello"), LinkType::Ethernet);
        let Decoded::Segment(seg) = d.decode(&packet, Instant::now()).unwrap() else {
            panic!("expected a segment");
        };
        assert_eq!(seg.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(seg.dst_port, 80);
        assert_eq!(seg.seq, 1000);
        assert!(seg.flags.syn && !seg.flags.ack);
        assert_eq!(seg.mss, Some(1460));
        assert_eq!(seg.payload, b"hello");
        assert_eq!(seg.checksum_ok, Some(true));
    }

    #[test]
    fn test_corrupted_checksum_is_reported() {
        let mut bytes = ethernet_tcp(b"hello");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let Decoded::Segment(seg) = decoder(true)
            .decode(&raw(bytes, LinkType::Ethernet), Instant::now())
            .unwrap()
        else {
            panic!("expected a segment");
        };
        assert_eq!(seg.checksum_ok, Some(false));
    }

    #[test]
    fn test_linux_cooked_header() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).tcp(1, 2, 3, 4);
        let mut ip = Vec::new();
        builder.write(&mut ip, b"x").unwrap();

        let mut sll = vec![0u8; 16];
        sll[14..16].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        sll.extend_from_slice(&ip);

        let decoded = decoder(false)
            .decode(&raw(sll, LinkType::LinuxSll), Instant::now())
            .unwrap();
        assert!(matches!(decoded, Decoded::Segment(s) if s.payload == b"x"));
    }

    #[test]
    fn test_udp_is_other() {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).udp(53, 53);
        let mut ip = Vec::new();
        builder.write(&mut ip, b"q").unwrap();
        let decoded = decoder(false)
            .decode(&raw(ip, LinkType::RawIp), Instant::now())
            .unwrap();
        assert!(matches!(decoded, Decoded::Other));
    }

    #[test]
    fn test_truncated_cooked_header() {
        let err = decoder(false)
            .decode(&raw(vec![0; 8], LinkType::LinuxSll), Instant::now())
            .unwrap_err();
        assert!(matches!(err, DecodeError::Truncated(_)));
    }
}
