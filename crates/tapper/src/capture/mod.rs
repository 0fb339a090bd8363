//! Packet sources.
//!
//! A [`PacketSource`] yields raw link-layer frames. [`open_interface`]
//! picks the best backend available for a live interface, falling back
//! AF_XDP → AF_PACKET → libpcap (AF_XDP is not built and is always
//! skipped); [`open_file`] replays a pcap file. The
//! [`SourceManager`] runs one thread per source and funnels packets into a
//! single bounded channel.

mod afpacket;
mod discovery;
mod manager;
mod netns;
mod pcap;

pub use afpacket::AfPacketSource;
pub use discovery::{Sidecar, discover_sidecars};
pub use manager::{PACKET_CHANNEL_CAPACITY, PacketInfo, SourceManager};
pub use netns::in_netns;
pub use pcap::PcapSource;

use std::{fmt, path::Path, time::SystemTime};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pcap: {0}")]
    Pcap(#[from] ::pcap::Error),
    #[error("{op}: {source}")]
    Io {
        op:     &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not available")]
    Unsupported(&'static str),
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("filter {expr:?}: {reason}")]
    Filter { expr: String, reason: String },
    #[error("network namespace of pid {pid}: {reason}")]
    Netns { pid: u32, reason: String },
    #[error("end of stream")]
    EndOfStream,
}

impl CaptureError {
    pub(crate) fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { op, source }
    }
}

/// Link layer of the frames a source yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Linux cooked capture v1
    LinuxSll,
    /// Linux cooked capture v2
    LinuxSll2,
    RawIp,
    /// BSD loopback
    Null,
}

impl LinkType {
    /// Map a libpcap DLT value.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(Self::Ethernet),
            113 => Some(Self::LinuxSll),
            276 => Some(Self::LinuxSll2),
            12 | 14 | 101 | 228 | 229 => Some(Self::RawIp),
            0 => Some(Self::Null),
            _ => None,
        }
    }
}

/// One captured frame.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data:      Vec<u8>,
    pub timestamp: SystemTime,
    pub link_type: LinkType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub received:   u64,
    pub dropped:    u64,
    pub if_dropped: u64,
}

/// A blocking packet source. `next_packet` returns `Ok(None)` when its
/// read timeout expires so the caller can check for updates and shutdown.
pub trait PacketSource: Send {
    fn name(&self) -> &str;

    fn backend(&self) -> Backend;

    fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError>;

    fn set_bpf(&mut self, expr: &str) -> Result<(), CaptureError>;

    fn link_type(&self) -> LinkType;

    fn stats(&mut self) -> Result<SourceStats, CaptureError>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    AfXdp,
    AfPacket,
    Pcap,
    File,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AfXdp => "af_xdp",
            Self::AfPacket => "af_packet",
            Self::Pcap => "libpcap",
            Self::File => "pcap_file",
        })
    }
}

/// AF_XDP slot in the backend order. No AF_XDP backend is built, so this
/// always reports [`CaptureError::Unsupported`] and [`open_interface`]
/// moves on to AF_PACKET.
fn open_xdp(_name: &str, _iface: &str) -> Result<Box<dyn PacketSource>, CaptureError> {
    Err(CaptureError::Unsupported("AF_XDP"))
}

/// Open a live source on `iface`, trying each backend in turn. `filter`,
/// when given, is applied before the source is returned.
pub fn open_interface(
    name: &str,
    iface: &str,
    filter: Option<&str>,
) -> Result<Box<dyn PacketSource>, CaptureError> {
    let attempts: [(Backend, fn(&str, &str) -> Result<Box<dyn PacketSource>, CaptureError>); 3] = [
        (Backend::AfXdp, open_xdp),
        (Backend::AfPacket, |name, iface| {
            AfPacketSource::open(name, iface).map(|s| Box::new(s) as Box<dyn PacketSource>)
        }),
        (Backend::Pcap, |name, iface| {
            PcapSource::open_live(name, iface).map(|s| Box::new(s) as Box<dyn PacketSource>)
        }),
    ];

    let mut last = CaptureError::InterfaceNotFound(iface.to_string());
    for (backend, open) in attempts {
        match open(name, iface) {
            Ok(mut source) => {
                if let Some(expr) = filter {
                    source.set_bpf(expr)?;
                }
                info!(
                    event.name = "capture.backend_selected",
                    source = name,
                    interface = iface,
                    %backend,
                    "capture source opened"
                );
                return Ok(source);
            },
            Err(e) => {
                debug!(source = name, %backend, error = %e, "capture backend unavailable");
                last = e;
            },
        }
    }
    Err(last)
}

/// Replay a pcap file.
pub fn open_file(path: &Path, filter: Option<&str>) -> Result<Box<dyn PacketSource>, CaptureError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut source = PcapSource::open_file(&format!("file-{file_name}"), path)?;
    if let Some(expr) = filter {
        source.set_bpf(expr)?;
    }
    info!(
        event.name = "capture.backend_selected",
        source = source.name(),
        path = %path.display(),
        backend = %Backend::File,
        "capture source opened"
    );
    Ok(Box::new(source))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::ethernet(1, Some(LinkType::Ethernet))]
    #[case::sll(113, Some(LinkType::LinuxSll))]
    #[case::sll2(276, Some(LinkType::LinuxSll2))]
    #[case::raw(101, Some(LinkType::RawIp))]
    #[case::ipv4(228, Some(LinkType::RawIp))]
    #[case::null(0, Some(LinkType::Null))]
    #[case::ieee802_11(105, None)]
    fn test_link_type_from_dlt(#[case] dlt: i32, #[case] expected: Option<LinkType>) {
        assert_eq!(LinkType::from_dlt(dlt), expected);
    }

    #[test]
    fn test_xdp_always_falls_back() {
        let Err(e) = open_xdp("host-eth0", "eth0") else {
            panic!("AF_XDP backend opened");
        };
        assert!(matches!(e, CaptureError::Unsupported("AF_XDP")));
        assert_eq!(e.to_string(), "AF_XDP is not available");
    }
}
