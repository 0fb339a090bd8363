use std::{
    path::Path,
    time::{Duration, UNIX_EPOCH},
};

use pcap::{Activated, Capture};

use super::{Backend, CaptureError, LinkType, PacketSource, RawPacket, SourceStats};

const SNAPLEN: i32 = 65535;
const READ_TIMEOUT_MS: i32 = 500;

/// libpcap handle, live or replaying a file.
pub struct PcapSource {
    name:      String,
    backend:   Backend,
    capture:   Option<Capture<dyn Activated>>,
    link_type: LinkType,
}

fn link_type_of(capture: &Capture<dyn Activated>) -> Result<LinkType, CaptureError> {
    let dlt = capture.get_datalink();
    LinkType::from_dlt(dlt.0).ok_or_else(|| CaptureError::Filter {
        expr:   String::new(),
        reason: format!("unsupported link type {}", dlt.0),
    })
}

impl PcapSource {
    pub fn open_live(name: &str, iface: &str) -> Result<Self, CaptureError> {
        let capture = Capture::from_device(iface)?
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .immediate_mode(true)
            .open()?;
        Self::new(name, Backend::Pcap, capture.into())
    }

    pub fn open_file(name: &str, path: &Path) -> Result<Self, CaptureError> {
        let capture = Capture::from_file(path)?;
        Self::new(name, Backend::File, capture.into())
    }

    fn new(name: &str, backend: Backend, capture: Capture<dyn Activated>) -> Result<Self, CaptureError> {
        let link_type = link_type_of(&capture)?;
        Ok(Self {
            name: name.to_string(),
            backend,
            capture: Some(capture),
            link_type,
        })
    }
}

impl PacketSource for PcapSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        let Some(capture) = self.capture.as_mut() else {
            return Err(CaptureError::EndOfStream);
        };
        match capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = UNIX_EPOCH
                    + Duration::from_secs(ts.tv_sec.max(0) as u64)
                    + Duration::from_micros(ts.tv_usec.max(0) as u64);
                Ok(Some(RawPacket {
                    data: packet.data.to_vec(),
                    timestamp,
                    link_type: self.link_type,
                }))
            },
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Err(CaptureError::EndOfStream),
            Err(e) => Err(e.into()),
        }
    }

    fn set_bpf(&mut self, expr: &str) -> Result<(), CaptureError> {
        let capture = self.capture.as_mut().ok_or(CaptureError::EndOfStream)?;
        capture.filter(expr, true)?;
        Ok(())
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn stats(&mut self) -> Result<SourceStats, CaptureError> {
        if self.backend == Backend::File {
            return Ok(SourceStats::default());
        }
        let capture = self.capture.as_mut().ok_or(CaptureError::EndOfStream)?;
        let stat = capture.stats()?;
        Ok(SourceStats {
            received:   u64::from(stat.received),
            dropped:    u64::from(stat.dropped),
            if_dropped: u64::from(stat.if_dropped),
        })
    }

    fn close(&mut self) {
        self.capture = None;
    }
}
