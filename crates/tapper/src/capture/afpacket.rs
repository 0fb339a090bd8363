use std::{
    io::{self, Read},
    mem,
    os::fd::{AsRawFd, RawFd},
    time::{Duration, SystemTime},
};

use socket2::{Domain, Protocol, Socket, Type};

use super::{Backend, CaptureError, LinkType, PacketSource, RawPacket, SourceStats};

const SNAPLEN: usize = 65535;
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Raw `AF_PACKET` socket. Frames carry their Ethernet header; the capture
/// filter is compiled by libpcap and attached as classic BPF.
pub struct AfPacketSource {
    name:   String,
    socket: Option<Socket>,
    buf:    Vec<u8>,
    stats:  SourceStats,
}

fn check(ret: libc::c_int, op: &'static str) -> Result<(), CaptureError> {
    if ret < 0 {
        return Err(CaptureError::Io {
            op,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn setsockopt<T>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
    op: &'static str,
) -> Result<(), CaptureError> {
    // SAFETY: `value` points to a live `T` for the duration of the call and
    // the length passed matches its size.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    check(ret, op)
}

impl AfPacketSource {
    /// Bind to `iface`; `"any"` captures on every interface without
    /// promiscuous mode.
    pub fn open(name: &str, iface: &str) -> Result<Self, CaptureError> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(protocol))),
        )
        .map_err(CaptureError::io("AF_PACKET socket"))?;
        let fd = socket.as_raw_fd();

        let ifindex = if iface == "any" {
            0
        } else {
            nix::net::if_::if_nametoindex(iface)
                .map_err(|_| CaptureError::InterfaceNotFound(iface.to_string()))? as libc::c_int
        };

        // SAFETY: sockaddr_ll is plain data; zeroed is a valid value.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex;
        // SAFETY: `addr` is a valid sockaddr_ll and the length matches.
        let ret = unsafe {
            libc::bind(
                fd,
                (&addr as *const libc::sockaddr_ll).cast(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        check(ret, "AF_PACKET bind")?;

        if ifindex != 0 {
            // SAFETY: packet_mreq is plain data; zeroed is a valid value.
            let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
            mreq.mr_ifindex = ifindex;
            mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
            setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq,
                "PACKET_ADD_MEMBERSHIP",
            )?;
        }

        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(CaptureError::io("SO_RCVTIMEO"))?;

        Ok(Self {
            name: name.to_string(),
            socket: Some(socket),
            buf: vec![0; SNAPLEN],
            stats: SourceStats::default(),
        })
    }

    fn socket(&self) -> Result<&Socket, CaptureError> {
        self.socket.as_ref().ok_or(CaptureError::EndOfStream)
    }
}

/// Compile `expr` for Ethernet frames into classic BPF instructions.
fn compile(expr: &str) -> Result<Vec<libc::sock_filter>, CaptureError> {
    let filter_err = |reason: String| CaptureError::Filter {
        expr: expr.to_string(),
        reason,
    };
    let dead = ::pcap::Capture::dead(::pcap::Linktype::ETHERNET)?;
    let program = dead.compile(expr, true)?;
    program
        .get_instructions()
        .iter()
        .map(|insn| {
            // Rendered as "code jt jf k"
            let text = insn.to_string();
            let fields: Vec<u32> = text
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<_, _>>()
                .map_err(|e| filter_err(format!("instruction {text:?}: {e}")))?;
            let [code, jt, jf, k] = fields[..] else {
                return Err(filter_err(format!("instruction {text:?}")));
            };
            Ok(libc::sock_filter {
                code: code as u16,
                jt:   jt as u8,
                jf:   jf as u8,
                k,
            })
        })
        .collect()
}

impl PacketSource for AfPacketSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> Backend {
        Backend::AfPacket
    }

    fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(CaptureError::EndOfStream);
        };
        let mut reader: &Socket = socket;
        match reader.read(&mut self.buf) {
            Ok(n) => Ok(Some(RawPacket {
                data:      self.buf[..n].to_vec(),
                timestamp: SystemTime::now(),
                link_type: LinkType::Ethernet,
            })),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            },
            Err(source) => Err(CaptureError::Io {
                op: "AF_PACKET read",
                source,
            }),
        }
    }

    fn set_bpf(&mut self, expr: &str) -> Result<(), CaptureError> {
        let mut filter = compile(expr)?;
        let program = libc::sock_fprog {
            len:    filter.len() as libc::c_ushort,
            filter: filter.as_mut_ptr(),
        };
        let fd = self.socket()?.as_raw_fd();
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, &program, "SO_ATTACH_FILTER")
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    fn stats(&mut self) -> Result<SourceStats, CaptureError> {
        let fd = self.socket()?.as_raw_fd();
        // SAFETY: tpacket_stats is plain data; zeroed is a valid value.
        let mut raw: libc::tpacket_stats = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::tpacket_stats>() as libc::socklen_t;
        // SAFETY: `raw` and `len` describe a writable buffer of the right size.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_STATISTICS,
                (&mut raw as *mut libc::tpacket_stats).cast(),
                &mut len,
            )
        };
        check(ret, "PACKET_STATISTICS")?;
        // The kernel resets its counters on every read
        self.stats.received += u64::from(raw.tp_packets);
        self.stats.dropped += u64::from(raw.tp_drops);
        Ok(self.stats)
    }

    fn close(&mut self) {
        self.socket = None;
    }
}
