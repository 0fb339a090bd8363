//! TCP reassembly.
//!
//! The [`Assembler`] tracks every observed connection under one lock. Each
//! segment goes through the connection's [`TcpFsm`] and [`OptionChecker`],
//! then into a per-direction sequence buffer; contiguous payload is handed
//! to the connection's [`StreamHandle`] in sequence order.

mod fsm;
mod options;

pub use fsm::{TcpFsm, TcpState};
pub use options::{OptionChecker, OptionViolation};

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use parking_lot::Mutex;
use serde::Serialize;
use tap_api::{Capture, Diagnostics};
use tracing::debug;

use crate::packet::TcpSegment;

/// Non-SYN packets of a just-closed connection are ignored this long.
pub const CLOSED_LINGER: Duration = Duration::from_secs(3);

/// Wrapping difference `a - b` in sequence space.
pub(crate) fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerOptions {
    pub allow_missing_init:                bool,
    pub ignore_fsm_err:                    bool,
    pub no_opt_check:                      bool,
    pub checksum:                          bool,
    pub max_buffered_pages_per_connection: usize,
    pub max_buffered_pages_total:          usize,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            allow_missing_init:                true,
            ignore_fsm_err:                    true,
            no_opt_check:                      true,
            checksum:                          false,
            max_buffered_pages_per_connection: 4000,
            max_buffered_pages_total:          150_000,
        }
    }
}

/// Both ends of a flow, oriented client to server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowAddr {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

/// In-order payload for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data:      Vec<u8>,
    pub timestamp: SystemTime,
}

/// Creates the consumer of a newly observed connection.
pub trait StreamFactory: Send + Sync {
    type Handle: StreamHandle;

    fn new_stream(&self, flow: FlowAddr, capture: Capture, first_seen: SystemTime) -> Self::Handle;
}

/// Receives a connection's reassembled payload.
pub trait StreamHandle: Send {
    fn deliver(&mut self, from_client: bool, chunk: Chunk);

    /// No more data will arrive in either direction.
    fn complete(&mut self);
}

/// Counters reported with every stats line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblerStats {
    pub ipdefrag:              u64,
    pub missed_bytes:          u64,
    pub pkt:                   u64,
    pub sz:                    u64,
    pub totalsz:               u64,
    pub reject_fsm:            u64,
    pub reject_opt:            u64,
    pub reject_conn_fsm:       u64,
    pub reassembled:           u64,
    pub out_of_order_bytes:    u64,
    pub out_of_order_packets:  u64,
    pub biggest_chunk_bytes:   u64,
    pub biggest_chunk_packets: u64,
    pub overlap_bytes:         u64,
    pub overlap_packets:       u64,
    pub queued_bytes:          u64,
    pub queued_packets:        u64,
}

/// What happened to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    /// Failed a state, option or checksum check
    Rejected,
    /// Straggler of a recently closed connection
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub flushed: usize,
    pub closed:  usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnKey(SocketAddr, SocketAddr);

impl ConnKey {
    fn new(a: SocketAddr, b: SocketAddr) -> Self {
        if a <= b { Self(a, b) } else { Self(b, a) }
    }
}

#[derive(Debug)]
struct Queued {
    seq:       u32,
    data:      Vec<u8>,
    timestamp: SystemTime,
}

#[derive(Debug, Default)]
struct Half {
    next_seq: Option<u32>,
    queued:   Vec<Queued>,
    /// Sequence number of a FIN seen ahead of undelivered data
    fin_seq:  Option<u32>,
    /// FIN reached in sequence
    fin:      bool,
}

impl Half {
    /// Consume a pending FIN once delivery has caught up with it.
    fn settle_fin(&mut self) {
        if let (Some(fin_seq), Some(next)) = (self.fin_seq, self.next_seq)
            && seq_diff(next, fin_seq) >= 0
        {
            self.fin = true;
            self.fin_seq = None;
            self.next_seq = Some(fin_seq.wrapping_add(1));
        }
    }
}

struct Connection<H> {
    handle:       H,
    client:       SocketAddr,
    fsm:          TcpFsm,
    options:      OptionChecker,
    /// Index 0 carries client-to-server payload
    halves:       [Half; 2],
    last_seen:    Instant,
    fsm_rejected: bool,
    reset:        bool,
}

impl<H> Connection<H> {
    fn queued_pages(&self) -> usize {
        self.halves[0].queued.len() + self.halves[1].queued.len()
    }

    fn finished(&self) -> bool {
        self.reset || (self.halves[0].fin && self.halves[1].fin)
    }
}

struct Inner<H> {
    conns:           HashMap<ConnKey, Connection<H>>,
    recently_closed: HashMap<ConnKey, Instant>,
    queued_pages:    usize,
    stats:           AssemblerStats,
}

/// Buffer limits and counters borrowed while one segment is placed.
struct Budget<'a> {
    stats:        &'a mut AssemblerStats,
    queued_pages: &'a mut usize,
    per_conn:     usize,
    total:        usize,
}

pub struct Assembler<F: StreamFactory> {
    factory:     F,
    options:     AssemblerOptions,
    diagnostics: Arc<Diagnostics>,
    inner:       Mutex<Inner<F::Handle>>,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(factory: F, options: AssemblerOptions, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            factory,
            options,
            diagnostics,
            inner: Mutex::new(Inner {
                conns:           HashMap::new(),
                recently_closed: HashMap::new(),
                queued_pages:    0,
                stats:           AssemblerStats::default(),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Place one segment. Runs synchronously under the assembler lock.
    pub fn assemble(&self, segment: TcpSegment, capture: Capture, now: Instant) -> Verdict {
        let src = SocketAddr::new(segment.src_ip, segment.src_port);
        let dst = SocketAddr::new(segment.dst_ip, segment.dst_port);
        let key = ConnKey::new(src, dst);
        let pure_syn = segment.flags.syn && !segment.flags.ack;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.stats.pkt += 1;
        inner.stats.totalsz += segment.payload.len() as u64;
        if segment.defragmented {
            inner.stats.ipdefrag += 1;
        }

        if self.options.checksum && segment.checksum_ok == Some(false) {
            inner.stats.reject_opt += 1;
            self.diagnostics
                .errors
                .silent("Checksum", format_args!("{src}->{dst}: invalid checksum"));
            return Verdict::Rejected;
        }

        if !inner.conns.contains_key(&key) {
            if !pure_syn
                && let Some(closed_at) = inner.recently_closed.get(&key)
                && now.saturating_duration_since(*closed_at) < CLOSED_LINGER
            {
                return Verdict::Ignored;
            }
            inner.recently_closed.remove(&key);

            let from_syn_ack = segment.flags.syn && segment.flags.ack;
            let (client, server) = if from_syn_ack { (dst, src) } else { (src, dst) };
            let mut fsm = TcpFsm::new(self.options.allow_missing_init);
            let fsm_ok = fsm.check(segment.flags, src == client);
            if !fsm_ok {
                inner.stats.reject_fsm += 1;
                inner.stats.reject_conn_fsm += 1;
                self.diagnostics.errors.silent(
                    "FSM-rejection",
                    format_args!("{src}->{dst}: connection does not start with a SYN"),
                );
                if !self.options.ignore_fsm_err {
                    return Verdict::Rejected;
                }
            }

            let handle = self.factory.new_stream(
                FlowAddr { client, server },
                capture,
                segment.timestamp,
            );
            inner.conns.insert(
                key,
                Connection {
                    handle,
                    client,
                    fsm,
                    options: OptionChecker::default(),
                    halves: [Half::default(), Half::default()],
                    last_seen: now,
                    fsm_rejected: !fsm_ok,
                    reset: false,
                },
            );
            let Some(conn) = inner.conns.get_mut(&key) else {
                return Verdict::Rejected;
            };
            let mut budget = Budget {
                stats:        &mut inner.stats,
                queued_pages: &mut inner.queued_pages,
                per_conn:     self.options.max_buffered_pages_per_connection,
                total:        self.options.max_buffered_pages_total,
            };
            self.place(conn, src == client, segment, &mut budget);
        } else {
            let Some(conn) = inner.conns.get_mut(&key) else {
                return Verdict::Rejected;
            };
            conn.last_seen = now;
            let from_client = src == conn.client;

            if !conn.fsm.check(segment.flags, from_client) {
                inner.stats.reject_fsm += 1;
                if !conn.fsm_rejected {
                    inner.stats.reject_conn_fsm += 1;
                    conn.fsm_rejected = true;
                }
                self.diagnostics.errors.silent(
                    "FSM-rejection",
                    format_args!("{src}->{dst}: packet rejected in state {:?}", conn.fsm.state()),
                );
                if !self.options.ignore_fsm_err {
                    return Verdict::Rejected;
                }
            }

            let dir = usize::from(!from_client);
            if let Err(violation) = conn
                .options
                .accept(&segment, from_client, conn.halves[dir].next_seq)
            {
                inner.stats.reject_opt += 1;
                self.diagnostics.errors.silent(
                    "OptionChecker-rejection",
                    format_args!("{src}->{dst}: {violation}"),
                );
                if !self.options.no_opt_check {
                    return Verdict::Rejected;
                }
            }

            let mut budget = Budget {
                stats:        &mut inner.stats,
                queued_pages: &mut inner.queued_pages,
                per_conn:     self.options.max_buffered_pages_per_connection,
                total:        self.options.max_buffered_pages_total,
            };
            self.place(conn, from_client, segment, &mut budget);
        }

        if inner.conns.get(&key).is_some_and(Connection::finished)
            && let Some(mut conn) = inner.conns.remove(&key)
        {
            inner.queued_pages -= conn.queued_pages();
            conn.handle.complete();
            inner.recently_closed.insert(key, now);
            debug!(event.name = "assembler.closed", client = %conn.client, "connection finished");
        }
        Verdict::Accepted
    }

    fn place(
        &self,
        conn: &mut Connection<F::Handle>,
        from_client: bool,
        segment: TcpSegment,
        budget: &mut Budget<'_>,
    ) {
        let dir = usize::from(!from_client);
        let flags = segment.flags;
        let mut seq = segment.seq;
        if flags.syn {
            seq = seq.wrapping_add(1);
            conn.halves[dir].next_seq = Some(seq);
        }
        let next = *conn.halves[dir].next_seq.get_or_insert(seq);
        let fin_seq = flags
            .fin
            .then(|| seq.wrapping_add(segment.payload.len() as u32));

        let mut data = segment.payload;
        if !data.is_empty() {
            let diff = seq_diff(seq, next);
            if diff < 0 {
                let overlap = diff.unsigned_abs() as usize;
                budget.stats.overlap_packets += 1;
                if overlap >= data.len() {
                    budget.stats.overlap_bytes += data.len() as u64;
                    data.clear();
                } else {
                    budget.stats.overlap_bytes += overlap as u64;
                    data.drain(..overlap);
                    seq = next;
                }
            }
        }

        if !data.is_empty() {
            if seq == next {
                deliver_run(conn, dir, data, segment.timestamp, budget, true);
            } else {
                budget.stats.out_of_order_packets += 1;
                budget.stats.out_of_order_bytes += data.len() as u64;
                budget.stats.queued_packets += 1;
                budget.stats.queued_bytes += data.len() as u64;
                conn.halves[dir].queued.push(Queued {
                    seq,
                    data,
                    timestamp: segment.timestamp,
                });
                *budget.queued_pages += 1;

                if conn.queued_pages() > budget.per_conn || *budget.queued_pages > budget.total {
                    skip_gap(conn, dir, budget);
                }
            }
        }

        if let Some(fin_seq) = fin_seq {
            let half = &mut conn.halves[dir];
            half.fin_seq = Some(fin_seq);
            half.settle_fin();
        }
        if flags.rst {
            conn.reset = true;
        }
    }

    /// Flush and close connections not seen since `cutoff`. Queued
    /// out-of-order data is skipped over and dropped.
    pub fn flush_older_than(&self, cutoff: Instant) -> FlushResult {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut result = FlushResult::default();

        let stale: Vec<ConnKey> = inner
            .conns
            .iter()
            .filter(|(_, c)| c.last_seen < cutoff)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            let Some(mut conn) = inner.conns.remove(&key) else {
                continue;
            };
            if conn.queued_pages() > 0 {
                let mut budget = Budget {
                    stats:        &mut inner.stats,
                    queued_pages: &mut inner.queued_pages,
                    per_conn:     0,
                    total:        0,
                };
                for dir in 0..2 {
                    while !conn.halves[dir].queued.is_empty() {
                        skip_gap(&mut conn, dir, &mut budget);
                    }
                }
                result.flushed += 1;
            }
            conn.handle.complete();
            result.closed += 1;
        }

        let now = Instant::now();
        inner
            .recently_closed
            .retain(|_, closed_at| now.saturating_duration_since(*closed_at) < CLOSED_LINGER);
        result
    }

    /// Close every connection; used at shutdown.
    pub fn flush_all(&self) -> usize {
        let mut guard = self.inner.lock();
        let closed = guard.conns.len();
        for (_, mut conn) in guard.conns.drain() {
            conn.handle.complete();
        }
        guard.queued_pages = 0;
        guard.recently_closed.clear();
        closed
    }

    pub fn stats(&self) -> AssemblerStats {
        self.inner.lock().stats.clone()
    }

    pub fn connections(&self) -> usize {
        self.inner.lock().conns.len()
    }
}

/// Deliver `data` (which starts at the expected sequence number) and then
/// everything queued that has become contiguous. With `emit` false the run
/// is consumed without delivery.
fn deliver_run<H: StreamHandle>(
    conn: &mut Connection<H>,
    dir: usize,
    data: Vec<u8>,
    timestamp: SystemTime,
    budget: &mut Budget<'_>,
    emit: bool,
) {
    let from_client = dir == 0;
    let mut run_bytes = data.len() as u64;
    let mut run_packets = 1u64;
    let mut next = conn.halves[dir]
        .next_seq
        .unwrap_or_default()
        .wrapping_add(data.len() as u32);
    if emit {
        conn.handle.deliver(from_client, Chunk { data, timestamp });
    }

    loop {
        let half = &mut conn.halves[dir];
        let Some(pos) = half
            .queued
            .iter()
            .position(|q| seq_diff(q.seq, next) <= 0)
        else {
            break;
        };
        let mut piece = half.queued.swap_remove(pos);
        *budget.queued_pages -= 1;
        let overlap = seq_diff(next, piece.seq) as usize;
        if overlap >= piece.data.len() {
            budget.stats.overlap_packets += 1;
            budget.stats.overlap_bytes += piece.data.len() as u64;
            continue;
        }
        if overlap > 0 {
            budget.stats.overlap_packets += 1;
            budget.stats.overlap_bytes += overlap as u64;
            piece.data.drain(..overlap);
        }
        next = next.wrapping_add(piece.data.len() as u32);
        run_bytes += piece.data.len() as u64;
        run_packets += 1;
        if emit {
            conn.handle.deliver(
                from_client,
                Chunk {
                    data:      piece.data,
                    timestamp: piece.timestamp,
                },
            );
        }
    }

    let half = &mut conn.halves[dir];
    half.next_seq = Some(next);
    half.settle_fin();
    if run_packets > 1 {
        budget.stats.reassembled += 1;
    }
    if emit {
        budget.stats.sz += run_bytes;
        budget.stats.biggest_chunk_bytes = budget.stats.biggest_chunk_bytes.max(run_bytes);
        budget.stats.biggest_chunk_packets = budget.stats.biggest_chunk_packets.max(run_packets);
    }
}

/// Give up on the hole before the earliest queued segment: count it as
/// missed and drop the run that follows it.
fn skip_gap<H: StreamHandle>(conn: &mut Connection<H>, dir: usize, budget: &mut Budget<'_>) {
    let half = &mut conn.halves[dir];
    let Some(head) = half.queued.first() else {
        return;
    };
    let next = half.next_seq.unwrap_or(head.seq);
    let Some(pos) = (0..half.queued.len()).min_by_key(|&i| seq_diff(half.queued[i].seq, next))
    else {
        return;
    };
    let first = half.queued.swap_remove(pos);
    *budget.queued_pages -= 1;
    let gap = seq_diff(first.seq, next).max(0) as u64;
    budget.stats.missed_bytes += gap;
    half.next_seq = Some(first.seq);
    deliver_run(conn, dir, first.data, first.timestamp, budget, false);
}
