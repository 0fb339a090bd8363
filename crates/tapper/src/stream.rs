//! A tapped TCP stream shared by its two readers

use std::{
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::{Duration, Instant, SystemTime},
};

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tap_api::{Capture, CounterPair, ProtocolId, RequestResponseMatcher, TcpId};

use crate::assembler::Chunk;

/// Payload chunks queued per direction before delivery blocks.
pub const READER_QUEUE_CAPACITY: usize = 256;

/// Longest the assembler waits on a full reader queue.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);

const UNIDENTIFIED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Closed,
    TimedOut,
}

/// Receiving ends of a stream's two reader queues.
pub struct StreamReceivers {
    pub client: Receiver<Chunk>,
    pub server: Receiver<Chunk>,
}

/// One tapped flow. Owned by the registry; readers keep a handle to it and
/// hold only the receiving ends of the queues, so closing the stream drops
/// the senders and ends both readers.
pub struct Stream {
    pub id:          i64,
    /// Client-to-server addressing
    pub client_id:   TcpId,
    pub created_at:  Instant,
    pub first_seen:  SystemTime,
    pub capture:     Capture,
    pub is_outgoing: bool,
    pub is_dns:      bool,
    protocol:        AtomicU8,
    matchers:        Vec<RequestResponseMatcher>,
    counters:        Vec<CounterPair>,
    closed:          AtomicBool,
    senders:         Mutex<Option<(Sender<Chunk>, Sender<Chunk>)>>,
}

impl Stream {
    /// A stream with one matcher per dissector, in chain order.
    pub fn new(
        client_id: TcpId,
        capture: Capture,
        created_at: Instant,
        first_seen: SystemTime,
        is_outgoing: bool,
        matchers: Vec<RequestResponseMatcher>,
    ) -> (Self, StreamReceivers) {
        let (client_tx, client_rx) = channel::bounded(READER_QUEUE_CAPACITY);
        let (server_tx, server_rx) = channel::bounded(READER_QUEUE_CAPACITY);
        let is_dns = client_id.src_port == 53 || client_id.dst_port == 53;
        let counters = matchers.iter().map(|_| CounterPair::default()).collect();
        let stream = Self {
            id: client_id.id,
            client_id,
            created_at,
            first_seen,
            capture,
            is_outgoing,
            is_dns,
            protocol: AtomicU8::new(UNIDENTIFIED),
            matchers,
            counters,
            closed: AtomicBool::new(false),
            senders: Mutex::new(Some((client_tx, server_tx))),
        };
        (stream, StreamReceivers {
            client: client_rx,
            server: server_rx,
        })
    }

    /// Claim the stream for `protocol`. True when it was unclaimed or
    /// already claimed by the same protocol.
    pub fn identify(&self, protocol: ProtocolId) -> bool {
        let tag = protocol as u8 + 1;
        match self
            .protocol
            .compare_exchange(UNIDENTIFIED, tag, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == tag,
        }
    }

    pub fn protocol(&self) -> Option<ProtocolId> {
        match self.protocol.load(Ordering::Acquire) {
            UNIDENTIFIED => None,
            tag => ProtocolId::from_index(usize::from(tag - 1)),
        }
    }

    pub fn matcher(&self, index: usize) -> &RequestResponseMatcher {
        &self.matchers[index]
    }

    pub fn counters(&self, index: usize) -> &CounterPair {
        &self.counters[index]
    }

    pub fn delete_matches_older_than(&self, cutoff: Instant) -> usize {
        self.matchers
            .iter()
            .map(|m| m.delete_older_than(cutoff))
            .sum()
    }

    pub fn unmatched(&self) -> usize {
        self.matchers.iter().map(RequestResponseMatcher::len).sum()
    }

    /// Queue a chunk for the reader of the given direction.
    pub fn send(&self, from_client: bool, chunk: Chunk) -> SendOutcome {
        let tx = {
            let guard = self.senders.lock();
            match guard.as_ref() {
                Some((client, server)) => {
                    if from_client {
                        client.clone()
                    } else {
                        server.clone()
                    }
                },
                None => return SendOutcome::Closed,
            }
        };
        match tx.send_timeout(chunk, SEND_TIMEOUT) {
            Ok(()) => SendOutcome::Sent,
            Err(SendTimeoutError::Timeout(_)) => SendOutcome::TimedOut,
            Err(SendTimeoutError::Disconnected(_)) => SendOutcome::Closed,
        }
    }

    /// Close both reader queues. Only the first call has an effect; readers
    /// still drain whatever was queued before it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.senders.lock().take();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
