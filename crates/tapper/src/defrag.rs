//! IPv4 fragment reassembly

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    time::{Duration, Instant},
};

/// Partial datagrams older than this are dropped.
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest datagram a fragment may extend to.
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src:      Ipv4Addr,
    pub dst:      Ipv4Addr,
    pub id:       u16,
    pub protocol: u8,
}

/// One fragment: its payload and where it goes in the datagram.
#[derive(Debug, Clone)]
pub struct Fragment<'a> {
    /// Offset in bytes
    pub offset:         usize,
    pub more_fragments: bool,
    pub data:           &'a [u8],
}

#[derive(Debug)]
struct Partial {
    pieces:     Vec<(usize, Vec<u8>)>,
    total_len:  Option<usize>,
    first_seen: Instant,
}

impl Partial {
    /// Datagram payload once the last fragment is in and there are no holes.
    fn assemble(&mut self) -> Option<Vec<u8>> {
        let total = self.total_len?;
        self.pieces.sort_by_key(|(offset, _)| *offset);
        let mut covered = 0;
        for (offset, data) in &self.pieces {
            if *offset > covered {
                return None;
            }
            covered = covered.max(offset + data.len());
        }
        if covered < total {
            return None;
        }
        let mut out = vec![0u8; total];
        for (offset, data) in &self.pieces {
            let end = (offset + data.len()).min(total);
            if *offset < end {
                out[*offset..end].copy_from_slice(&data[..end - offset]);
            }
        }
        Some(out)
    }
}

/// Holds partial IPv4 datagrams until they complete or time out.
#[derive(Debug)]
pub struct Defragmenter {
    pending:    HashMap<FragmentKey, Partial>,
    timeout:    Duration,
    /// Datagrams reassembled so far
    pub merged: u64,
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new(FRAGMENT_TIMEOUT)
    }
}

impl Defragmenter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            merged: 0,
        }
    }

    /// Add a fragment. Returns the full datagram payload when this fragment
    /// completes it; `None` while it is still retained.
    pub fn insert(&mut self, key: FragmentKey, fragment: Fragment<'_>, now: Instant) -> Option<Vec<u8>> {
        let end = fragment.offset + fragment.data.len();
        if end > MAX_DATAGRAM {
            self.pending.remove(&key);
            return None;
        }
        let partial = self.pending.entry(key).or_insert_with(|| Partial {
            pieces:     Vec::new(),
            total_len:  None,
            first_seen: now,
        });
        if !fragment.more_fragments {
            partial.total_len = Some(end);
        }
        partial.pieces.push((fragment.offset, fragment.data.to_vec()));

        let datagram = partial.assemble()?;
        self.pending.remove(&key);
        self.merged += 1;
        Some(datagram)
    }

    /// Drop partial datagrams first seen before `now - timeout`; returns
    /// how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.first_seen) < timeout);
        before - self.pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
