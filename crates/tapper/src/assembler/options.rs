//! TCP option and window sanity checks

use thiserror::Error;

use super::seq_diff;
use crate::packet::TcpSegment;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionViolation {
    #[error("re-emitted packet (diff {diff}, seq {seq}, expected {expected})")]
    Reemitted { diff: i32, seq: u32, expected: u32 },
    #[error("{len} > mss ({mss})")]
    AboveMss { len: usize, mss: u16 },
    #[error("{diff} > receive window ({window})")]
    AboveWindow { diff: i32, window: u32 },
}

#[derive(Debug, Clone, Copy, Default)]
struct SideOptions {
    mss:            Option<u16>,
    scale:          Option<u8>,
    receive_window: u32,
}

/// Remembers MSS and window scale from each side's SYN and checks later
/// segments against the peer's advertised limits.
#[derive(Debug, Clone, Default)]
pub struct OptionChecker {
    /// Index 0 is the client side
    sides: [SideOptions; 2],
}

impl OptionChecker {
    /// `next_seq` is the next expected sequence number in the segment's
    /// direction, when known.
    pub fn accept(
        &mut self,
        segment: &TcpSegment,
        from_client: bool,
        next_seq: Option<u32>,
    ) -> Result<(), OptionViolation> {
        let (own, peer) = if from_client { (0, 1) } else { (1, 0) };

        if segment.flags.syn {
            self.sides[own].mss = segment.mss;
            self.sides[own].scale = segment.window_scale;
        } else if let Some(expected) = next_seq {
            let peer_opts = self.sides[peer];
            let len = segment.payload.len();
            let diff = seq_diff(segment.seq, expected);
            if diff == -1 && len <= 1 {
                // keep-alive
            } else if diff < 0 {
                return Err(OptionViolation::Reemitted {
                    diff,
                    seq: segment.seq,
                    expected,
                });
            } else if let Some(mss) = peer_opts.mss
                && len > usize::from(mss)
            {
                return Err(OptionViolation::AboveMss { len, mss });
            } else if peer_opts.receive_window != 0
                && peer_opts.scale.is_none()
                && diff as u32 > peer_opts.receive_window
            {
                return Err(OptionViolation::AboveWindow {
                    diff,
                    window: peer_opts.receive_window,
                });
            }
        }

        let side = &mut self.sides[own];
        side.receive_window = u32::from(segment.window) << side.scale.unwrap_or(0).min(14);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::packet::TcpFlags;

    fn segment(seq: u32, syn: bool, mss: Option<u16>, payload: usize) -> TcpSegment {
        TcpSegment {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 1,
            dst_port: 2,
            seq,
            ack: 0,
            flags: TcpFlags {
                syn,
                ack: !syn,
                ..TcpFlags::default()
            },
            window: 1000,
            mss,
            window_scale: None,
            payload: vec![0; payload],
            checksum_ok: None,
            timestamp: SystemTime::UNIX_EPOCH,
            wire_len: 0,
            defragmented: false,
        }
    }

    #[test]
    fn test_segment_above_peer_mss() {
        let mut c = OptionChecker::default();
        c.accept(&segment(0, true, Some(100), 0), false, None).unwrap();
        assert!(c.accept(&segment(10, false, None, 50), true, Some(10)).is_ok());
        assert_eq!(
            c.accept(&segment(60, false, None, 101), true, Some(60)),
            Err(OptionViolation::AboveMss { len: 101, mss: 100 })
        );
    }

    #[test]
    fn test_retransmission_and_keepalive() {
        let mut c = OptionChecker::default();
        assert!(matches!(
            c.accept(&segment(5, false, None, 10), true, Some(10)),
            Err(OptionViolation::Reemitted { diff: -5, .. })
        ));
        assert!(c.accept(&segment(9, false, None, 1), true, Some(10)).is_ok());
    }

    #[test]
    fn test_beyond_receive_window() {
        let mut c = OptionChecker::default();
        c.accept(&segment(0, false, None, 0), false, None).unwrap();
        assert!(matches!(
            c.accept(&segment(5000, false, None, 10), true, Some(10)),
            Err(OptionViolation::AboveWindow { window: 1000, .. })
        ));
    }
}
