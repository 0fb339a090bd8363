//! Simple TCP connection state machine

use crate::packet::TcpFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    SynAckSeen,
    Established,
    Closing,
    Reset,
}

/// Tracks the handshake and teardown of one connection. Directions are
/// given as "from the client" booleans.
#[derive(Debug, Clone)]
pub struct TcpFsm {
    state:              TcpState,
    /// Direction of the initiating SYN
    opener_is_client:   bool,
    allow_missing_init: bool,
}

impl TcpFsm {
    pub fn new(allow_missing_init: bool) -> Self {
        Self {
            state: TcpState::Closed,
            opener_is_client: true,
            allow_missing_init,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Advance on a segment; false when the segment does not fit the
    /// current state.
    pub fn check(&mut self, flags: TcpFlags, from_client: bool) -> bool {
        let pure_syn = flags.syn && !flags.ack;
        let syn_ack = flags.syn && flags.ack;

        if self.state == TcpState::Closed && self.allow_missing_init && !pure_syn {
            if syn_ack {
                self.state = TcpState::SynAckSeen;
                self.opener_is_client = !from_client;
            } else {
                self.state = TcpState::Established;
                self.opener_is_client = from_client;
                self.on_established(flags);
            }
            return true;
        }

        match self.state {
            TcpState::Closed => {
                if pure_syn {
                    self.state = TcpState::SynSent;
                    self.opener_is_client = from_client;
                    return true;
                }
                false
            },
            TcpState::SynSent => {
                if syn_ack && from_client != self.opener_is_client {
                    self.state = TcpState::SynAckSeen;
                    return true;
                }
                pure_syn && from_client == self.opener_is_client
            },
            TcpState::SynAckSeen => {
                if flags.rst {
                    self.state = TcpState::Reset;
                    return true;
                }
                if !flags.syn && flags.ack && from_client == self.opener_is_client {
                    self.state = TcpState::Established;
                    self.on_established(flags);
                    return true;
                }
                syn_ack && from_client != self.opener_is_client
            },
            TcpState::Established => {
                if flags.syn {
                    return false;
                }
                self.on_established(flags);
                true
            },
            TcpState::Closing => {
                if flags.rst {
                    self.state = TcpState::Reset;
                }
                !flags.syn
            },
            TcpState::Reset => flags.rst,
        }
    }

    fn on_established(&mut self, flags: TcpFlags) {
        if flags.rst {
            self.state = TcpState::Reset;
        } else if flags.fin {
            self.state = TcpState::Closing;
        }
    }
}
