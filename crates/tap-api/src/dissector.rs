//! The dissector contract and the reader it consumes

use std::{
    collections::BTreeMap,
    io::BufRead,
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use thiserror::Error;
use tracing::info;

use crate::{
    diagnose::Diagnostics,
    exchange::{Exchange, ExchangeSummary},
    matcher::{MatchOutcome, MatchedPair, RequestResponseMatcher},
    message::{Capture, ConnectionInfo, Message, TcpId},
    options::TrafficFilteringOptions,
    protocol::{Protocol, ProtocolId},
};

/// Why a dissector gave up on a reader.
#[derive(Debug, Error)]
pub enum DissectError {
    #[error("not {protocol}: {reason}")]
    NotProtocol {
        protocol: ProtocolId,
        reason:   String,
    },
    #[error("malformed {protocol} message: {reason}")]
    Malformed {
        protocol: ProtocolId,
        reason:   String,
    },
    /// The other direction identified a different protocol
    #[error("stream already identified as {0}")]
    Claimed(ProtocolId),
    #[error(transparent)]
    Http2(#[from] h2session::ParseError),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl DissectError {
    pub fn not_protocol(protocol: ProtocolId, reason: impl Into<String>) -> Self {
        Self::NotProtocol {
            protocol,
            reason: reason.into(),
        }
    }

    pub fn malformed(protocol: ProtocolId, reason: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Receives exchanges ready for publication.
pub trait Emitter: Send + Sync {
    fn emit(&self, exchange: Exchange);
}

/// Per-direction message counters used to build pairing keys for protocols
/// without a native correlation id.
#[derive(Debug, Default)]
pub struct CounterPair {
    request:  AtomicU64,
    response: AtomicU64,
}

impl CounterPair {
    /// Next index for the given direction, starting at 1.
    pub fn next(&self, is_client: bool) -> u64 {
        let counter = if is_client {
            &self.request
        } else {
            &self.response
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// One direction of a reassembled TCP stream, as seen by a dissector.
///
/// Reads block until payload arrives; EOF means the stream closed. While the
/// stream is unidentified, everything read is kept so the next dissector in
/// the chain can start over from the first byte.
pub trait TcpReader: BufRead + Send {
    /// Client-to-server direction
    fn is_client(&self) -> bool;
    fn tcp_id(&self) -> &TcpId;
    /// Capture time of the chunk currently being read
    fn capture_time(&self) -> SystemTime;
    /// Bytes consumed since the reader was created
    fn read_progress(&self) -> usize;
    fn capture(&self) -> Capture;
    fn is_outgoing(&self) -> bool;
    /// Either endpoint uses port 53
    fn is_dns(&self) -> bool;
    /// Matcher of the dissector currently running
    fn matcher(&self) -> &RequestResponseMatcher;
    /// Counters of the dissector currently running
    fn counter_pair(&self) -> &CounterPair;
    fn emitter(&self) -> &dyn Emitter;
    fn options(&self) -> &TrafficFilteringOptions;
    fn diagnostics(&self) -> &Diagnostics;
    /// Claim the stream for `protocol`. Returns false when the stream is
    /// already identified as something else.
    fn identify(&mut self, protocol: ProtocolId) -> bool;
    fn identified(&self) -> Option<ProtocolId>;

    fn connection_info(&self) -> ConnectionInfo {
        self.tcp_id()
            .connection_info(self.is_client(), self.is_outgoing())
    }

    /// `"caddr:cport->saddr:sport"` for this stream
    fn flow_key(&self) -> String {
        self.tcp_id().flow_key(self.is_client())
    }

    /// Register a message with the current matcher, tallying matches and
    /// duplicates.
    fn register(&self, key: String, message: Message) -> Option<MatchedPair> {
        let is_request = message.is_request;
        let outcome = if is_request {
            self.matcher().register_request(key.as_str(), message)
        } else {
            self.matcher().register_response(key.as_str(), message)
        };
        match outcome {
            MatchOutcome::Matched(pair) => {
                self.diagnostics().stats.inc_matched_messages();
                Some(*pair)
            },
            MatchOutcome::Stored => None,
            MatchOutcome::Duplicate => {
                let tag = if is_request {
                    "Request-Duplicate"
                } else {
                    "Response-Duplicate"
                };
                self.diagnostics()
                    .errors
                    .silent(tag, format_args!("duplicate key {key}"));
                None
            },
        }
    }
}

/// A protocol plugin.
pub trait Dissector: Send + Sync {
    fn id(&self) -> ProtocolId;

    /// Descriptors this dissector can attach to exchanges
    fn protocols(&self) -> &'static [Protocol];

    /// Short filter names mapped to their expansion
    fn macros(&self) -> BTreeMap<&'static str, String>;

    fn ping(&self) {
        info!(
            event.name = "dissector.loaded",
            protocol = %self.id(),
            "dissector loaded"
        );
    }

    /// Read messages from `reader` until EOF. Returns an error when the
    /// bytes are not this protocol.
    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError>;

    fn new_matcher(&self) -> RequestResponseMatcher {
        RequestResponseMatcher::new()
    }

    /// Publish an exchange, after any protocol-specific filtering.
    fn emit(&self, exchange: Exchange, _options: &TrafficFilteringOptions, emitter: &dyn Emitter) {
        emitter.emit(exchange);
    }

    fn summarize(&self, exchange: &Exchange) -> ExchangeSummary {
        exchange.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_pair_directions_are_independent() {
        let c = CounterPair::default();
        assert_eq!(c.next(true), 1);
        assert_eq!(c.next(true), 2);
        assert_eq!(c.next(false), 1);
        assert_eq!(c.next(true), 3);
    }

    #[test]
    fn test_error_display() {
        let e = DissectError::not_protocol(ProtocolId::Redis, "bad type byte");
        assert_eq!(e.to_string(), "not redis: bad type byte");
    }
}
