//! Shared vocabulary between the tapper and its protocol dissectors.
//!
//! A capture pipeline hands each reassembled TCP direction to a
//! [`TcpReader`]; a [`Dissector`] reads from it, turns bytes into
//! [`Message`]s, pairs them through the stream's
//! [`RequestResponseMatcher`] and publishes the resulting [`Exchange`]s
//! through an [`Emitter`].

mod diagnose;
mod dissector;
mod exchange;
mod matcher;
mod message;
mod options;
mod protocol;

pub use diagnose::{AppStats, AppStatsSnapshot, Diagnostics, ErrorLevel, ErrorMap};
pub use dissector::{CounterPair, DissectError, Dissector, Emitter, TcpReader};
pub use exchange::{Endpoint, Exchange, ExchangeSummary};
pub use matcher::{MatchOutcome, MatchedPair, RequestResponseMatcher};
pub use message::{
    Body, Capture, ConnectionInfo, GenericRecord, Header, HttpRequestRecord, HttpResponseRecord,
    Message, Payload, TcpId,
};
pub use options::TrafficFilteringOptions;
pub use protocol::{Protocol, ProtocolId};
