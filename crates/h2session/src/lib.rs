//! Incremental HTTP/2 parsing for passively observed connections.
//!
//! One [`H2ConnectionState`] tracks one half of a connection: it owns the
//! HPACK decoder for that direction, accumulates frames per stream and yields
//! a [`ParsedH2Message`] when a stream ends. Bodies are capped at
//! [`H2Limits::max_body_size`]; data past the cap is dropped and the message
//! is flagged as truncated.

mod frame;
mod http_types;
mod parse;
mod state;

#[cfg(feature = "tracing")]
macro_rules! trace_warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn {
    ($($arg:tt)*) => {};
}
pub(crate) use trace_warn;

pub use frame::{
    CONNECTION_PREFACE, FRAME_HEADER_SIZE, is_http2_preface, is_server_settings_frame,
    looks_like_http2_frame,
};
pub use http_types::{HttpRequest, HttpResponse};
pub use state::{
    H2ConnectionState, H2Limits, ParseError, ParseErrorKind, ParsedH2Message, StreamId,
    TimestampNs,
};

/// Default cap for accumulated DATA per stream (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
