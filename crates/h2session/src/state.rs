use std::collections::{HashMap, VecDeque};

/// Newtype for HTTP/2 stream identifiers (RFC 7540 §5.1.1: 31-bit unsigned
/// integer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<StreamId> for u32 {
    fn from(v: StreamId) -> Self {
        v.0
    }
}

/// Newtype for nanosecond-precision timestamps (monotonic clock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampNs(pub u64);

impl TimestampNs {
    /// Returns `self - other`, clamped to zero on underflow.
    pub fn saturating_sub(self, other: TimestampNs) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl std::fmt::Display for TimestampNs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl From<u64> for TimestampNs {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<TimestampNs> for u64 {
    fn from(v: TimestampNs) -> Self {
        v.0
    }
}

/// Configurable limits for HTTP/2 header decoding and stream management.
///
/// These limits defend against resource exhaustion from untrusted input
/// (e.g., HPACK decompression bombs, stream flooding).
#[derive(Debug, Clone)]
pub struct H2Limits {
    /// Maximum total decoded header list size in bytes (default: 65536, RFC
    /// 7540 default)
    pub max_header_list_size:   usize,
    /// Maximum number of headers per HEADERS block (default: 128)
    pub max_header_count:       usize,
    /// Maximum size of any individual header value in bytes (default: 8192)
    pub max_header_value_size:  usize,
    /// Hard cap for HPACK dynamic table size (default: 65536)
    pub max_table_size:         usize,
    /// Maximum concurrent active streams before rejecting new ones (default:
    /// 100)
    pub max_concurrent_streams: usize,
    /// Streams whose first frame is older than this are evicted (default: 30s)
    pub stream_timeout_ns:      u64,
    /// Cap on accumulated DATA per stream in bytes (default: 1 MiB). Data
    /// beyond the cap is discarded and the message is marked truncated.
    pub max_body_size:          usize,
    /// Maximum buffer size for incremental parsing in bytes (default: 16 MiB
    /// plus one frame header, enough for a maximum-size frame).
    pub max_buffer_size:        usize,
}

impl Default for H2Limits {
    fn default() -> Self {
        Self {
            max_header_list_size:   65536,
            max_header_count:       128,
            max_header_value_size:  8192,
            max_table_size:         65536,
            max_concurrent_streams: 100,
            stream_timeout_ns:      30_000_000_000,
            max_body_size:          crate::DEFAULT_MAX_BODY_SIZE,
            max_buffer_size:        (1 << 24) + crate::FRAME_HEADER_SIZE,
        }
    }
}

impl H2Limits {
    /// Default limits with a custom body cap.
    pub fn with_max_body_size(max_body_size: usize) -> Self {
        Self {
            max_body_size,
            ..Self::default()
        }
    }
}

/// Connection-level HTTP/2 state
///
/// Maintains HPACK decoder state and active stream tracking for one direction
/// of a single HTTP/2 connection. Create one instance per half-connection.
///
/// Use `feed()` to incrementally add data with timestamps, and `try_pop()`
/// to retrieve completed messages.
pub struct H2ConnectionState {
    /// Persistent HPACK decoder with dynamic table
    pub(crate) decoder: loona_hpack::Decoder<'static>,

    /// Active streams being tracked
    pub(crate) active_streams: HashMap<StreamId, StreamState>,

    /// Connection settings (from SETTINGS frames)
    pub(crate) settings: H2Settings,

    /// Resource limits for header decoding and stream management
    pub(crate) limits: H2Limits,

    /// Whether the connection preface has been consumed on this half.
    pub preface_received: bool,

    /// Highest stream ID seen
    pub(crate) highest_stream_id: StreamId,

    /// Internal buffer for incremental parsing
    pub(crate) buffer: Vec<u8>,

    /// Completed messages ready to be popped
    pub(crate) completed: VecDeque<(StreamId, ParsedH2Message)>,

    /// Timestamp of the data most recently fed
    pub(crate) current_timestamp_ns: TimestampNs,
}

/// Phase of a stream's lifecycle (RFC 7540 §5.1).
///
/// Transitions only move forward:
///   ReceivingHeaders → ReceivingBody → ReceivingTrailers → Complete
///   ReceivingHeaders → Complete  (when END_STREAM arrives with HEADERS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    /// HEADERS received but END_HEADERS not yet seen; CONTINUATION pending.
    ReceivingHeaders { end_stream_seen: bool },
    /// Headers complete, awaiting DATA, trailers or END_STREAM.
    ReceivingBody,
    /// Trailing HEADERS received without END_HEADERS; CONTINUATION pending.
    ReceivingTrailers { end_stream_seen: bool },
    /// END_STREAM received after a complete header block.
    Complete,
}

/// Per-stream state (internal to crate)
pub(crate) struct StreamState {
    /// Decoded regular headers, in wire order
    pub(crate) headers:  Vec<(String, String)>,
    /// Decoded trailer fields
    pub(crate) trailers: Vec<(String, String)>,

    pub(crate) method:    Option<String>,
    pub(crate) path:      Option<String>,
    pub(crate) authority: Option<String>,
    pub(crate) scheme:    Option<String>,
    pub(crate) status:    Option<u16>,

    /// Accumulated body from DATA frames, capped at `max_body_size`
    pub(crate) body:      Vec<u8>,
    /// Set once any DATA had to be discarded because of the cap
    pub(crate) truncated: bool,

    /// Buffer for incomplete header blocks (CONTINUATION support)
    pub(crate) continuation_buffer: Vec<u8>,

    /// Total size of HEADERS and CONTINUATION frames
    pub(crate) header_size: usize,

    pub(crate) phase: StreamPhase,

    pub(crate) first_frame_timestamp_ns: TimestampNs,
    pub(crate) end_stream_timestamp_ns:  TimestampNs,
}

/// Settings announced by the sender of this half (internal to crate)
#[derive(Clone)]
pub(crate) struct H2Settings {
    pub(crate) header_table_size: u32,
    pub(crate) max_frame_size:    u32,
}

impl Default for H2Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            max_frame_size:    16384,
        }
    }
}

impl Default for H2ConnectionState {
    fn default() -> Self {
        Self::with_limits(H2Limits::default())
    }
}

impl H2ConnectionState {
    /// Create a connection state with default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new H2ConnectionState with custom limits.
    pub fn with_limits(limits: H2Limits) -> Self {
        let mut decoder = loona_hpack::Decoder::new();
        decoder.set_max_allowed_table_size(limits.max_table_size);
        Self {
            decoder,
            active_streams: HashMap::new(),
            settings: H2Settings::default(),
            limits,
            preface_received: false,
            highest_stream_id: StreamId(0),
            buffer: Vec::new(),
            completed: VecDeque::new(),
            current_timestamp_ns: TimestampNs(0),
        }
    }

    /// Feed new data for incremental parsing with a timestamp.
    ///
    /// Returns Ok(()) if data was processed (even if no messages completed
    /// yet). Returns Err only for fatal parse errors; after an HPACK error
    /// the decoder's dynamic table is unreliable and the caller should stop
    /// feeding this half.
    pub fn feed(&mut self, data: &[u8], timestamp_ns: TimestampNs) -> Result<(), ParseError> {
        if self.buffer.len() + data.len() > self.limits.max_buffer_size {
            return Err(ParseError::new(ParseErrorKind::Http2BufferTooLarge));
        }
        self.buffer.extend_from_slice(data);
        self.current_timestamp_ns = timestamp_ns;
        crate::parse::parse_buffer_incremental(self)
    }

    /// Pop a completed message if available, in completion order.
    pub fn try_pop(&mut self) -> Option<(StreamId, ParsedH2Message)> {
        self.completed.pop_front()
    }

    /// Check if any completed messages are ready to be popped.
    pub fn has_completed(&self) -> bool {
        !self.completed.is_empty()
    }

    /// Returns the number of active (incomplete) streams.
    pub fn active_stream_count(&self) -> usize {
        self.active_streams.len()
    }

    /// SETTINGS_MAX_FRAME_SIZE announced by the sender of this half.
    pub fn announced_max_frame_size(&self) -> u32 {
        self.settings.max_frame_size
    }

    /// SETTINGS_HEADER_TABLE_SIZE announced by the sender of this half.
    pub fn announced_header_table_size(&self) -> u32 {
        self.settings.header_table_size
    }

    /// Bytes buffered but not yet parsed into frames.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Evict stale streams that have exceeded the configured timeout.
    ///
    /// Removes streams whose first frame arrived more than `stream_timeout_ns`
    /// ago. If still over `max_concurrent_streams` after timeout eviction,
    /// removes the oldest streams by `first_frame_timestamp_ns`. Only
    /// incomplete streams live in `active_streams`, so popped or queued
    /// messages are never affected.
    pub fn evict_stale_streams(&mut self, current_time_ns: TimestampNs) {
        let timeout = self.limits.stream_timeout_ns;
        let max_streams = self.limits.max_concurrent_streams;

        self.active_streams.retain(|_id, stream| {
            let stale = current_time_ns.saturating_sub(stream.first_frame_timestamp_ns) >= timeout;
            if stale {
                crate::trace_warn!("evicting stale stream {_id} (timeout)");
            }
            !stale
        });

        while self.active_streams.len() > max_streams {
            let oldest_id = self
                .active_streams
                .iter()
                .min_by_key(|(_, s)| s.first_frame_timestamp_ns)
                .map(|(&id, _)| id);
            if let Some(id) = oldest_id {
                crate::trace_warn!("evicting stream {id} (over max_concurrent_streams)");
                self.active_streams.remove(&id);
            } else {
                break;
            }
        }
    }
}

impl StreamState {
    pub(crate) fn new(timestamp_ns: TimestampNs) -> Self {
        Self {
            headers: Vec::new(),
            trailers: Vec::new(),
            method: None,
            path: None,
            authority: None,
            scheme: None,
            status: None,
            body: Vec::new(),
            truncated: false,
            continuation_buffer: Vec::new(),
            header_size: 0,
            phase: StreamPhase::ReceivingHeaders {
                end_stream_seen: false,
            },
            first_frame_timestamp_ns: timestamp_ns,
            end_stream_timestamp_ns: TimestampNs(0),
        }
    }

    /// Append DATA, keeping at most `limit` bytes in total.
    pub(crate) fn append_body(&mut self, data: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.body.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.body.extend_from_slice(&data[..data.len().min(room)]);
    }
}

/// A fully parsed HTTP/2 message extracted from a completed stream.
///
/// Pseudo-headers are lifted into dedicated fields; `headers` carries the
/// regular fields in wire order and `trailers` any trailing header block.
#[derive(Debug, Clone)]
pub struct ParsedH2Message {
    /// `:method` pseudo-header (present for requests)
    pub method: Option<String>,
    /// `:path` pseudo-header (present for requests)
    pub path: Option<String>,
    /// `:authority` pseudo-header (present for requests)
    pub authority: Option<String>,
    /// `:scheme` pseudo-header (present for requests)
    pub scheme: Option<String>,
    /// `:status` pseudo-header (present for responses)
    pub status: Option<u16>,
    /// Decoded regular headers in wire order
    pub headers: Vec<(String, String)>,
    /// Trailer fields (e.g. `grpc-status`)
    pub trailers: Vec<(String, String)>,
    /// HTTP/2 stream identifier
    pub stream_id: StreamId,
    /// Total size of the header frames in bytes
    pub header_size: usize,
    /// Accumulated body from DATA frames, at most `max_body_size` bytes
    pub body: Vec<u8>,
    /// Whether DATA beyond the body cap was discarded
    pub truncated: bool,
    /// Timestamp when first frame for this stream was received
    pub first_frame_timestamp_ns: TimestampNs,
    /// Timestamp when stream completed (END_STREAM received)
    pub end_stream_timestamp_ns: TimestampNs,
}

impl ParsedH2Message {
    /// Returns true if this message is a request (has :method pseudo-header)
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Returns true if this message is a response (has :status pseudo-header)
    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }

    /// First regular header or trailer with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .chain(self.trailers.iter())
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// gRPC messages carry `application/grpc*` content types or a
    /// `grpc-status` field.
    pub fn is_grpc(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.starts_with("application/grpc"))
            || self.header("grpc-status").is_some()
    }

    /// `grpc-status` from headers or trailers, parsed as an integer.
    pub fn grpc_status(&self) -> Option<u32> {
        self.header("grpc-status")?.trim().parse().ok()
    }

    /// `{scheme}://{authority}{path}`; falls back to the bare path when no
    /// authority was sent.
    pub fn url(&self) -> String {
        let path = self.path.as_deref().unwrap_or("/");
        match &self.authority {
            Some(authority) => {
                let scheme = self.scheme.as_deref().unwrap_or("http");
                format!("{scheme}://{authority}{path}")
            },
            None => path.to_string(),
        }
    }

    /// Convert :status pseudo-header to http::StatusCode
    pub fn http_status(&self) -> Option<http::StatusCode> {
        self.status.and_then(|s| http::StatusCode::from_u16(s).ok())
    }

    /// Pseudo-headers re-synthesised as `(":name", value)` pairs, followed
    /// by the regular headers.
    pub fn headers_with_pseudo(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.headers.len() + 5);
        let pseudo = [
            (":method", self.method.clone()),
            (":path", self.path.clone()),
            (":authority", self.authority.clone()),
            (":scheme", self.scheme.clone()),
            (":status", self.status.map(|s| s.to_string())),
        ];
        for (name, value) in pseudo {
            if let Some(value) = value {
                out.push((name.to_string(), value));
            }
        }
        out.extend(self.headers.iter().cloned());
        out
    }
}

/// Classification of parse errors (public API)
#[derive(Debug, Clone)]
pub enum ParseErrorKind {
    /// Frame header requires 9 bytes but the buffer is shorter
    Http2BufferTooSmall,
    /// HPACK decompression failed (detail in the `String`)
    Http2HpackError(String),
    /// HEADERS block is split across CONTINUATION frames that have not all
    /// arrived yet
    Http2HeadersIncomplete,
    /// Decoded header list exceeds the configured size limit
    Http2HeaderListTooLarge,
    /// Frame could not be classified or has an invalid structure
    Http2InvalidFrame,
    /// Rejected because max concurrent streams limit was reached
    Http2MaxConcurrentStreams,
    /// Padded frame has missing or invalid padding
    Http2PaddingError,
    /// PRIORITY flag present but header block too short for priority fields
    Http2PriorityError,
    /// DATA or CONTINUATION frame references a stream that does not exist
    Http2StreamNotFound,
    /// Header contains invalid UTF-8 encoding
    Http2InvalidHeaderEncoding,
    /// Internal buffer would exceed the configured max_buffer_size
    Http2BufferTooLarge,
    /// SETTINGS frame payload length is not a multiple of 6 bytes
    Http2SettingsLengthError,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http2BufferTooSmall => write!(f, "HTTP/2 buffer too small to parse frame header"),
            Self::Http2HpackError(msg) => write!(f, "HTTP/2 HPACK decoding error: {msg}"),
            Self::Http2HeadersIncomplete => {
                write!(f, "HTTP/2 headers incomplete (missing CONTINUATION)")
            },
            Self::Http2HeaderListTooLarge => write!(f, "HTTP/2 header list exceeds size limits"),
            Self::Http2InvalidFrame => write!(f, "HTTP/2 invalid frame"),
            Self::Http2MaxConcurrentStreams => {
                write!(f, "HTTP/2 max concurrent streams limit reached")
            },
            Self::Http2PaddingError => write!(f, "HTTP/2 frame has missing or invalid padding"),
            Self::Http2PriorityError => {
                write!(f, "HTTP/2 PRIORITY flag present but header block too short")
            },
            Self::Http2StreamNotFound => write!(f, "HTTP/2 frame references unknown stream"),
            Self::Http2InvalidHeaderEncoding => {
                write!(f, "HTTP/2 header contains invalid UTF-8 encoding")
            },
            Self::Http2BufferTooLarge => {
                write!(f, "HTTP/2 internal buffer exceeds max_buffer_size")
            },
            Self::Http2SettingsLengthError => {
                write!(
                    f,
                    "HTTP/2 SETTINGS frame payload is not a multiple of 6 bytes"
                )
            },
        }
    }
}

/// Parse error with optional stream context (public API)
#[derive(Debug, Clone)]
pub struct ParseError {
    /// What went wrong
    pub kind:      ParseErrorKind,
    /// The stream that caused the error, if applicable
    pub stream_id: Option<StreamId>,
}

impl ParseError {
    /// Create a connection-level parse error (no specific stream).
    pub fn new(kind: ParseErrorKind) -> Self {
        Self {
            kind,
            stream_id: None,
        }
    }

    /// Create a stream-level parse error with the offending stream ID.
    pub fn with_stream(kind: ParseErrorKind, stream_id: StreamId) -> Self {
        Self {
            kind,
            stream_id: Some(stream_id),
        }
    }
}

impl ParseError {
    /// Errors after which the half-connection cannot be parsed further.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ParseErrorKind::Http2HpackError(_) | ParseErrorKind::Http2BufferTooLarge
        )
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(sid) = self.stream_id {
            write!(f, "[stream {sid}] {}", self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

impl std::error::Error for ParseError {}
