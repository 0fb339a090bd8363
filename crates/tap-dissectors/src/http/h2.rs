//! HTTP/2 dissect loop over [`h2session::H2ConnectionState`]

use std::time::SystemTime;

use h2session::{
    CONNECTION_PREFACE, FRAME_HEADER_SIZE, H2ConnectionState, H2Limits, ParsedH2Message,
    is_server_settings_frame,
};
use tap_api::{DissectError, MatchedPair, Message, Payload, ProtocolId, TcpReader};
use tracing::debug;

use super::{
    GRPC, HTTP2,
    h1::{from_timestamp, to_timestamp},
    publish, record,
};
use crate::{claim, next_capture_time, read_up_to};

/// Dissect a direction that starts as HTTP/2: the client must open with the
/// connection preface and the server with a SETTINGS frame.
pub(super) fn dissect(reader: &mut dyn TcpReader, limits: &H2Limits) -> Result<(), DissectError> {
    let first_seen = next_capture_time(reader)?;
    let head = if reader.is_client() {
        let head = read_up_to(reader, CONNECTION_PREFACE.len())?;
        if head.as_slice() != CONNECTION_PREFACE.as_slice() {
            return Err(DissectError::not_protocol(
                ProtocolId::Http2,
                "missing connection preface",
            ));
        }
        head
    } else {
        let head = read_up_to(reader, FRAME_HEADER_SIZE)?;
        if !is_server_settings_frame(&head) {
            return Err(DissectError::not_protocol(
                ProtocolId::Http2,
                "first frame is not SETTINGS",
            ));
        }
        head
    };
    claim(reader, ProtocolId::Http2)?;
    dissect_half(reader, limits, head, first_seen)
}

/// Feed this direction into an HTTP/2 connection state until EOF, pairing
/// each completed stream through `"{flow},h2/{stream id}"`. `pending` holds
/// bytes already read from the reader, captured at `first_seen`.
pub(super) fn dissect_half(
    reader: &mut dyn TcpReader,
    limits: &H2Limits,
    mut pending: Vec<u8>,
    first_seen: SystemTime,
) -> Result<(), DissectError> {
    let mut state = H2ConnectionState::with_limits(limits.clone());
    let mut chunk_time = first_seen;
    debug!(
        flow = %reader.flow_key(),
        max_body_size = limits.max_body_size,
        "HTTP/2 direction started"
    );

    loop {
        if !pending.is_empty() {
            let now = to_timestamp(chunk_time);
            match state.feed(&pending, now) {
                Ok(()) => {},
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => reader.diagnostics().errors.silent("HTTP2-parser", &e),
            }
            pending.clear();
            while let Some((_, msg)) = state.try_pop() {
                on_message(reader, msg);
            }
            state.evict_stale_streams(now);
        }

        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            return Ok(());
        }
        pending.extend_from_slice(chunk);
        chunk_time = reader.capture_time();
        let n = pending.len();
        reader.consume(n);
    }
}

fn on_message(reader: &dyn TcpReader, msg: ParsedH2Message) {
    let key = format!("{},h2/{}", reader.flow_key(), msg.stream_id);
    let time = from_timestamp(msg.first_frame_timestamp_ns);
    let size = msg.header_size + msg.body.len();
    let message = if reader.is_client() {
        Message::request(time, size, Payload::HttpRequest(record::request_from_h2(&msg)))
    } else {
        Message::response(time, size, Payload::HttpResponse(record::response_from_h2(&msg)))
    };
    if let Some(pair) = reader.register(key, message) {
        publish_pair(reader, pair);
    }
}

/// Publish under the gRPC descriptor when the request carried a gRPC
/// content type.
pub(super) fn publish_pair(reader: &dyn TcpReader, pair: MatchedPair) {
    let grpc = pair
        .request
        .as_http_request()
        .and_then(|r| r.header("content-type"))
        .is_some_and(|ct| ct.starts_with("application/grpc"));
    publish(reader, if grpc { &GRPC } else { &HTTP2 }, pair);
}
