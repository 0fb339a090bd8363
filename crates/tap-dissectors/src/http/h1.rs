//! HTTP/1.x message parsing and the per-direction dissect loop

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use h2session::{CONNECTION_PREFACE, H2Limits, HttpRequest, HttpResponse, TimestampNs};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tap_api::{DissectError, Message, Payload, ProtocolId, TcpReader};
use tracing::debug;

use super::{HTTP10, HTTP11, h2, publish, record};
use crate::claim;

/// Header section size past which a message that still has not ended its
/// headers is rejected.
const MAX_HEADER_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// Outcome of parsing the front of a buffer.
#[derive(Debug)]
pub(crate) enum Parsed<T> {
    Complete {
        message:      T,
        /// Bytes of the buffer the message occupies
        consumed:     usize,
        headers_size: usize,
    },
    /// Valid so far, more data needed
    Partial,
    Invalid(String),
}

impl<T> Parsed<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Parsed<U> {
        match self {
            Parsed::Complete {
                message,
                consumed,
                headers_size,
            } => Parsed::Complete {
                message: f(message),
                consumed,
                headers_size,
            },
            Parsed::Partial => Parsed::Partial,
            Parsed::Invalid(reason) => Parsed::Invalid(reason),
        }
    }
}

fn version_from_minor(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn header_map(headers: &[httparse::Header<'_>]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for h in headers {
        let parsed = (
            HeaderName::from_bytes(h.name.as_bytes()),
            HeaderValue::from_bytes(h.value),
        );
        if let (Ok(name), Ok(value)) = parsed {
            map.append(name, value);
        }
    }
    map
}

/// Parse one HTTP/1.x request from the front of `data`.
pub(crate) fn parse_request(data: &[u8], timestamp_ns: TimestampNs) -> Parsed<HttpRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let body_offset = match req.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Parsed::Partial,
        Err(e) => return Parsed::Invalid(e.to_string()),
    };

    let (body, body_len) = match determine_body(req.headers, &data[body_offset..], None) {
        BodyResult::Complete { body, consumed } => (body, consumed),
        BodyResult::Incomplete => return Parsed::Partial,
        BodyResult::Invalid(reason) => return Parsed::Invalid(reason),
    };

    let Some(Ok(method)) = req.method.map(|m| Method::from_bytes(m.as_bytes())) else {
        return Parsed::Invalid("bad method".to_string());
    };
    let Some(Ok(uri)) = req.path.map(str::parse::<Uri>) else {
        return Parsed::Invalid("bad request target".to_string());
    };

    Parsed::Complete {
        message:      HttpRequest {
            method,
            uri,
            version: version_from_minor(req.version),
            headers: header_map(req.headers),
            body,
            timestamp_ns,
        },
        consumed:     body_offset + body_len,
        headers_size: body_offset,
    }
}

/// Parse one HTTP/1.x response from the front of `data`.
pub(crate) fn parse_response(data: &[u8], timestamp_ns: TimestampNs) -> Parsed<HttpResponse> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let body_offset = match res.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Parsed::Partial,
        Err(e) => return Parsed::Invalid(e.to_string()),
    };

    let (body, body_len) = match determine_body(res.headers, &data[body_offset..], res.code) {
        BodyResult::Complete { body, consumed } => (body, consumed),
        BodyResult::Incomplete => return Parsed::Partial,
        BodyResult::Invalid(reason) => return Parsed::Invalid(reason),
    };

    let Some(Ok(status)) = res.code.map(StatusCode::from_u16) else {
        return Parsed::Invalid("bad status code".to_string());
    };

    Parsed::Complete {
        message:      HttpResponse {
            status,
            reason: res.reason.filter(|r| !r.is_empty()).map(str::to_string),
            version: version_from_minor(res.version),
            headers: header_map(res.headers),
            body,
            timestamp_ns,
        },
        consumed:     body_offset + body_len,
        headers_size: body_offset,
    }
}

/// Finalize an HTTP/1.x response when the connection closes.
///
/// For responses without Content-Length or Transfer-Encoding the body is
/// everything until the connection closes (RFC 7230 §3.3.3).
pub(crate) fn finalize_response(data: &[u8], timestamp_ns: TimestampNs) -> Option<(HttpResponse, usize)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let body_offset = match res.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        _ => return None,
    };
    let status = StatusCode::from_u16(res.code?).ok()?;

    let response = HttpResponse {
        status,
        reason: res.reason.filter(|r| !r.is_empty()).map(str::to_string),
        version: version_from_minor(res.version),
        headers: header_map(res.headers),
        body: data[body_offset..].to_vec(),
        timestamp_ns,
    };
    Some((response, body_offset))
}

/// Result of body determination for an HTTP/1.x message.
enum BodyResult {
    /// Body is complete; `consumed` counts the framed bytes, chunk
    /// headers included
    Complete { body: Vec<u8>, consumed: usize },
    /// Not enough data yet
    Incomplete,
    Invalid(String),
}

/// Determine the body of an HTTP/1.x message based on headers and available data.
///
/// - Content-Length: body is exactly `body_data[..content_length]`
/// - Transfer-Encoding: chunked: walks chunk boundaries to decode body
/// - Neither (request): body is empty
/// - Neither (response with body-bearing status): incomplete until the
///   connection closes
///
/// `response_status`: `None` for requests, `Some(code)` for responses.
fn determine_body(
    headers: &[httparse::Header<'_>],
    body_data: &[u8],
    response_status: Option<u16>,
) -> BodyResult {
    if let Some(code) = response_status
        && ((100..200).contains(&code) || code == 204 || code == 304)
    {
        return BodyResult::Complete {
            body:     Vec::new(),
            consumed: 0,
        };
    }

    for h in headers.iter() {
        if h.name.eq_ignore_ascii_case("Transfer-Encoding")
            && let Ok(value) = std::str::from_utf8(h.value)
            && value.to_ascii_lowercase().contains("chunked")
        {
            return decode_chunked_body(body_data);
        }
    }

    for h in headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            let Some(content_length) = std::str::from_utf8(h.value)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
            else {
                return BodyResult::Invalid("bad Content-Length".to_string());
            };
            if body_data.len() >= content_length {
                return BodyResult::Complete {
                    body:     body_data[..content_length].to_vec(),
                    consumed: content_length,
                };
            }
            return BodyResult::Incomplete;
        }
    }

    match response_status {
        None => BodyResult::Complete {
            body:     Vec::new(),
            consumed: 0,
        },
        Some(_) => BodyResult::Incomplete,
    }
}

/// Walk chunk boundaries to decode a chunked transfer-encoded body.
///
/// Chunk format: `[hex-size][;ext=val]\r\n[data]\r\n` terminated by
/// `0\r\n[trailers]\r\n`.
fn decode_chunked_body(data: &[u8]) -> BodyResult {
    let mut decoded = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_end) = find_crlf(data, pos) else {
            return BodyResult::Incomplete;
        };

        // Chunk extensions after ';' are ignored
        let size_bytes = &data[pos..line_end];
        let size_part = match size_bytes.iter().position(|&b| b == b';') {
            Some(semi_pos) => &size_bytes[..semi_pos],
            None => size_bytes,
        };
        let Some(chunk_size) = std::str::from_utf8(size_part)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
        else {
            return BodyResult::Invalid("bad chunk size".to_string());
        };

        pos = line_end + 2;

        if chunk_size == 0 {
            if pos + 2 > data.len() {
                return BodyResult::Incomplete;
            }
            if data[pos..pos + 2] == *b"\r\n" {
                return BodyResult::Complete {
                    body:     decoded,
                    consumed: pos + 2,
                };
            }
            // Trailer fields end with an empty line
            return match find_crlf_crlf(data, pos) {
                Some(end) => BodyResult::Complete {
                    body:     decoded,
                    consumed: end + 4,
                },
                None => BodyResult::Incomplete,
            };
        }

        if pos + chunk_size > data.len() {
            return BodyResult::Incomplete;
        }
        decoded.extend_from_slice(&data[pos..pos + chunk_size]);
        pos += chunk_size;

        if pos + 2 > data.len() {
            return BodyResult::Incomplete;
        }
        if data[pos..pos + 2] != *b"\r\n" {
            return BodyResult::Invalid("chunk not terminated by CRLF".to_string());
        }
        pos += 2;
    }
}

/// Find the position of `\r\n` starting at `from` in `data`.
fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

/// Find the position of `\r\n\r\n` starting at `from` in `data`.
fn find_crlf_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| from + p)
}

pub(crate) fn to_timestamp(time: SystemTime) -> TimestampNs {
    let nanos = time
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    TimestampNs(nanos)
}

pub(crate) fn from_timestamp(ts: TimestampNs) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ts.0)
}

fn wants_h2c(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("h2c")))
}

/// What the loop does after a message.
enum Next {
    Continue,
    /// Hand the rest of this direction to the HTTP/2 parser
    SwitchToH2,
}

/// Parse HTTP/1.x messages from one direction until EOF.
///
/// Each message is paired through `"{flow},{n}"`, where `n` counts messages
/// in this direction. An `Upgrade: h2c` request is also registered as
/// HTTP/2 stream 1; the direction switches to HTTP/2 once the client sends
/// the connection preface or the server answers `101`.
pub(super) fn dissect(reader: &mut dyn TcpReader, h2_limits: &H2Limits) -> Result<(), DissectError> {
    let mut buf: Vec<u8> = Vec::new();
    let mut first_seen = reader.capture_time();
    let mut parsed_any = false;
    let mut upgrade_requested = false;

    loop {
        if !buf.is_empty() {
            if reader.is_client() && looks_like_preface(&buf) {
                if !upgrade_requested {
                    return Err(DissectError::not_protocol(
                        ProtocolId::Http1,
                        "HTTP/2 connection preface",
                    ));
                }
                if buf.len() >= CONNECTION_PREFACE.len() {
                    debug!(flow = %reader.flow_key(), "client switched to h2c");
                    return h2::dissect_half(reader, h2_limits, buf, first_seen);
                }
            } else {
                let timestamp = to_timestamp(first_seen);
                let parsed = if reader.is_client() {
                    parse_request(&buf, timestamp).map(Either::Request)
                } else {
                    parse_response(&buf, timestamp).map(Either::Response)
                };
                match parsed {
                    Parsed::Complete {
                        message,
                        consumed,
                        headers_size,
                    } => {
                        if !parsed_any {
                            claim(reader, ProtocolId::Http1)?;
                            parsed_any = true;
                        }
                        buf.drain(..consumed);
                        let time = first_seen;
                        first_seen = reader.capture_time();
                        let next = match message {
                            Either::Request(req) => {
                                upgrade_requested |= wants_h2c(&req.headers);
                                on_request(reader, req, time, consumed, headers_size)
                            },
                            Either::Response(resp) => {
                                on_response(reader, resp, time, consumed, headers_size)
                            },
                        };
                        if let Next::SwitchToH2 = next {
                            debug!(flow = %reader.flow_key(), "server switched to h2c");
                            return h2::dissect_half(reader, h2_limits, buf, first_seen);
                        }
                        continue;
                    },
                    Parsed::Partial => {
                        if buf.len() > MAX_HEADER_BYTES && find_crlf_crlf(&buf, 0).is_none() {
                            return Err(invalid(parsed_any, "header section too large"));
                        }
                    },
                    Parsed::Invalid(reason) => return Err(invalid(parsed_any, reason)),
                }
            }
        }

        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            break;
        }
        let data = chunk.to_vec();
        reader.consume(data.len());
        if buf.is_empty() {
            first_seen = reader.capture_time();
        }
        buf.extend_from_slice(&data);
    }

    // A response without framing ends with the connection
    if !reader.is_client()
        && !buf.is_empty()
        && let Some((resp, headers_size)) = finalize_response(&buf, to_timestamp(first_seen))
    {
        if !parsed_any {
            claim(reader, ProtocolId::Http1)?;
            parsed_any = true;
        }
        let size = buf.len();
        on_response(reader, resp, first_seen, size, headers_size);
    }

    if parsed_any {
        Ok(())
    } else {
        Err(DissectError::not_protocol(
            ProtocolId::Http1,
            "stream ended before a complete message",
        ))
    }
}

enum Either {
    Request(HttpRequest),
    Response(HttpResponse),
}

fn looks_like_preface(buf: &[u8]) -> bool {
    let n = buf.len().min(CONNECTION_PREFACE.len());
    buf[..n] == CONNECTION_PREFACE[..n]
}

fn invalid(parsed_any: bool, reason: impl Into<String>) -> DissectError {
    if parsed_any {
        DissectError::malformed(ProtocolId::Http1, reason)
    } else {
        DissectError::not_protocol(ProtocolId::Http1, reason)
    }
}

fn on_request(
    reader: &dyn TcpReader,
    req: HttpRequest,
    time: SystemTime,
    size: usize,
    headers_size: usize,
) -> Next {
    let info = reader.connection_info();
    let fallback_authority = format!("{}:{}", info.server_ip, info.server_port);
    let record = record::request_from_h1(&req, headers_size, &fallback_authority);
    let message = Message::request(time, size, Payload::HttpRequest(record));
    let flow = reader.flow_key();

    if wants_h2c(&req.headers) {
        // The response to an upgrade request arrives on HTTP/2 stream 1
        let upgraded = message.clone();
        if let Some(pair) = reader.register(format!("{flow},h2/1"), upgraded) {
            h2::publish_pair(reader, pair);
        }
    }

    let key = format!("{flow},{}", reader.counter_pair().next(true));
    if let Some(pair) = reader.register(key, message) {
        publish_h1(reader, pair);
    }
    Next::Continue
}

fn on_response(
    reader: &dyn TcpReader,
    resp: HttpResponse,
    time: SystemTime,
    size: usize,
    headers_size: usize,
) -> Next {
    let switching = resp.status == StatusCode::SWITCHING_PROTOCOLS && wants_h2c(&resp.headers);
    if resp.status.is_informational() && !switching {
        // Interim responses precede the real one for the same request
        return Next::Continue;
    }
    let record = record::response_from_h1(&resp, headers_size);
    let message = Message::response(time, size, Payload::HttpResponse(record));

    let key = format!("{},{}", reader.flow_key(), reader.counter_pair().next(false));
    if let Some(pair) = reader.register(key, message) {
        publish_h1(reader, pair);
    }
    if switching {
        Next::SwitchToH2
    } else {
        Next::Continue
    }
}

fn publish_h1(reader: &dyn TcpReader, pair: tap_api::MatchedPair) {
    let http10 = pair
        .request
        .as_http_request()
        .is_some_and(|r| r.http_version == "HTTP/1.0");
    let protocol = if http10 { &HTTP10 } else { &HTTP11 };
    publish(reader, protocol, pair);
}
