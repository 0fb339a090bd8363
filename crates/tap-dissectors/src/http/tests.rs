use h2session::H2Limits;
use rstest::rstest;
use tap_api::{Dissector, ProtocolId, TrafficFilteringOptions};

use super::{Http1Dissector, Http2Dissector, REDACTED};
use crate::testing::{MockReader, at};

fn h1() -> Http1Dissector {
    Http1Dissector::new(h2session::DEFAULT_MAX_BODY_SIZE)
}

fn chunk(data: &[u8], ms: u64) -> (Vec<u8>, std::time::SystemTime) {
    (data.to_vec(), at(ms))
}

// =========================================================================
// HTTP/2 frame builders
// =========================================================================

const END_STREAM: u8 = 0x01;
const END_HEADERS: u8 = 0x04;

fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, frame_type, flags];
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn settings() -> Vec<u8> {
    frame(0x04, 0, 0, &[])
}

fn headers(stream_id: u32, flags: u8, block: &[u8]) -> Vec<u8> {
    frame(0x01, END_HEADERS | flags, stream_id, block)
}

fn data(stream_id: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    frame(0x00, flags, stream_id, payload)
}

/// HPACK literal header field without indexing, new name
fn literal(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![0x00, name.len() as u8];
    out.extend_from_slice(name.as_bytes());
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out
}

fn grpc_message(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

// =========================================================================
// HTTP/1
// =========================================================================

#[test]
fn test_get_pairs_into_one_exchange() {
    let (mut client, mut server, shared) = MockReader::pair(
        80,
        vec![chunk(b"GET /x?a=1 HTTP/1.1\r\nHost: a\r\n\r\n", 0)],
        vec![chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", 5)],
        TrafficFilteringOptions::default(),
    );
    h1().dissect(&mut client).unwrap();
    h1().dissect(&mut server).unwrap();

    let exchanges = shared.exchanges();
    assert_eq!(exchanges.len(), 1);
    let ex = &exchanges[0];
    assert_eq!(ex.protocol.version, "1.1");
    assert_eq!(ex.elapsed_time, 5);
    assert_eq!(ex.src.ip, "10.0.0.1");
    assert_eq!(ex.dst.port, Some(80));

    let req = ex.request.as_http_request().unwrap();
    assert_eq!(req.url, "http://a/x?a=1");
    assert_eq!(req.path, "/x");
    assert_eq!(req.query_string.len(), 1);
    let resp = ex.response.as_ref().unwrap().as_http_response().unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body.as_bytes, "ok");
    assert_eq!(shared.diagnostics.stats.snapshot().matched_messages, 1);
    assert_eq!(*shared.protocol.lock().unwrap(), Some(ProtocolId::Http1));
}

#[test]
fn test_pipelined_requests_pair_in_order() {
    let (mut client, mut server, shared) = MockReader::pair(
        8080,
        vec![chunk(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n", 0)],
        vec![
            chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA", 3),
            chunk(b"HTTP/1.1 404 Not Found\r\nContent-Length: 1\r\n\r\nB", 7),
        ],
        TrafficFilteringOptions::default(),
    );
    h1().dissect(&mut server).unwrap();
    h1().dissect(&mut client).unwrap();

    let exchanges = shared.exchanges();
    let pairs: Vec<(String, u16)> = exchanges
        .iter()
        .map(|ex| {
            let path = ex.request.as_http_request().unwrap().path.clone();
            let status = ex.response.as_ref().unwrap().as_http_response().unwrap().status;
            (path, status)
        })
        .collect();
    assert_eq!(pairs, vec![("/a".to_string(), 200), ("/b".to_string(), 404)]);
}

#[test]
fn test_url_falls_back_to_server_address() {
    let (mut client, mut server, shared) = MockReader::pair(
        8080,
        vec![chunk(b"GET /ping HTTP/1.0\r\n\r\n", 0)],
        vec![chunk(b"HTTP/1.0 204 No Content\r\n\r\n", 1)],
        TrafficFilteringOptions::default(),
    );
    h1().dissect(&mut client).unwrap();
    h1().dissect(&mut server).unwrap();

    let ex = &shared.exchanges()[0];
    assert_eq!(ex.protocol.version, "1.0");
    assert_eq!(
        ex.request.as_http_request().unwrap().url,
        "http://10.0.0.2:8080/ping"
    );
}

#[test]
fn test_response_body_read_until_close() {
    let (mut client, mut server, shared) = MockReader::pair(
        80,
        vec![chunk(b"GET / HTTP/1.1\r\n\r\n", 0)],
        vec![
            chunk(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nhel", 1),
            chunk(b"lo", 2),
        ],
        TrafficFilteringOptions::default(),
    );
    h1().dissect(&mut client).unwrap();
    h1().dissect(&mut server).unwrap();

    let ex = &shared.exchanges()[0];
    let resp = ex.response.as_ref().unwrap().as_http_response().unwrap();
    assert_eq!(resp.body.as_bytes, "hello");
    assert_eq!(resp.body.mime_type, "text/plain");
}

#[test]
fn test_interim_response_is_skipped() {
    let (mut client, mut server, shared) = MockReader::pair(
        80,
        vec![chunk(
            b"POST /u HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 1\r\n\r\nx",
            0,
        )],
        vec![chunk(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
            2,
        )],
        TrafficFilteringOptions::default(),
    );
    h1().dissect(&mut client).unwrap();
    h1().dissect(&mut server).unwrap();

    let exchanges = shared.exchanges();
    assert_eq!(exchanges.len(), 1);
    let resp = exchanges[0].response.as_ref().unwrap();
    assert_eq!(resp.as_http_response().unwrap().status, 201);
}

#[rstest]
#[case::redis(b"*1\r\n$4\r\nPING\r\n".as_slice())]
#[case::binary(b"\x00\x00\x00\x10\x00\x12\x00\x03".as_slice())]
#[case::preface(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".as_slice())]
fn test_http1_rejects_other_protocols(#[case] bytes: &[u8]) {
    let (mut client, _server, shared) = MockReader::pair(
        80,
        vec![chunk(bytes, 0)],
        vec![],
        TrafficFilteringOptions::default(),
    );
    let err = h1().dissect(&mut client).unwrap_err();
    assert!(
        matches!(err, tap_api::DissectError::NotProtocol { .. }),
        "unexpected error: {err}"
    );
    assert!(shared.protocol.lock().unwrap().is_none(), "nothing claimed");
}

#[test]
fn test_http1_yields_when_other_side_claimed_differently() {
    let (mut client, _server, shared) = MockReader::pair(
        80,
        vec![chunk(b"GET / HTTP/1.1\r\n\r\n", 0)],
        vec![],
        TrafficFilteringOptions::default(),
    );
    *shared.protocol.lock().unwrap() = Some(ProtocolId::Redis);
    let err = h1().dissect(&mut client).unwrap_err();
    assert!(matches!(
        err,
        tap_api::DissectError::Claimed(ProtocolId::Redis)
    ));
}

// =========================================================================
// Filtering
// =========================================================================

fn run_single(request: &[u8], options: TrafficFilteringOptions) -> Vec<tap_api::Exchange> {
    let (mut client, mut server, shared) = MockReader::pair(
        80,
        vec![chunk(request, 0)],
        vec![chunk(
            b"HTTP/1.1 200 OK\r\nSet-Cookie: s=1\r\nContent-Type: application/json\r\nContent-Length: 19\r\n\r\n{\"password\":\"abcd\"}",
            1,
        )],
        options,
    );
    h1().dissect(&mut client).unwrap();
    h1().dissect(&mut server).unwrap();
    shared.exchanges()
}

#[test]
fn test_health_check_exchange_dropped() {
    let options =
        TrafficFilteringOptions::from_json(r#"{"healthChecksUserAgentHeaders":["kube-probe"]}"#)
            .unwrap();
    let exchanges = run_single(
        b"GET /healthz HTTP/1.1\r\nUser-Agent: kube-probe/1.27\r\n\r\n",
        options,
    );
    assert!(exchanges.is_empty());
}

#[test]
fn test_forwarded_for_replaces_client() {
    let exchanges = run_single(
        b"GET / HTTP/1.1\r\nX-Forwarded-For: 203.0.113.7, 10.1.1.1\r\n\r\n",
        TrafficFilteringOptions::default(),
    );
    assert_eq!(exchanges[0].src.ip, "203.0.113.7");
    assert_eq!(exchanges[0].src.port, None);
}

#[test]
fn test_sensitive_fields_redacted() {
    let exchanges = run_single(
        b"GET /login?user=bob&page=2 HTTP/1.1\r\nAuthorization: Bearer s3cret\r\nCookie: c=1\r\nUser-Agent: curl\r\n\r\n",
        TrafficFilteringOptions::default(),
    );
    let ex = &exchanges[0];
    let req = ex.request.as_http_request().unwrap();
    assert_eq!(req.header("authorization"), Some(REDACTED));
    assert_eq!(req.header("cookie"), None);
    assert_eq!(req.header("user-agent"), Some("curl"));
    assert_eq!(req.url, "http://10.0.0.2:80/login?user=[REDACTED]&page=2");

    let resp = ex.response.as_ref().unwrap().as_http_response().unwrap();
    assert_eq!(resp.header("set-cookie"), None);
    assert_eq!(resp.body.as_bytes, r#"{"password":"[REDACTED]"}"#);
}

#[test]
fn test_redaction_can_be_disabled() {
    let options = TrafficFilteringOptions::from_json(r#"{"disableRedaction":true}"#).unwrap();
    let exchanges = run_single(
        b"GET / HTTP/1.1\r\nAuthorization: Bearer s3cret\r\n\r\n",
        options,
    );
    let req = exchanges[0].request.as_http_request().unwrap();
    assert_eq!(req.header("authorization"), Some("Bearer s3cret"));
}

// =========================================================================
// HTTP/2 and gRPC
// =========================================================================

fn grpc_client() -> Vec<u8> {
    let mut block = vec![0x83, 0x86]; // :method POST, :scheme http
    block.extend(literal(":path", "/pkg.Svc/Do"));
    block.extend(literal(":authority", "svc:50051"));
    block.extend(literal("content-type", "application/grpc"));

    let mut out = h2session::CONNECTION_PREFACE.to_vec();
    out.extend(settings());
    out.extend(headers(1, 0, &block));
    out.extend(data(1, END_STREAM, &grpc_message(b"\x08\x01")));
    out
}

fn grpc_server(status: &str) -> Vec<u8> {
    let mut block = vec![0x88]; // :status 200
    block.extend(literal("content-type", "application/grpc"));

    let mut out = settings();
    out.extend(headers(1, 0, &block));
    out.extend(data(1, 0, &grpc_message(b"\x08\x02")));
    out.extend(headers(1, END_STREAM, &literal("grpc-status", status)));
    out
}

#[test]
fn test_grpc_unary_call() {
    let (mut client, mut server, shared) = MockReader::pair(
        50051,
        vec![chunk(&grpc_client(), 0)],
        vec![chunk(&grpc_server("0"), 4)],
        TrafficFilteringOptions::default(),
    );
    let d = Http2Dissector::default();
    d.dissect(&mut client).unwrap();
    d.dissect(&mut server).unwrap();

    let exchanges = shared.exchanges();
    assert_eq!(exchanges.len(), 1);
    let ex = &exchanges[0];
    assert_eq!(ex.protocol.abbreviation, "gRPC");
    assert_eq!(ex.elapsed_time, 4);

    let req = ex.request.as_http_request().unwrap();
    assert_eq!(req.url, "http://svc:50051/pkg.Svc/Do");
    assert_eq!(req.http_version, "HTTP/2.0");
    assert_eq!(req.body.encoding.as_deref(), Some("base64"));
    assert_eq!(req.body.size, 7);

    let resp = ex.response.as_ref().unwrap().as_http_response().unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.status_text, "OK");
    assert_eq!(resp.header("grpc-status"), Some("0"));
    assert_eq!(*shared.protocol.lock().unwrap(), Some(ProtocolId::Http2));
}

#[test]
fn test_grpc_error_status_text() {
    let (mut client, mut server, shared) = MockReader::pair(
        50051,
        vec![chunk(&grpc_client(), 0)],
        vec![chunk(&grpc_server("14"), 1)],
        TrafficFilteringOptions::default(),
    );
    let d = Http2Dissector::default();
    d.dissect(&mut client).unwrap();
    d.dissect(&mut server).unwrap();

    let ex = &shared.exchanges()[0];
    let resp = ex.response.as_ref().unwrap().as_http_response().unwrap();
    assert_eq!(resp.status_text, "UNAVAILABLE");
}

#[test]
fn test_http2_body_limit_truncates() {
    let mut block = vec![0x83, 0x86];
    block.extend(literal(":path", "/upload"));
    block.extend(literal(":authority", "a"));
    let mut client_bytes = h2session::CONNECTION_PREFACE.to_vec();
    client_bytes.extend(settings());
    client_bytes.extend(headers(1, 0, &block));
    client_bytes.extend(data(1, END_STREAM, &[b'x'; 10]));

    let (mut client, mut server, shared) = MockReader::pair(
        80,
        vec![chunk(&client_bytes, 0)],
        vec![chunk(&[settings(), headers(1, END_STREAM, &[0x88])].concat(), 1)],
        TrafficFilteringOptions::default(),
    );
    let d = Http2Dissector::new(H2Limits::with_max_body_size(4));
    d.dissect(&mut client).unwrap();
    d.dissect(&mut server).unwrap();

    let ex = &shared.exchanges()[0];
    assert_eq!(ex.protocol.abbreviation, "HTTP/2");
    let body = &ex.request.as_http_request().unwrap().body;
    assert!(body.truncated);
    assert_eq!(body.size, 4);
}

#[test]
fn test_http2_rejects_http1_bytes() {
    let (mut client, mut server, _shared) = MockReader::pair(
        80,
        vec![chunk(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", 0)],
        vec![chunk(b"HTTP/1.1 200 OK\r\n\r\n", 1)],
        TrafficFilteringOptions::default(),
    );
    let d = Http2Dissector::default();
    assert!(d.dissect(&mut client).is_err());
    assert!(d.dissect(&mut server).is_err());
}

#[test]
fn test_h2c_upgrade_continues_as_http2() {
    let upgrade = b"GET / HTTP/1.1\r\nHost: a\r\nConnection: Upgrade, HTTP2-Settings\r\nUpgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAAP__\r\n\r\n";
    let mut preface = h2session::CONNECTION_PREFACE.to_vec();
    preface.extend(settings());

    let mut server_bytes =
        b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n".to_vec();
    server_bytes.extend(settings());
    server_bytes.extend(headers(1, 0, &[0x88]));
    server_bytes.extend(data(1, END_STREAM, b"hi"));

    let (mut client, mut server, shared) = MockReader::pair(
        80,
        vec![chunk(upgrade, 0), chunk(&preface, 2)],
        vec![chunk(&server_bytes, 3)],
        TrafficFilteringOptions::default(),
    );
    h1().dissect(&mut client).unwrap();
    h1().dissect(&mut server).unwrap();

    let exchanges = shared.exchanges();
    assert_eq!(exchanges.len(), 2);
    let switching = exchanges[0].response.as_ref().unwrap();
    assert_eq!(switching.as_http_response().unwrap().status, 101);

    assert_eq!(exchanges[1].protocol.abbreviation, "HTTP/2");
    let resp = exchanges[1].response.as_ref().unwrap().as_http_response().unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.http_version, "HTTP/2.0");
}
