//! Integration tests for incremental HTTP/2 parsing of one half-connection

mod fixtures;

use fixtures::*;
use h2session::{H2ConnectionState, H2Limits, ParseErrorKind, ParsedH2Message, StreamId, TimestampNs};
use rstest::rstest;
use std::collections::HashMap;

/// Feed a whole buffer at once and collect completed messages by stream id.
fn parse_buffer(buffer: &[u8]) -> HashMap<StreamId, ParsedH2Message> {
    let mut state = H2ConnectionState::new();
    state
        .feed(buffer, TimestampNs(1))
        .expect("buffer should parse without fatal errors");
    drain(&mut state)
}

fn drain(state: &mut H2ConnectionState) -> HashMap<StreamId, ParsedH2Message> {
    let mut out = HashMap::new();
    while let Some((id, msg)) = state.try_pop() {
        out.insert(id, msg);
    }
    out
}

fn unique_body_pattern(stream_id: u32, chunk_num: u32) -> Vec<u8> {
    format!("STREAM{stream_id}:CHUNK{chunk_num}").into_bytes()
}

// =============================================================================
// Interleaving
// =============================================================================

#[test]
fn test_interleaved_data_body_integrity() {
    let mut buffer = connection_start();
    let hpack_block = hpack_get_request("/resource", "example.com");

    for id in [1, 3, 5] {
        buffer.extend(build_headers_frame(id, &hpack_block, FLAG_END_HEADERS));
    }
    // S1-D1, S3-D1, S1-D2, S5-D1, S3-D2, S1-D3(END), S5-D2, S3-D3(END), S5-D3(END)
    let order = [(1, 1), (3, 1), (1, 2), (5, 1), (3, 2), (1, 3), (5, 2), (3, 3), (5, 3)];
    for (id, chunk) in order {
        buffer.extend(build_data_frame(id, &unique_body_pattern(id, chunk), chunk == 3));
    }

    let messages = parse_buffer(&buffer);
    assert_eq!(messages.len(), 3, "should have 3 completed streams");

    for id in [1, 3, 5] {
        let expected: Vec<u8> = (1..=3).flat_map(|c| unique_body_pattern(id, c)).collect();
        assert_eq!(
            messages[&StreamId(id)].body,
            expected,
            "stream {id} body should not mix with other streams"
        );
    }
}

#[test]
fn test_completion_order_is_preserved() {
    let mut buffer = connection_start();
    let hpack_block = hpack_get_request("/", "example.com");
    buffer.extend(build_headers_frame(1, &hpack_block, FLAG_END_HEADERS));
    buffer.extend(build_complete_headers_frame(3, &hpack_block));
    buffer.extend(build_data_frame(1, b"late", true));

    let mut state = H2ConnectionState::new();
    state.feed(&buffer, TimestampNs(5)).unwrap();

    let ids: Vec<_> = std::iter::from_fn(|| state.try_pop()).map(|(id, _)| id).collect();
    assert_eq!(ids, vec![StreamId(3), StreamId(1)]);
    assert!(!state.has_completed());
}

// =============================================================================
// HPACK dynamic table
// =============================================================================

#[test]
fn test_hpack_dynamic_table_cross_stream() {
    let mut buffer = connection_start();

    let mut hpack_block_1 = hpack_get_request("/", "example.com");
    hpack_block_1.extend(hpack_literal_with_indexing("x-custom", "value1"));
    buffer.extend(build_complete_headers_frame(1, &hpack_block_1));

    // Index 62 is the first dynamic table entry
    let mut hpack_block_3 = hpack_get_request("/other", "example.com");
    hpack_block_3.extend(hpack_indexed(62));
    buffer.extend(build_complete_headers_frame(3, &hpack_block_3));

    let messages = parse_buffer(&buffer);
    assert_eq!(messages.len(), 2);
    for id in [1, 3] {
        assert_eq!(
            messages[&StreamId(id)].header("x-custom"),
            Some("value1"),
            "stream {id} should see x-custom from the dynamic table"
        );
    }
}

#[test]
fn test_hpack_state_survives_split_feeds() {
    let mut first = connection_start();
    let mut block = hpack_get_request("/", "example.com");
    block.extend(hpack_literal_with_indexing("x-trace", "abc"));
    first.extend(build_complete_headers_frame(1, &block));

    let mut second = hpack_get_request("/again", "example.com");
    second.extend(hpack_indexed(62));
    let second = build_complete_headers_frame(3, &second);

    let mut state = H2ConnectionState::new();
    state.feed(&first, TimestampNs(1)).unwrap();
    state.feed(&second, TimestampNs(2)).unwrap();

    let messages = drain(&mut state);
    assert_eq!(messages[&StreamId(3)].header("x-trace"), Some("abc"));
    assert_eq!(messages[&StreamId(3)].path.as_deref(), Some("/again"));
}

// =============================================================================
// Incremental parsing
// =============================================================================

#[rstest]
#[case::one_byte(1)]
#[case::seven_bytes(7)]
#[case::frame_sized(64)]
fn test_incremental_feeding_matches_bulk(#[case] chunk: usize) {
    let mut buffer = connection_start();
    let hpack_block = hpack_post_request("/upload", "example.com");
    buffer.extend(build_headers_frame(1, &hpack_block, FLAG_END_HEADERS));
    buffer.extend(build_data_frame(1, b"hello ", false));
    buffer.extend(build_data_frame(1, b"world", true));

    let mut state = H2ConnectionState::new();
    for (i, piece) in buffer.chunks(chunk).enumerate() {
        state.feed(piece, TimestampNs(i as u64 + 1)).unwrap();
    }

    let messages = drain(&mut state);
    let msg = &messages[&StreamId(1)];
    assert_eq!(msg.method.as_deref(), Some("POST"));
    assert_eq!(msg.body, b"hello world");
    assert!(msg.first_frame_timestamp_ns <= msg.end_stream_timestamp_ns);
    assert_eq!(state.buffered_len(), 0);
}

#[test]
fn test_incomplete_frame_is_buffered() {
    let mut buffer = connection_start();
    buffer.extend(&[0x00, 0x00, 0x10, 0x01, 0x05]);

    let mut state = H2ConnectionState::new();
    state.feed(&buffer, TimestampNs(1)).unwrap();
    assert!(state.try_pop().is_none());
    assert_eq!(state.buffered_len(), 5, "partial frame header should be retained");
}

// =============================================================================
// Body cap
// =============================================================================

#[test]
fn test_body_over_limit_is_truncated_not_dropped() {
    let limit = 16;
    let mut buffer = connection_start();
    buffer.extend(build_headers_frame(1, &hpack_post_request("/", "a"), FLAG_END_HEADERS));
    buffer.extend(build_data_frame(1, &[b'x'; 10], false));
    buffer.extend(build_data_frame(1, &[b'y'; 10], false));
    buffer.extend(build_data_frame(1, &[b'z'; 10], true));

    let mut state = H2ConnectionState::with_limits(H2Limits::with_max_body_size(limit));
    state.feed(&buffer, TimestampNs(1)).unwrap();
    let (_, msg) = state.try_pop().expect("stream should still complete");

    assert_eq!(msg.body.len(), limit, "emitted body is exactly the limit");
    assert_eq!(&msg.body[..10], &[b'x'; 10]);
    assert_eq!(&msg.body[10..], &[b'y'; 6]);
    assert!(msg.truncated);
}

#[test]
fn test_body_at_limit_is_not_truncated() {
    let mut buffer = connection_start();
    buffer.extend(build_headers_frame(1, &hpack_post_request("/", "a"), FLAG_END_HEADERS));
    buffer.extend(build_data_frame(1, &[7u8; 8], true));

    let mut state = H2ConnectionState::with_limits(H2Limits::with_max_body_size(8));
    state.feed(&buffer, TimestampNs(1)).unwrap();
    let (_, msg) = state.try_pop().unwrap();
    assert_eq!(msg.body.len(), 8);
    assert!(!msg.truncated);
}

// =============================================================================
// HEADERS + CONTINUATION and trailers
// =============================================================================

#[test]
fn test_continuation_reassembly() {
    let block = hpack_get_request("/split", "example.com");
    let (a, b) = block.split_at(block.len() / 2);

    let mut buffer = connection_start();
    buffer.extend(build_headers_frame(1, a, FLAG_END_STREAM));
    buffer.extend(build_continuation_frame(1, b, true));

    let messages = parse_buffer(&buffer);
    assert_eq!(messages[&StreamId(1)].path.as_deref(), Some("/split"));
}

#[test]
fn test_grpc_response_completes_on_trailers() {
    let mut head = hpack_static::status_200();
    head.extend(hpack_literal_without_indexing("content-type", "application/grpc"));
    let trailers = hpack_literal_without_indexing("grpc-status", "0");

    let mut buffer = server_start();
    buffer.extend(build_headers_frame(1, &head, FLAG_END_HEADERS));
    buffer.extend(build_data_frame(1, &grpc_frame(b"reply"), false));
    buffer.extend(build_headers_frame(1, &trailers, FLAG_END_HEADERS | FLAG_END_STREAM));

    let messages = parse_buffer(&buffer);
    let msg = &messages[&StreamId(1)];
    assert!(msg.is_response());
    assert!(msg.is_grpc());
    assert_eq!(msg.grpc_status(), Some(0));
    assert_eq!(msg.trailers, vec![("grpc-status".to_string(), "0".to_string())]);
    assert!(msg.headers.iter().all(|(n, _)| n != "grpc-status"));
}

#[test]
fn test_grpc_request_url_synthesis() {
    let mut buffer = connection_start();
    buffer.extend(build_headers_frame(
        1,
        &hpack_grpc_request("/S/M", "svc:50051"),
        FLAG_END_HEADERS,
    ));
    buffer.extend(build_data_frame(1, &grpc_frame(b"req"), true));

    let messages = parse_buffer(&buffer);
    let msg = &messages[&StreamId(1)];
    assert!(msg.is_request());
    assert!(msg.is_grpc());
    assert_eq!(msg.url(), "http://svc:50051/S/M");
}

#[test]
fn test_pseudo_headers_resynthesised() {
    let mut buffer = connection_start();
    buffer.extend(build_complete_headers_frame(1, &hpack_get_request("/p", "host")));
    let messages = parse_buffer(&buffer);
    let headers = messages[&StreamId(1)].headers_with_pseudo();
    let names: Vec<_> = headers.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec![":method", ":path", ":authority", ":scheme"]);
}

// =============================================================================
// Error and edge cases
// =============================================================================

#[test]
fn test_continuation_without_headers_is_skipped() {
    let mut buffer = connection_start();
    buffer.extend(build_continuation_frame(1, b"garbage", true));
    buffer.extend(build_complete_headers_frame(3, &hpack_get_request("/", "a")));

    let messages = parse_buffer(&buffer);
    assert_eq!(messages.len(), 1, "the stray CONTINUATION must not stop parsing");
    assert!(messages.contains_key(&StreamId(3)));
}

#[test]
fn test_data_frame_unknown_stream_is_skipped() {
    let mut buffer = connection_start();
    buffer.extend(build_data_frame(1, b"data", true));
    assert!(parse_buffer(&buffer).is_empty());
}

#[test]
fn test_malformed_hpack_is_fatal() {
    let mut buffer = connection_start();
    buffer.extend(build_complete_headers_frame(1, &[0xFF, 0xFF, 0xFF, 0xFF]));

    let mut state = H2ConnectionState::new();
    let err = state.feed(&buffer, TimestampNs(1)).unwrap_err();
    assert!(
        matches!(err.kind, ParseErrorKind::Http2HpackError(_)),
        "expected HPACK error, got {err:?}"
    );
    assert!(err.is_fatal());
}

#[test]
fn test_rst_stream_discards_partial_stream() {
    let mut buffer = connection_start();
    buffer.extend(build_headers_frame(1, &hpack_post_request("/", "a"), FLAG_END_HEADERS));
    buffer.extend(build_data_frame(1, b"partial", false));
    buffer.extend(build_rst_stream_frame(1, 0x8));

    let mut state = H2ConnectionState::new();
    state.feed(&buffer, TimestampNs(1)).unwrap();
    assert!(state.try_pop().is_none());
    assert_eq!(state.active_stream_count(), 0);
}

#[test]
fn test_padded_and_priority_headers() {
    let block = hpack_get_request("/pp", "example.com");
    let mut buffer = connection_start();
    buffer.extend(build_headers_frame_padded(1, &block, 4, true, true));
    buffer.extend(build_headers_frame_priority(3, &block, 0, false, 16, true, true));
    buffer.extend(build_headers_frame(5, &hpack_post_request("/", "a"), FLAG_END_HEADERS));
    buffer.extend(build_data_frame_padded(5, b"actual-data", 10, true));

    let messages = parse_buffer(&buffer);
    assert_eq!(messages[&StreamId(1)].path.as_deref(), Some("/pp"));
    assert_eq!(messages[&StreamId(3)].path.as_deref(), Some("/pp"));
    assert_eq!(messages[&StreamId(5)].body, b"actual-data");
}

#[test]
fn test_settings_are_recorded() {
    let mut buffer = connection_start();
    buffer.extend(build_settings_frame(&[(0x01, 8192), (0x05, 32768)]));

    let mut state = H2ConnectionState::new();
    state.feed(&buffer, TimestampNs(1)).unwrap();
    assert!(state.preface_received);
    assert_eq!(state.announced_header_table_size(), 8192);
    assert_eq!(state.announced_max_frame_size(), 32768);
}

#[test]
fn test_stale_streams_are_evicted() {
    let mut buffer = connection_start();
    buffer.extend(build_headers_frame(1, &hpack_post_request("/", "a"), FLAG_END_HEADERS));

    let limits = H2Limits {
        stream_timeout_ns: 100,
        ..H2Limits::default()
    };
    let mut state = H2ConnectionState::with_limits(limits);
    state.feed(&buffer, TimestampNs(10)).unwrap();
    assert_eq!(state.active_stream_count(), 1);

    state.evict_stale_streams(TimestampNs(200));
    assert_eq!(state.active_stream_count(), 0);
}
