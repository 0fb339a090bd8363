use crate::frame::*;
use crate::state::{
    H2ConnectionState, H2Limits, ParseError, ParseErrorKind, ParsedH2Message, StreamId,
    StreamPhase, StreamState, TimestampNs,
};

/// Parse the internal buffer incrementally, called by H2ConnectionState::feed()
///
/// Frame-level errors (missing stream for DATA, padding errors) are non-fatal:
/// the offending frame is skipped and parsing continues. HPACK errors corrupt
/// the decoder's dynamic table and are fatal; parsing stops immediately.
/// The buffer is always drained up to the last consumed position regardless
/// of errors, so consumed frames are never re-processed.
pub(crate) fn parse_buffer_incremental(state: &mut H2ConnectionState) -> Result<(), ParseError> {
    let mut pos = 0;
    let timestamp_ns = state.current_timestamp_ns;
    let mut fatal_error: Option<ParseError> = None;

    // Wait for the rest of a preface split across feeds.
    if !state.preface_received
        && state.buffer.len() < CONNECTION_PREFACE.len()
        && CONNECTION_PREFACE.starts_with(&state.buffer)
    {
        return Ok(());
    }

    if !state.preface_received && state.buffer.starts_with(CONNECTION_PREFACE) {
        pos += CONNECTION_PREFACE.len();
        state.preface_received = true;
    }

    while pos + FRAME_HEADER_SIZE <= state.buffer.len() {
        let header = match parse_frame_header(&state.buffer[pos..]) {
            Ok(h) => h,
            Err(_) => break,
        };
        let frame_total_size = FRAME_HEADER_SIZE + header.length as usize;

        if pos + frame_total_size > state.buffer.len() {
            break;
        }

        let frame_payload = state.buffer[pos + FRAME_HEADER_SIZE..pos + frame_total_size].to_vec();

        let result = match header.frame_type {
            FRAME_TYPE_DATA => handle_data_frame(state, &header, &frame_payload, timestamp_ns),
            FRAME_TYPE_HEADERS => {
                handle_headers_frame(state, &header, &frame_payload, timestamp_ns)
            },
            FRAME_TYPE_CONTINUATION => {
                handle_continuation_frame(state, &header, &frame_payload, timestamp_ns)
            },
            FRAME_TYPE_SETTINGS => handle_settings_frame(state, &header, &frame_payload),
            FRAME_TYPE_RST_STREAM => {
                state.active_streams.remove(&header.stream_id);
                Ok(())
            },
            _ => Ok(()),
        };

        pos += frame_total_size;

        if let Err(e) = result {
            if e.is_fatal() {
                fatal_error = Some(e);
                break;
            }
            crate::trace_warn!("skipping HTTP/2 frame: {e}");
            continue;
        }

        if header.stream_id.0 != 0
            && let Some(pair) = check_stream_completion(state, header.stream_id)
        {
            state.completed.push_back(pair);
        }
    }

    if pos > 0 {
        state.buffer.drain(..pos);
    }

    state.evict_stale_streams(timestamp_ns);

    match fatal_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Strip the PADDED prefix/suffix from a frame payload.
fn strip_padding(flags: u8, payload: &[u8], stream_id: StreamId) -> Result<&[u8], ParseError> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    let Some((&pad_len, rest)) = payload.split_first() else {
        return Err(ParseError::with_stream(ParseErrorKind::Http2PaddingError, stream_id));
    };
    let pad_len = pad_len as usize;
    if pad_len > rest.len() {
        return Err(ParseError::with_stream(ParseErrorKind::Http2PaddingError, stream_id));
    }
    Ok(&rest[..rest.len() - pad_len])
}

fn handle_headers_frame(
    state: &mut H2ConnectionState,
    header: &FrameHeader,
    payload: &[u8],
    timestamp_ns: TimestampNs,
) -> Result<(), ParseError> {
    let stream_id = header.stream_id;
    if stream_id.0 == 0 {
        return Err(ParseError::new(ParseErrorKind::Http2InvalidFrame));
    }

    if !state.active_streams.contains_key(&stream_id)
        && state.active_streams.len() >= state.limits.max_concurrent_streams
    {
        return Err(ParseError::with_stream(
            ParseErrorKind::Http2MaxConcurrentStreams,
            stream_id,
        ));
    }

    let header_block = strip_padding(header.flags, payload, stream_id)?;

    let header_block = if header.flags & FLAG_PRIORITY != 0 {
        if header_block.len() < 5 {
            return Err(ParseError::with_stream(
                ParseErrorKind::Http2PriorityError,
                stream_id,
            ));
        }
        &header_block[5..]
    } else {
        header_block
    };

    if stream_id > state.highest_stream_id {
        state.highest_stream_id = stream_id;
    }
    let stream = state
        .active_streams
        .entry(stream_id)
        .or_insert_with(|| StreamState::new(timestamp_ns));

    stream.header_size += FRAME_HEADER_SIZE + payload.len();

    let end_stream = header.flags & FLAG_END_STREAM != 0;
    let end_headers = header.flags & FLAG_END_HEADERS != 0;
    if end_stream {
        stream.end_stream_timestamp_ns = timestamp_ns;
    }

    // A second HEADERS block after the headers completed carries trailers.
    let trailers = stream.phase == StreamPhase::ReceivingBody;

    if end_headers {
        let full_block = if stream.continuation_buffer.is_empty() {
            header_block.to_vec()
        } else {
            stream.continuation_buffer.extend_from_slice(header_block);
            std::mem::take(&mut stream.continuation_buffer)
        };
        decode_headers_into_stream(
            &mut state.decoder,
            stream,
            &full_block,
            &state.limits,
            trailers,
        )?;
        stream.phase = if end_stream || trailers {
            StreamPhase::Complete
        } else {
            StreamPhase::ReceivingBody
        };
    } else {
        stream.continuation_buffer.extend_from_slice(header_block);
        stream.phase = if trailers {
            StreamPhase::ReceivingTrailers {
                end_stream_seen: end_stream,
            }
        } else {
            StreamPhase::ReceivingHeaders {
                end_stream_seen: end_stream,
            }
        };
    }

    Ok(())
}

fn handle_continuation_frame(
    state: &mut H2ConnectionState,
    header: &FrameHeader,
    payload: &[u8],
    timestamp_ns: TimestampNs,
) -> Result<(), ParseError> {
    let stream = state.active_streams.get_mut(&header.stream_id).ok_or_else(|| {
        ParseError::with_stream(ParseErrorKind::Http2HeadersIncomplete, header.stream_id)
    })?;

    let (end_stream_seen, trailers) = match stream.phase {
        StreamPhase::ReceivingHeaders { end_stream_seen } => (end_stream_seen, false),
        StreamPhase::ReceivingTrailers { end_stream_seen } => (end_stream_seen, true),
        _ => {
            return Err(ParseError::with_stream(
                ParseErrorKind::Http2HeadersIncomplete,
                header.stream_id,
            ));
        },
    };

    stream.continuation_buffer.extend_from_slice(payload);
    stream.header_size += FRAME_HEADER_SIZE + payload.len();

    if header.flags & FLAG_END_HEADERS != 0 {
        let buf = std::mem::take(&mut stream.continuation_buffer);
        decode_headers_into_stream(&mut state.decoder, stream, &buf, &state.limits, trailers)?;
        stream.phase = if end_stream_seen || trailers {
            if stream.end_stream_timestamp_ns.0 == 0 {
                stream.end_stream_timestamp_ns = timestamp_ns;
            }
            StreamPhase::Complete
        } else {
            StreamPhase::ReceivingBody
        };
    }

    Ok(())
}

fn handle_data_frame(
    state: &mut H2ConnectionState,
    header: &FrameHeader,
    payload: &[u8],
    timestamp_ns: TimestampNs,
) -> Result<(), ParseError> {
    let data = strip_padding(header.flags, payload, header.stream_id)?;
    let limit = state.limits.max_body_size;

    let stream = state.active_streams.get_mut(&header.stream_id).ok_or_else(|| {
        ParseError::with_stream(ParseErrorKind::Http2StreamNotFound, header.stream_id)
    })?;
    if stream.phase != StreamPhase::ReceivingBody {
        return Err(ParseError::with_stream(
            ParseErrorKind::Http2InvalidFrame,
            header.stream_id,
        ));
    }

    stream.append_body(data, limit);

    if header.flags & FLAG_END_STREAM != 0 {
        stream.end_stream_timestamp_ns = timestamp_ns;
        stream.phase = StreamPhase::Complete;
    }

    Ok(())
}

fn handle_settings_frame(
    state: &mut H2ConnectionState,
    header: &FrameHeader,
    payload: &[u8],
) -> Result<(), ParseError> {
    if !payload.len().is_multiple_of(6) {
        return Err(ParseError::with_stream(
            ParseErrorKind::Http2SettingsLengthError,
            header.stream_id,
        ));
    }

    for setting in payload.chunks_exact(6) {
        let setting_id = u16::from_be_bytes([setting[0], setting[1]]);
        let value = u32::from_be_bytes([setting[2], setting[3], setting[4], setting[5]]);

        match setting_id {
            0x01 => {
                state.settings.header_table_size = value;
                let capped = (value as usize).min(state.limits.max_table_size);
                state.decoder.set_max_table_size(capped);
            },
            0x05 => state.settings.max_frame_size = value,
            _ => {},
        }
    }

    Ok(())
}

fn decode_headers_into_stream(
    decoder: &mut loona_hpack::Decoder<'static>,
    stream: &mut StreamState,
    header_block: &[u8],
    limits: &H2Limits,
    trailers: bool,
) -> Result<(), ParseError> {
    let mut total_size: usize = 0;
    let mut header_count: usize = 0;
    let mut limit_exceeded = false;
    let mut encoding_error = false;

    decoder
        .decode_with_cb(header_block, |name, value| {
            if limit_exceeded || encoding_error {
                return;
            }

            header_count += 1;
            if header_count > limits.max_header_count || value.len() > limits.max_header_value_size
            {
                limit_exceeded = true;
                return;
            }

            // RFC 7540 §6.5.2: sum of (name.len + value.len + 32) per entry
            total_size += name.len() + value.len() + 32;
            if total_size > limits.max_header_list_size {
                limit_exceeded = true;
                return;
            }

            let (Ok(name_str), Ok(value_str)) =
                (std::str::from_utf8(&name), std::str::from_utf8(&value))
            else {
                encoding_error = true;
                return;
            };
            let value_str = value_str.to_string();

            if trailers {
                stream.trailers.push((name_str.to_string(), value_str));
                return;
            }
            match name_str {
                ":method" => stream.method = Some(value_str),
                ":path" => stream.path = Some(value_str),
                ":authority" => stream.authority = Some(value_str),
                ":scheme" => stream.scheme = Some(value_str),
                ":status" => stream.status = value_str.parse().ok(),
                _ => stream.headers.push((name_str.to_string(), value_str)),
            }
        })
        .map_err(|e| ParseError::new(ParseErrorKind::Http2HpackError(format!("{e:?}"))))?;

    if encoding_error {
        return Err(ParseError::new(ParseErrorKind::Http2InvalidHeaderEncoding));
    }

    if limit_exceeded {
        return Err(ParseError::new(ParseErrorKind::Http2HeaderListTooLarge));
    }

    Ok(())
}

fn build_parsed_message_owned(stream_id: StreamId, stream: StreamState) -> ParsedH2Message {
    ParsedH2Message {
        method: stream.method,
        path: stream.path,
        authority: stream.authority,
        scheme: stream.scheme,
        status: stream.status,
        headers: stream.headers,
        trailers: stream.trailers,
        stream_id,
        header_size: stream.header_size,
        body: stream.body,
        truncated: stream.truncated,
        first_frame_timestamp_ns: stream.first_frame_timestamp_ns,
        end_stream_timestamp_ns: stream.end_stream_timestamp_ns,
    }
}

/// Extract the stream if it just completed. Only the stream touched by the
/// current frame is checked.
fn check_stream_completion(
    state: &mut H2ConnectionState,
    stream_id: StreamId,
) -> Option<(StreamId, ParsedH2Message)> {
    let stream = state.active_streams.get(&stream_id)?;
    if stream.phase == StreamPhase::Complete {
        let stream = state.active_streams.remove(&stream_id)?;
        Some((stream_id, build_parsed_message_owned(stream_id, stream)))
    } else {
        None
    }
}
