//! Conversion of parsed HTTP messages into exchange records

use base64::{Engine, engine::general_purpose::STANDARD};
use h2session::{HttpRequest, HttpResponse, ParsedH2Message};
use http::Version;
use tap_api::{Body, Header, HttpRequestRecord, HttpResponseRecord};

/// Bytes examined when a body has no declared content type
const SNIFF_LEN: usize = 512;

pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn header_list(headers: &http::HeaderMap) -> Vec<Header> {
    headers
        .iter()
        .map(|(name, value)| Header::new(name.as_str(), String::from_utf8_lossy(value.as_bytes())))
        .collect()
}

/// Query parameters in order of appearance, undecoded.
pub(crate) fn query_pairs(query: Option<&str>) -> Vec<Header> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => Header::new(k, v),
            None => Header::new(pair, ""),
        })
        .collect()
}

/// Request record for an HTTP/1.x request. `fallback_authority` is used
/// when the request has neither an absolute URI nor a `Host` header.
pub(crate) fn request_from_h1(
    req: &HttpRequest,
    headers_size: usize,
    fallback_authority: &str,
) -> HttpRequestRecord {
    let path_and_query = req
        .uri
        .path_and_query()
        .map_or_else(|| req.uri.to_string(), |pq| pq.as_str().to_string());
    let url = if req.uri.authority().is_some() {
        req.uri.to_string()
    } else {
        let host = req.header_str("host").unwrap_or(fallback_authority);
        format!("http://{host}{path_and_query}")
    };
    HttpRequestRecord {
        method: req.method.to_string(),
        url,
        path: req.uri.path().to_string(),
        http_version: version_str(req.version).to_string(),
        headers: header_list(&req.headers),
        query_string: query_pairs(req.uri.query()),
        body: text_body(&req.body, req.header_str("content-type"), false),
        headers_size: headers_size as i64,
    }
}

pub(crate) fn response_from_h1(resp: &HttpResponse, headers_size: usize) -> HttpResponseRecord {
    let status_text = resp
        .reason
        .clone()
        .or_else(|| resp.status.canonical_reason().map(str::to_string))
        .unwrap_or_default();
    HttpResponseRecord {
        status: resp.status.as_u16(),
        status_text,
        http_version: version_str(resp.version).to_string(),
        headers: header_list(&resp.headers),
        body: text_body(&resp.body, resp.header_str("content-type"), false),
        headers_size: headers_size as i64,
    }
}

/// Request record for a completed HTTP/2 stream. Pseudo-headers are kept in
/// the header list; the URL is `{scheme}://{authority}{path}`.
pub(crate) fn request_from_h2(msg: &ParsedH2Message) -> HttpRequestRecord {
    let full_path = msg.path.clone().unwrap_or_else(|| "/".to_string());
    let (path, query) = match full_path.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q)),
        None => (full_path.clone(), None),
    };
    HttpRequestRecord {
        method: msg.method.clone().unwrap_or_default(),
        url: msg.url(),
        path,
        http_version: version_str(Version::HTTP_2).to_string(),
        headers: h2_headers(msg),
        query_string: query_pairs(query),
        body: base64_body(&msg.body, msg.header("content-type"), msg.truncated),
        headers_size: msg.header_size as i64,
    }
}

pub(crate) fn response_from_h2(msg: &ParsedH2Message) -> HttpResponseRecord {
    let status = msg.status.unwrap_or_default();
    let status_text = match msg.grpc_status() {
        Some(code) if msg.is_grpc() => grpc_status_name(code).to_string(),
        _ => msg
            .http_status()
            .and_then(|s| s.canonical_reason())
            .unwrap_or_default()
            .to_string(),
    };
    HttpResponseRecord {
        status,
        status_text,
        http_version: version_str(Version::HTTP_2).to_string(),
        headers: h2_headers(msg),
        body: base64_body(&msg.body, msg.header("content-type"), msg.truncated),
        headers_size: msg.header_size as i64,
    }
}

/// Pseudo-headers, regular headers, then trailers.
fn h2_headers(msg: &ParsedH2Message) -> Vec<Header> {
    msg.headers_with_pseudo()
        .into_iter()
        .chain(msg.trailers.iter().cloned())
        .map(|(n, v)| Header::new(n, v))
        .collect()
}

/// Bodies that are not valid UTF-8 fall back to base64.
pub(crate) fn text_body(bytes: &[u8], content_type: Option<&str>, truncated: bool) -> Body {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return base64_body(bytes, content_type, truncated);
    };
    Body {
        truncated,
        as_bytes: text.to_string(),
        mime_type: mime_type(bytes, content_type),
        size: bytes.len(),
        encoding: None,
    }
}

pub(crate) fn base64_body(bytes: &[u8], content_type: Option<&str>, truncated: bool) -> Body {
    Body {
        truncated,
        as_bytes: STANDARD.encode(bytes),
        mime_type: mime_type(bytes, content_type),
        size: bytes.len(),
        encoding: Some("base64".to_string()),
    }
}

fn mime_type(bytes: &[u8], content_type: Option<&str>) -> String {
    match content_type {
        Some(ct) if !ct.trim().is_empty() => ct.to_string(),
        _ if bytes.is_empty() => String::new(),
        _ => sniff_content_type(bytes).to_string(),
    }
}

/// Guess a content type from the leading bytes of a body.
pub(crate) fn sniff_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
        (b"\x00asm", "application/wasm"),
        (b"%!PS-Adobe-", "application/postscript"),
        (b"\xef\xbb\xbf", "text/plain; charset=utf-8"),
    ];
    for (magic, mime) in SIGNATURES {
        if data.starts_with(magic) {
            return mime;
        }
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }

    let trimmed = trim_leading_ws(data);
    let lower: Vec<u8> = trimmed.iter().take(16).map(u8::to_ascii_lowercase).collect();
    const HTML_TAGS: &[&[u8]] = &[
        b"<!doctype html",
        b"<html",
        b"<head",
        b"<script",
        b"<body",
        b"<title",
        b"<div",
        b"<p",
        b"<h1",
        b"<table",
        b"<!--",
    ];
    if HTML_TAGS.iter().any(|tag| lower.starts_with(tag)) {
        return "text/html; charset=utf-8";
    }
    if lower.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    if data.iter().any(|&b| is_binary_byte(b)) {
        return "application/octet-stream";
    }
    if (trimmed.starts_with(b"{") || trimmed.starts_with(b"["))
        && serde_json::from_slice::<serde_json::Value>(data).is_ok()
    {
        return "application/json";
    }
    "text/plain; charset=utf-8"
}

fn trim_leading_ws(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f)
}

/// Canonical name of a gRPC status code.
pub(crate) fn grpc_status_name(code: u32) -> &'static str {
    match code {
        0 => "OK",
        1 => "CANCELLED",
        2 => "UNKNOWN",
        3 => "INVALID_ARGUMENT",
        4 => "DEADLINE_EXCEEDED",
        5 => "NOT_FOUND",
        6 => "ALREADY_EXISTS",
        7 => "PERMISSION_DENIED",
        8 => "RESOURCE_EXHAUSTED",
        9 => "FAILED_PRECONDITION",
        10 => "ABORTED",
        11 => "OUT_OF_RANGE",
        12 => "UNIMPLEMENTED",
        13 => "INTERNAL",
        14 => "UNAVAILABLE",
        15 => "DATA_LOSS",
        16 => "UNAUTHENTICATED",
        _ => "UNKNOWN",
    }
}
