//! HTTP/1.x and HTTP/2 (including gRPC) dissectors

mod h1;
mod h2;
mod record;
mod redact;

use std::collections::BTreeMap;

use h2session::H2Limits;
use tap_api::{
    DissectError, Dissector, Emitter, Exchange, MatchedPair, Protocol, ProtocolId, TcpReader,
    TrafficFilteringOptions,
};

pub use redact::REDACTED;

pub(crate) const HTTP10: Protocol = Protocol {
    name:             "http",
    long_name:        "Hypertext Transfer Protocol -- HTTP/1.0",
    abbreviation:     "HTTP",
    macro_name:       "http",
    version:          "1.0",
    background_color: "#205cf5",
    foreground_color: "#ffffff",
    font_size:        12,
    reference_link:   "https://datatracker.ietf.org/doc/html/rfc1945",
    ports:            &["80", "443", "8080"],
    priority:         0,
};

pub(crate) const HTTP11: Protocol = Protocol {
    long_name: "Hypertext Transfer Protocol -- HTTP/1.1",
    version: "1.1",
    reference_link: "https://datatracker.ietf.org/doc/html/rfc2616",
    ..HTTP10
};

pub(crate) const HTTP2: Protocol = Protocol {
    name:             "http",
    long_name:        "Hypertext Transfer Protocol Version 2 (HTTP/2)",
    abbreviation:     "HTTP/2",
    macro_name:       "http2",
    version:          "2.0",
    background_color: "#244c5a",
    foreground_color: "#ffffff",
    font_size:        11,
    reference_link:   "https://datatracker.ietf.org/doc/html/rfc7540",
    ports:            &["80", "443", "8080"],
    priority:         0,
};

pub(crate) const GRPC: Protocol = Protocol {
    long_name: "Hypertext Transfer Protocol Version 2 (HTTP/2) [ gRPC over HTTP/2 ]",
    abbreviation: "gRPC",
    macro_name: "grpc",
    reference_link: "https://grpc.github.io/grpc/core/md_doc_statuscodes.html",
    ports: &["80", "443", "8080", "50051"],
    ..HTTP2
};

static HTTP1_PROTOCOLS: [Protocol; 2] = [HTTP10, HTTP11];
static HTTP2_PROTOCOLS: [Protocol; 2] = [HTTP2, GRPC];

fn http_macros() -> BTreeMap<&'static str, String> {
    BTreeMap::from([
        (
            "http",
            format!(
                r#"proto.name == "{}" and proto.version.startsWith("1")"#,
                HTTP11.name
            ),
        ),
        (
            "http2",
            format!(
                r#"proto.name == "{}" and proto.version == "{}""#,
                HTTP2.name, HTTP2.version
            ),
        ),
        (
            "grpc",
            format!(
                r#"proto.name == "{}" and proto.version == "{}" and proto.macro == "{}""#,
                GRPC.name, GRPC.version, GRPC.macro_name
            ),
        ),
    ])
}

/// HTTP/1.0 and HTTP/1.1, including the `h2c` upgrade into HTTP/2.
#[derive(Debug, Clone)]
pub struct Http1Dissector {
    h2_limits: H2Limits,
}

impl Http1Dissector {
    pub fn new(http2_body_limit: usize) -> Self {
        Self {
            h2_limits: H2Limits::with_max_body_size(http2_body_limit),
        }
    }
}

impl Dissector for Http1Dissector {
    fn id(&self) -> ProtocolId {
        ProtocolId::Http1
    }

    fn protocols(&self) -> &'static [Protocol] {
        &HTTP1_PROTOCOLS
    }

    fn macros(&self) -> BTreeMap<&'static str, String> {
        http_macros()
    }

    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError> {
        h1::dissect(reader, &self.h2_limits)
    }

    fn emit(&self, exchange: Exchange, options: &TrafficFilteringOptions, emitter: &dyn Emitter) {
        filter_and_emit(exchange, options, emitter);
    }
}

/// HTTP/2 with prior knowledge, carrying gRPC.
#[derive(Debug, Clone, Default)]
pub struct Http2Dissector {
    limits: H2Limits,
}

impl Http2Dissector {
    pub fn new(limits: H2Limits) -> Self {
        Self { limits }
    }
}

impl Dissector for Http2Dissector {
    fn id(&self) -> ProtocolId {
        ProtocolId::Http2
    }

    fn protocols(&self) -> &'static [Protocol] {
        &HTTP2_PROTOCOLS
    }

    fn macros(&self) -> BTreeMap<&'static str, String> {
        http_macros()
    }

    fn dissect(&self, reader: &mut dyn TcpReader) -> Result<(), DissectError> {
        h2::dissect(reader, &self.limits)
    }

    fn emit(&self, exchange: Exchange, options: &TrafficFilteringOptions, emitter: &dyn Emitter) {
        filter_and_emit(exchange, options, emitter);
    }
}

/// Build the exchange for a matched pair and publish it.
fn publish(reader: &dyn TcpReader, protocol: &Protocol, pair: MatchedPair) {
    let exchange = Exchange::paired(
        protocol,
        reader.capture(),
        &reader.connection_info(),
        pair,
    );
    filter_and_emit(exchange, reader.options(), reader.emitter());
}

/// Health-check suppression, `X-Forwarded-For` and redaction, then emit.
pub(crate) fn filter_and_emit(
    mut exchange: Exchange,
    options: &TrafficFilteringOptions,
    emitter: &dyn Emitter,
) {
    let Some(request) = exchange.request.as_http_request() else {
        emitter.emit(exchange);
        return;
    };
    if let Some(ua) = request.header("user-agent")
        && options.is_health_check(ua)
    {
        return;
    }
    if let Some(forwarded) = request.header("x-forwarded-for")
        && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        exchange.src.ip = first.to_string();
        exchange.src.port = None;
    }
    if !options.disable_redaction {
        redact::redact_exchange(&mut exchange, options);
    }
    emitter.emit(exchange);
}

#[cfg(test)]
mod tests;
