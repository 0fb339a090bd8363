//! Paired request/response exchanges

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::{
    matcher::MatchedPair,
    message::{Capture, ConnectionInfo, Message, Payload},
    protocol::Protocol,
};

/// One side of an exchange. `name` is filled in by the tapper when the
/// address belongs to a known pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub ip:   String,
    pub port: Option<u16>,
    pub name: String,
}

/// The output unit: a request, its response when the protocol has one, and
/// where they were observed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub protocol:     Protocol,
    pub capture:      Capture,
    pub src:          Endpoint,
    pub dst:          Endpoint,
    pub namespace:    String,
    pub outgoing:     bool,
    pub request:      Message,
    pub response:     Option<Message>,
    pub elapsed_time: i64,
    /// Request capture time, nanoseconds since the Unix epoch
    pub timestamp:    u64,
}

impl Exchange {
    /// Exchange from a matched pair.
    pub fn paired(
        protocol: &Protocol,
        capture: Capture,
        connection: &ConnectionInfo,
        pair: MatchedPair,
    ) -> Self {
        let mut exchange = Self::request_only(protocol, capture, connection, pair.request);
        exchange.response = Some(pair.response);
        exchange.elapsed_time = pair.elapsed_ms;
        exchange
    }

    /// Exchange for a message that has no response in its protocol.
    pub fn request_only(
        protocol: &Protocol,
        capture: Capture,
        connection: &ConnectionInfo,
        request: Message,
    ) -> Self {
        let timestamp = request
            .capture_time
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            protocol: protocol.clone(),
            capture,
            src: Endpoint {
                ip:   connection.client_ip.clone(),
                port: connection.client_port,
                name: String::new(),
            },
            dst: Endpoint {
                ip:   connection.server_ip.clone(),
                port: Some(connection.server_port),
                name: String::new(),
            },
            namespace: String::new(),
            outgoing: connection.is_outgoing,
            request,
            response: None,
            elapsed_time: 0,
            timestamp,
        }
    }

    pub fn request_time(&self) -> SystemTime {
        self.request.capture_time
    }

    /// One-line view used in logs and listings.
    pub fn summary(&self) -> ExchangeSummary {
        let (method, path) = match &self.request.payload {
            Payload::HttpRequest(r) => (r.method.clone(), r.path.clone()),
            Payload::Generic(g) => (g.method.clone(), g.summary.clone()),
            Payload::HttpResponse(_) => (String::new(), String::new()),
        };
        let status = self
            .response
            .as_ref()
            .and_then(|r| r.as_http_response())
            .map(|r| r.status);
        ExchangeSummary {
            protocol: self.protocol.abbreviation,
            method,
            path,
            status,
            elapsed_ms: self.elapsed_time,
            src: format!("{}:{}", self.src.ip, port_str(self.src.port)),
            dst: format!("{}:{}", self.dst.ip, port_str(self.dst.port)),
        }
    }
}

fn port_str(port: Option<u16>) -> String {
    port.map_or_else(|| "-".to_string(), |p| p.to_string())
}

/// Condensed description of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSummary {
    pub protocol:   &'static str,
    pub method:     String,
    pub path:       String,
    pub status:     Option<u16>,
    pub elapsed_ms: i64,
    pub src:        String,
    pub dst:        String,
}

impl std::fmt::Display for ExchangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} -> {}",
            self.protocol, self.method, self.path, self.src, self.dst
        )?;
        if let Some(status) = self.status {
            write!(f, " {status}")?;
        }
        write!(f, " ({}ms)", self.elapsed_ms)
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "=== {} Exchange ({}, {}:{} -> {}:{}) ===",
            self.protocol.abbreviation,
            self.capture,
            self.src.ip,
            port_str(self.src.port),
            self.dst.ip,
            port_str(self.dst.port),
        )?;
        writeln!(f, "Latency: {}ms", self.elapsed_time)?;
        writeln!(f)?;
        writeln!(f, "--- Request ---")?;
        write_message(f, &self.request)?;
        if let Some(response) = &self.response {
            writeln!(f)?;
            writeln!(f, "--- Response ---")?;
            write_message(f, response)?;
        }
        Ok(())
    }
}

fn write_message(f: &mut std::fmt::Formatter<'_>, message: &Message) -> std::fmt::Result {
    match &message.payload {
        Payload::HttpRequest(r) => {
            writeln!(f, "{} {} {}", r.method, r.url, r.http_version)?;
            for h in &r.headers {
                writeln!(f, "{}: {}", h.name, h.value)?;
            }
            if !r.body.as_bytes.is_empty() {
                writeln!(f)?;
                writeln!(f, "{}", r.body.as_bytes)?;
            }
        },
        Payload::HttpResponse(r) => {
            writeln!(f, "{} {} {}", r.http_version, r.status, r.status_text)?;
            for h in &r.headers {
                writeln!(f, "{}: {}", h.name, h.value)?;
            }
            if !r.body.as_bytes.is_empty() {
                writeln!(f)?;
                writeln!(f, "{}", r.body.as_bytes)?;
            }
        },
        Payload::Generic(g) => {
            writeln!(f, "{} {}", g.method, g.summary)?;
            writeln!(f, "{}", g.details)?;
        },
    }
    Ok(())
}
