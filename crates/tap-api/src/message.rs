//! Messages produced by dissectors and the connection metadata they carry

use std::{net::IpAddr, time::SystemTime};

use serde::{Deserialize, Serialize};

/// Where a packet was captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capture {
    /// Host interface or pcap file
    #[default]
    Pcap,
    /// Inside an Envoy sidecar's network namespace
    Envoy,
    /// Inside a Linkerd proxy's network namespace
    Linkerd,
    /// Envoy injected by Istio
    Istio,
}

impl std::fmt::Display for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pcap => "Pcap",
            Self::Envoy => "Envoy",
            Self::Linkerd => "Linkerd",
            Self::Istio => "Istio",
        };
        f.write_str(s)
    }
}

/// Addressing of one direction of a TCP stream, plus the stream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpId {
    pub src_ip:   IpAddr,
    pub dst_ip:   IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Registry id of the owning stream
    pub id:       i64,
}

impl TcpId {
    /// The same stream seen from the other direction
    pub fn reversed(&self) -> Self {
        Self {
            src_ip:   self.dst_ip,
            dst_ip:   self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            id:       self.id,
        }
    }

    /// `"caddr:cport->saddr:sport"`, oriented client to server regardless of
    /// which direction this id describes.
    pub fn flow_key(&self, is_client: bool) -> String {
        if is_client {
            format!(
                "{}:{}->{}:{}",
                self.src_ip, self.src_port, self.dst_ip, self.dst_port
            )
        } else {
            format!(
                "{}:{}->{}:{}",
                self.dst_ip, self.dst_port, self.src_ip, self.src_port
            )
        }
    }

    /// Client-to-server connection info for a reader of the given direction.
    pub fn connection_info(&self, is_client: bool, is_outgoing: bool) -> ConnectionInfo {
        let id = if is_client {
            self.clone()
        } else {
            self.reversed()
        };
        ConnectionInfo {
            client_ip: id.src_ip.to_string(),
            client_port: Some(id.src_port),
            server_ip: id.dst_ip.to_string(),
            server_port: id.dst_port,
            is_outgoing,
        }
    }
}

/// Client/server addressing attached to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_ip:   String,
    /// Cleared when the client address comes from `X-Forwarded-For`
    pub client_port: Option<u16>,
    pub server_ip:   String,
    pub server_port: u16,
    pub is_outgoing: bool,
}

/// A header or query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    #[serde(rename = "key")]
    pub name:  String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name:  name.into(),
            value: value.into(),
        }
    }
}

/// Captured message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    /// Data past the size cap was dropped
    pub truncated: bool,
    /// Text, or base64 when `encoding` is set
    pub as_bytes:  String,
    pub mime_type: String,
    /// Size of the captured body before any encoding
    pub size:      usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding:  Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestRecord {
    pub method:       String,
    pub url:          String,
    pub path:         String,
    pub http_version: String,
    pub headers:      Vec<Header>,
    pub query_string: Vec<Header>,
    pub body:         Body,
    pub headers_size: i64,
}

impl HttpRequestRecord {
    /// First header with this name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseRecord {
    pub status:       u16,
    pub status_text:  String,
    pub http_version: String,
    pub headers:      Vec<Header>,
    pub body:         Body,
    pub headers_size: i64,
}

impl HttpResponseRecord {
    /// First header with this name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Message of a non-HTTP protocol: a method, a one-line summary and a JSON
/// rendering of the decoded fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenericRecord {
    pub method:  String,
    pub summary: String,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    HttpRequest(HttpRequestRecord),
    HttpResponse(HttpResponseRecord),
    Generic(GenericRecord),
}

/// One decoded request or response, owned independently of packet buffers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(skip)]
    pub is_request:   bool,
    #[serde(skip)]
    pub capture_time: SystemTime,
    pub capture_size: usize,
    #[serde(flatten)]
    pub payload:      Payload,
}

impl Message {
    pub fn request(capture_time: SystemTime, capture_size: usize, payload: Payload) -> Self {
        Self {
            is_request: true,
            capture_time,
            capture_size,
            payload,
        }
    }

    pub fn response(capture_time: SystemTime, capture_size: usize, payload: Payload) -> Self {
        Self {
            is_request: false,
            capture_time,
            capture_size,
            payload,
        }
    }

    pub fn as_http_request(&self) -> Option<&HttpRequestRecord> {
        match &self.payload {
            Payload::HttpRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_http_response(&self) -> Option<&HttpResponseRecord> {
        match &self.payload {
            Payload::HttpResponse(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_generic(&self) -> Option<&GenericRecord> {
        match &self.payload {
            Payload::Generic(g) => Some(g),
            _ => None,
        }
    }
}
