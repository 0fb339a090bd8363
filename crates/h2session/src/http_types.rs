//! Generic HTTP request/response types
//!
//! These types represent parsed HTTP messages independent of the HTTP version.
//! They can be used for both HTTP/1.x and HTTP/2 messages.

use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::state::TimestampNs;

/// HTTP request parsed from any HTTP version
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, etc.)
    pub method:       Method,
    /// Request target URI
    pub uri:          Uri,
    /// Protocol version from the request line
    pub version:      Version,
    /// HTTP headers
    pub headers:      HeaderMap,
    /// Request body bytes
    pub body:         Vec<u8>,
    /// When the first byte of this request was observed
    pub timestamp_ns: TimestampNs,
}

/// HTTP response parsed from any HTTP version
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code (200, 404, etc.)
    pub status:       StatusCode,
    /// Reason phrase as sent on the wire, if any
    pub reason:       Option<String>,
    /// Protocol version from the status line
    pub version:      Version,
    /// HTTP headers
    pub headers:      HeaderMap,
    /// Response body bytes
    pub body:         Vec<u8>,
    /// When the first byte of this response was observed
    pub timestamp_ns: TimestampNs,
}

impl HttpRequest {
    /// Value of a header as a string, if present and valid ASCII.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl HttpResponse {
    /// Value of a header as a string, if present and valid ASCII.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}
