//! Core HTTP types: methods, header maps, requests, and wire responses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }

    /// Methods that require a framed body when present.
    pub fn expects_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive header map. Keys are stored lowercased; insertion order
/// is not preserved.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: HashMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.entries.clone()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(&name, value);
        }
        headers
    }
}

/// A fully parsed request, alive from first byte to written response.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request target as received, including any query string.
    pub target: String,
    /// Path portion of the target, after the query split.
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub peer: Option<SocketAddr>,
    pub received_at: Instant,
}

impl Request {
    /// Whether this request asks the connection to close after the response.
    pub fn wants_close(&self) -> bool {
        if let Some(connection) = self.headers.get("connection") {
            return connection.eq_ignore_ascii_case("close");
        }
        self.version == "1.0"
    }

    /// Fingerprint of the raw request bytes, used as the response-cache key.
    pub fn fingerprint(&self) -> u64 {
        let mut hash = fnv1a(0xcbf2_9ce4_8422_2325, self.method.as_str().as_bytes());
        hash = fnv1a(hash, b" ");
        hash = fnv1a(hash, self.target.as_bytes());
        hash = fnv1a(hash, b"\r\n");
        fnv1a(hash, &self.body)
    }

    /// Re-serialize the request line, whitespace-normalized.
    pub fn request_line(&self) -> String {
        format!("{} {} HTTP/{}", self.method.as_str(), self.target, self.version)
    }
}

pub(crate) fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Registered reason phrases for the status line. Anything unregistered on a
/// success path falls back to `OK`.
pub fn status_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Content",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

/// An assembled response about to hit the wire.
///
/// Wire shape:
/// ```text
/// HTTP/1.1 <status> <reason>\r\n
/// content-length: <n>\r\n
/// <other-headers>\r\n
/// \r\n
/// <body>
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: Option<String>,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            reason: None,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Response {
            status,
            reason: None,
            content_type: Some("text/plain".to_string()),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Response {
            status,
            reason: None,
            content_type: Some("application/json".to_string()),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn from_error(err: &ServerError) -> Self {
        Response {
            status: err.status_code(),
            reason: Some(err.reason().to_string()),
            content_type: Some("application/json".to_string()),
            headers: Vec::new(),
            body: err.to_body(),
        }
    }

    /// Error response carrying a JSON array body (route misses, middleware
    /// error accumulation).
    pub fn from_error_list(status: u16, reason: &str, messages: &[String]) -> Self {
        Response {
            status,
            reason: Some(reason.to_string()),
            content_type: Some("application/json".to_string()),
            headers: Vec::new(),
            body: ServerError::list_body(messages),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The bare interim response for `Expect: 100-continue`.
    pub fn continue_interim() -> Vec<u8> {
        b"HTTP/1.1 100 Continue\r\n\r\n".to_vec()
    }

    /// Serialize to wire bytes. `content-length` always leads the header
    /// block; `content-type` follows when set.
    pub fn serialize(&self) -> Vec<u8> {
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| status_reason(self.status));

        let mut wire = Vec::with_capacity(128 + self.body.len());
        wire.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());
        wire.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());

        if let Some(content_type) = &self.content_type {
            wire.extend_from_slice(format!("content-type: {}\r\n", content_type).as_bytes());
        }

        for (name, value) in &self.headers {
            wire.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }

        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(&self.body);
        wire
    }
}
