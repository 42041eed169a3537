//! Per-request context threaded through the middleware chain.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::handler::HandlerArgs;
use crate::http::{Headers, Method};

/// Connection scheme as observed at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub fn is_plaintext(&self) -> bool {
        matches!(self, Scheme::Http | Scheme::Ws)
    }

    /// The TLS counterpart a plaintext connection upgrades to.
    pub fn upgraded(&self) -> Scheme {
        match self {
            Scheme::Http | Scheme::Https => Scheme::Https,
            Scheme::Ws | Scheme::Wss => Scheme::Wss,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

/// The bag of decoded inputs, accumulators, and response-shaping knobs a
/// request carries through its middleware chain.
#[derive(Debug)]
pub struct Context {
    pub path: String,
    pub method: Method,
    pub request_headers: Headers,
    pub params: HashMap<String, String>,
    pub query: String,
    /// Raw body bytes, untouched by the fabricator when middleware is
    /// attached (a decompressor may need them first).
    pub body: Vec<u8>,
    /// Fabricated handler inputs; the innermost chain frame takes these.
    pub args: Option<HandlerArgs>,
    pub ip_address: std::net::IpAddr,
    pub scheme: Scheme,
    pub local_addr: Option<SocketAddr>,
    pub upgrade_port: Option<u16>,
    pub response_headers: HashMap<String, String>,
    pub status: Option<u16>,
    pub errors: Vec<String>,
    /// Hint for a pluggable response compressor.
    pub compressor: Option<String>,
    pub compression_level: Option<u32>,
}

impl Context {
    /// Reconstruct the request URL from the Host header (or local address)
    /// and the connection scheme.
    pub fn request_url(&self) -> String {
        let host = match self.request_headers.get("host") {
            Some(host) => host.to_string(),
            None => match self.local_addr {
                Some(addr) => addr.to_string(),
                None => "localhost".to_string(),
            },
        };
        format!("{}://{}{}", self.scheme.as_str(), host, self.path)
    }

    /// The request URL with the host's port swapped for the upgrade port
    /// and the scheme promoted to its TLS counterpart.
    pub fn upgrade_url(&self, upgrade_port: u16) -> String {
        let host = match self.request_headers.get("host") {
            Some(host) => host.to_string(),
            None => match self.local_addr {
                Some(addr) => addr.ip().to_string(),
                None => "localhost".to_string(),
            },
        };
        let bare_host = host.split(':').next().unwrap_or(&host);
        format!(
            "{}://{}:{}{}",
            self.scheme.upgraded().as_str(),
            bare_host,
            upgrade_port,
            self.path
        )
    }

    /// Remove both encoding markers a decompressing middleware may have
    /// consumed. Two independent removals, so one present key never
    /// shadows the other.
    pub fn strip_encoding_headers(&mut self) {
        self.request_headers.remove("content-encoding");
        self.request_headers.remove("x-compression-encoding");
    }
}
