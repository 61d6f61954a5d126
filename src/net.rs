//! Network primitives: protocol and method enums, host address discovery.

use std::net::UdpSocket;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Wire protocol of a job URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Http,
    Https,
    Ws,
    Wss,
}

impl Protocol {
    /// Prefix-matches the URL scheme. Unknown schemes default to HTTP.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("https") {
            Protocol::Https
        } else if url.starts_with("wss") {
            Protocol::Wss
        } else if url.starts_with("ws") {
            Protocol::Ws
        } else {
            Protocol::Http
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }
}

/// HTTP request methods. Only GET and POST are driven by jobs; the rest
/// exist so descriptors parsed from user input stay representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// The user-facing phrase accepted on the command line.
    pub fn phrase(self) -> &'static str {
        match self {
            HttpMethod::Get => "HttpGet",
            HttpMethod::Post => "HttpPost",
            HttpMethod::Put => "HttpPut",
            HttpMethod::Patch => "HttpPatch",
            HttpMethod::Delete => "HttpDelete",
            HttpMethod::Head => "HttpHead",
            HttpMethod::Options => "HttpOptions",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "httpget" | "get" => Ok(HttpMethod::Get),
            "httppost" | "post" => Ok(HttpMethod::Post),
            "httpput" | "put" => Ok(HttpMethod::Put),
            "httppatch" | "patch" => Ok(HttpMethod::Patch),
            "httpdelete" | "delete" => Ok(HttpMethod::Delete),
            "httphead" | "head" => Ok(HttpMethod::Head),
            "httpoptions" | "options" => Ok(HttpMethod::Options),
            _ => Err(format!(
                "Invalid method: '{}'. Use 'HttpGet' or 'HttpPost'.",
                s
            )),
        }
    }
}

/// Best-effort LAN address of this host, cached for the process lifetime.
///
/// Learns the outbound interface from a connected UDP socket; no packet
/// is sent. Hosts with no route fall back to loopback.
pub fn local_ip() -> &'static str {
    static IP: OnceLock<String> = OnceLock::new();
    IP.get_or_init(|| {
        UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect("8.8.8.8:80")?;
                socket.local_addr()
            })
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "127.0.0.1".to_string())
    })
}
