//! Request type accepted by the transport stack.

use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{Error, Result};
use crate::headers::HeaderMap;

/// Request body: in-memory bytes or a finite chunk stream.
pub enum Body {
    Bytes(Bytes),
    /// Streamed body. `len` must be the total number of bytes the stream
    /// will yield; transports use it for `content-length`.
    Stream {
        rx: mpsc::Receiver<Bytes>,
        len: u64,
    },
}

impl Body {
    /// Known total length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Body::Bytes(b) => b.len() as u64,
            Body::Stream { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream { len, .. } => write!(f, "Body::Stream({} bytes)", len),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// An HTTP request with an absolute URL.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    /// Per-request wall-clock bound; overrides the transport default.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        if url.host_str().is_none() {
            return Err(Error::request("parse_url", "URL has no host"));
        }
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::request(
                    "parse_url",
                    format!("unsupported scheme: {}", other),
                ))
            }
        }
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        })
    }

    pub fn get(url: impl AsRef<str>) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl AsRef<str>) -> Result<Self> {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url
            .port()
            .unwrap_or(if self.url.scheme() == "https" { 443 } else { 80 })
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Path plus query, as sent on the wire.
    pub fn path_and_query(&self) -> String {
        let path = self.url.path();
        let path = if path.is_empty() { "/" } else { path };
        match self.url.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        }
    }
}

/// Key identifying a pooled endpoint: scheme, host, port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl HostKey {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        }
    }

    pub fn from_request(req: &Request) -> Self {
        Self::new(req.url.scheme(), req.host(), req.port())
    }

    pub fn authority(&self) -> String {
        let default = if self.scheme == "https" { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parsing() {
        let req = Request::get("https://example.com/a/b?x=1").unwrap();
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.port(), 443);
        assert_eq!(req.path_and_query(), "/a/b?x=1");
        assert!(req.is_https());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Request::get("http://example.com/").unwrap().port(), 80);
        assert_eq!(Request::get("https://example.com:8443/").unwrap().port(), 8443);
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(Request::get("ftp://example.com/").is_err());
        assert!(Request::get("not a url").is_err());
    }

    #[test]
    fn test_host_key_authority() {
        let key = HostKey::new("https", "example.com", 443);
        assert_eq!(key.authority(), "example.com");
        let key = HostKey::new("https", "example.com", 8443);
        assert_eq!(key.authority(), "example.com:8443");
    }
}
