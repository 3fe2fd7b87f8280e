//! Error types for the httpcloak crate.
//!
//! Every transport failure is reported as an [`Error`] carrying the failed
//! operation, the target endpoint, the protocol in flight and a category
//! that callers can branch on without string matching.

use std::io;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection refused/reset, unreachable, broken pipe.
    Network,
    /// Deadline exceeded.
    Timeout,
    /// Name resolution failure.
    Dns,
    /// Handshake or certificate failure.
    Tls,
    /// Upstream proxy negotiation failure.
    Proxy,
    /// ALPN mismatch, framing violation, preface rejection.
    Protocol,
    /// Malformed caller input.
    Request,
    /// Body-read or response-framing failure.
    Response,
    /// Operation on a terminated transport.
    Closed,
}

impl ErrorCategory {
    /// Whether errors of this category are retryable by default.
    ///
    /// Retryability is structural (category plus, for IO causes, the
    /// `io::ErrorKind`), never inferred from error text.
    pub fn default_retryable(self) -> bool {
        matches!(self, ErrorCategory::Timeout | ErrorCategory::Dns)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Dns => "dns",
            ErrorCategory::Tls => "tls",
            ErrorCategory::Proxy => "proxy",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Request => "request",
            ErrorCategory::Response => "response",
            ErrorCategory::Closed => "closed",
        }
    }
}

/// Transport error with full context.
#[derive(Debug, thiserror::Error)]
#[error("{op}{host_part}{proto_part}: {message}",
    host_part = self.host_part(),
    proto_part = self.proto_part())]
pub struct Error {
    /// Operation that failed (e.g. "dial", "tls_handshake", "round_trip").
    pub op: &'static str,
    /// Target host, if known at the failure site.
    pub host: String,
    /// Target port (0 when unknown).
    pub port: u16,
    /// Protocol in flight ("h1", "h2", "h3"), empty before selection.
    pub protocol: &'static str,
    /// Error category.
    pub category: ErrorCategory,
    /// Whether the operation can be retried.
    pub retryable: bool,
    /// Human-readable detail.
    message: String,
    /// Underlying cause, when one exists.
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(op: &'static str, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            op,
            host: String::new(),
            port: 0,
            protocol: "",
            category,
            retryable: category.default_retryable(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach endpoint context. Does not overwrite context already present,
    /// so the innermost failure site wins.
    pub fn with_endpoint(mut self, host: &str, port: u16) -> Self {
        if self.host.is_empty() {
            self.host = host.to_string();
            self.port = port;
        }
        self
    }

    /// Attach the protocol tag ("h1", "h2", "h3").
    pub fn with_protocol(mut self, protocol: &'static str) -> Self {
        if self.protocol.is_empty() {
            self.protocol = protocol;
        }
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Override the structural retryability default.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn network(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorCategory::Network, message)
    }

    pub fn timeout(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorCategory::Timeout, message)
    }

    pub fn dns(host: &str, message: impl Into<String>) -> Self {
        Self::new("dns_resolve", ErrorCategory::Dns, message).with_endpoint(host, 0)
    }

    pub fn tls(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorCategory::Tls, message)
    }

    pub fn proxy(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorCategory::Proxy, message)
    }

    pub fn protocol(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorCategory::Protocol, message)
    }

    pub fn request(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorCategory::Request, message)
    }

    pub fn response(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, ErrorCategory::Response, message)
    }

    pub fn closed(op: &'static str) -> Self {
        Self::new(op, ErrorCategory::Closed, "transport closed")
    }

    /// Wrap an IO error, deriving category and retryability from its kind.
    pub fn io(op: &'static str, err: io::Error) -> Self {
        let (category, retryable) = classify_io(&err);
        let message = err.to_string();
        Self {
            op,
            host: String::new(),
            port: 0,
            protocol: "",
            category,
            retryable,
            message,
            cause: Some(Box::new(err)),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// True for errors that should make `auto` mode down-negotiate.
    pub fn is_protocol_class(&self) -> bool {
        self.category == ErrorCategory::Protocol
    }

    pub fn is_timeout(&self) -> bool {
        self.category == ErrorCategory::Timeout
    }

    fn host_part(&self) -> String {
        if self.host.is_empty() {
            String::new()
        } else if self.port == 0 || self.port == 443 || self.port == 80 {
            format!(" {}", self.host)
        } else {
            format!(" {}:{}", self.host, self.port)
        }
    }

    fn proto_part(&self) -> String {
        if self.protocol.is_empty() {
            String::new()
        } else {
            format!(" [{}]", self.protocol)
        }
    }
}

/// Map an IO error to (category, retryable) using its structural kind.
fn classify_io(err: &io::Error) -> (ErrorCategory, bool) {
    use io::ErrorKind::*;
    match err.kind() {
        TimedOut | WouldBlock => (ErrorCategory::Timeout, true),
        ConnectionRefused | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected => {
            (ErrorCategory::Network, true)
        }
        AddrNotAvailable | AddrInUse => (ErrorCategory::Network, false),
        UnexpectedEof => (ErrorCategory::Network, true),
        _ => (ErrorCategory::Network, false),
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::request("parse_url", e.to_string()).with_cause(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::response("decode_json", e.to_string()).with_cause(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = Error::tls("tls_handshake", "certificate expired")
            .with_endpoint("example.com", 8443)
            .with_protocol("h2");
        let s = err.to_string();
        assert!(s.contains("tls_handshake"));
        assert!(s.contains("example.com:8443"));
        assert!(s.contains("[h2]"));
        assert!(s.contains("certificate expired"));
    }

    #[test]
    fn test_default_ports_omitted() {
        let err = Error::network("dial", "refused").with_endpoint("example.com", 443);
        assert!(!err.to_string().contains("443"));
    }

    #[test]
    fn test_innermost_context_wins() {
        let err = Error::network("dial", "refused")
            .with_endpoint("inner.example", 443)
            .with_endpoint("outer.example", 443);
        assert_eq!(err.host, "inner.example");
    }

    #[test]
    fn test_io_classification() {
        let err = Error::io("read", io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.is_retryable());

        let err = Error::io("read", io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_tls_not_retryable() {
        assert!(!Error::tls("tls_handshake", "bad cert").is_retryable());
        assert!(Error::timeout("round_trip", "deadline").is_retryable());
        assert!(Error::dns("example.com", "servfail").is_retryable());
    }
}
