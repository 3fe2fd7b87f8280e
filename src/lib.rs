//! # httpcloak
//!
//! Browser-fingerprint-emulating HTTP client transport stack.
//!
//! Given a target URL and a named browser preset, httpcloak issues
//! HTTP/1.1, HTTP/2 or HTTP/3 requests whose on-wire artifacts — TLS
//! ClientHello, QUIC transport parameters, HTTP/2 SETTINGS order, header
//! and pseudo-header ordering, stream priority — match a real browser
//! build, behind a conventional request/response API.
//!
//! ```rust,ignore
//! use httpcloak::{Request, Transport, TransportOptions};
//!
//! let transport = Transport::new("chrome-145", TransportOptions::default())?;
//! let mut resp = transport.round_trip(Request::get("https://example.com/")?).await?;
//! println!("{} over {}", resp.status, resp.protocol);
//! ```

pub mod cache;
pub mod dns;
pub mod error;
pub mod fingerprint;
pub mod headers;
pub mod pool;
pub mod request;
pub mod response;
pub mod session_state;
pub mod tls;
pub mod transport;

pub use error::{Error, ErrorCategory, Result};
pub use fingerprint::{Preset, PresetKind, PseudoHeaderOrder};
pub use headers::HeaderMap;
pub use request::{Body, HostKey, Request};
pub use response::{Response, ResponseBody, Timing};
pub use session_state::{CookieState, SessionState, SESSION_STATE_VERSION};
pub use transport::proxy::ProxyConfig;
pub use transport::{Protocol, Transport, TransportOptions, TransportStats};

pub use cache::{BackendHandle, CacheBackend};
pub use tls::hello::ShuffleSeed;
pub use tls::keylog::KeyLogSink;
pub use tls::session::{SessionKey, TlsSessionCache, TlsSessionState};
