//! HTTP/3 transport.
//!
//! QUIC connections are pooled per host key and multiplexed. The transport
//! parameters, control-stream SETTINGS and QPACK policy are all derived
//! from the preset; see the submodules for the wire encodings.

pub mod driver;
pub mod frames;
pub mod params;
pub mod qpack;
pub mod quic;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::dns;
use crate::error::{Error, Result};
use crate::pool::{Outcome, Pool, Poolable};
use crate::request::{Body, HostKey, Request};
use crate::response::{Response, ResponseBody};
use crate::tls::TlsContext;

pub use driver::{H3Driver, SendRequest};
pub use quic::DEFAULT_IDLE_TIMEOUT;

/// Streams per QUIC connection before a second connection is dialed,
/// matching the advertised initial_max_streams_bidi.
const MAX_STREAMS: u32 = 100;

/// A pooled handle to a driven HTTP/3 connection.
pub struct H3PooledConnection {
    command_tx: mpsc::Sender<SendRequest>,
    shared: Arc<driver::DriverShared>,
    /// Whether the dial attempted 0-RTT.
    pub zero_rtt: bool,
    /// The browser-extra transport parameters this dial advertised.
    pub extra_params: Bytes,
}

impl Poolable for H3PooledConnection {
    fn max_concurrent(&self) -> u32 {
        MAX_STREAMS
    }

    fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Relaxed)
    }
}

/// HTTP/3 transport over pooled QUIC connections.
pub struct H3Transport {
    tls: TlsContext,
    resolver: dns::Resolver,
    pool: Arc<Pool<HostKey, H3PooledConnection>>,
    idle_timeout: Duration,
    tls_only: bool,
}

impl H3Transport {
    pub fn new(tls: TlsContext, resolver: dns::Resolver) -> Self {
        Self {
            tls,
            resolver,
            pool: Arc::new(Pool::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            tls_only: false,
        }
    }

    pub fn set_tls_only(&mut self, tls_only: bool) {
        self.tls_only = tls_only;
    }

    pub fn set_insecure_skip_verify(&mut self, skip: bool) {
        self.tls.insecure_skip_verify = skip;
    }

    /// QUIC idle timeout; the keepalive period follows at half this value.
    pub fn set_idle_timeout(&mut self, idle: Duration) {
        self.idle_timeout = idle;
    }

    pub fn tls_context(&self) -> &TlsContext {
        &self.tls
    }

    /// Reset all QUIC connections, preserving the session and ECH caches.
    pub fn close_connections(&self) {
        self.pool.clear();
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// Live pooled connections, for diagnostics.
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub async fn round_trip(&self, req: Request) -> Result<Response> {
        if !req.is_https() {
            return Err(Error::protocol("scheme_check", "HTTP/3 requires https")
                .with_protocol("h3"));
        }
        if !self.tls.preset.supports_h3 {
            return Err(Error::protocol(
                "protocol_select",
                format!("preset {} does not support HTTP/3", self.tls.preset.name),
            )
            .with_protocol("h3"));
        }

        let key = HostKey::from_request(&req);
        let url = req.url.to_string();

        let tls = self.tls.clone();
        let resolver = self.resolver.clone();
        let idle = self.idle_timeout;
        let dial_key = key.clone();

        let lease = self
            .pool
            .acquire(key.clone(), move || async move {
                dial(tls, resolver, dial_key, idle).await
            })
            .await
            .map_err(|e| e.with_endpoint(&key.host, key.port).with_protocol("h3"))?;
        let reused = lease.is_reused();

        let headers = self.wire_headers(&req);
        let body = match req.body {
            None => None,
            Some(Body::Bytes(b)) => Some(b),
            Some(Body::Stream { mut rx, len }) => {
                let mut buf = bytes::BytesMut::with_capacity(len as usize);
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk);
                }
                Some(buf.freeze())
            }
        };
        let headers = match &body {
            Some(b) if !b.is_empty()
                && !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length")) =>
            {
                let mut headers = headers;
                headers.push(("content-length".to_string(), b.len().to_string()));
                headers
            }
            _ => headers,
        };

        let (respond, head_rx) = oneshot::channel();
        let cmd = SendRequest {
            method: req.method.as_str().to_string(),
            scheme: "https".to_string(),
            authority: key.authority(),
            path: req.path_and_query(),
            headers: headers
                .into_iter()
                .map(|(n, v)| (n.to_ascii_lowercase(), v))
                .collect(),
            body,
            respond,
        };

        lease
            .conn()
            .command_tx
            .send(cmd)
            .await
            .map_err(|_| Error::closed("h3_round_trip").with_protocol("h3"))?;

        let head = match head_rx.await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                lease.release(Outcome::Unhealthy);
                return Err(e.with_endpoint(&key.host, key.port));
            }
            Err(_) => {
                lease.release(Outcome::Unhealthy);
                return Err(Error::closed("h3_round_trip")
                    .with_protocol("h3")
                    .with_endpoint(&key.host, key.port));
            }
        };
        lease.release(Outcome::Reusable);

        let (status, resp_headers, body_rx) = head;
        let mut response = Response::new(
            status,
            resp_headers,
            ResponseBody::new(body_rx),
            url,
            "h3",
        );
        response.reused = reused;
        if reused {
            response.timing.mark_reused();
        }
        Ok(response)
    }

    fn wire_headers(&self, req: &Request) -> Vec<(String, String)> {
        let preset = &self.tls.preset;
        if self.tls_only {
            return crate::headers::apply_order(
                req.headers.clone().into_entries(),
                &preset.header_order,
            );
        }
        crate::headers::merge_ordered(
            &preset.headers,
            preset.user_agent,
            &req.headers,
            &preset.header_order,
        )
    }
}

async fn dial(
    tls: TlsContext,
    resolver: dns::Resolver,
    key: HostKey,
    idle: Duration,
) -> Result<H3PooledConnection> {
    let dialed = quic::dial(&tls, &resolver, &key, idle).await?;
    let zero_rtt = dialed.zero_rtt;
    let extra_params = dialed.extra_params.clone();

    let (command_tx, command_rx) = mpsc::channel(64);
    let shared = Arc::new(driver::DriverShared::new());
    let driver = H3Driver::new(
        dialed,
        command_rx,
        tls.session_cache.clone(),
        tls.seed,
        tls.preset.pseudo_header_order,
        &tls.preset.h3_settings,
        Arc::clone(&shared),
    );
    tokio::spawn(driver.run());

    Ok(H3PooledConnection {
        command_tx,
        shared,
        zero_rtt,
        extra_params,
    })
}
