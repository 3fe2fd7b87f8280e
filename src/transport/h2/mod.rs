//! HTTP/2 transport.
//!
//! One muxed connection per host key, pooled and shared across requests.
//! The dial path runs TLS with the preset's TCP ClientHello variant and
//! requires `h2` from ALPN; a different answer is a protocol-class error
//! that drives the facade's down-negotiation.

pub mod connection;
pub mod driver;
pub mod frame;
pub mod hpack;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::dns;
use crate::error::{Error, Result};
use crate::pool::{Outcome, Pool, Poolable};
use crate::request::{Body, HostKey, Request};
use crate::response::{Response, ResponseBody};
use crate::tls::{self, AlpnProtocol, TlsContext};
use crate::transport::proxy::{self, ProxyConfig};

pub use connection::H2Connection;
pub use driver::{H2Driver, SendRequest};

/// A pooled handle to a driven HTTP/2 connection.
pub struct H2PooledConnection {
    command_tx: mpsc::Sender<SendRequest>,
    shared: Arc<driver::DriverShared>,
    pub resumed: bool,
}

impl Poolable for H2PooledConnection {
    fn max_concurrent(&self) -> u32 {
        self.shared.max_streams.load(Ordering::Relaxed).max(1)
    }

    fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Relaxed)
    }
}

/// HTTP/2 transport over pooled muxed connections.
pub struct H2Transport {
    tls: TlsContext,
    resolver: dns::Resolver,
    proxy: Option<ProxyConfig>,
    pool: Arc<Pool<HostKey, H2PooledConnection>>,
    tls_only: bool,
}

impl H2Transport {
    pub fn new(tls: TlsContext, resolver: dns::Resolver, proxy: Option<ProxyConfig>) -> Self {
        Self {
            tls,
            resolver,
            proxy,
            pool: Arc::new(Pool::new()),
            tls_only: false,
        }
    }

    pub fn set_tls_only(&mut self, tls_only: bool) {
        self.tls_only = tls_only;
    }

    pub fn set_insecure_skip_verify(&mut self, skip: bool) {
        self.tls.insecure_skip_verify = skip;
    }

    pub fn tls_context(&self) -> &TlsContext {
        &self.tls
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
            return Err(Error::protocol("scheme_check", "HTTP/2 requires https")
                .with_protocol("h2"));
        }
        let key = HostKey::from_request(&req);
        let url = req.url.to_string();

        let tls = self.tls.clone();
        let resolver = self.resolver.clone();
        let proxy = self.proxy.clone();
        let dial_key = key.clone();

        let lease = self
            .pool
            .acquire(key.clone(), move || async move {
                dial(&tls, &resolver, proxy.as_ref(), &dial_key).await
            })
            .await
            .map_err(|e| e.with_endpoint(&key.host, key.port).with_protocol("h2"))?;
        let reused = lease.is_reused();

        let headers = self.wire_headers(&req);
        let body = match req.body {
            None => None,
            Some(Body::Bytes(b)) => Some(b),
            Some(Body::Stream { mut rx, len }) => {
                // Muxed frames need sized DATA; a finite stream is drained
                // up front.
                let mut buf = bytes::BytesMut::with_capacity(len as usize);
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk);
                }
                Some(buf.freeze())
            }
        };
        let headers = with_content_length(headers, body.as_ref());

        let (respond, head_rx) = oneshot::channel();
        let cmd = SendRequest {
            method: req.method.as_str().to_string(),
            scheme: "https".to_string(),
            authority: key.authority(),
            path: req.path_and_query(),
            headers,
            body,
            respond,
        };

        lease
            .conn()
            .command_tx
            .send(cmd)
            .await
            .map_err(|_| Error::closed("h2_round_trip").with_protocol("h2"))?;

        let head = match head_rx.await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                lease.release(Outcome::Unhealthy);
                return Err(e.with_endpoint(&key.host, key.port));
            }
            Err(_) => {
                lease.release(Outcome::Unhealthy);
                return Err(Error::closed("h2_round_trip")
                    .with_protocol("h2")
                    .with_endpoint(&key.host, key.port));
            }
        };

        // The driver keeps the stream alive; the lease only tracks slot
        // occupancy and can return once headers are in.
        lease.release(Outcome::Reusable);

        let (status, resp_headers, body_rx) = head;
        let mut response = Response::new(
            status,
            resp_headers,
            ResponseBody::new(body_rx),
            url,
            "h2",
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

fn with_content_length(
    mut headers: Vec<(String, String)>,
    body: Option<&Bytes>,
) -> Vec<(String, String)> {
    if let Some(body) = body {
        let present = headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
        if !present && !body.is_empty() {
            headers.push(("content-length".to_string(), body.len().to_string()));
        }
    }
    headers
}

async fn dial(
    tls: &TlsContext,
    resolver: &dns::Resolver,
    proxy: Option<&ProxyConfig>,
    key: &HostKey,
) -> Result<H2PooledConnection> {
    let tcp = match proxy {
        Some(p) => {
            let mut stream = dns::connect_tcp(resolver, p.host(), p.port()).await?;
            proxy::establish_tunnel(&mut stream, p, &key.host, key.port).await?;
            stream
        }
        None => dns::connect_tcp(resolver, &key.host, key.port).await?,
    };

    let hs = tls::handshake(tls, tcp, &key.host, key.port, "h2").await?;
    if hs.alpn != AlpnProtocol::H2 {
        return Err(Error::protocol("alpn", "server did not negotiate h2")
            .with_endpoint(&key.host, key.port)
            .with_protocol("h2"));
    }

    let preset = &tls.preset;
    let conn = H2Connection::connect(
        hs.stream,
        preset.h2_settings.clone(),
        &preset.h2_settings_order,
        preset.pseudo_header_order,
    )
    .await?;

    let (command_tx, command_rx) = mpsc::channel(64);
    let shared = Arc::new(driver::DriverShared::new());
    let driver = H2Driver::new(conn, command_rx, Arc::clone(&shared));
    tokio::spawn(driver.run());

    Ok(H2PooledConnection {
        command_tx,
        shared,
        resumed: hs.resumed,
    })
}
