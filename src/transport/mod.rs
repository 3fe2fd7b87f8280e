//! Unified transport facade: protocol selection, racing, reconfiguration.
//!
//! The facade holds the three protocol transports as concrete values and
//! dispatches explicitly. Selection follows the learned support cache;
//! unknown hosts race H3 against H2 when the preset allows, and the winner
//! is recorded only once response headers arrive.

pub mod h1;
pub mod h2;
pub mod h3;
pub mod proxy;
pub mod racing;
pub mod support;

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dns::{FamilyPolicy, Resolver};
use crate::error::{Error, Result};
use crate::fingerprint::{self, Preset};
use crate::request::{Body, HostKey, Request};
use crate::response::Response;
use crate::tls::hello::ShuffleSeed;
use crate::tls::keylog::KeyLogSink;
use crate::tls::session::{EchCache, TlsSessionCache};
use crate::tls::TlsContext;
use proxy::ProxyConfig;
use racing::RaceOutcome;
use support::{KnownProtocol, SupportCache};

/// Requested protocol policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Auto,
    Http1,
    Http2,
    Http3,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Auto => "auto",
            Protocol::Http1 => "h1",
            Protocol::Http2 => "h2",
            Protocol::Http3 => "h3",
        }
    }
}

/// Options for constructing a [`Transport`].
#[derive(Default)]
pub struct TransportOptions {
    pub proxy: Option<ProxyConfig>,
    pub protocol: Protocol,
    pub timeout: Option<Duration>,
    pub disable_h3: bool,
    pub insecure_skip_verify: bool,
    /// Skip preset HTTP headers while keeping the TLS fingerprint.
    pub tls_only: bool,
    pub quic_idle_timeout: Option<Duration>,
    pub prefer_ipv4: bool,
    pub local_address: Option<IpAddr>,
    pub key_log_file: Option<std::path::PathBuf>,
    pub cache_backend: Option<crate::cache::BackendHandle>,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-transport connection counts, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub h1_connections: usize,
    pub h2_connections: usize,
    pub h3_connections: usize,
    pub support_entries: usize,
}

/// Unified transport over HTTP/1.1, HTTP/2 and HTTP/3.
pub struct Transport {
    preset: Preset,
    tls: TlsContext,
    resolver: Resolver,
    h1: Arc<h1::H1Transport>,
    h2: Arc<h2::H2Transport>,
    h3: Arc<h3::H3Transport>,
    support: Arc<SupportCache>,
    protocol: Protocol,
    timeout: Duration,
    proxy: Option<ProxyConfig>,
    disable_h3: bool,
    tls_only: bool,
    quic_idle_timeout: Duration,
    /// Header-order override: `None` follows the preset; `Some(vec![])`
    /// declares an empty order (headers keep insertion order).
    header_order: Option<Vec<String>>,
    ech_config_domain: Option<String>,
}

impl Transport {
    pub fn new(preset_name: &str, options: TransportOptions) -> Result<Self> {
        let preset = fingerprint::get(preset_name)?;

        let mut tls = TlsContext::new(preset.clone());
        tls.insecure_skip_verify = options.insecure_skip_verify;
        if let Some(backend) = &options.cache_backend {
            tls.session_cache = TlsSessionCache::new().with_backend(backend.clone());
            tls.ech_cache = EchCache::new().with_backend(backend.clone());
        }
        if let Some(path) = &options.key_log_file {
            tls.key_log = Some(KeyLogSink::open(path)?);
        }

        let resolver = Resolver::new(FamilyPolicy {
            prefer_ipv4: options.prefer_ipv4,
            local_address: options.local_address,
        });

        let h1 = Arc::new(h1::H1Transport::new(tls.clone(), resolver.clone(), None));
        let h2 = Arc::new(h2::H2Transport::new(tls.clone(), resolver.clone(), None));
        let h3 = Arc::new(h3::H3Transport::new(tls.clone(), resolver.clone()));

        let mut transport = Self {
            preset,
            tls,
            resolver,
            h1,
            h2,
            h3,
            support: Arc::new(SupportCache::new()),
            protocol: options.protocol,
            timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT),
            proxy: options.proxy,
            disable_h3: options.disable_h3,
            tls_only: options.tls_only,
            quic_idle_timeout: options
                .quic_idle_timeout
                .unwrap_or(h3::DEFAULT_IDLE_TIMEOUT),
            header_order: None,
            ech_config_domain: None,
        };
        transport.rebuild_all();
        Ok(transport)
    }

    /// Rebuild the three protocol transports from the current state. The
    /// TLS context (seed, caches) is shared; pools start empty.
    fn rebuild_all(&mut self) {
        self.rebuild_tcp_transports();
        let mut h3 = h3::H3Transport::new(self.tls.clone(), self.resolver.clone());
        h3.set_tls_only(self.tls_only);
        h3.set_idle_timeout(self.quic_idle_timeout);
        self.h3 = Arc::new(h3);
    }

    fn rebuild_tcp_transports(&mut self) {
        let mut h1 =
            h1::H1Transport::new(self.tls.clone(), self.resolver.clone(), self.proxy.clone());
        h1.set_tls_only(self.tls_only);
        self.h1 = Arc::new(h1);
        let mut h2 =
            h2::H2Transport::new(self.tls.clone(), self.resolver.clone(), self.proxy.clone());
        h2.set_tls_only(self.tls_only);
        self.h2 = Arc::new(h2);
    }

    pub fn preset(&self) -> &Preset {
        &self.preset
    }

    pub fn shuffle_seed(&self) -> ShuffleSeed {
        self.tls.seed
    }

    pub fn session_cache(&self) -> &TlsSessionCache {
        &self.tls.session_cache
    }

    pub fn ech_cache(&self) -> &EchCache {
        &self.tls.ech_cache
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Execute one request, selecting the protocol per the facade rules.
    pub async fn round_trip(&self, req: Request) -> Result<Response> {
        let deadline = req.timeout.unwrap_or(self.timeout);
        let started = Instant::now();

        let mut response = match tokio::time::timeout(deadline, self.dispatch(req)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::timeout(
                    "round_trip",
                    format!("request exceeded {:?}", deadline),
                ))
            }
        };

        response.timing.record_first_byte(started.elapsed());
        response.timing.record_total(started.elapsed());
        if response.reused {
            response.timing.mark_reused();
        } else {
            match response.protocol {
                "h3" => response.timing.apportion_quic(),
                _ => response.timing.apportion_tcp(),
            }
        }
        Ok(response)
    }

    async fn dispatch(&self, req: Request) -> Result<Response> {
        // Plaintext only speaks HTTP/1.1.
        if !req.is_https() {
            return self.h1.round_trip(req).await;
        }

        // A CONNECT/SOCKS proxy cannot carry UDP, so H3 is off the table;
        // prefer H2 and fall back to H1.
        if let Some(p) = &self.proxy {
            if !p.supports_udp() {
                return match self.clone_for_fallback(req) {
                    Ok((h2_req, h1_req)) => match self.h2.round_trip(h2_req).await {
                        Ok(resp) => Ok(resp),
                        Err(_) => self.h1.round_trip(h1_req).await,
                    },
                    Err(req) => self.h2.round_trip(req).await,
                };
            }
        }

        match self.protocol {
            Protocol::Http1 => self.h1.round_trip(req).await,
            Protocol::Http2 => self.h2.round_trip(req).await,
            Protocol::Http3 => self.h3.round_trip(req).await,
            Protocol::Auto => self.dispatch_auto(req).await,
        }
    }

    async fn dispatch_auto(&self, req: Request) -> Result<Response> {
        let key = HostKey::from_request(&req);

        match self.support.get(&key) {
            Some(KnownProtocol::H3) => return self.h3.round_trip(req).await,
            Some(KnownProtocol::H2) => {
                return match self.clone_for_fallback(req) {
                    Ok((h2_req, h1_req)) => match self.h2.round_trip(h2_req).await {
                        Ok(resp) => Ok(resp),
                        Err(e) if e.is_protocol_class() => {
                            self.support.record(&key, KnownProtocol::H1);
                            self.h1.round_trip(h1_req).await
                        }
                        Err(e) => Err(e),
                    },
                    Err(req) => self.h2.round_trip(req).await,
                };
            }
            Some(KnownProtocol::H1) => return self.h1.round_trip(req).await,
            None => {}
        }

        let race_h3 = self.preset.supports_h3 && !self.disable_h3;
        if !race_h3 {
            return match self.clone_for_fallback(req) {
                Ok((h2_req, h1_req)) => match self.h2.round_trip(h2_req).await {
                    Ok(resp) => {
                        self.support.record(&key, KnownProtocol::H2);
                        Ok(resp)
                    }
                    Err(e) if e.is_protocol_class() => {
                        self.support.record(&key, KnownProtocol::H1);
                        let resp = self.h1.round_trip(h1_req).await?;
                        Ok(resp)
                    }
                    Err(e) => Err(e),
                },
                Err(req) => self.h2.round_trip(req).await,
            };
        }

        // Race H3 against H2. Bodies must be materialized so each branch
        // (and the H1 retry) can carry its own copy.
        let (req, h3_req, h2_req) = materialize_three(req).await;
        let h3_transport = Arc::clone(&self.h3);
        let h2_transport = Arc::clone(&self.h2);

        match racing::race(
            async move { h3_transport.round_trip(h3_req).await },
            async move { h2_transport.round_trip(h2_req).await },
        )
        .await
        {
            RaceOutcome::H3(resp) => {
                self.support.record(&key, KnownProtocol::H3);
                Ok(resp)
            }
            RaceOutcome::H2(resp) => {
                self.support.record(&key, KnownProtocol::H2);
                Ok(resp)
            }
            RaceOutcome::BothFailed { h3, h2 } => {
                if h2.is_protocol_class() {
                    self.support.record(&key, KnownProtocol::H1);
                }
                tracing::debug!("race failed (h3: {}, h2: {}), trying h1", h3, h2);
                let resp = self.h1.round_trip(req).await?;
                self.support.record(&key, KnownProtocol::H1);
                Ok(resp)
            }
        }
    }

    /// Split a request into a primary and a fallback copy. Requests with a
    /// streaming body cannot be retried; those come back unchanged as `Err`.
    fn clone_for_fallback(&self, req: Request) -> std::result::Result<(Request, Request), Request> {
        match &req.body {
            Some(Body::Stream { .. }) => Err(req),
            _ => {
                let copy = Request {
                    method: req.method.clone(),
                    url: req.url.clone(),
                    headers: req.headers.clone(),
                    body: match &req.body {
                        Some(Body::Bytes(b)) => Some(Body::Bytes(b.clone())),
                        _ => None,
                    },
                    timeout: req.timeout,
                };
                Ok((req, copy))
            }
        }
    }

    // -- runtime reconfiguration ------------------------------------------

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Replace the proxy. The H1/H2 transports are rebuilt; the H3
    /// transport keeps its connections and session cache.
    pub fn set_proxy(&mut self, proxy: Option<ProxyConfig>) {
        self.h1.close();
        self.h2.close();
        self.proxy = proxy;
        self.rebuild_tcp_transports();
    }

    /// Switch presets: all three transports are torn down and rebuilt, the
    /// support cache and pools are cleared. The session cache object is
    /// retained; its keys are preset-scoped, so prior entries can never
    /// resume under the new identity.
    pub fn set_preset(&mut self, preset_name: &str) -> Result<()> {
        let preset = fingerprint::get(preset_name)?;
        self.close_transports();
        self.support.clear();
        self.preset = preset.clone();
        self.tls.preset = preset;
        if let Some(order) = &self.header_order {
            self.tls.preset.header_order = order.clone();
        }
        self.rebuild_all();
        Ok(())
    }

    pub fn set_insecure_skip_verify(&mut self, skip: bool) {
        self.tls.insecure_skip_verify = skip;
        self.close_transports();
        self.rebuild_all();
    }

    /// Skip preset HTTP headers while keeping the TLS fingerprint.
    pub fn set_tls_only(&mut self, tls_only: bool) {
        self.tls_only = tls_only;
        self.rebuild_all();
    }

    pub fn set_quic_idle_timeout(&mut self, idle: Duration) {
        self.quic_idle_timeout = idle;
        self.h3.close();
        let mut h3 = h3::H3Transport::new(self.tls.clone(), self.resolver.clone());
        h3.set_tls_only(self.tls_only);
        h3.set_idle_timeout(idle);
        self.h3 = Arc::new(h3);
    }

    /// Domain fronting: SNI and Host keep `request_host` while DNS and TCP
    /// target `connect_host`.
    pub fn set_connect_to(&self, request_host: &str, connect_host: &str) {
        self.resolver.set_connect_to(request_host, connect_host);
    }

    /// Pin ECH config bytes for every subsequent handshake.
    pub fn set_ech_config(&self, bytes: Option<Vec<u8>>) {
        self.tls.set_ech_override(bytes);
    }

    /// Name the domain whose published ECH config should be fetched by the
    /// external discovery collaborator and applied via `set_ech_config`.
    pub fn set_ech_config_domain(&mut self, domain: Option<String>) {
        self.ech_config_domain = domain;
    }

    pub fn ech_config_domain(&self) -> Option<&str> {
        self.ech_config_domain.as_deref()
    }

    /// Override the preset's header order. `None` resets to the preset;
    /// an empty list means no declared order at all.
    pub fn set_header_order(&mut self, order: Option<Vec<String>>) {
        self.header_order = order.clone();
        self.tls.preset.header_order = match order {
            Some(order) => order,
            None => self.preset.header_order.clone(),
        };
        self.rebuild_all();
    }

    pub fn header_order(&self) -> &[String] {
        &self.tls.preset.header_order
    }

    pub fn set_key_log_file(&mut self, path: Option<&Path>) -> Result<()> {
        self.tls.key_log = match path {
            Some(p) => Some(KeyLogSink::open(p)?),
            None => None,
        };
        self.rebuild_all();
        Ok(())
    }

    /// Reset all HTTP/3 connections while preserving session and ECH caches.
    pub fn close_quic_connections(&self) {
        self.h3.close_connections();
    }

    /// Drop every pooled connection, preserving caches and learned support.
    pub fn refresh(&self) {
        self.h1.close();
        self.h2.close();
        self.h3.close_connections();
    }

    fn close_transports(&self) {
        self.h1.close();
        self.h2.close();
        self.h3.close();
    }

    pub fn close(&self) {
        self.close_transports();
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            h1_connections: self.h1_pool_len(),
            h2_connections: self.h2_pool_len(),
            h3_connections: self.h3_pool_len(),
            support_entries: self.support.len(),
        }
    }

    fn h1_pool_len(&self) -> usize {
        self.h1.pool_len()
    }

    fn h2_pool_len(&self) -> usize {
        self.h2.pool_len()
    }

    fn h3_pool_len(&self) -> usize {
        self.h3.pool_len()
    }
}

/// Materialize a streaming body and fan the request out into three copies
/// (primary + one per race branch).
async fn materialize_three(mut req: Request) -> (Request, Request, Request) {
    if let Some(Body::Stream { mut rx, len }) = req.body.take() {
        let mut buf = bytes::BytesMut::with_capacity(len as usize);
        while let Some(chunk) = rx.recv().await {
            buf.extend_from_slice(&chunk);
        }
        req.body = Some(Body::Bytes(buf.freeze()));
    }

    let copy = |req: &Request| Request {
        method: req.method.clone(),
        url: req.url.clone(),
        headers: req.headers.clone(),
        body: match &req.body {
            Some(Body::Bytes(b)) => Some(Body::Bytes(b.clone())),
            _ => None,
        },
        timeout: req.timeout,
    };

    let a = copy(&req);
    let b = copy(&req);
    (req, a, b)
}
