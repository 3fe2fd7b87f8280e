//! TLS dial path shared by the HTTP/1.1 and HTTP/2 transports.
//!
//! Variant selection, session resumption, ECH pinning and key logging all
//! happen here; the HTTP/3 transport reuses the same context builder to
//! carry the fingerprint into QUIC.

pub mod hello;
pub mod keylog;
pub mod session;

use std::io;
use std::os::raw::c_int;
use std::pin::Pin;
use std::task::{Context, Poll};

use boring::ssl::{
    SslConnector, SslConnectorBuilder, SslContextBuilder, SslMethod, SslSession,
    SslSessionCacheMode, SslVerifyMode, SslVersion,
};
use boring_sys::{SSL, SSL_CTX};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;

use crate::error::{Error, Result};
use crate::fingerprint::Preset;
use hello::{ClientHelloSpec, ShuffleSeed};
use keylog::KeyLogSink;
use session::{EchCache, SessionKey, TlsSessionCache, TlsSessionState};

// BoringSSL knobs the safe wrapper does not expose.
extern "C" {
    /// Enable GREASE (Generate Random Extensions And Sustain Extensibility).
    fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
    /// Toggle BoringSSL's per-connection extension permutation.
    fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
    /// Allow early data on this connection (resumed handshakes only).
    fn SSL_set_early_data_enabled(ssl: *mut SSL, enabled: c_int);
    /// Pin an ECHConfigList for this handshake.
    fn SSL_set1_ech_config_list(ssl: *mut SSL, list: *const u8, len: usize) -> c_int;
}

/// Shared TLS state for one transport instance: preset identity, the
/// session-scoped shuffle seed, caches and the key-log sink.
#[derive(Clone)]
pub struct TlsContext {
    pub preset: Preset,
    pub seed: ShuffleSeed,
    pub session_cache: TlsSessionCache,
    pub ech_cache: EchCache,
    pub key_log: Option<KeyLogSink>,
    pub insecure_skip_verify: bool,
    /// Caller-supplied ECH config applied to every host, ahead of the
    /// per-host cache. Shared across the clones held by the transports.
    pub ech_override: std::sync::Arc<std::sync::Mutex<Option<Vec<u8>>>>,
}

impl TlsContext {
    pub fn new(preset: Preset) -> Self {
        Self {
            preset,
            seed: ShuffleSeed::random(),
            session_cache: TlsSessionCache::new(),
            ech_cache: EchCache::new(),
            key_log: None,
            insecure_skip_verify: false,
            ech_override: std::sync::Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn set_ech_override(&self, bytes: Option<Vec<u8>>) {
        *self.ech_override.lock().expect("ech override poisoned") = bytes;
    }

    /// The sink for this transport's handshakes (per-transport override,
    /// else `SSLKEYLOGFILE`).
    pub fn effective_key_log(&self) -> Option<KeyLogSink> {
        keylog::effective_sink(self.key_log.as_ref())
    }

    /// ECH config bytes for a host: the bytes pinned in a cached session if
    /// one will be resumed, else the caller override, else the cached
    /// discovery result. DNS is never re-consulted while resuming.
    pub fn ech_for(&self, host: &str, port: u16, resuming: Option<&TlsSessionState>) -> Option<Vec<u8>> {
        if let Some(state) = resuming {
            return state.ech_config.clone();
        }
        if let Some(bytes) = self.ech_override.lock().expect("ech override poisoned").clone() {
            return Some(bytes);
        }
        self.ech_cache.get(self.preset.name, host, port)
    }
}

/// Result of a TCP TLS handshake.
pub struct TlsHandshake {
    pub stream: SslStream<TcpStream>,
    pub alpn: AlpnProtocol,
    /// Whether the session was resumed from a cached ticket.
    pub resumed: bool,
    /// Extension order this session emits, derived from the shuffle seed.
    pub extension_order: Vec<u16>,
}

/// Negotiated ALPN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    H2,
    Http1,
    Unknown,
}

/// Configure a context builder with a ClientHello variant. Also used by
/// the QUIC dialer, which hands the builder to quiche.
pub fn configure_context(
    builder: &mut SslContextBuilder,
    spec: &ClientHelloSpec,
    min_tls13: bool,
) -> Result<()> {
    if !spec.cipher_list.is_empty() {
        let ciphers: Vec<&str> = spec
            .cipher_list
            .iter()
            .copied()
            .filter(|c| !c.starts_with("TLS_AES") && !c.starts_with("TLS_CHACHA20"))
            .collect();
        if !ciphers.is_empty() {
            builder
                .set_cipher_list(&ciphers.join(":"))
                .map_err(|e| Error::tls("configure_tls", format!("cipher list: {}", e)))?;
        }
    }
    if !spec.curves.is_empty() {
        builder
            .set_curves_list(&spec.curves.join(":"))
            .map_err(|e| Error::tls("configure_tls", format!("curves: {}", e)))?;
    }
    if !spec.sigalgs.is_empty() {
        // Safari repeats rsa_pss_rsae_sha384; BoringSSL rejects duplicates,
        // so the engine list is deduplicated while the spec keeps the quirk.
        let mut seen: Vec<&str> = Vec::new();
        for &alg in &spec.sigalgs {
            if !seen.contains(&alg) {
                seen.push(alg);
            }
        }
        let joined = seen.join(":");
        builder
            .set_sigalgs_list(&joined)
            .map_err(|e| Error::tls("configure_tls", format!("sigalgs: {}", e)))?;
    }

    let min = if min_tls13 {
        SslVersion::TLS1_3
    } else {
        SslVersion::TLS1_2
    };
    builder
        .set_min_proto_version(Some(min))
        .map_err(|e| Error::tls("configure_tls", format!("min version: {}", e)))?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| Error::tls("configure_tls", format!("max version: {}", e)))?;

    // GREASE per variant; BoringSSL's own permutation is disabled because
    // the emission order must stay stable for the life of the session.
    unsafe {
        let ctx = builder.as_ptr();
        SSL_CTX_set_grease_enabled(ctx, c_int::from(spec.grease));
        SSL_CTX_set_permute_extensions(ctx, 0);
    }
    Ok(())
}

/// Perform the TLS handshake for a TCP transport.
///
/// `protocol` tags the session-cache key ("h1" or "h2"); `sni_host` may
/// differ from the dialed address under domain fronting.
pub async fn handshake(
    ctx: &TlsContext,
    tcp: TcpStream,
    sni_host: &str,
    port: u16,
    protocol: &'static str,
) -> Result<TlsHandshake> {
    let key = SessionKey::new(ctx.preset.name, protocol, sni_host, port);
    let cached = ctx.session_cache.get(&key);

    // PSK variant only when a fresh session exists for this exact key.
    let hello_id = ctx
        .preset
        .hello_id(false, cached.is_some())
        .ok_or_else(|| Error::tls("client_hello", "preset has no TCP ClientHello variant"))?;
    let spec = ClientHelloSpec::for_id(hello_id)?;
    let extension_order = spec.shuffled_extensions(ctx.seed);

    let ech_bytes = ctx.ech_for(sni_host, port, cached.as_ref());

    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| Error::tls("configure_tls", format!("connector: {}", e)))?;
    configure_context(&mut builder, &spec, ech_bytes.is_some())?;
    configure_session_capture(&mut builder, ctx, key.clone(), ech_bytes.clone());
    configure_alpn(&mut builder, &spec)?;
    configure_verification(&mut builder, ctx.insecure_skip_verify)?;
    if let Some(sink) = ctx.effective_key_log() {
        builder.set_keylog_callback(move |_, line| sink.write_line(line));
    }
    let connector = builder.build();

    let mut config = connector
        .configure()
        .map_err(|e| Error::tls("configure_tls", format!("ssl config: {}", e)))?;

    if let Some(state) = &cached {
        if let Ok(session) = SslSession::from_der(&state.ticket) {
            // Safe: the session came from a connector configured with the
            // same method and the same preset-keyed context parameters.
            unsafe {
                let _ = config.set_session(&session);
            }
        }
    }

    unsafe {
        let ssl = config.as_ptr();
        // early_data rides only on resumed handshakes; with an empty PSK it
        // must be absent entirely.
        if spec.early_data && cached.is_some() {
            SSL_set_early_data_enabled(ssl, 1);
        }
        if let Some(ech) = &ech_bytes {
            if SSL_set1_ech_config_list(ssl, ech.as_ptr(), ech.len()) != 1 {
                return Err(Error::tls("configure_tls", "invalid ECH config list")
                    .with_endpoint(sni_host, port));
            }
        }
    }

    let stream = tokio_boring::connect(config, sni_host, tcp)
        .await
        .map_err(|e| {
            Error::tls("tls_handshake", e.to_string()).with_endpoint(sni_host, port)
        })?;

    let resumed = stream.ssl().session_reused();
    let alpn = match stream.ssl().selected_alpn_protocol() {
        Some(b"h2") => AlpnProtocol::H2,
        Some(b"http/1.1") => AlpnProtocol::Http1,
        _ => AlpnProtocol::Unknown,
    };

    Ok(TlsHandshake {
        stream,
        alpn,
        resumed,
        extension_order,
    })
}

fn configure_alpn(builder: &mut SslConnectorBuilder, spec: &ClientHelloSpec) -> Result<()> {
    let mut wire = Vec::new();
    for proto in &spec.alpn {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto);
    }
    builder
        .set_alpn_protos(&wire)
        .map_err(|e| Error::tls("configure_tls", format!("alpn: {}", e)))
}

fn configure_verification(builder: &mut SslConnectorBuilder, skip: bool) -> Result<()> {
    if skip {
        builder.set_verify(SslVerifyMode::NONE);
    } else {
        builder.set_verify(SslVerifyMode::PEER);
        builder
            .set_default_verify_paths()
            .map_err(|e| Error::tls("configure_tls", format!("verify paths: {}", e)))?;
    }
    Ok(())
}

/// Arrange for NewSessionTicket deliveries to land in the session cache,
/// with the ECH config in force stored alongside for resumption.
fn configure_session_capture(
    builder: &mut SslConnectorBuilder,
    ctx: &TlsContext,
    key: SessionKey,
    ech_bytes: Option<Vec<u8>>,
) {
    builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);
    let cache = ctx.session_cache.clone();
    builder.set_new_session_callback(move |_ssl, session| {
        match session.to_der() {
            Ok(der) => {
                cache.put(
                    key.clone(),
                    TlsSessionState::new(der, Vec::new(), ech_bytes.clone()),
                );
            }
            Err(e) => tracing::debug!("failed to serialize session ticket: {}", e),
        }
    });
}

/// Stream that is either plain TCP (for `http://`) or TLS.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl MaybeTlsStream {
    pub fn alpn(&self) -> AlpnProtocol {
        match self {
            MaybeTlsStream::Plain(_) => AlpnProtocol::Unknown,
            MaybeTlsStream::Tls(s) => match s.ssl().selected_alpn_protocol() {
                Some(b"h2") => AlpnProtocol::H2,
                Some(b"http/1.1") => AlpnProtocol::Http1,
                _ => AlpnProtocol::Unknown,
            },
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
