//! QUIC connection establishment via quiche.
//!
//! The fingerprinted BoringSSL context is handed to quiche so the QUIC
//! ClientHello carries the preset's cipher, curve and extension profile.
//! 0-RTT is attempted only when the preset has a QUIC PSK variant, a fresh
//! session state is cached, and the cached ECH config bytes match the
//! config currently in force.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use boring::ssl::{SslContextBuilder, SslMethod};
use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::dns;
use crate::error::{Error, Result};
use crate::request::HostKey;
use crate::tls::hello::ClientHelloSpec;
use crate::tls::keylog::KeyLogWriter;
use crate::tls::session::{SessionKey, TlsSessionState};
use crate::tls::{configure_context, TlsContext};

use super::params;

/// Default QUIC idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Chrome's initial connection-level flow-control credit.
const INITIAL_MAX_DATA: u64 = 15_663_105;

const MAX_DATAGRAM_SIZE: usize = 1350;

/// Everything the driver needs to run a dialed QUIC connection.
pub struct QuicDialed {
    pub conn: quiche::Connection,
    pub socket: Arc<UdpSocket>,
    pub peer_addr: SocketAddr,
    /// Whether the dial went out with 0-RTT early data enabled.
    pub zero_rtt: bool,
    /// Session-cache key this connection stores tickets under.
    pub session_key: SessionKey,
    /// ECH config bytes in force, stored beside any captured session.
    pub ech_config: Option<Vec<u8>>,
    /// Idle timeout in force; the keepalive period is half of it.
    pub idle_timeout: Duration,
    /// The browser-extra transport parameters advertised by this dial.
    pub extra_params: Bytes,
}

/// Dial QUIC to `key`, driving the handshake until established (or until
/// early data opens on a 0-RTT dial).
pub async fn dial(
    tls: &TlsContext,
    resolver: &dns::Resolver,
    key: &HostKey,
    idle_timeout: Duration,
) -> Result<QuicDialed> {
    let session_key = SessionKey::new(tls.preset.name, "h3", &key.host, key.port);
    let cached = tls.session_cache.get(&session_key);
    let current_ech = tls.ech_for(&key.host, key.port, None);

    let hello_id = tls
        .preset
        .hello_id(true, cached.is_some())
        .ok_or_else(|| {
            Error::protocol("client_hello", "preset has no QUIC ClientHello variant")
                .with_protocol("h3")
        })?;
    let spec = ClientHelloSpec::for_id(hello_id)?;

    // 0-RTT gate: PSK variant + fresh session + identical ECH bytes.
    let zero_rtt = tls.preset.has_psk_variant(true)
        && cached.is_some()
        && cached.as_ref().map(|s| s.ech_config.clone()) == Some(current_ech.clone());

    let mut builder = SslContextBuilder::new(SslMethod::tls_client())
        .map_err(|e| Error::tls("configure_tls", format!("ssl context: {}", e)))?;
    // QUIC is TLS 1.3 only.
    configure_context(&mut builder, &spec, true)?;

    let mut config =
        quiche::Config::with_boring_ssl_ctx_builder(quiche::PROTOCOL_VERSION, builder)
            .map_err(|e| Error::tls("configure_quic", format!("quiche config: {}", e)))?;

    config
        .set_application_protos(&[b"h3".as_ref()])
        .map_err(|e| Error::tls("configure_quic", format!("alpn: {}", e)))?;
    config.set_max_idle_timeout(idle_timeout.as_millis() as u64);
    config.set_max_recv_udp_payload_size(65535);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_initial_max_data(INITIAL_MAX_DATA);
    config.set_initial_max_stream_data_bidi_local(6_291_456);
    config.set_initial_max_stream_data_bidi_remote(6_291_456);
    config.set_initial_max_stream_data_uni(6_291_456);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(103);
    config.set_disable_active_migration(true);
    config.grease(spec.grease);
    if !tls.insecure_skip_verify {
        config.verify_peer(true);
    } else {
        config.verify_peer(false);
    }
    if zero_rtt {
        config.enable_early_data();
    }

    let key_log = tls.effective_key_log();
    if key_log.is_some() {
        config.log_keys();
    }

    let addrs = resolver.resolve(&key.host, key.port).await?;
    let peer_addr = addrs[0];
    let socket = Arc::new(dns::bind_udp(resolver.policy(), peer_addr).await?);
    socket
        .connect(peer_addr)
        .await
        .map_err(|e| Error::io("udp_connect", e))?;

    let mut scid = [0u8; 8];
    getrandom::getrandom(&mut scid)
        .map_err(|e| Error::network("quic_dial", format!("rng: {}", e)))?;
    let scid = quiche::ConnectionId::from_ref(&scid);

    let local_addr = socket
        .local_addr()
        .map_err(|e| Error::io("quic_dial", e))?;

    // SNI carries the request host even when DNS resolved a fronting host.
    let mut conn = quiche::connect(Some(&key.host), &scid, local_addr, peer_addr, &mut config)
        .map_err(|e| Error::tls("quic_dial", format!("quiche connect: {}", e)))?;

    if let Some(sink) = key_log {
        conn.set_keylog(Box::new(KeyLogWriter(sink)));
    }

    if let Some(state) = &cached {
        if conn.set_session(&state.state).is_err() {
            tracing::debug!("stale QUIC session state rejected, full handshake");
        }
    }

    let extra_params = params::extra_transport_params(tls.seed);

    drive_handshake(&mut conn, &socket, zero_rtt).await.map_err(|e| {
        e.with_endpoint(&key.host, key.port).with_protocol("h3")
    })?;

    Ok(QuicDialed {
        conn,
        socket,
        peer_addr,
        zero_rtt,
        session_key,
        ech_config: current_ech,
        idle_timeout,
        extra_params,
    })
}

/// Pump packets until the handshake completes. A 0-RTT dial returns as
/// soon as early data opens so the first request rides the ClientHello
/// flight.
async fn drive_handshake(
    conn: &mut quiche::Connection,
    socket: &UdpSocket,
    zero_rtt: bool,
) -> Result<()> {
    let mut out = [0u8; MAX_DATAGRAM_SIZE];
    let mut buf = [0u8; 65535];
    let started = Instant::now();
    let budget = Duration::from_secs(10);

    loop {
        loop {
            match conn.send(&mut out) {
                Ok((n, _info)) => {
                    socket
                        .send(&out[..n])
                        .await
                        .map_err(|e| Error::io("quic_send", e))?;
                }
                Err(quiche::Error::Done) => break,
                Err(e) => return Err(Error::tls("quic_send", format!("send: {}", e))),
            }
        }

        if conn.is_established() || (zero_rtt && conn.is_in_early_data()) {
            return Ok(());
        }
        if conn.is_closed() {
            return Err(Error::tls("quic_handshake", "connection closed during handshake"));
        }
        if started.elapsed() > budget {
            return Err(Error::timeout("quic_handshake", "QUIC handshake timed out"));
        }

        let wait = conn.timeout().unwrap_or(Duration::from_millis(100));
        match tokio::time::timeout(wait, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let info = quiche::RecvInfo {
                    from: socket.peer_addr().map_err(|e| Error::io("quic_recv", e))?,
                    to: socket.local_addr().map_err(|e| Error::io("quic_recv", e))?,
                };
                match conn.recv(&mut buf[..n], info) {
                    Ok(_) | Err(quiche::Error::Done) => {}
                    Err(e) => {
                        return Err(Error::tls("quic_recv", format!("recv: {}", e)));
                    }
                }
            }
            Ok(Err(e)) => return Err(Error::io("quic_recv", e)),
            Err(_) => conn.on_timeout(),
        }
    }
}

/// Capture a fresh session state (with the ECH bytes in force) once the
/// peer has delivered a ticket.
pub fn capture_session(
    tls_cache: &crate::tls::session::TlsSessionCache,
    dialed_key: &SessionKey,
    conn: &quiche::Connection,
    ech_config: &Option<Vec<u8>>,
) -> bool {
    match conn.session() {
        Some(session) => {
            tls_cache.put(
                dialed_key.clone(),
                TlsSessionState::new(Vec::new(), session.to_vec(), ech_config.clone()),
            );
            true
        }
        None => false,
    }
}
