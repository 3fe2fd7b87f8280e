//! HTTP/3 connection driver.
//!
//! Owns the QUIC connection and UDP socket. The control stream carries the
//! preset's SETTINGS (plus GREASE) as its first bytes; requests multiplex
//! on client-initiated bidirectional streams with QPACK static encoding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::fingerprint::PseudoHeaderOrder;
use crate::headers::HeaderMap;
use crate::tls::hello::ShuffleSeed;
use crate::tls::session::TlsSessionCache;

use super::frames;
use super::qpack;
use super::quic::QuicDialed;

const MAX_DATAGRAM_SIZE: usize = 1350;

/// Client-initiated unidirectional stream ids.
const LOCAL_CONTROL_STREAM: u64 = 2;
const LOCAL_QPACK_ENCODER_STREAM: u64 = 6;
const LOCAL_QPACK_DECODER_STREAM: u64 = 10;

/// Response head: status, headers, body stream.
pub type ResponseHead = (u16, HeaderMap, mpsc::Receiver<Result<Bytes>>);

pub struct SendRequest {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub respond: oneshot::Sender<Result<ResponseHead>>,
}

/// Driver state shared with the pooled handle.
pub struct DriverShared {
    pub healthy: AtomicBool,
    pub in_flight: AtomicU32,
}

impl DriverShared {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
        }
    }
}

impl Default for DriverShared {
    fn default() -> Self {
        Self::new()
    }
}

struct RequestStream {
    respond: Option<oneshot::Sender<Result<ResponseHead>>>,
    body_tx: Option<mpsc::Sender<Result<Bytes>>>,
    status: Option<u16>,
    /// Incoming frame reassembly buffer.
    inbound: BytesMut,
    /// Outgoing bytes not yet accepted by quiche.
    outbound: BytesMut,
    outbound_fin: bool,
}

impl RequestStream {
    fn fail(&mut self, err: Error) {
        if let Some(tx) = self.respond.take() {
            let _ = tx.send(Err(err));
        } else if let Some(tx) = self.body_tx.take() {
            let _ = tx.try_send(Err(err));
        }
    }
}

/// A server-initiated unidirectional stream being classified.
#[derive(Default)]
struct UniStream {
    stream_type: Option<u64>,
    buf: BytesMut,
}

pub struct H3Driver {
    dialed: QuicDialed,
    command_rx: mpsc::Receiver<SendRequest>,
    session_cache: TlsSessionCache,
    pseudo_order: PseudoHeaderOrder,
    shared: Arc<DriverShared>,

    streams: HashMap<u64, RequestStream>,
    uni_streams: HashMap<u64, UniStream>,
    next_stream_id: u64,
    /// Pending writes for local unidirectional streams.
    pending_uni: Vec<(u64, BytesMut)>,
    peer_settings: Option<Vec<(u64, u64)>>,
    session_captured: bool,
    goaway: bool,
}

impl H3Driver {
    pub fn new(
        dialed: QuicDialed,
        command_rx: mpsc::Receiver<SendRequest>,
        session_cache: TlsSessionCache,
        seed: ShuffleSeed,
        pseudo_order: PseudoHeaderOrder,
        h3_settings: &[(u64, u64)],
        shared: Arc<DriverShared>,
    ) -> Self {
        let preamble = frames::control_stream_preamble(h3_settings, seed);
        let mut enc = BytesMut::new();
        frames::put_varint(&mut enc, frames::STREAM_QPACK_ENCODER);
        let mut dec = BytesMut::new();
        frames::put_varint(&mut dec, frames::STREAM_QPACK_DECODER);

        Self {
            dialed,
            command_rx,
            session_cache,
            pseudo_order,
            shared,
            streams: HashMap::new(),
            uni_streams: HashMap::new(),
            next_stream_id: 0,
            pending_uni: vec![
                (LOCAL_CONTROL_STREAM, BytesMut::from(&preamble[..])),
                (LOCAL_QPACK_ENCODER_STREAM, enc),
                (LOCAL_QPACK_DECODER_STREAM, dec),
            ],
            peer_settings: None,
            session_captured: false,
            goaway: false,
        }
    }

    /// Settings learned from the server's control stream, for stats.
    pub fn peer_settings(&self) -> Option<&[(u64, u64)]> {
        self.peer_settings.as_deref()
    }

    pub async fn run(mut self) {
        let result = self.drive().await;
        self.shared.healthy.store(false, Ordering::Relaxed);
        if let Err(e) = &result {
            tracing::debug!("h3 driver exited: {}", e);
        }
        for (_, stream) in self.streams.iter_mut() {
            stream.fail(Error::closed("h3_round_trip").with_protocol("h3"));
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        let mut buf = [0u8; 65535];
        let keepalive_period = self.dialed.idle_timeout / 2;
        let mut next_keepalive = Instant::now() + keepalive_period;
        let mut handles_gone = false;

        loop {
            self.flush_stream_writes()?;
            self.flush_egress(&mut out).await?;
            self.maybe_capture_session();
            self.shared
                .in_flight
                .store(self.streams.len() as u32, Ordering::Relaxed);

            if self.dialed.conn.is_closed() {
                return Err(Error::network("h3_drive", "QUIC connection closed")
                    .with_protocol("h3")
                    .retryable(true));
            }
            if handles_gone && self.streams.is_empty() {
                let _ = self.dialed.conn.close(true, 0x100, b"done");
                self.flush_egress(&mut out).await?;
                return Ok(());
            }

            let quic_timeout = self.dialed.conn.timeout().unwrap_or(Duration::from_secs(60));
            let keepalive_in = next_keepalive.saturating_duration_since(Instant::now());
            let sleep_for = quic_timeout.min(keepalive_in);

            tokio::select! {
                cmd = self.command_rx.recv(), if !handles_gone => {
                    match cmd {
                        Some(cmd) => self.start_request(cmd)?,
                        None => handles_gone = true,
                    }
                }
                recv = self.dialed.socket.recv(&mut buf) => {
                    let n = recv.map_err(|e| Error::io("quic_recv", e))?;
                    let info = quiche::RecvInfo {
                        from: self.dialed.peer_addr,
                        to: self.dialed.socket.local_addr().map_err(|e| Error::io("quic_recv", e))?,
                    };
                    match self.dialed.conn.recv(&mut buf[..n], info) {
                        Ok(_) | Err(quiche::Error::Done) => {}
                        Err(e) => {
                            return Err(Error::protocol("quic_recv", format!("recv: {}", e))
                                .with_protocol("h3"));
                        }
                    }
                    self.process_readable().await?;
                }
                _ = tokio::time::sleep(sleep_for) => {
                    if Instant::now() >= next_keepalive {
                        // Keepalive at half the idle timeout keeps the path
                        // warm without resetting the peer's idle clock late.
                        let _ = self.dialed.conn.send_ack_eliciting();
                        next_keepalive = Instant::now() + keepalive_period;
                    } else {
                        self.dialed.conn.on_timeout();
                    }
                }
            }
        }
    }

    fn maybe_capture_session(&mut self) {
        if !self.session_captured && self.dialed.conn.is_established() {
            self.session_captured = super::quic::capture_session(
                &self.session_cache,
                &self.dialed.session_key,
                &self.dialed.conn,
                &self.dialed.ech_config,
            );
        }
    }

    fn start_request(&mut self, cmd: SendRequest) -> Result<()> {
        if self.goaway {
            let _ = cmd.respond.send(Err(Error::closed("h3_round_trip").with_protocol("h3")));
            return Ok(());
        }
        if cmd.respond.is_closed() {
            return Ok(());
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 4;

        let pseudo: [(&[u8], &[u8]); 4] = [
            (b":method", cmd.method.as_bytes()),
            (b":authority", cmd.authority.as_bytes()),
            (b":scheme", cmd.scheme.as_bytes()),
            (b":path", cmd.path.as_bytes()),
        ];
        let mut list: Vec<(&[u8], &[u8])> = Vec::with_capacity(4 + cmd.headers.len());
        for &idx in &self.pseudo_order.indices() {
            list.push(pseudo[idx]);
        }
        for (n, v) in &cmd.headers {
            if !n.starts_with(':') {
                list.push((n.as_bytes(), v.as_bytes()));
            }
        }
        let section = qpack::encode_field_section(&list);

        let mut outbound = BytesMut::new();
        outbound.extend_from_slice(&frames::frame(frames::FRAME_HEADERS, &section));
        if let Some(body) = &cmd.body {
            if !body.is_empty() {
                outbound.extend_from_slice(&frames::frame(frames::FRAME_DATA, body));
            }
        }

        self.streams.insert(
            stream_id,
            RequestStream {
                respond: Some(cmd.respond),
                body_tx: None,
                status: None,
                inbound: BytesMut::new(),
                outbound,
                outbound_fin: true,
            },
        );
        Ok(())
    }

    /// Push pending stream bytes into quiche as its buffers allow.
    fn flush_stream_writes(&mut self) -> Result<()> {
        self.pending_uni.retain_mut(|(sid, buf)| {
            if buf.is_empty() {
                return false;
            }
            match self.dialed.conn.stream_send(*sid, buf, false) {
                Ok(n) => {
                    let _ = buf.split_to(n);
                    !buf.is_empty()
                }
                Err(quiche::Error::Done) => true,
                Err(e) => {
                    tracing::debug!("uni stream {} write failed: {}", sid, e);
                    false
                }
            }
        });

        let ids: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.outbound.is_empty() || s.outbound_fin)
            .map(|(&id, _)| id)
            .collect();
        for sid in ids {
            let Some(stream) = self.streams.get_mut(&sid) else { continue };
            if stream.outbound.is_empty() && !stream.outbound_fin {
                continue;
            }
            let fin = stream.outbound_fin;
            match self.dialed.conn.stream_send(sid, &stream.outbound, fin) {
                Ok(n) => {
                    let _ = stream.outbound.split_to(n);
                    if stream.outbound.is_empty() {
                        stream.outbound_fin = false;
                    }
                }
                Err(quiche::Error::Done) => {}
                Err(quiche::Error::StreamLimit) => {
                    // Too many concurrent requests; retried next pass.
                }
                Err(e) => {
                    if let Some(mut stream) = self.streams.remove(&sid) {
                        stream.fail(
                            Error::protocol("h3_send", format!("stream send: {}", e))
                                .with_protocol("h3"),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn flush_egress(&mut self, out: &mut [u8]) -> Result<()> {
        loop {
            match self.dialed.conn.send(out) {
                Ok((n, _info)) => {
                    self.dialed
                        .socket
                        .send(&out[..n])
                        .await
                        .map_err(|e| Error::io("quic_send", e))?;
                }
                Err(quiche::Error::Done) => return Ok(()),
                Err(e) => {
                    return Err(Error::protocol("quic_send", format!("send: {}", e))
                        .with_protocol("h3"))
                }
            }
        }
    }

    async fn process_readable(&mut self) -> Result<()> {
        let readable: Vec<u64> = self.dialed.conn.readable().collect();
        for sid in readable {
            if sid % 4 == 3 {
                self.read_uni_stream(sid)?;
            } else if sid % 4 == 0 {
                self.read_request_stream(sid).await?;
            }
        }
        Ok(())
    }

    fn read_uni_stream(&mut self, sid: u64) -> Result<()> {
        let mut chunk = [0u8; 16384];
        loop {
            match self.dialed.conn.stream_recv(sid, &mut chunk) {
                Ok((n, _fin)) => {
                    let uni = self.uni_streams.entry(sid).or_default();
                    uni.buf.extend_from_slice(&chunk[..n]);
                }
                Err(quiche::Error::Done) => break,
                Err(quiche::Error::StreamReset(_)) => {
                    self.uni_streams.remove(&sid);
                    return Ok(());
                }
                Err(e) => {
                    return Err(Error::protocol("h3_read", format!("uni recv: {}", e))
                        .with_protocol("h3"))
                }
            }
        }

        let Some(uni) = self.uni_streams.get_mut(&sid) else { return Ok(()) };
        if uni.stream_type.is_none() {
            let mut pos = 0usize;
            if let Some(t) = frames::try_read_varint(&uni.buf, &mut pos) {
                uni.stream_type = Some(t);
                let _ = uni.buf.split_to(pos);
            } else {
                return Ok(());
            }
        }

        match uni.stream_type {
            Some(frames::STREAM_CONTROL) => self.read_control_frames(sid),
            // QPACK instruction streams are drained and ignored: we never
            // acknowledge insertions, so the peer cannot reference them.
            Some(frames::STREAM_QPACK_ENCODER) | Some(frames::STREAM_QPACK_DECODER) => {
                if let Some(uni) = self.uni_streams.get_mut(&sid) {
                    uni.buf.clear();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn read_control_frames(&mut self, sid: u64) -> Result<()> {
        loop {
            let parsed = {
                let Some(uni) = self.uni_streams.get_mut(&sid) else { return Ok(()) };
                match frames::try_parse_frame(&uni.buf)? {
                    Some(parsed) => {
                        let _ = uni.buf.split_to(parsed.consumed);
                        parsed
                    }
                    None => return Ok(()),
                }
            };
            match parsed.frame_type {
                frames::FRAME_SETTINGS => {
                    if self.peer_settings.is_none() {
                        self.peer_settings = Some(frames::parse_settings(&parsed.payload)?);
                    }
                }
                frames::FRAME_GOAWAY => {
                    self.goaway = true;
                }
                _ => {}
            }
        }
    }

    async fn read_request_stream(&mut self, sid: u64) -> Result<()> {
        let mut chunk = [0u8; 16384];
        let mut finished = false;
        loop {
            match self.dialed.conn.stream_recv(sid, &mut chunk) {
                Ok((n, fin)) => {
                    if let Some(stream) = self.streams.get_mut(&sid) {
                        stream.inbound.extend_from_slice(&chunk[..n]);
                    }
                    if fin {
                        finished = true;
                        break;
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(quiche::Error::StreamReset(code)) => {
                    if let Some(mut stream) = self.streams.remove(&sid) {
                        stream.fail(
                            Error::protocol("h3_round_trip", format!("stream reset: {}", code))
                                .with_protocol("h3"),
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    return Err(Error::protocol("h3_read", format!("recv: {}", e))
                        .with_protocol("h3"))
                }
            }
        }

        self.deliver_frames(sid).await?;
        if finished {
            if let Some(mut stream) = self.streams.remove(&sid) {
                if stream.respond.is_some() {
                    stream.fail(
                        Error::protocol("h3_round_trip", "stream finished without headers")
                            .with_protocol("h3"),
                    );
                }
                // Dropping body_tx ends the caller's stream.
            }
        }
        Ok(())
    }

    async fn deliver_frames(&mut self, sid: u64) -> Result<()> {
        loop {
            let parsed = {
                let Some(stream) = self.streams.get_mut(&sid) else { return Ok(()) };
                match frames::try_parse_frame(&stream.inbound)? {
                    Some(parsed) => {
                        let _ = stream.inbound.split_to(parsed.consumed);
                        parsed
                    }
                    None => return Ok(()),
                }
            };

            match parsed.frame_type {
                frames::FRAME_HEADERS => {
                    let decoded = qpack::decode_field_section(&parsed.payload)?;
                    let Some(stream) = self.streams.get_mut(&sid) else { return Ok(()) };
                    if stream.respond.is_none() {
                        continue; // trailers, not surfaced
                    }
                    let mut status = None;
                    let mut headers = HeaderMap::new();
                    for (name, value) in decoded {
                        if name == ":status" {
                            status = value.parse().ok();
                        } else if !name.starts_with(':') {
                            headers.append(name, value);
                        }
                    }
                    let Some(status) = status else {
                        let mut stream = self.streams.remove(&sid).expect("stream disappeared");
                        stream.fail(Error::protocol("h3_round_trip", "response without :status"));
                        let _ = self.dialed.conn.stream_shutdown(
                            sid,
                            quiche::Shutdown::Read,
                            0x10e,
                        );
                        return Ok(());
                    };
                    stream.status = Some(status);
                    let respond = stream.respond.take().expect("checked above");
                    let (tx, rx) = mpsc::channel(8);
                    stream.body_tx = Some(tx);
                    if respond.send(Ok((status, headers, rx))).is_err() {
                        // Caller cancelled before headers arrived.
                        self.streams.remove(&sid);
                        let _ = self.dialed.conn.stream_shutdown(
                            sid,
                            quiche::Shutdown::Read,
                            0x10c,
                        );
                        return Ok(());
                    }
                }
                frames::FRAME_DATA => {
                    let tx = self
                        .streams
                        .get(&sid)
                        .and_then(|s| s.body_tx.clone());
                    if let Some(tx) = tx {
                        // Awaiting applies backpressure to the whole
                        // connection; a closed channel means the caller
                        // cancelled mid-body.
                        if tx.send(Ok(parsed.payload)).await.is_err() {
                            self.streams.remove(&sid);
                            let _ = self.dialed.conn.stream_shutdown(
                                sid,
                                quiche::Shutdown::Read,
                                0x10c,
                            );
                            return Ok(());
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
