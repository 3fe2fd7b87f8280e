//! Raw HTTP/2 connection: handshake, frame IO, flow control.
//!
//! The handshake is wire-exact for fingerprinting: client preface, one
//! SETTINGS frame whose entries follow the preset's declared order, then a
//! WINDOW_UPDATE with the preset's connection increment. Request HEADERS
//! carry pseudo-headers in the preset's permutation and a priority field
//! unless the preset disables RFC 7540 priorities.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::fingerprint::{H2Settings, PseudoHeaderOrder};

use super::frame::{self, flags, ErrorCode, FrameHeader, FrameType, FRAME_HEADER_SIZE};
use super::hpack;

/// Peer-advertised settings, defaults per RFC 9113.
#[derive(Debug, Clone, Copy)]
pub struct PeerSettings {
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub header_table_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: u32::MAX,
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            header_table_size: 4096,
        }
    }
}

/// Stream states (RFC 7540 §5.1, client side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    Closed,
}

struct Stream {
    state: StreamState,
    send_window: i64,
    recv_window: i64,
}

/// Action the driver must take after a control frame.
#[derive(Debug)]
pub enum ControlAction {
    None,
    /// Peer reset this stream.
    RstStream(u32, ErrorCode),
    /// Peer is going away; streams above the id are dead.
    GoAway(u32, ErrorCode),
    /// Flow-control credit changed; blocked writes may proceed.
    WindowOpened,
    /// A PUSH_PROMISE arrived; the promised stream must be refused.
    RefusePush(u32),
}

/// Raw HTTP/2 client connection over any async stream.
pub struct H2Connection<S> {
    io: S,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,
    settings: H2Settings,
    pseudo_order: PseudoHeaderOrder,
    next_stream_id: u32,
    streams: HashMap<u32, Stream>,
    conn_send_window: i64,
    conn_recv_window: i64,
    peer: PeerSettings,
    read_buf: BytesMut,
    goaway_last_stream: Option<u32>,
}

/// Receive window refill threshold.
const WINDOW_UPDATE_THRESHOLD: i64 = 16384;

impl<S> H2Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Perform the client handshake and return the connection.
    pub async fn connect(
        mut io: S,
        settings: H2Settings,
        settings_order: &[u16],
        pseudo_order: PseudoHeaderOrder,
    ) -> Result<Self> {
        let entries: Vec<(u16, u32)> = settings_order
            .iter()
            .filter_map(|&id| settings.value_for(id).map(|v| (id, v)))
            .collect();

        let mut handshake = BytesMut::new();
        handshake.extend_from_slice(frame::CONNECTION_PREFACE);
        handshake.extend_from_slice(&frame::settings(&entries));
        handshake.extend_from_slice(&frame::window_update(0, settings.connection_window_update));

        io.write_all(&handshake)
            .await
            .map_err(|e| Error::io("h2_handshake", e).with_protocol("h2"))?;
        io.flush()
            .await
            .map_err(|e| Error::io("h2_handshake", e).with_protocol("h2"))?;

        let mut encoder = hpack::Encoder::new();
        encoder.set_max_table_size(settings.header_table_size as usize);
        let mut decoder = hpack::Decoder::new();
        decoder.set_max_table_size(settings.header_table_size as usize);

        Ok(Self {
            io,
            encoder,
            decoder,
            conn_recv_window: (frame::DEFAULT_INITIAL_WINDOW as i64)
                + settings.connection_window_update as i64,
            conn_send_window: frame::DEFAULT_INITIAL_WINDOW as i64,
            settings,
            pseudo_order,
            next_stream_id: 1,
            streams: HashMap::new(),
            peer: PeerSettings::default(),
            read_buf: BytesMut::with_capacity(16384),
            goaway_last_stream: None,
        })
    }

    pub fn peer_settings(&self) -> PeerSettings {
        self.peer
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_going_away(&self) -> bool {
        self.goaway_last_stream.is_some()
    }

    /// Send HEADERS for a new request; returns the stream id.
    pub async fn send_headers(
        &mut self,
        method: &str,
        scheme: &str,
        authority: &str,
        path: &str,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> Result<u32> {
        if let Some(last) = self.goaway_last_stream {
            if self.next_stream_id > last {
                return Err(Error::closed("h2_send_headers").with_protocol("h2"));
            }
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let block = self.encode_block(method, scheme, authority, path, headers);
        let priority = if self.settings.no_rfc7540_priorities {
            None
        } else {
            Some((
                0u32,
                (self.settings.stream_weight - 1) as u8,
                self.settings.stream_exclusive,
            ))
        };

        let max_frame = self.peer.max_frame_size as usize;
        if block.len() <= max_frame {
            let frame = frame::headers(stream_id, &block, end_stream, true, priority);
            self.write(&frame).await?;
        } else {
            // Oversized blocks continue across CONTINUATION frames.
            let first = &block[..max_frame];
            self.write(&frame::headers(stream_id, first, end_stream, false, priority))
                .await?;
            let mut rest = &block[max_frame..];
            while rest.len() > max_frame {
                let (chunk, tail) = rest.split_at(max_frame);
                self.write(&frame::continuation(stream_id, chunk, false)).await?;
                rest = tail;
            }
            self.write(&frame::continuation(stream_id, rest, true)).await?;
        }

        self.streams.insert(
            stream_id,
            Stream {
                state: if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                },
                send_window: self.peer.initial_window_size as i64,
                recv_window: self.settings.initial_window_size as i64,
            },
        );
        Ok(stream_id)
    }

    /// Encode the header block: pseudo-headers in the preset permutation,
    /// then regular headers as given (already preset-ordered by the caller).
    fn encode_block(
        &mut self,
        method: &str,
        scheme: &str,
        authority: &str,
        path: &str,
        headers: &[(String, String)],
    ) -> Bytes {
        let pseudo: [(&[u8], &[u8]); 4] = [
            (b":method", method.as_bytes()),
            (b":authority", authority.as_bytes()),
            (b":scheme", scheme.as_bytes()),
            (b":path", path.as_bytes()),
        ];

        let mut lowered: Vec<(String, String)> = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            if name.starts_with(':') || name.is_empty() {
                continue;
            }
            let lower = name.to_ascii_lowercase();
            // Connection-specific headers are forbidden in HTTP/2.
            if matches!(
                lower.as_str(),
                "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
            ) {
                continue;
            }
            if lower == "te" && !value.eq_ignore_ascii_case("trailers") {
                continue;
            }
            lowered.push((lower, value.clone()));
        }

        let mut list: Vec<(&[u8], &[u8])> = Vec::with_capacity(4 + lowered.len());
        for &idx in &self.pseudo_order.indices() {
            list.push(pseudo[idx]);
        }
        for (n, v) in &lowered {
            list.push((n.as_bytes(), v.as_bytes()));
        }
        self.encoder.encode(&list)
    }

    /// Write body bytes for a stream, bounded by both flow-control windows
    /// and the peer frame size. Returns bytes written (0 when blocked).
    pub async fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> Result<usize> {
        let stream_window = match self.streams.get(&stream_id) {
            Some(s) if s.state == StreamState::Open => s.send_window,
            Some(_) => return Err(Error::protocol("h2_send_data", "stream not writable")),
            None => return Err(Error::protocol("h2_send_data", "unknown stream")),
        };

        let budget = stream_window
            .min(self.conn_send_window)
            .min(self.peer.max_frame_size as i64);
        if budget <= 0 && !data.is_empty() {
            return Ok(0);
        }
        let n = data.len().min(budget.max(0) as usize);
        let last = end_stream && n == data.len();

        let frame = frame::data(stream_id, &data[..n], last);
        self.write(&frame).await?;

        self.conn_send_window -= n as i64;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send_window -= n as i64;
            if last {
                stream.state = StreamState::HalfClosedLocal;
            }
        }
        Ok(n)
    }

    pub async fn send_rst_stream(&mut self, stream_id: u32, code: ErrorCode) -> Result<()> {
        self.streams.remove(&stream_id);
        let frame = frame::rst_stream(stream_id, code);
        self.write(&frame).await
    }

    pub async fn send_goaway(&mut self, code: ErrorCode) -> Result<()> {
        let frame = frame::goaway(0, code);
        self.write(&frame).await
    }

    /// Read the next frame off the wire.
    pub async fn read_frame(&mut self) -> Result<(FrameHeader, Bytes)> {
        loop {
            if self.read_buf.len() >= FRAME_HEADER_SIZE {
                let header = FrameHeader::parse(&self.read_buf)?;
                let total = FRAME_HEADER_SIZE + header.length as usize;
                if header.length > self.settings.max_frame_size.max(frame::DEFAULT_MAX_FRAME_SIZE) {
                    return Err(Error::protocol("h2_read", "frame exceeds max size"));
                }
                if self.read_buf.len() >= total {
                    let mut whole = self.read_buf.split_to(total);
                    let payload = whole.split_off(FRAME_HEADER_SIZE).freeze();
                    return Ok((header, payload));
                }
            }
            let mut chunk = [0u8; 16384];
            let n = self
                .io
                .read(&mut chunk)
                .await
                .map_err(|e| Error::io("h2_read", e).with_protocol("h2"))?;
            if n == 0 {
                return Err(Error::network("h2_read", "connection closed by peer")
                    .with_protocol("h2")
                    .retryable(true));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Handle connection-level frames; stream DATA/HEADERS are left to the
    /// driver, which routes them to their requests.
    pub async fn handle_control_frame(
        &mut self,
        header: &FrameHeader,
        payload: &Bytes,
    ) -> Result<ControlAction> {
        match header.frame_type {
            FrameType::Settings => {
                if header.has_flag(flags::ACK) {
                    return Ok(ControlAction::None);
                }
                for (id, value) in frame::parse_settings(payload)? {
                    match id {
                        0x1 => {
                            self.peer.header_table_size = value;
                            self.encoder.set_max_table_size(
                                value.min(self.settings.header_table_size) as usize,
                            );
                        }
                        0x3 => self.peer.max_concurrent_streams = value,
                        0x4 => {
                            // Delta applies to all open stream windows.
                            let delta = value as i64 - self.peer.initial_window_size as i64;
                            for stream in self.streams.values_mut() {
                                stream.send_window += delta;
                            }
                            self.peer.initial_window_size = value;
                        }
                        0x5 => self.peer.max_frame_size = value,
                        _ => {}
                    }
                }
                let ack = frame::settings_ack();
                self.write(&ack).await?;
                Ok(ControlAction::None)
            }
            FrameType::Ping => {
                if !header.has_flag(flags::ACK) && payload.len() == 8 {
                    let mut data = [0u8; 8];
                    data.copy_from_slice(payload);
                    let ack = frame::ping_ack(data);
                    self.write(&ack).await?;
                }
                Ok(ControlAction::None)
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(Error::protocol("h2_window_update", "bad length"));
                }
                let incr = u32::from_be_bytes(payload[..4].try_into().expect("len checked"))
                    & 0x7fff_ffff;
                if header.stream_id == 0 {
                    self.conn_send_window += incr as i64;
                } else if let Some(stream) = self.streams.get_mut(&header.stream_id) {
                    stream.send_window += incr as i64;
                }
                Ok(ControlAction::WindowOpened)
            }
            FrameType::RstStream => {
                if payload.len() != 4 {
                    return Err(Error::protocol("h2_rst_stream", "bad length"));
                }
                let code =
                    ErrorCode::from(u32::from_be_bytes(payload[..4].try_into().expect("len checked")));
                self.streams.remove(&header.stream_id);
                Ok(ControlAction::RstStream(header.stream_id, code))
            }
            FrameType::GoAway => {
                if payload.len() < 8 {
                    return Err(Error::protocol("h2_goaway", "bad length"));
                }
                let last = u32::from_be_bytes(payload[..4].try_into().expect("len checked"))
                    & 0x7fff_ffff;
                let code =
                    ErrorCode::from(u32::from_be_bytes(payload[4..8].try_into().expect("len checked")));
                self.goaway_last_stream = Some(last);
                Ok(ControlAction::GoAway(last, code))
            }
            FrameType::PushPromise => {
                // ENABLE_PUSH is 0 in every preset; refuse the promise.
                if payload.len() < 4 {
                    return Err(Error::protocol("h2_push_promise", "bad length"));
                }
                let promised = u32::from_be_bytes(payload[..4].try_into().expect("len checked"))
                    & 0x7fff_ffff;
                Ok(ControlAction::RefusePush(promised))
            }
            _ => Ok(ControlAction::None),
        }
    }

    /// Account an inbound DATA frame against both receive windows, sending
    /// WINDOW_UPDATEs when they run low.
    pub async fn account_data(&mut self, stream_id: u32, len: usize) -> Result<()> {
        self.conn_recv_window -= len as i64;
        if self.conn_recv_window < WINDOW_UPDATE_THRESHOLD {
            let refill = self.settings.connection_window_update.max(65535);
            let frame = frame::window_update(0, refill);
            self.write(&frame).await?;
            self.conn_recv_window += refill as i64;
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.recv_window -= len as i64;
            if stream.recv_window < WINDOW_UPDATE_THRESHOLD {
                let refill = self.settings.initial_window_size;
                let frame = frame::window_update(stream_id, refill);
                self.write(&frame).await?;
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.recv_window += refill as i64;
                }
            }
        }
        Ok(())
    }

    pub fn decode_block(&mut self, block: &[u8]) -> Result<Vec<(String, String)>> {
        self.decoder.decode(block)
    }

    /// Mark a stream fully closed and release its slot.
    pub fn close_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.io
            .write_all(bytes)
            .await
            .map_err(|e| Error::io("h2_write", e).with_protocol("h2"))?;
        self.io
            .flush()
            .await
            .map_err(|e| Error::io("h2_write", e).with_protocol("h2"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;

    /// Duplex pipe standing in for a TLS stream.
    fn pipe() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        tokio::io::duplex(1 << 20)
    }

    async fn read_exact(server: &mut tokio::io::DuplexStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        server.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_handshake_emits_preface_settings_window_update() {
        let preset = fingerprint::get("chrome-145").unwrap();
        let (client, mut server) = pipe();

        let order = preset.h2_settings_order.clone();
        let settings = preset.h2_settings.clone();
        let _conn = H2Connection::connect(client, settings.clone(), &order, preset.pseudo_header_order)
            .await
            .unwrap();

        let preface = read_exact(&mut server, frame::CONNECTION_PREFACE.len()).await;
        assert_eq!(preface, frame::CONNECTION_PREFACE);

        // Exactly one SETTINGS frame, entries in the preset's order.
        let head = read_exact(&mut server, FRAME_HEADER_SIZE).await;
        let header = FrameHeader::parse(&head).unwrap();
        assert_eq!(header.frame_type, FrameType::Settings);
        let payload = read_exact(&mut server, header.length as usize).await;
        let entries = frame::parse_settings(&payload).unwrap();
        let ids: Vec<u16> = entries.iter().map(|&(id, _)| id).collect();
        assert_eq!(ids, order);
        for (id, value) in entries {
            assert_eq!(settings.value_for(id), Some(value));
        }

        // Immediately followed by the connection WINDOW_UPDATE.
        let head = read_exact(&mut server, FRAME_HEADER_SIZE).await;
        let header = FrameHeader::parse(&head).unwrap();
        assert_eq!(header.frame_type, FrameType::WindowUpdate);
        assert_eq!(header.stream_id, 0);
        let payload = read_exact(&mut server, 4).await;
        let incr = u32::from_be_bytes(payload.try_into().unwrap());
        assert_eq!(incr, settings.connection_window_update);
    }

    #[tokio::test]
    async fn test_headers_pseudo_order_and_priority() {
        let preset = fingerprint::get("chrome-145").unwrap();
        let (client, mut server) = pipe();
        let mut conn = H2Connection::connect(
            client,
            preset.h2_settings.clone(),
            &preset.h2_settings_order,
            preset.pseudo_header_order,
        )
        .await
        .unwrap();

        // Drain the handshake bytes.
        let hs_len = frame::CONNECTION_PREFACE.len()
            + FRAME_HEADER_SIZE
            + preset.h2_settings_order.len() * 6
            + FRAME_HEADER_SIZE
            + 4;
        read_exact(&mut server, hs_len).await;

        let headers = vec![
            ("user-agent".to_string(), "test".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
        ];
        let sid = conn
            .send_headers("GET", "https", "example.com", "/", &headers, true)
            .await
            .unwrap();
        assert_eq!(sid, 1);

        let head = read_exact(&mut server, FRAME_HEADER_SIZE).await;
        let header = FrameHeader::parse(&head).unwrap();
        assert_eq!(header.frame_type, FrameType::Headers);
        assert!(header.has_flag(flags::PRIORITY));
        assert!(header.has_flag(flags::END_STREAM));

        let payload = read_exact(&mut server, header.length as usize).await;
        // Skip the 5-byte priority section; weight is preset weight - 1.
        assert_eq!(payload[4], (preset.h2_settings.stream_weight - 1) as u8);
        let block = &payload[5..];

        let mut decoder = hpack::Decoder::new();
        decoder.set_max_table_size(preset.h2_settings.header_table_size as usize);
        let decoded = decoder.decode(block).unwrap();

        // Chrome order: m,s,a,p. Connection header filtered, names lowered.
        let names: Vec<&str> = decoded.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![":method", ":scheme", ":authority", ":path", "user-agent"]
        );
    }

    #[tokio::test]
    async fn test_safari_omits_priority() {
        let preset = fingerprint::get("safari-18").unwrap();
        let (client, mut server) = pipe();
        let mut conn = H2Connection::connect(
            client,
            preset.h2_settings.clone(),
            &preset.h2_settings_order,
            preset.pseudo_header_order,
        )
        .await
        .unwrap();

        let hs_len = frame::CONNECTION_PREFACE.len()
            + FRAME_HEADER_SIZE
            + preset.h2_settings_order.len() * 6
            + FRAME_HEADER_SIZE
            + 4;
        read_exact(&mut server, hs_len).await;

        conn.send_headers("GET", "https", "example.com", "/", &[], true)
            .await
            .unwrap();

        let head = read_exact(&mut server, FRAME_HEADER_SIZE).await;
        let header = FrameHeader::parse(&head).unwrap();
        assert!(!header.has_flag(flags::PRIORITY));
    }

    #[tokio::test]
    async fn test_send_data_respects_peer_window() {
        let preset = fingerprint::get("chrome-145").unwrap();
        let (client, mut server) = pipe();
        let mut conn = H2Connection::connect(
            client,
            preset.h2_settings.clone(),
            &preset.h2_settings_order,
            preset.pseudo_header_order,
        )
        .await
        .unwrap();

        let sid = conn
            .send_headers("POST", "https", "example.com", "/upload", &[], false)
            .await
            .unwrap();

        // Peer default window is 65535; a 100KB body must be split.
        let body = vec![0u8; 100_000];
        let sent = conn.send_data(sid, &body, true).await.unwrap();
        assert!(sent <= 16384, "bounded by default max frame size");

        // Drain server side so writes cannot stall.
        tokio::spawn(async move {
            let mut sink = vec![0u8; 1 << 16];
            while server.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let mut total = sent;
        loop {
            let n = conn.send_data(sid, &body[total..], true).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
            if total == body.len() {
                break;
            }
        }
        // Blocked at the peer's 65535 default connection window.
        assert_eq!(total, 65535);
    }
}
