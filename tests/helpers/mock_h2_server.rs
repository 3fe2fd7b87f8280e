//! Frame-level mock HTTP/2 server over plain TCP.
//!
//! Speaks just enough of RFC 9113 to accept a client handshake, record the
//! frames the client sent, and answer each HEADERS with a canned response.
//! No TLS: the client side connects an `H2Connection` directly over TCP,
//! which exercises the same framing path the TLS transport uses.

#![allow(dead_code)]

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// One recorded frame: (type, flags, stream id, payload).
pub type RecordedFrame = (u8, u8, u32, Vec<u8>);

pub struct MockH2Server {
    pub port: u16,
    pub frames: Arc<Mutex<Vec<RecordedFrame>>>,
}

impl MockH2Server {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let frames = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&frames);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = serve(stream, log).await;
                });
            }
        });

        Ok(Self { port, frames })
    }

    pub async fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.lock().await.clone()
    }

    /// Frames of a given type, in arrival order.
    pub async fn frames_of(&self, frame_type: u8) -> Vec<RecordedFrame> {
        self.frames
            .lock()
            .await
            .iter()
            .filter(|f| f.0 == frame_type)
            .cloned()
            .collect()
    }
}

async fn serve(
    mut stream: TcpStream,
    log: Arc<Mutex<Vec<RecordedFrame>>>,
) -> std::io::Result<()> {
    let mut preface = [0u8; 24];
    stream.read_exact(&mut preface).await?;
    assert_eq!(&preface[..], PREFACE, "client preface mismatch");

    // Server SETTINGS (empty) so the client handshake can complete.
    stream.write_all(&frame_bytes(0x4, 0, 0, &[])).await?;

    loop {
        let mut head = [0u8; 9];
        if stream.read_exact(&mut head).await.is_err() {
            return Ok(());
        }
        let len = ((head[0] as usize) << 16) | ((head[1] as usize) << 8) | head[2] as usize;
        let frame_type = head[3];
        let flags = head[4];
        let stream_id = u32::from_be_bytes([head[5] & 0x7f, head[6], head[7], head[8]]);
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        log.lock().await.push((frame_type, flags, stream_id, payload));

        match frame_type {
            // SETTINGS: ack non-acks.
            0x4 if flags & 0x1 == 0 => {
                stream.write_all(&frame_bytes(0x4, 0x1, 0, &[])).await?;
            }
            // HEADERS: answer with a canned 200 + tiny body.
            0x1 => {
                // :status 200 is static index 8 -> 0x88.
                let headers = frame_bytes(0x1, 0x4, stream_id, &[0x88]);
                let data = frame_bytes(0x0, 0x1, stream_id, b"ok");
                stream.write_all(&headers).await?;
                stream.write_all(&data).await?;
            }
            // PING: reply with ack.
            0x6 if flags & 0x1 == 0 => {
                stream.write_all(&frame_bytes(0x6, 0x1, 0, &payload)).await?;
            }
            _ => {}
        }
    }
}

fn frame_bytes(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + payload.len());
    out.push((payload.len() >> 16) as u8);
    out.push((payload.len() >> 8) as u8);
    out.push(payload.len() as u8);
    out.push(frame_type);
    out.push(flags);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}
