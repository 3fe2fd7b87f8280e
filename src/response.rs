//! HTTP response with a lazily read body stream and explicit decompression.

use std::io::Read;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::headers::HeaderMap;

/// Per-request timing record, milliseconds.
///
/// On reused connections the connection-formation components are zero. On
/// fresh connections they are apportioned from the measured first-byte
/// latency by fixed ratios when not directly measurable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timing {
    pub dns_lookup: f64,
    pub tcp_connect: f64,
    pub tls_handshake: f64,
    pub first_byte: f64,
    pub total: f64,
}

impl Timing {
    /// Apportion connection-formation time for a fresh TCP+TLS connection
    /// (DNS/TCP/TLS = 20/30/50 of the estimated overhead).
    pub fn apportion_tcp(&mut self) {
        let overhead = self.first_byte * 0.7;
        if overhead > 10.0 {
            self.dns_lookup = overhead * 0.2;
            self.tcp_connect = overhead * 0.3;
            self.tls_handshake = overhead * 0.5;
        }
    }

    /// Apportion for a fresh QUIC connection (no TCP; DNS/TLS = 30/70).
    pub fn apportion_quic(&mut self) {
        self.tcp_connect = 0.0;
        let overhead = self.first_byte * 0.7;
        if overhead > 10.0 {
            self.dns_lookup = overhead * 0.3;
            self.tls_handshake = overhead * 0.7;
        }
    }

    /// Zero the connection-formation components (reused connection).
    pub fn mark_reused(&mut self) {
        self.dns_lookup = 0.0;
        self.tcp_connect = 0.0;
        self.tls_handshake = 0.0;
    }

    pub fn record_first_byte(&mut self, elapsed: Duration) {
        self.first_byte = elapsed.as_secs_f64() * 1000.0;
    }

    pub fn record_total(&mut self, elapsed: Duration) {
        self.total = elapsed.as_secs_f64() * 1000.0;
    }
}

/// One-shot response body stream.
///
/// Chunks arrive from the transport as they are read off the wire. Dropping
/// the stream (or calling [`ResponseBody::close`]) releases the underlying
/// stream and returns the connection to its pool.
pub struct ResponseBody {
    rx: mpsc::Receiver<Result<Bytes>>,
    done: bool,
}

impl ResponseBody {
    pub fn new(rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self { rx, done: false }
    }

    /// Empty body.
    pub fn empty() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx, done: true }
    }

    /// Body wholly in memory (already-read responses, tests).
    pub fn from_bytes(bytes: Bytes) -> Self {
        let (tx, rx) = mpsc::channel(1);
        if !bytes.is_empty() {
            // Channel has capacity 1 and no other senders; cannot fail.
            let _ = tx.try_send(Ok(bytes));
        }
        Self { rx, done: false }
    }

    /// Next chunk, or `None` at end of body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => {
                self.done = true;
                Err(e)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Read the entire remaining body into memory.
    pub async fn collect(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Stop reading and release the stream.
    pub fn close(&mut self) {
        self.rx.close();
        self.done = true;
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResponseBody {{ done: {} }}", self.done)
    }
}

/// An HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    body: ResponseBody,
    /// Body bytes once collected; body() reads lazily, bytes() caches here.
    collected: Option<Bytes>,
    pub final_url: String,
    /// Negotiated protocol: "h1", "h2" or "h3".
    pub protocol: &'static str,
    /// Whether this response rode a reused connection.
    pub reused: bool,
    pub timing: Timing,
}

impl Response {
    pub fn new(
        status: u16,
        headers: HeaderMap,
        body: ResponseBody,
        final_url: String,
        protocol: &'static str,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            collected: None,
            final_url,
            protocol,
            reused: false,
            timing: Timing::default(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Take the body stream for incremental reading. Callers that want the
    /// whole body should use [`Response::bytes`] instead.
    pub fn body_stream(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Read and cache the whole raw body.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        if self.collected.is_none() {
            self.collected = Some(self.body.collect().await?);
        }
        Ok(self.collected.clone().unwrap_or_default())
    }

    /// Whole body, decompressed per `Content-Encoding`.
    pub async fn decoded_body(&mut self) -> Result<Bytes> {
        let raw = self.bytes().await?;
        decode_content(&raw, self.headers.get("content-encoding"))
    }

    pub async fn text(&mut self) -> Result<String> {
        let decoded = self.decoded_body().await?;
        String::from_utf8(decoded.to_vec())
            .map_err(|e| Error::response("decode_text", format!("UTF-8 decode error: {}", e)))
    }

    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let decoded = self.decoded_body().await?;
        serde_json::from_slice(&decoded).map_err(Error::from)
    }
}

/// Decompress `data` per the Content-Encoding value, sniffing magic bytes
/// when the header is absent.
pub fn decode_content(data: &Bytes, encoding: Option<&str>) -> Result<Bytes> {
    match encoding.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("gzip") | Some("x-gzip") => decode_gzip(data),
        Some("deflate") => decode_deflate(data),
        Some("br") => decode_brotli(data),
        Some("zstd") => decode_zstd(data),
        Some("") | Some("identity") | None => {
            if data.len() >= 4 && data[..4] == [0x28, 0xB5, 0x2F, 0xFD] {
                return decode_zstd(data);
            }
            if data.len() >= 2 && data[..2] == [0x1f, 0x8b] {
                return decode_gzip(data);
            }
            Ok(data.clone())
        }
        Some(_) => Ok(data.clone()),
    }
}

fn decode_gzip(data: &[u8]) -> Result<Bytes> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| Error::response("decompress", format!("gzip: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_deflate(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    if flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut decoded)
        .is_ok()
    {
        return Ok(Bytes::from(decoded));
    }
    decoded.clear();
    flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::response("decompress", format!("deflate: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_brotli(data: &[u8]) -> Result<Bytes> {
    let mut decoder = brotli::Decompressor::new(data, 4096);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| Error::response("decompress", format!("brotli: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_zstd(data: &[u8]) -> Result<Bytes> {
    zstd::stream::decode_all(std::io::Cursor::new(data))
        .map(Bytes::from)
        .map_err(|e| Error::response("decompress", format!("zstd: {}", e)))
}
