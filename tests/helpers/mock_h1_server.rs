//! Minimal scriptable HTTP/1.1 server.
//!
//! Captures the raw request bytes for fingerprint assertions and replies
//! with a canned response per accepted connection.

#![allow(dead_code)]

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub struct MockH1Server {
    pub port: u16,
    /// Raw request heads, one entry per request served.
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockH1Server {
    /// Start a server that answers every request on a connection with
    /// `response` (raw bytes, including the status line).
    pub async fn start(response: &'static [u8]) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut buf: Vec<u8> = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        // Serve once the head and any declared body are in.
                        let Some(head_end) =
                            buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
                        else {
                            continue;
                        };
                        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
                        let body_len = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if buf.len() < head_end + body_len {
                            continue;
                        }
                        let request: Vec<u8> = buf.drain(..head_end + body_len).collect();
                        log.lock().await.push(request);
                        if stream.write_all(response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Ok(Self { port, requests })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub async fn request_heads(&self) -> Vec<String> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .collect()
    }
}

/// A keep-alive response with a sized body.
pub const OK_SIZED: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";

/// A chunked response.
pub const OK_CHUNKED: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

/// A close-delimited response.
pub const OK_CLOSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok";
