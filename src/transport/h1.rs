//! HTTP/1.1 transport.
//!
//! Requests are written raw for full control over header order and casing;
//! responses are parsed with httparse. Connections are exclusively leased
//! from the pool and returned once the body has been fully streamed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::dns;
use crate::error::{Error, Result};
use crate::headers::HeaderMap;
use crate::pool::{Lease, Outcome, Pool, Poolable};
use crate::request::{Body, HostKey, Request};
use crate::response::{Response, ResponseBody};
use crate::tls::{self, MaybeTlsStream, TlsContext};
use crate::transport::proxy::{self, ProxyConfig};

/// Maximum response head size (64KB).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum number of response headers.
const MAX_HEADERS: usize = 100;

/// Body stream chunk size.
const READ_CHUNK: usize = 16 * 1024;

/// A pooled HTTP/1.1 connection.
pub struct H1Connection {
    io: tokio::sync::Mutex<MaybeTlsStream>,
    healthy: AtomicBool,
    /// Set when the TLS handshake resumed a cached session.
    pub resumed: bool,
}

impl H1Connection {
    fn new(io: MaybeTlsStream, resumed: bool) -> Self {
        Self {
            io: tokio::sync::Mutex::new(io),
            healthy: AtomicBool::new(true),
            resumed,
        }
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }
}

impl Poolable for H1Connection {
    fn max_concurrent(&self) -> u32 {
        1
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// HTTP/1.1 transport: dials (optionally through a proxy), pools exclusive
/// connections, and runs request/response exchanges.
pub struct H1Transport {
    tls: TlsContext,
    resolver: dns::Resolver,
    proxy: Option<ProxyConfig>,
    pool: Arc<Pool<HostKey, H1Connection>>,
    /// Skip preset default headers, keeping only the TLS fingerprint.
    tls_only: bool,
}

impl H1Transport {
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

    /// Execute one request over HTTP/1.1.
    pub async fn round_trip(&self, req: Request) -> Result<Response> {
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
            .map_err(|e| e.with_endpoint(&key.host, key.port).with_protocol("h1"))?;

        let reused = lease.is_reused();
        let headers = self.wire_headers(&req);
        let path = req.path_and_query();
        let method = req.method.clone();
        let body = req.body;

        let (status, resp_headers, body) = exchange(lease, &method, &key, &path, headers, body)
            .await
            .map_err(|e| e.with_endpoint(&key.host, key.port).with_protocol("h1"))?;

        let mut response = Response::new(status, resp_headers, body, url, "h1");
        response.reused = reused;
        if reused {
            response.timing.mark_reused();
        }
        Ok(response)
    }

    /// Preset defaults merged with user headers, in declared order.
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
    tls: &TlsContext,
    resolver: &dns::Resolver,
    proxy: Option<&ProxyConfig>,
    key: &HostKey,
) -> Result<H1Connection> {
    let mut tcp = match proxy {
        Some(p) => {
            let mut stream = dns::connect_tcp(resolver, p.host(), p.port())
                .await
                .map_err(|e| e.with_protocol("h1"))?;
            proxy::establish_tunnel(&mut stream, p, &key.host, key.port).await?;
            stream
        }
        None => dns::connect_tcp(resolver, &key.host, key.port).await?,
    };

    if key.scheme == "https" {
        let _ = tcp.set_nodelay(true);
        let hs = tls::handshake(tls, tcp, &key.host, key.port, "h1").await?;
        Ok(H1Connection::new(MaybeTlsStream::Tls(hs.stream), hs.resumed))
    } else {
        Ok(H1Connection::new(MaybeTlsStream::Plain(tcp), false))
    }
}

/// Write the request and read the response head; the body is streamed by a
/// background task that owns the lease until completion.
async fn exchange(
    lease: Lease<H1Connection>,
    method: &Method,
    key: &HostKey,
    path_and_query: &str,
    headers: Vec<(String, String)>,
    body: Option<Body>,
) -> Result<(u16, HeaderMap, ResponseBody)> {
    let head = build_request_head(method, key, path_and_query, &headers, body.as_ref());

    let write_result = async {
        let mut io = lease.conn().io.lock().await;
        io.write_all(&head).await.map_err(|e| Error::io("write_request", e))?;
        match body {
            Some(Body::Bytes(bytes)) if !bytes.is_empty() => {
                io.write_all(&bytes).await.map_err(|e| Error::io("write_body", e))?;
            }
            Some(Body::Stream { mut rx, .. }) => {
                while let Some(chunk) = rx.recv().await {
                    io.write_all(&chunk).await.map_err(|e| Error::io("write_body", e))?;
                }
            }
            _ => {}
        }
        io.flush().await.map_err(|e| Error::io("write_request", e))?;

        read_head(&mut io).await
    }
    .await;

    let (status, resp_headers, leftover) = match write_result {
        Ok(parts) => parts,
        Err(e) => {
            lease.conn().mark_unhealthy();
            lease.release(Outcome::Unhealthy);
            return Err(e);
        }
    };

    let framing = body_framing(method, status, &resp_headers);
    let keep_alive = connection_keep_alive(&resp_headers);

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(stream_body(lease, leftover, framing, keep_alive, tx));

    Ok((status, resp_headers, ResponseBody::new(rx)))
}

fn build_request_head(
    method: &Method,
    key: &HostKey,
    path_and_query: &str,
    headers: &[(String, String)],
    body: Option<&Body>,
) -> Bytes {
    let mut out = BytesMut::with_capacity(512);
    out.extend_from_slice(method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(path_and_query.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(key.authority().as_bytes());
    out.extend_from_slice(b"\r\n");

    let mut has_content_length = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        if name.eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        }
        out.extend_from_slice(canonical_name(name).as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if let Some(body) = body {
        if !has_content_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

/// HTTP/1.1 header names go out in canonical Train-Case, the way browsers
/// send them.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

async fn read_head(
    io: &mut MaybeTlsStream,
) -> Result<(u16, HeaderMap, BytesMut)> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::response("read_head", "response head too large"));
        }
        let mut chunk = [0u8; 4096];
        let n = io
            .read(&mut chunk)
            .await
            .map_err(|e| Error::io("read_head", e))?;
        if n == 0 {
            return Err(Error::network("read_head", "connection closed before response")
                .retryable(true));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let status = parsed.code.ok_or_else(|| {
                    Error::response("read_head", "response missing status code")
                })?;
                let mut map = HeaderMap::new();
                for h in parsed.headers.iter() {
                    map.append(
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    );
                }
                let mut leftover = buf;
                let _ = leftover.split_to(head_len);
                return Ok((status, map, leftover));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => {
                return Err(Error::response("read_head", format!("malformed response: {}", e)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    /// No body (HEAD, 1xx, 204, 304).
    None,
    /// Exactly n bytes.
    Length(u64),
    /// Transfer-Encoding: chunked.
    Chunked,
    /// Read until the peer closes; connection is not reusable afterwards.
    Eof,
}

fn body_framing(method: &Method, status: u16, headers: &HeaderMap) -> Framing {
    if *method == Method::HEAD || (100..200).contains(&status) || status == 204 || status == 304 {
        return Framing::None;
    }
    let chunked = headers
        .get("transfer-encoding")
        .map(|te| {
            te.split(',')
                .next_back()
                .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
                .unwrap_or(false)
        })
        .unwrap_or(false);
    if chunked {
        return Framing::Chunked;
    }
    if let Some(len) = headers.get("content-length").and_then(|v| v.trim().parse().ok()) {
        return Framing::Length(len);
    }
    Framing::Eof
}

fn connection_keep_alive(headers: &HeaderMap) -> bool {
    !headers
        .get("connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

/// Stream the body into `tx`, then release the lease. The lease lives here
/// so the connection cannot be handed out while the body is in flight.
async fn stream_body(
    lease: Lease<H1Connection>,
    mut leftover: BytesMut,
    framing: Framing,
    keep_alive: bool,
    tx: mpsc::Sender<Result<Bytes>>,
) {
    let result: Result<bool> = async {
        let mut io = lease.conn().io.lock().await;
        match framing {
            Framing::None => Ok(keep_alive),
            Framing::Length(total) => {
                let mut remaining = total;
                if !leftover.is_empty() {
                    let take = leftover.len().min(remaining as usize);
                    let chunk = leftover.split_to(take).freeze();
                    remaining -= chunk.len() as u64;
                    if tx.send(Ok(chunk)).await.is_err() {
                        return Ok(false);
                    }
                }
                let mut buf = vec![0u8; READ_CHUNK];
                while remaining > 0 {
                    let want = buf.len().min(remaining as usize);
                    let n = io
                        .read(&mut buf[..want])
                        .await
                        .map_err(|e| Error::io("read_body", e))?;
                    if n == 0 {
                        return Err(Error::response("read_body", "connection closed mid-body"));
                    }
                    remaining -= n as u64;
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        return Ok(false);
                    }
                }
                Ok(keep_alive)
            }
            Framing::Chunked => {
                stream_chunked(&mut io, leftover, &tx).await?;
                Ok(keep_alive)
            }
            Framing::Eof => {
                if !leftover.is_empty() && tx.send(Ok(leftover.freeze())).await.is_err() {
                    return Ok(false);
                }
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    let n = io
                        .read(&mut buf)
                        .await
                        .map_err(|e| Error::io("read_body", e))?;
                    if n == 0 {
                        break;
                    }
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        break;
                    }
                }
                Ok(false)
            }
        }
    }
    .await;

    match result {
        Ok(true) => lease.release(Outcome::Reusable),
        Ok(false) => {
            lease.conn().mark_unhealthy();
            lease.release(Outcome::Unhealthy);
        }
        Err(e) => {
            lease.conn().mark_unhealthy();
            let _ = tx.send(Err(e)).await;
            lease.release(Outcome::Unhealthy);
        }
    }
}

/// Incremental chunked-body decoder.
async fn stream_chunked(
    io: &mut MaybeTlsStream,
    mut buf: BytesMut,
    tx: &mpsc::Sender<Result<Bytes>>,
) -> Result<()> {
    loop {
        // Read the size line.
        let line = read_line(io, &mut buf).await?;
        let size_str = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| Error::response("read_body", format!("bad chunk size: {size_str}")))?;

        if size == 0 {
            // Trailers until the blank line.
            loop {
                let trailer = read_line(io, &mut buf).await?;
                if trailer.is_empty() {
                    return Ok(());
                }
            }
        }

        let mut remaining = size as usize;
        while remaining > 0 {
            if buf.is_empty() {
                fill(io, &mut buf).await?;
            }
            let take = buf.len().min(remaining);
            let chunk = buf.split_to(take).freeze();
            remaining -= chunk.len();
            if tx.send(Ok(chunk)).await.is_err() {
                return Err(Error::response("read_body", "body stream dropped"));
            }
        }

        // Trailing CRLF after the chunk data.
        let crlf = read_line(io, &mut buf).await?;
        if !crlf.is_empty() {
            return Err(Error::response("read_body", "missing chunk terminator"));
        }
    }
}

async fn read_line(io: &mut MaybeTlsStream, buf: &mut BytesMut) -> Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos);
            let _ = buf.split_to(2);
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::response("read_body", "oversized chunk header"));
        }
        fill(io, buf).await?;
    }
}

async fn fill(io: &mut MaybeTlsStream, buf: &mut BytesMut) -> Result<()> {
    let mut chunk = [0u8; 4096];
    let n = io
        .read(&mut chunk)
        .await
        .map_err(|e| Error::io("read_body", e))?;
    if n == 0 {
        return Err(Error::response("read_body", "connection closed mid-body"));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("user-agent"), "User-Agent");
        assert_eq!(canonical_name("sec-ch-ua"), "Sec-Ch-Ua");
        assert_eq!(canonical_name("accept"), "Accept");
    }

    #[test]
    fn test_request_head_has_content_length() {
        let key = HostKey::new("https", "example.com", 443);
        let body = Body::from("hello");
        let head = build_request_head(
            &Method::POST,
            &key,
            "/submit",
            &[("accept".into(), "*/*".into())],
            Some(&body),
        );
        let s = String::from_utf8_lossy(&head);
        assert!(s.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(s.contains("Host: example.com\r\n"));
        assert!(s.contains("Accept: */*\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_framing_rules() {
        let mut headers = HeaderMap::new();
        headers.append("content-length", "10");
        assert!(matches!(
            body_framing(&Method::GET, 200, &headers),
            Framing::Length(10)
        ));
        assert!(matches!(
            body_framing(&Method::HEAD, 200, &headers),
            Framing::None
        ));
        assert!(matches!(
            body_framing(&Method::GET, 304, &headers),
            Framing::None
        ));

        let mut headers = HeaderMap::new();
        headers.append("transfer-encoding", "gzip, chunked");
        assert!(matches!(
            body_framing(&Method::GET, 200, &headers),
            Framing::Chunked
        ));

        let headers = HeaderMap::new();
        assert!(matches!(
            body_framing(&Method::GET, 200, &headers),
            Framing::Eof
        ));
    }

    #[test]
    fn test_keep_alive_detection() {
        let mut headers = HeaderMap::new();
        assert!(connection_keep_alive(&headers));
        headers.append("connection", "close");
        assert!(!connection_keep_alive(&headers));
    }
}
