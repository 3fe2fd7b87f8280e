//! HTTP/2 connection driver.
//!
//! A background task owns the raw connection, multiplexes requests from
//! cloneable handles, routes frames to per-stream channels, and enforces
//! the peer's MAX_CONCURRENT_STREAMS with a FIFO queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::headers::HeaderMap;

use super::connection::{ControlAction, H2Connection};
use super::frame::{flags, ErrorCode, FrameHeader, FrameType};

/// Response head delivered once headers arrive; the body streams after.
pub type ResponseHead = (u16, HeaderMap, mpsc::Receiver<Result<Bytes>>);

/// Command sent from a handle to the driver.
pub struct SendRequest {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    /// Fully ordered wire headers (preset defaults merged and sorted).
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub respond: oneshot::Sender<Result<ResponseHead>>,
}

struct StreamJob {
    respond: Option<oneshot::Sender<Result<ResponseHead>>>,
    body_tx: Option<mpsc::Sender<Result<Bytes>>>,
    status: Option<u16>,
    headers: HeaderMap,
    pending_body: Bytes,
    body_offset: usize,
    /// Header block under assembly across CONTINUATION frames.
    partial_block: Option<BytesMut>,
}

impl StreamJob {
    fn new(respond: oneshot::Sender<Result<ResponseHead>>, pending_body: Bytes) -> Self {
        Self {
            respond: Some(respond),
            body_tx: None,
            status: None,
            headers: HeaderMap::new(),
            pending_body,
            body_offset: 0,
            partial_block: None,
        }
    }

    fn fail(&mut self, err: Error) {
        if let Some(tx) = self.respond.take() {
            let _ = tx.send(Err(err));
        } else if let Some(tx) = self.body_tx.take() {
            let _ = tx.try_send(Err(err));
        }
    }
}

/// Shared driver state visible to the pooled handle.
pub struct DriverShared {
    pub healthy: AtomicBool,
    pub max_streams: AtomicU32,
    pub in_flight: AtomicU32,
}

impl DriverShared {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            max_streams: AtomicU32::new(100),
            in_flight: AtomicU32::new(0),
        }
    }
}

impl Default for DriverShared {
    fn default() -> Self {
        Self::new()
    }
}

pub struct H2Driver<S> {
    conn: H2Connection<S>,
    command_rx: mpsc::Receiver<SendRequest>,
    jobs: HashMap<u32, StreamJob>,
    queue: VecDeque<SendRequest>,
    shared: Arc<DriverShared>,
}

impl<S> H2Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        conn: H2Connection<S>,
        command_rx: mpsc::Receiver<SendRequest>,
        shared: Arc<DriverShared>,
    ) -> Self {
        Self {
            conn,
            command_rx,
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            shared,
        }
    }

    pub async fn run(mut self) {
        let result = self.drive().await;
        self.shared.healthy.store(false, Ordering::Relaxed);
        if let Err(e) = &result {
            tracing::debug!("h2 driver exited: {}", e);
        }
        // Fail everything still in flight or queued.
        for (_, job) in self.jobs.iter_mut() {
            job.fail(Error::closed("h2_round_trip").with_protocol("h2"));
        }
        for cmd in self.queue.drain(..) {
            let _ = cmd
                .respond
                .send(Err(Error::closed("h2_round_trip").with_protocol("h2")));
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let mut handles_gone = false;
        loop {
            self.dispatch_queued().await?;
            self.flush_bodies().await?;
            self.sync_shared();

            if handles_gone && self.jobs.is_empty() {
                let _ = self.conn.send_goaway(ErrorCode::NoError).await;
                return Ok(());
            }

            tokio::select! {
                cmd = self.command_rx.recv(), if !handles_gone => {
                    match cmd {
                        Some(cmd) => self.enqueue(cmd).await?,
                        None => handles_gone = true,
                    }
                }
                frame = self.conn.read_frame() => {
                    let (header, payload) = frame?;
                    self.handle_frame(header, payload).await?;
                }
            }
        }
    }

    fn sync_shared(&self) {
        self.shared
            .max_streams
            .store(self.conn.peer_settings().max_concurrent_streams, Ordering::Relaxed);
        self.shared
            .in_flight
            .store(self.jobs.len() as u32, Ordering::Relaxed);
    }

    async fn enqueue(&mut self, cmd: SendRequest) -> Result<()> {
        self.queue.push_back(cmd);
        self.dispatch_queued().await
    }

    /// Start queued requests while stream slots are available (FIFO).
    async fn dispatch_queued(&mut self) -> Result<()> {
        let max = self.conn.peer_settings().max_concurrent_streams as usize;
        while self.jobs.len() < max {
            let Some(cmd) = self.queue.pop_front() else { break };
            if cmd.respond.is_closed() {
                continue; // caller gave up while queued
            }
            self.start_request(cmd).await?;
        }
        Ok(())
    }

    async fn start_request(&mut self, cmd: SendRequest) -> Result<()> {
        let body = cmd.body.unwrap_or_default();
        let end_stream = body.is_empty();

        match self
            .conn
            .send_headers(
                &cmd.method,
                &cmd.scheme,
                &cmd.authority,
                &cmd.path,
                &cmd.headers,
                end_stream,
            )
            .await
        {
            Ok(stream_id) => {
                self.jobs.insert(stream_id, StreamJob::new(cmd.respond, body));
                Ok(())
            }
            Err(e) if e.category == crate::error::ErrorCategory::Closed => {
                // GOAWAY already seen; this request loses its slot but the
                // connection still drains existing streams.
                let _ = cmd.respond.send(Err(e));
                Ok(())
            }
            Err(e) => {
                let msg = Error::new(e.op, e.category, e.to_string());
                let _ = cmd.respond.send(Err(e));
                Err(msg)
            }
        }
    }

    /// Push pending request bodies as flow control allows.
    async fn flush_bodies(&mut self) -> Result<()> {
        let ids: Vec<u32> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.body_offset < j.pending_body.len())
            .map(|(&id, _)| id)
            .collect();

        for stream_id in ids {
            loop {
                let (chunk, offset) = {
                    let job = self.jobs.get(&stream_id).expect("job disappeared");
                    (job.pending_body.clone(), job.body_offset)
                };
                if offset >= chunk.len() {
                    break;
                }
                let sent = self.conn.send_data(stream_id, &chunk[offset..], true).await?;
                if sent == 0 {
                    break; // blocked on flow control
                }
                if let Some(job) = self.jobs.get_mut(&stream_id) {
                    job.body_offset += sent;
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        match self.conn.handle_control_frame(&header, &payload).await? {
            ControlAction::RstStream(stream_id, code) => {
                if let Some(mut job) = self.jobs.remove(&stream_id) {
                    job.fail(
                        Error::protocol("h2_round_trip", format!("stream reset by peer: {:?}", code))
                            .with_protocol("h2"),
                    );
                }
                return Ok(());
            }
            ControlAction::GoAway(last_stream_id, code) => {
                let dead: Vec<u32> = self
                    .jobs
                    .keys()
                    .copied()
                    .filter(|&id| id > last_stream_id)
                    .collect();
                for id in dead {
                    if let Some(mut job) = self.jobs.remove(&id) {
                        job.fail(
                            Error::protocol(
                                "h2_round_trip",
                                format!("GOAWAY ({:?}) before stream completed", code),
                            )
                            .with_protocol("h2")
                            .retryable(true),
                        );
                    }
                }
                return Ok(());
            }
            ControlAction::RefusePush(promised) => {
                self.conn.send_rst_stream(promised, ErrorCode::RefusedStream).await?;
                return Ok(());
            }
            ControlAction::WindowOpened => {
                self.flush_bodies().await?;
                return Ok(());
            }
            ControlAction::None => {}
        }

        match header.frame_type {
            FrameType::Headers | FrameType::Continuation => {
                self.handle_headers(header, payload).await?;
            }
            FrameType::Data => {
                self.handle_data(header, payload).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_headers(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        let stream_id = header.stream_id;
        let Some(job) = self.jobs.get_mut(&stream_id) else {
            return Ok(());
        };

        // HEADERS may carry a priority section we must skip.
        let mut fragment = payload;
        if header.frame_type == FrameType::Headers && header.has_flag(flags::PRIORITY) {
            if fragment.len() < 5 {
                return Err(Error::protocol("h2_headers", "short priority section"));
            }
            fragment = fragment.slice(5..);
        }

        let complete = if header.has_flag(flags::END_HEADERS) {
            match job.partial_block.take() {
                Some(mut block) => {
                    block.extend_from_slice(&fragment);
                    block.freeze()
                }
                None => fragment,
            }
        } else {
            job.partial_block
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(&fragment);
            return Ok(());
        };

        let decoded = self.conn.decode_block(&complete)?;
        let job = self.jobs.get_mut(&stream_id).expect("job disappeared");
        for (name, value) in decoded {
            if name == ":status" {
                job.status = value.parse().ok();
            } else if !name.starts_with(':') {
                job.headers.append(name, value);
            }
        }

        let end_stream = header.has_flag(flags::END_STREAM);
        if let Some(status) = job.status {
            if let Some(respond) = job.respond.take() {
                let (tx, rx) = mpsc::channel(8);
                job.body_tx = Some(tx);
                let head = (status, std::mem::take(&mut job.headers), rx);
                if respond.send(Ok(head)).is_err() {
                    // Caller cancelled before headers; abort the stream.
                    self.abort_stream(stream_id).await?;
                    return Ok(());
                }
            }
        } else if end_stream {
            let mut job = self.jobs.remove(&stream_id).expect("job disappeared");
            self.conn.close_stream(stream_id);
            job.fail(Error::protocol("h2_round_trip", "response without :status"));
            return Ok(());
        }

        if end_stream {
            self.finish_stream(stream_id);
        }
        Ok(())
    }

    async fn handle_data(&mut self, header: FrameHeader, payload: Bytes) -> Result<()> {
        let stream_id = header.stream_id;
        self.conn.account_data(stream_id, payload.len()).await?;

        let tx = match self.jobs.get(&stream_id) {
            Some(job) => job.body_tx.clone(),
            None => return Ok(()),
        };
        if let Some(tx) = tx {
            if !payload.is_empty() && tx.send(Ok(payload)).await.is_err() {
                // Body stream dropped mid-read: cancel and release credit.
                self.abort_stream(stream_id).await?;
                return Ok(());
            }
        }
        if header.has_flag(flags::END_STREAM) {
            self.finish_stream(stream_id);
        }
        Ok(())
    }

    fn finish_stream(&mut self, stream_id: u32) {
        self.conn.close_stream(stream_id);
        // Dropping the sender ends the caller's body stream.
        self.jobs.remove(&stream_id);
    }

    async fn abort_stream(&mut self, stream_id: u32) -> Result<()> {
        self.jobs.remove(&stream_id);
        self.conn.send_rst_stream(stream_id, ErrorCode::Cancel).await
    }
}
