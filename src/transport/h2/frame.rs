//! HTTP/2 frame types and binary serialization (RFC 9113).
//!
//! Serialization is byte-exact: SETTINGS entries go out in the order the
//! caller supplies, which is how the preset's settings order reaches the
//! wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Frame header size (9 bytes).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Initial flow-control window per RFC 9113.
pub const DEFAULT_INITIAL_WINDOW: u32 = 65535;

/// Client connection preface.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> u8 {
        match t {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// RST_STREAM / GOAWAY error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl From<u32> for ErrorCode {
    fn from(v: u32) -> Self {
        match v {
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::NoError,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a 9-byte header. The reserved stream-id bit must be zero.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(Error::protocol("h2_frame", "short frame header"));
        }
        if buf[5] & 0x80 != 0 {
            return Err(Error::protocol("h2_frame", "reserved bit set"));
        }
        Ok(Self {
            length: ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id: ((buf[5] as u32 & 0x7f) << 24)
                | ((buf[6] as u32) << 16)
                | ((buf[7] as u32) << 8)
                | buf[8] as u32,
        })
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

fn put_header(out: &mut BytesMut, length: usize, frame_type: FrameType, flags: u8, stream_id: u32) {
    out.put_u8((length >> 16) as u8);
    out.put_u8((length >> 8) as u8);
    out.put_u8(length as u8);
    out.put_u8(frame_type.into());
    out.put_u8(flags);
    out.put_u32(stream_id & 0x7fff_ffff);
}

/// Serialize a SETTINGS frame with entries in the given order.
pub fn settings(entries: &[(u16, u32)]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + entries.len() * 6);
    put_header(&mut out, entries.len() * 6, FrameType::Settings, 0, 0);
    for &(id, value) in entries {
        out.put_u16(id);
        out.put_u32(value);
    }
    out.freeze()
}

pub fn settings_ack() -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE);
    put_header(&mut out, 0, FrameType::Settings, flags::ACK, 0);
    out.freeze()
}

/// Parse a SETTINGS payload into (id, value) pairs, order preserved.
pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u16, u32)>> {
    if payload.len() % 6 != 0 {
        return Err(Error::protocol("h2_frame", "bad SETTINGS length"));
    }
    let mut buf = payload;
    let mut entries = Vec::with_capacity(payload.len() / 6);
    while buf.has_remaining() {
        let id = buf.get_u16();
        let value = buf.get_u32();
        entries.push((id, value));
    }
    Ok(entries)
}

pub fn window_update(stream_id: u32, increment: u32) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
    put_header(&mut out, 4, FrameType::WindowUpdate, 0, stream_id);
    out.put_u32(increment & 0x7fff_ffff);
    out.freeze()
}

/// Serialize a HEADERS frame. `priority` is `(dependency, wire_weight,
/// exclusive)`; the wire weight is the preset weight minus one.
pub fn headers(
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    end_headers: bool,
    priority: Option<(u32, u8, bool)>,
) -> Bytes {
    let mut f = 0u8;
    if end_stream {
        f |= flags::END_STREAM;
    }
    if end_headers {
        f |= flags::END_HEADERS;
    }
    let priority_len = if priority.is_some() { 5 } else { 0 };
    if priority.is_some() {
        f |= flags::PRIORITY;
    }

    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + priority_len + block.len());
    put_header(
        &mut out,
        block.len() + priority_len,
        FrameType::Headers,
        f,
        stream_id,
    );
    if let Some((dep, weight, exclusive)) = priority {
        let dep = if exclusive { dep | 0x8000_0000 } else { dep };
        out.put_u32(dep);
        out.put_u8(weight);
    }
    out.put_slice(block);
    out.freeze()
}

pub fn continuation(stream_id: u32, block: &[u8], end_headers: bool) -> Bytes {
    let f = if end_headers { flags::END_HEADERS } else { 0 };
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + block.len());
    put_header(&mut out, block.len(), FrameType::Continuation, f, stream_id);
    out.put_slice(block);
    out.freeze()
}

pub fn data(stream_id: u32, payload: &[u8], end_stream: bool) -> Bytes {
    let f = if end_stream { flags::END_STREAM } else { 0 };
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    put_header(&mut out, payload.len(), FrameType::Data, f, stream_id);
    out.put_slice(payload);
    out.freeze()
}

pub fn rst_stream(stream_id: u32, code: ErrorCode) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
    put_header(&mut out, 4, FrameType::RstStream, 0, stream_id);
    out.put_u32(code as u32);
    out.freeze()
}

pub fn ping_ack(payload: [u8; 8]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
    put_header(&mut out, 8, FrameType::Ping, flags::ACK, 0);
    out.put_slice(&payload);
    out.freeze()
}

pub fn goaway(last_stream_id: u32, code: ErrorCode) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
    put_header(&mut out, 8, FrameType::GoAway, 0, 0);
    out.put_u32(last_stream_id & 0x7fff_ffff);
    out.put_u32(code as u32);
    out.freeze()
}
