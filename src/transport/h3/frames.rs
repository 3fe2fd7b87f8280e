//! HTTP/3 framing (RFC 9114): varints, frame encode/decode, and the
//! SETTINGS serializer that preserves the preset's enumeration order.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::tls::hello::ShuffleSeed;

/// Frame types.
pub const FRAME_DATA: u64 = 0x0;
pub const FRAME_HEADERS: u64 = 0x1;
pub const FRAME_CANCEL_PUSH: u64 = 0x3;
pub const FRAME_SETTINGS: u64 = 0x4;
pub const FRAME_PUSH_PROMISE: u64 = 0x5;
pub const FRAME_GOAWAY: u64 = 0x7;
pub const FRAME_MAX_PUSH_ID: u64 = 0xd;

/// Unidirectional stream types.
pub const STREAM_CONTROL: u64 = 0x00;
pub const STREAM_PUSH: u64 = 0x01;
pub const STREAM_QPACK_ENCODER: u64 = 0x02;
pub const STREAM_QPACK_DECODER: u64 = 0x03;

/// Write a QUIC variable-length integer (RFC 9000 §16).
pub fn put_varint(out: &mut BytesMut, value: u64) {
    if value < 1 << 6 {
        out.put_u8(value as u8);
    } else if value < 1 << 14 {
        out.put_u16(0x4000 | value as u16);
    } else if value < 1 << 30 {
        out.put_u32(0x8000_0000 | value as u32);
    } else {
        out.put_u64(0xc000_0000_0000_0000 | value);
    }
}

/// Read a varint at `*pos`, advancing it. Returns `(value, encoded_len)`;
/// `None`-like truncation is an error.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Result<(u64, usize)> {
    let first = *buf
        .get(*pos)
        .ok_or_else(|| Error::protocol("h3_varint", "truncated varint"))?;
    let len = 1usize << (first >> 6);
    if *pos + len > buf.len() {
        return Err(Error::protocol("h3_varint", "truncated varint"));
    }
    let mut value = u64::from(first & 0x3f);
    for i in 1..len {
        value = (value << 8) | u64::from(buf[*pos + i]);
    }
    *pos += len;
    Ok((value, len))
}

/// Try to read a varint from a possibly incomplete buffer.
pub fn try_read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    let len = 1usize << (first >> 6);
    if *pos + len > buf.len() {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for i in 1..len {
        value = (value << 8) | u64::from(buf[*pos + i]);
    }
    *pos += len;
    Some(value)
}

/// A GREASE settings identifier (`0x1f * N + 0x21`) with a non-zero value,
/// both derived from the session seed so the SETTINGS frame is stable for
/// the life of the session.
pub fn grease_setting(seed: ShuffleSeed) -> (u64, u64) {
    let n = seed.derive(0x4833_5345); // independent draw per concern
    let id = 0x1f * (n % 0x2000) + 0x21;
    let value = (seed.derive(0x4833_5356) % 0x3fff) + 1;
    (id, value)
}

/// Serialize the control-stream preamble: stream type then SETTINGS with
/// the preset entries in enumeration order plus one GREASE setting.
pub fn control_stream_preamble(settings: &[(u64, u64)], seed: ShuffleSeed) -> Bytes {
    let mut payload = BytesMut::with_capacity(64);
    for &(id, value) in settings {
        put_varint(&mut payload, id);
        put_varint(&mut payload, value);
    }
    let (gid, gvalue) = grease_setting(seed);
    put_varint(&mut payload, gid);
    put_varint(&mut payload, gvalue);

    let mut out = BytesMut::with_capacity(payload.len() + 8);
    put_varint(&mut out, STREAM_CONTROL);
    put_varint(&mut out, FRAME_SETTINGS);
    put_varint(&mut out, payload.len() as u64);
    out.extend_from_slice(&payload);
    out.freeze()
}

/// Parse a SETTINGS payload into (id, value) pairs, order preserved.
pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u64, u64)>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let (id, _) = read_varint(payload, &mut pos)?;
        let (value, _) = read_varint(payload, &mut pos)?;
        entries.push((id, value));
    }
    Ok(entries)
}

/// Wrap a frame: type varint, length varint, payload.
pub fn frame(frame_type: u64, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 8);
    put_varint(&mut out, frame_type);
    put_varint(&mut out, payload.len() as u64);
    out.extend_from_slice(payload);
    out.freeze()
}

/// A frame parsed out of a request-stream buffer.
#[derive(Debug)]
pub struct ParsedFrame {
    pub frame_type: u64,
    pub payload: Bytes,
    /// Total bytes consumed from the buffer.
    pub consumed: usize,
}

/// Try to parse one frame from the head of `buf`. Returns `None` until the
/// whole frame is buffered.
pub fn try_parse_frame(buf: &[u8]) -> Result<Option<ParsedFrame>> {
    let mut pos = 0usize;
    let Some(frame_type) = try_read_varint(buf, &mut pos) else {
        return Ok(None);
    };
    let Some(len) = try_read_varint(buf, &mut pos) else {
        return Ok(None);
    };
    let len = usize::try_from(len)
        .map_err(|_| Error::protocol("h3_frame", "oversized frame length"))?;
    if buf.len() < pos + len {
        return Ok(None);
    }
    Ok(Some(ParsedFrame {
        frame_type,
        payload: Bytes::copy_from_slice(&buf[pos..pos + len]),
        consumed: pos + len,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;

    #[test]
    fn test_varint_roundtrip() {
        for v in [0u64, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, u64::MAX >> 2] {
            let mut out = BytesMut::new();
            put_varint(&mut out, v);
            let mut pos = 0;
            let (decoded, len) = read_varint(&out, &mut pos).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(len, out.len());
        }
    }

    #[test]
    fn test_settings_enumeration_order_plus_grease() {
        let preset = fingerprint::get("chrome-145").unwrap();
        let seed = ShuffleSeed(99);
        let preamble = control_stream_preamble(&preset.h3_settings, seed);

        let mut pos = 0;
        let (stream_type, _) = read_varint(&preamble, &mut pos).unwrap();
        assert_eq!(stream_type, STREAM_CONTROL);
        let (frame_type, _) = read_varint(&preamble, &mut pos).unwrap();
        assert_eq!(frame_type, FRAME_SETTINGS);
        let (len, _) = read_varint(&preamble, &mut pos).unwrap();
        assert_eq!(pos + len as usize, preamble.len());

        let entries = parse_settings(&preamble[pos..]).unwrap();
        assert_eq!(entries.len(), preset.h3_settings.len() + 1);
        // Preset entries in enumeration order.
        assert_eq!(&entries[..preset.h3_settings.len()], &preset.h3_settings[..]);
        // GREASE entry: reserved id pattern, non-zero id and value.
        let (gid, gvalue) = entries[entries.len() - 1];
        assert_eq!((gid - 0x21) % 0x1f, 0);
        assert_ne!(gid, 0);
        assert_ne!(gvalue, 0);
    }

    #[test]
    fn test_grease_setting_stable_per_seed() {
        assert_eq!(grease_setting(ShuffleSeed(5)), grease_setting(ShuffleSeed(5)));
        assert_ne!(grease_setting(ShuffleSeed(5)), grease_setting(ShuffleSeed(6)));
    }

    #[test]
    fn test_partial_frame_parse() {
        let full = frame(FRAME_HEADERS, b"abcdef");
        assert!(try_parse_frame(&full[..3]).unwrap().is_none());
        let parsed = try_parse_frame(&full).unwrap().unwrap();
        assert_eq!(parsed.frame_type, FRAME_HEADERS);
        assert_eq!(parsed.payload.as_ref(), b"abcdef");
        assert_eq!(parsed.consumed, full.len());
    }
}
