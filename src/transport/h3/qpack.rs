//! QPACK field-section codec (RFC 9204), static table only.
//!
//! We advertise the preset's dynamic-table capacity in SETTINGS for
//! fingerprint fidelity but never issue encoder-stream instructions, so
//! every emitted field section has a zero required insert count. Servers
//! answer clients that send no encoder instructions the same way, so the
//! decoder treats a non-zero required insert count as a protocol error.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::transport::h2::hpack::huffman_decode;

/// RFC 9204 Appendix A static table.
const STATIC_TABLE: [(&str, &str); 99] = [
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains; preload",
    ),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    (
        "content-security-policy",
        "script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

fn encode_prefix_int(value: usize, prefix_bits: u8, first_byte_flags: u8, out: &mut BytesMut) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.put_u8(first_byte_flags | value as u8);
        return;
    }
    out.put_u8(first_byte_flags | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        out.put_u8((rest % 128 + 128) as u8);
        rest /= 128;
    }
    out.put_u8(rest as u8);
}

fn decode_prefix_int(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let first = *buf
        .get(*pos)
        .ok_or_else(|| Error::protocol("qpack_decode", "truncated integer"))?;
    *pos += 1;
    let mut value = (first as usize) & max_prefix;
    if value < max_prefix {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::protocol("qpack_decode", "truncated integer"))?;
        *pos += 1;
        value = value
            .checked_add(((byte & 0x7f) as usize) << shift)
            .ok_or_else(|| Error::protocol("qpack_decode", "integer overflow"))?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(Error::protocol("qpack_decode", "integer overflow"));
        }
    }
}

fn full_match(name: &[u8], value: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|(n, v)| n.as_bytes() == name && v.as_bytes() == value)
}

fn name_match(name: &[u8]) -> Option<usize> {
    STATIC_TABLE.iter().position(|(n, _)| n.as_bytes() == name)
}

fn encode_string(s: &[u8], prefix_bits: u8, first_byte_flags: u8, out: &mut BytesMut) {
    encode_prefix_int(s.len(), prefix_bits, first_byte_flags, out);
    out.put_slice(s);
}

/// Encode a field section. Headers must already be in wire order with
/// pseudo-headers first.
pub fn encode_field_section(headers: &[(&[u8], &[u8])]) -> Bytes {
    let mut out = BytesMut::with_capacity(128);
    // Static-only: required insert count 0, base 0.
    out.put_u8(0);
    out.put_u8(0);

    for &(name, value) in headers {
        if let Some(i) = full_match(name, value) {
            // Indexed field line, static table (1 T=1, 6-bit index).
            encode_prefix_int(i, 6, 0xc0, &mut out);
        } else if let Some(i) = name_match(name) {
            // Literal with static name reference (01 N=0 T=1, 4-bit index).
            encode_prefix_int(i, 4, 0x50, &mut out);
            encode_string(value, 7, 0x00, &mut out);
        } else {
            // Literal with literal name (001 N=0 H=0, 3-bit length).
            encode_string(name, 3, 0x20, &mut out);
            encode_string(value, 7, 0x00, &mut out);
        }
    }
    out.freeze()
}

fn decode_string(buf: &[u8], pos: &mut usize, prefix_bits: u8, huffman_bit: u8) -> Result<Vec<u8>> {
    let first = *buf
        .get(*pos)
        .ok_or_else(|| Error::protocol("qpack_decode", "truncated string"))?;
    let huffman = first & huffman_bit != 0;
    let len = decode_prefix_int(buf, pos, prefix_bits)?;
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::protocol("qpack_decode", "truncated string"))?;
    let raw = &buf[*pos..end];
    *pos = end;
    if huffman {
        huffman_decode(raw)
    } else {
        Ok(raw.to_vec())
    }
}

fn static_entry(index: usize) -> Result<(String, String)> {
    STATIC_TABLE
        .get(index)
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .ok_or_else(|| Error::protocol("qpack_decode", "static index out of range"))
}

/// Decode a field section into (name, value) pairs.
pub fn decode_field_section(buf: &[u8]) -> Result<Vec<(String, String)>> {
    let mut pos = 0usize;
    let required_insert_count = decode_prefix_int(buf, &mut pos, 8)?;
    if required_insert_count != 0 {
        // We never enable the peer's dynamic table (no encoder stream), so
        // a blocked section can only be a peer bug.
        return Err(Error::protocol(
            "qpack_decode",
            "field section references dynamic table",
        ));
    }
    let _base = decode_prefix_int(buf, &mut pos, 7)?;

    let mut headers = Vec::new();
    while pos < buf.len() {
        let first = buf[pos];
        if first & 0x80 != 0 {
            // Indexed field line; T must be static.
            if first & 0x40 == 0 {
                return Err(Error::protocol("qpack_decode", "dynamic index in static mode"));
            }
            let index = decode_prefix_int(buf, &mut pos, 6)?;
            headers.push(static_entry(index)?);
        } else if first & 0x40 != 0 {
            // Literal with name reference.
            if first & 0x10 == 0 {
                return Err(Error::protocol("qpack_decode", "dynamic name in static mode"));
            }
            let index = decode_prefix_int(buf, &mut pos, 4)?;
            let (name, _) = static_entry(index)?;
            let value = decode_string(buf, &mut pos, 7, 0x80)?;
            headers.push((name, String::from_utf8_lossy(&value).into_owned()));
        } else if first & 0x20 != 0 {
            // Literal with literal name; H bit is 0x08 for the name.
            let name = decode_string(buf, &mut pos, 3, 0x08)?;
            let value = decode_string(buf, &mut pos, 7, 0x80)?;
            headers.push((
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        } else {
            // Post-base forms require dynamic state we never enable.
            return Err(Error::protocol("qpack_decode", "post-base field line"));
        }
    }
    Ok(headers)
}
