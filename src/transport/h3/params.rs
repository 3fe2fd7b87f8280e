//! QUIC transport-parameter encoding for the browser-shaped extras.
//!
//! Browsers advertise `version_information` (0x11) and Google's legacy
//! `google_version` (0x4752) in their QUIC ClientHello. The GREASE entry in
//! the available-versions list is nibble-replicated (`0x?a?a?a?a`) and is
//! derived from the session shuffle seed so every connection of a session
//! advertises the same block.

use bytes::{BufMut, Bytes, BytesMut};

use crate::tls::hello::ShuffleSeed;

use super::frames::put_varint;

/// QUIC v1 wire version.
pub const QUIC_V1: u32 = 0x0000_0001;

/// version_information transport parameter (RFC 9368).
pub const TP_VERSION_INFORMATION: u64 = 0x11;

/// Google legacy version parameter.
pub const TP_GOOGLE_VERSION: u64 = 0x4752;

/// Nibble-replicated GREASE version `0x?a?a?a?a` from a seed draw.
pub fn grease_version(seed: ShuffleSeed) -> u32 {
    let nibble = (seed.derive(0x4752_4541) & 0xf) as u32;
    (nibble << 28) | (0xa << 24) | (nibble << 20) | (0xa << 16) | (nibble << 12) | (0xa << 8)
        | (nibble << 4)
        | 0xa
}

/// Encode the browser-extra transport parameters:
/// - `version_information`: chosen = QUICv1, available = [GREASE, QUICv1]
/// - `google_version`: 4 bytes of QUICv1
pub fn extra_transport_params(seed: ShuffleSeed) -> Bytes {
    let mut out = BytesMut::with_capacity(32);

    // version_information: chosen + available list.
    put_varint(&mut out, TP_VERSION_INFORMATION);
    put_varint(&mut out, 12);
    out.put_u32(QUIC_V1);
    out.put_u32(grease_version(seed));
    out.put_u32(QUIC_V1);

    // google_version.
    put_varint(&mut out, TP_GOOGLE_VERSION);
    put_varint(&mut out, 4);
    out.put_u32(QUIC_V1);

    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::h3::frames::read_varint;

    #[test]
    fn test_grease_version_shape() {
        for raw in [0u64, 1, 0xdead_beef, u64::MAX] {
            let v = grease_version(ShuffleSeed(raw));
            // Every odd nibble is 0xa.
            assert_eq!(v & 0x0f0f_0f0f, 0x0a0a_0a0a, "{v:#x}");
            // Replicated random nibble.
            let n = (v >> 28) & 0xf;
            assert_eq!((v >> 20) & 0xf, n);
            assert_eq!((v >> 12) & 0xf, n);
            assert_eq!((v >> 4) & 0xf, n);
        }
    }

    #[test]
    fn test_grease_version_stable_per_seed() {
        let seed = ShuffleSeed(42);
        assert_eq!(grease_version(seed), grease_version(seed));
    }

    #[test]
    fn test_extra_params_layout() {
        let block = extra_transport_params(ShuffleSeed(7));
        let mut pos = 0;

        let (id, _) = read_varint(&block, &mut pos).unwrap();
        assert_eq!(id, TP_VERSION_INFORMATION);
        let (len, _) = read_varint(&block, &mut pos).unwrap();
        assert_eq!(len, 12);
        let chosen = u32::from_be_bytes(block[pos..pos + 4].try_into().unwrap());
        assert_eq!(chosen, QUIC_V1);
        let grease = u32::from_be_bytes(block[pos + 4..pos + 8].try_into().unwrap());
        assert_eq!(grease & 0x0f0f_0f0f, 0x0a0a_0a0a);
        let avail = u32::from_be_bytes(block[pos + 8..pos + 12].try_into().unwrap());
        assert_eq!(avail, QUIC_V1);
        pos += 12;

        let (id, _) = read_varint(&block, &mut pos).unwrap();
        assert_eq!(id, TP_GOOGLE_VERSION);
        let (len, _) = read_varint(&block, &mut pos).unwrap();
        assert_eq!(len, 4);
        let google = u32::from_be_bytes(block[pos..pos + 4].try_into().unwrap());
        assert_eq!(google, QUIC_V1);
        pos += 4;
        assert_eq!(pos, block.len());
    }
}
