//! HTTP/3 wire encodings: control-stream SETTINGS, QUIC transport
//! parameters, QPACK field sections.

use httpcloak::fingerprint;
use httpcloak::tls::hello::ShuffleSeed;
use httpcloak::transport::h3::{frames, params, qpack};

#[test]
fn test_chrome_settings_enumeration_order() {
    let preset = fingerprint::get("chrome-145").unwrap();
    let seed = ShuffleSeed(0xfeed);
    let preamble = frames::control_stream_preamble(&preset.h3_settings, seed);

    let mut pos = 0;
    let (stream_type, _) = frames::read_varint(&preamble, &mut pos).unwrap();
    assert_eq!(stream_type, frames::STREAM_CONTROL);
    let (frame_type, _) = frames::read_varint(&preamble, &mut pos).unwrap();
    assert_eq!(frame_type, frames::FRAME_SETTINGS);
    let (_len, _) = frames::read_varint(&preamble, &mut pos).unwrap();

    let entries = frames::parse_settings(&preamble[pos..]).unwrap();
    let ids: Vec<u64> = entries.iter().map(|&(id, _)| id).collect();

    // Preset order first: QPACK capacity, field-section size, blocked
    // streams, datagram — then the GREASE entry.
    assert_eq!(&ids[..4], &[0x01, 0x06, 0x07, 0x33]);
    let (grease_id, grease_value) = *entries.last().unwrap();
    assert_eq!((grease_id - 0x21) % 0x1f, 0);
    assert_ne!(grease_value, 0);
}

#[test]
fn test_safari_settings_omit_chrome_entries() {
    let preset = fingerprint::get("safari-18").unwrap();
    let preamble = frames::control_stream_preamble(&preset.h3_settings, ShuffleSeed(1));

    let mut pos = 0;
    let _ = frames::read_varint(&preamble, &mut pos).unwrap();
    let _ = frames::read_varint(&preamble, &mut pos).unwrap();
    let _ = frames::read_varint(&preamble, &mut pos).unwrap();
    let entries = frames::parse_settings(&preamble[pos..]).unwrap();

    // No MAX_FIELD_SECTION_SIZE (0x06), no H3_DATAGRAM (0x33); GREASE ids
    // land in the reserved 0x1f*N+0x21 space so they cannot collide.
    assert!(!entries.iter().any(|&(id, _)| id == 0x06 || id == 0x33));
}

#[test]
fn test_settings_stable_within_session_and_vary_across() {
    let preset = fingerprint::get("chrome-145").unwrap();
    let a1 = frames::control_stream_preamble(&preset.h3_settings, ShuffleSeed(10));
    let a2 = frames::control_stream_preamble(&preset.h3_settings, ShuffleSeed(10));
    let b = frames::control_stream_preamble(&preset.h3_settings, ShuffleSeed(11));
    assert_eq!(a1, a2, "same session seed, same bytes");
    assert_ne!(a1, b, "different sessions draw different GREASE");
}

#[test]
fn test_transport_params_version_information() {
    let seed = ShuffleSeed(0x1234);
    let block = params::extra_transport_params(seed);

    let mut pos = 0;
    let (id, _) = frames::read_varint(&block, &mut pos).unwrap();
    assert_eq!(id, params::TP_VERSION_INFORMATION);
    let (len, _) = frames::read_varint(&block, &mut pos).unwrap();
    assert_eq!(len, 12, "chosen + [GREASE, QUICv1]");

    let chosen = u32::from_be_bytes(block[pos..pos + 4].try_into().unwrap());
    let grease = u32::from_be_bytes(block[pos + 4..pos + 8].try_into().unwrap());
    let v1 = u32::from_be_bytes(block[pos + 8..pos + 12].try_into().unwrap());
    assert_eq!(chosen, params::QUIC_V1);
    assert_eq!(grease & 0x0f0f_0f0f, 0x0a0a_0a0a, "nibble-replicated GREASE");
    assert_eq!(v1, params::QUIC_V1);
    pos += 12;

    let (id, _) = frames::read_varint(&block, &mut pos).unwrap();
    assert_eq!(id, params::TP_GOOGLE_VERSION);
    let (len, _) = frames::read_varint(&block, &mut pos).unwrap();
    assert_eq!(len, 4);
    assert_eq!(
        u32::from_be_bytes(block[pos..pos + 4].try_into().unwrap()),
        params::QUIC_V1
    );
}

#[test]
fn test_qpack_section_roundtrip_with_pseudo_order() {
    let preset = fingerprint::get("chrome-145").unwrap();
    let pseudo: [(&[u8], &[u8]); 4] = [
        (b":method", b"GET"),
        (b":authority", b"example.com"),
        (b":scheme", b"https"),
        (b":path", b"/"),
    ];
    let mut list: Vec<(&[u8], &[u8])> = Vec::new();
    for &idx in &preset.pseudo_header_order.indices() {
        list.push(pseudo[idx]);
    }
    list.push((b"user-agent", b"Mozilla/5.0"));

    let section = qpack::encode_field_section(&list);
    let decoded = qpack::decode_field_section(&section).unwrap();
    let names: Vec<&str> = decoded.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![":method", ":scheme", ":authority", ":path", "user-agent"]
    );
}
