//! Safari / WebKit preset data tables.
//!
//! Safari disables RFC 7540 priorities and omits `MAX_FIELD_SECTION_SIZE`
//! and `H3_DATAGRAM` from its HTTP/3 SETTINGS.

use super::preset::{
    h2_setting, h3_setting, header_table, order_list, ClientHelloId, ClientHelloIds, H2Settings,
    Preset, PresetKind, PseudoHeaderOrder,
};

fn safari_h2_settings() -> H2Settings {
    H2Settings {
        header_table_size: 4096,
        enable_push: false,
        max_concurrent_streams: Some(100),
        initial_window_size: 2_097_152,
        max_frame_size: 16384,
        max_header_list_size: 262_144,
        connection_window_update: 10_485_760,
        stream_weight: 255,
        stream_exclusive: false,
        no_rfc7540_priorities: true,
    }
}

fn safari_h2_order() -> Vec<u16> {
    vec![
        h2_setting::ENABLE_PUSH,
        h2_setting::MAX_CONCURRENT_STREAMS,
        h2_setting::INITIAL_WINDOW_SIZE,
        h2_setting::ENABLE_CONNECT_PROTOCOL,
        h2_setting::NO_RFC7540_PRIORITIES,
    ]
}

fn safari_h3_settings() -> Vec<(u64, u64)> {
    vec![
        (h3_setting::QPACK_MAX_TABLE_CAPACITY, 4096),
        (h3_setting::QPACK_BLOCKED_STREAMS, 100),
    ]
}

fn safari_header_order() -> Vec<String> {
    order_list(&[
        "accept",
        "sec-fetch-site",
        "cookie",
        "sec-fetch-dest",
        "accept-language",
        "sec-fetch-mode",
        "user-agent",
        "accept-encoding",
    ])
}

pub fn safari_18() -> Preset {
    let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.2 Safari/605.1.15";
    Preset {
        name: "safari-18",
        kind: PresetKind::Safari,
        user_agent: ua,
        platform_tag: "darwin",
        headers: header_table(&[
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
            ("sec-fetch-site", "none"),
            ("sec-fetch-dest", "document"),
            ("accept-language", "en-US,en;q=0.9"),
            ("sec-fetch-mode", "navigate"),
            ("user-agent", ua),
            ("accept-encoding", "gzip, deflate, br"),
        ]),
        header_order: safari_header_order(),
        pseudo_header_order: PseudoHeaderOrder::Mspa,
        h2_settings: safari_h2_settings(),
        h2_settings_order: safari_h2_order(),
        h3_settings: safari_h3_settings(),
        client_hello_ids: ClientHelloIds {
            tcp: Some(ClientHelloId("safari-18")),
            tcp_psk: Some(ClientHelloId("safari-18-psk")),
            quic: Some(ClientHelloId("safari-18-quic")),
            quic_psk: Some(ClientHelloId("safari-18-quic-psk")),
        },
        supports_h3: true,
    }
}

/// iOS WebKit build. Same engine as desktop Safari, mobile UA and platform
/// tag; Chrome-on-iOS builds reuse this TLS stack.
pub fn safari_18_ios() -> Preset {
    let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.2 Mobile/15E148 Safari/604.1";
    Preset {
        name: "safari-18-ios",
        kind: PresetKind::IosWebkit,
        user_agent: ua,
        platform_tag: "ios",
        headers: header_table(&[
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
            ("sec-fetch-site", "none"),
            ("sec-fetch-dest", "document"),
            ("accept-language", "en-US,en;q=0.9"),
            ("sec-fetch-mode", "navigate"),
            ("user-agent", ua),
            ("accept-encoding", "gzip, deflate, br"),
        ]),
        header_order: safari_header_order(),
        pseudo_header_order: PseudoHeaderOrder::Mspa,
        h2_settings: safari_h2_settings(),
        h2_settings_order: safari_h2_order(),
        h3_settings: safari_h3_settings(),
        client_hello_ids: ClientHelloIds {
            tcp: Some(ClientHelloId("safari-18-ios")),
            tcp_psk: Some(ClientHelloId("safari-18-ios-psk")),
            quic: Some(ClientHelloId("safari-18-ios-quic")),
            quic_psk: Some(ClientHelloId("safari-18-ios-quic-psk")),
        },
        supports_h3: true,
    }
}
