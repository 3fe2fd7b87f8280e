//! Firefox preset data tables.

use super::preset::{
    h2_setting, h3_setting, header_table, order_list, ClientHelloId, ClientHelloIds, H2Settings,
    Preset, PresetKind, PseudoHeaderOrder,
};

pub fn firefox_133() -> Preset {
    let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0";
    Preset {
        name: "firefox-133",
        kind: PresetKind::Firefox,
        user_agent: ua,
        platform_tag: "darwin",
        headers: header_table(&[
            ("user-agent", ua),
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/png,image/svg+xml,*/*;q=0.8",
            ),
            ("accept-language", "en-US,en;q=0.5"),
            ("accept-encoding", "gzip, deflate, br, zstd"),
            ("upgrade-insecure-requests", "1"),
            ("sec-fetch-dest", "document"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-site", "none"),
            ("sec-fetch-user", "?1"),
            ("priority", "u=0, i"),
        ]),
        header_order: order_list(&[
            "user-agent",
            "accept",
            "accept-language",
            "accept-encoding",
            "cookie",
            "upgrade-insecure-requests",
            "sec-fetch-dest",
            "sec-fetch-mode",
            "sec-fetch-site",
            "sec-fetch-user",
            "priority",
        ]),
        pseudo_header_order: PseudoHeaderOrder::Mpas,
        h2_settings: H2Settings {
            header_table_size: 65536,
            enable_push: false,
            max_concurrent_streams: None,
            initial_window_size: 131_072,
            max_frame_size: 16384,
            max_header_list_size: 393_216,
            connection_window_update: 12_517_377,
            stream_weight: 42,
            stream_exclusive: false,
            no_rfc7540_priorities: false,
        },
        h2_settings_order: vec![
            h2_setting::HEADER_TABLE_SIZE,
            h2_setting::ENABLE_PUSH,
            h2_setting::INITIAL_WINDOW_SIZE,
            h2_setting::MAX_FRAME_SIZE,
        ],
        h3_settings: vec![
            (h3_setting::QPACK_MAX_TABLE_CAPACITY, 65536),
            (h3_setting::MAX_FIELD_SECTION_SIZE, 393_216),
            (h3_setting::QPACK_BLOCKED_STREAMS, 20),
        ],
        client_hello_ids: ClientHelloIds {
            tcp: Some(ClientHelloId("firefox-133")),
            tcp_psk: Some(ClientHelloId("firefox-133-psk")),
            quic: Some(ClientHelloId("firefox-133-quic")),
            quic_psk: None,
        },
        supports_h3: true,
    }
}
