//! Chrome preset data tables.

use super::preset::{
    h2_setting, h3_setting, header_table, order_list, ClientHelloId, ClientHelloIds, H2Settings,
    Preset, PresetKind, PseudoHeaderOrder,
};

/// Chrome's connection-level WINDOW_UPDATE increment sent after SETTINGS.
const CHROME_WINDOW_UPDATE: u32 = 15_663_105;

fn chrome_h2_settings() -> H2Settings {
    H2Settings {
        header_table_size: 65536,
        enable_push: false,
        max_concurrent_streams: Some(1000),
        initial_window_size: 6_291_456,
        max_frame_size: 16384,
        max_header_list_size: 262_144,
        connection_window_update: CHROME_WINDOW_UPDATE,
        stream_weight: 256,
        stream_exclusive: true,
        no_rfc7540_priorities: false,
    }
}

fn chrome_h2_order() -> Vec<u16> {
    vec![
        h2_setting::HEADER_TABLE_SIZE,
        h2_setting::ENABLE_PUSH,
        h2_setting::MAX_CONCURRENT_STREAMS,
        h2_setting::INITIAL_WINDOW_SIZE,
        h2_setting::MAX_FRAME_SIZE,
        h2_setting::MAX_HEADER_LIST_SIZE,
    ]
}

fn chrome_h3_settings() -> Vec<(u64, u64)> {
    vec![
        (h3_setting::QPACK_MAX_TABLE_CAPACITY, 65536),
        (h3_setting::MAX_FIELD_SECTION_SIZE, 262_144),
        (h3_setting::QPACK_BLOCKED_STREAMS, 100),
        (h3_setting::H3_DATAGRAM, 1),
    ]
}

fn chrome_headers(version: &str, ua: &'static str, platform: &str) -> Vec<(String, String)> {
    let major = version;
    header_table(&[
        (
            "sec-ch-ua",
            &format!(
                r#""Chromium";v="{major}", "Google Chrome";v="{major}", "Not_A Brand";v="24""#
            ),
        ),
        ("sec-ch-ua-mobile", "?0"),
        ("sec-ch-ua-platform", &format!("\"{platform}\"")),
        ("upgrade-insecure-requests", "1"),
        ("user-agent", ua),
        (
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
        ),
        ("sec-fetch-site", "none"),
        ("sec-fetch-mode", "navigate"),
        ("sec-fetch-user", "?1"),
        ("sec-fetch-dest", "document"),
        ("accept-encoding", "gzip, deflate, br, zstd"),
        ("accept-language", "en-US,en;q=0.9"),
    ])
}

fn chrome_header_order() -> Vec<String> {
    order_list(&[
        "sec-ch-ua",
        "sec-ch-ua-mobile",
        "sec-ch-ua-platform",
        "upgrade-insecure-requests",
        "user-agent",
        "accept",
        "sec-fetch-site",
        "sec-fetch-mode",
        "sec-fetch-user",
        "sec-fetch-dest",
        "accept-encoding",
        "accept-language",
        "cookie",
    ])
}

fn chrome_preset(
    name: &'static str,
    version: &str,
    ua: &'static str,
    platform_tag: &'static str,
    platform_hint: &str,
    hello: ClientHelloIds,
    supports_h3: bool,
) -> Preset {
    Preset {
        name,
        kind: PresetKind::Chrome,
        user_agent: ua,
        platform_tag,
        headers: chrome_headers(version, ua, platform_hint),
        header_order: chrome_header_order(),
        pseudo_header_order: PseudoHeaderOrder::Msap,
        h2_settings: chrome_h2_settings(),
        h2_settings_order: chrome_h2_order(),
        h3_settings: chrome_h3_settings(),
        client_hello_ids: hello,
        supports_h3,
    }
}

pub fn chrome_145() -> Preset {
    chrome_preset(
        "chrome-145",
        "145",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/145.0.0.0 Safari/537.36",
        "darwin",
        "macOS",
        ClientHelloIds {
            tcp: Some(ClientHelloId("chrome-145")),
            tcp_psk: Some(ClientHelloId("chrome-145-psk")),
            quic: Some(ClientHelloId("chrome-145-quic")),
            quic_psk: Some(ClientHelloId("chrome-145-quic-psk")),
        },
        true,
    )
}

pub fn chrome_145_windows() -> Preset {
    chrome_preset(
        "chrome-145-windows",
        "145",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/145.0.0.0 Safari/537.36",
        "windows",
        "Windows",
        ClientHelloIds {
            tcp: Some(ClientHelloId("chrome-145")),
            tcp_psk: Some(ClientHelloId("chrome-145-psk")),
            quic: Some(ClientHelloId("chrome-145-quic")),
            quic_psk: Some(ClientHelloId("chrome-145-quic-psk")),
        },
        true,
    )
}

pub fn chrome_145_linux() -> Preset {
    chrome_preset(
        "chrome-145-linux",
        "145",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/145.0.0.0 Safari/537.36",
        "linux",
        "Linux",
        ClientHelloIds {
            tcp: Some(ClientHelloId("chrome-145")),
            tcp_psk: Some(ClientHelloId("chrome-145-psk")),
            quic: Some(ClientHelloId("chrome-145-quic")),
            quic_psk: Some(ClientHelloId("chrome-145-quic-psk")),
        },
        true,
    )
}

pub fn chrome_143() -> Preset {
    chrome_preset(
        "chrome-143",
        "143",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36",
        "darwin",
        "macOS",
        ClientHelloIds {
            tcp: Some(ClientHelloId("chrome-143")),
            tcp_psk: Some(ClientHelloId("chrome-143-psk")),
            quic: Some(ClientHelloId("chrome-143-quic")),
            quic_psk: Some(ClientHelloId("chrome-143-quic-psk")),
        },
        true,
    )
}

/// Chrome 133 kept for older-build emulation; its QUIC hello variants were
/// never captured so the preset is TCP-only.
pub fn chrome_133() -> Preset {
    chrome_preset(
        "chrome-133",
        "133",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36",
        "darwin",
        "macOS",
        ClientHelloIds {
            tcp: Some(ClientHelloId("chrome-133")),
            tcp_psk: Some(ClientHelloId("chrome-133-psk")),
            quic: None,
            quic_psk: None,
        },
        false,
    )
}
