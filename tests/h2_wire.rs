//! HTTP/2 fingerprint wire assertions against a frame-level mock server.

mod helpers;

use helpers::mock_h2_server::MockH2Server;
use httpcloak::fingerprint;
use httpcloak::transport::h2::connection::H2Connection;
use httpcloak::transport::h2::hpack;
use tokio::net::TcpStream;

async fn connect(preset_name: &str, server: &MockH2Server) -> H2Connection<TcpStream> {
    let preset = fingerprint::get(preset_name).unwrap();
    let tcp = TcpStream::connect(("127.0.0.1", server.port)).await.unwrap();
    H2Connection::connect(
        tcp,
        preset.h2_settings.clone(),
        &preset.h2_settings_order,
        preset.pseudo_header_order,
    )
    .await
    .unwrap()
}

async fn drive_one_request(conn: &mut H2Connection<TcpStream>, headers: Vec<(String, String)>) {
    conn.send_headers("GET", "https", "example.com", "/", &headers, true)
        .await
        .unwrap();
    // Read until our stream sees END_STREAM on DATA.
    loop {
        let (header, payload) = conn.read_frame().await.unwrap();
        let _ = conn.handle_control_frame(&header, &payload).await.unwrap();
        if u8::from(header.frame_type) == 0x0 && header.flags & 0x1 != 0 {
            break;
        }
    }
}

#[tokio::test]
async fn test_first_settings_frame_matches_preset_order() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init();

    let server = MockH2Server::start().await.unwrap();
    let preset = fingerprint::get("chrome-145").unwrap();
    let mut conn = connect("chrome-145", &server).await;
    drive_one_request(&mut conn, vec![]).await;

    let settings = server.frames_of(0x4).await;
    // Exactly one non-ack SETTINGS from the client.
    let non_ack: Vec<_> = settings.iter().filter(|f| f.1 & 0x1 == 0).collect();
    assert_eq!(non_ack.len(), 1);
    let payload = &non_ack[0].3;

    let mut ids = Vec::new();
    let mut values = Vec::new();
    for entry in payload.chunks(6) {
        ids.push(u16::from_be_bytes([entry[0], entry[1]]));
        values.push(u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]));
    }
    assert_eq!(ids, preset.h2_settings_order);
    for (id, value) in ids.iter().zip(&values) {
        assert_eq!(preset.h2_settings.value_for(*id), Some(*value));
    }
}

#[tokio::test]
async fn test_window_update_follows_settings() {
    let server = MockH2Server::start().await.unwrap();
    let preset = fingerprint::get("chrome-145").unwrap();
    let mut conn = connect("chrome-145", &server).await;
    drive_one_request(&mut conn, vec![]).await;

    let frames = server.frames().await;
    // The frame right after the client SETTINGS is the connection
    // WINDOW_UPDATE with the preset increment.
    let settings_pos = frames
        .iter()
        .position(|f| f.0 == 0x4 && f.1 & 0x1 == 0)
        .expect("client SETTINGS recorded");
    let (frame_type, _, stream_id, payload) = &frames[settings_pos + 1];
    assert_eq!(*frame_type, 0x8, "WINDOW_UPDATE immediately after SETTINGS");
    assert_eq!(*stream_id, 0);
    let incr = u32::from_be_bytes(payload[..4].try_into().unwrap());
    assert_eq!(incr, preset.h2_settings.connection_window_update);
}

#[tokio::test]
async fn test_headers_pseudo_and_regular_order() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init();

    let server = MockH2Server::start().await.unwrap();
    let mut conn = connect("chrome-145", &server).await;
    let preset = fingerprint::get("chrome-145").unwrap();

    // Regular headers as the facade would send them: preset-ordered
    // defaults first, user additions at the tail.
    let headers = httpcloak::headers::merge_ordered(
        &preset.headers,
        preset.user_agent,
        &[("x-user-one", "1"), ("x-user-two", "2")]
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect(),
        &preset.header_order,
    );
    drive_one_request(&mut conn, headers).await;

    let headers_frames = server.frames_of(0x1).await;
    let (_, flags, _, payload) = &headers_frames[0];
    // Priority section present for Chrome presets.
    assert!(flags & 0x20 != 0);
    let wire_weight = payload[4];
    assert_eq!(wire_weight as u16, preset.h2_settings.stream_weight - 1);

    let mut decoder = hpack::Decoder::new();
    decoder.set_max_table_size(preset.h2_settings.header_table_size as usize);
    let decoded = decoder.decode(&payload[5..]).unwrap();
    let names: Vec<&str> = decoded.iter().map(|(n, _)| n.as_str()).collect();

    // Chrome pseudo order m,s,a,p.
    assert_eq!(
        &names[..4],
        &[":method", ":scheme", ":authority", ":path"]
    );
    // Declared header order prefix, user headers in insertion order at the
    // tail.
    let sec_ch = names.iter().position(|n| *n == "sec-ch-ua").unwrap();
    let ua = names.iter().position(|n| *n == "user-agent").unwrap();
    let lang = names.iter().position(|n| *n == "accept-language").unwrap();
    assert!(sec_ch < ua && ua < lang);
    let one = names.iter().position(|n| *n == "x-user-one").unwrap();
    let two = names.iter().position(|n| *n == "x-user-two").unwrap();
    assert!(lang < one && one < two);
}

#[tokio::test]
async fn test_firefox_pseudo_order() {
    let server = MockH2Server::start().await.unwrap();
    let mut conn = connect("firefox-133", &server).await;
    drive_one_request(&mut conn, vec![]).await;

    let headers_frames = server.frames_of(0x1).await;
    let (_, flags, _, payload) = &headers_frames[0];
    let block = if flags & 0x20 != 0 { &payload[5..] } else { &payload[..] };

    let preset = fingerprint::get("firefox-133").unwrap();
    let mut decoder = hpack::Decoder::new();
    decoder.set_max_table_size(preset.h2_settings.header_table_size as usize);
    let decoded = decoder.decode(block).unwrap();
    let names: Vec<&str> = decoded.iter().map(|(n, _)| n.as_str()).collect();
    // Firefox: m,p,a,s.
    assert_eq!(
        &names[..4],
        &[":method", ":path", ":authority", ":scheme"]
    );
}

#[tokio::test]
async fn test_safari_sends_no_priority() {
    let server = MockH2Server::start().await.unwrap();
    let mut conn = connect("safari-18", &server).await;
    drive_one_request(&mut conn, vec![]).await;

    let headers_frames = server.frames_of(0x1).await;
    assert!(headers_frames[0].1 & 0x20 == 0, "NO_RFC7540_PRIORITIES preset");

    // And its SETTINGS carry the disable flag.
    let settings = server.frames_of(0x4).await;
    let payload = &settings.iter().find(|f| f.1 & 0x1 == 0).unwrap().3;
    let ids: Vec<u16> = payload
        .chunks(6)
        .map(|e| u16::from_be_bytes([e[0], e[1]]))
        .collect();
    assert!(ids.contains(&0x9), "NO_RFC7540_PRIORITIES advertised");
}
