//! HTTP/1.1 wire behavior against a mock server.

mod helpers;

use helpers::mock_h1_server::{MockH1Server, OK_CHUNKED, OK_CLOSE, OK_SIZED};
use httpcloak::{Request, Transport, TransportOptions};

fn transport() -> Transport {
    Transport::new("chrome-145", TransportOptions::default()).unwrap()
}

#[tokio::test]
async fn test_plaintext_url_uses_h1() {
    let server = MockH1Server::start(OK_SIZED).await.unwrap();
    let t = transport();

    let mut resp = t
        .round_trip(Request::get(server.url("/")).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.protocol, "h1");
    assert_eq!(resp.bytes().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_preset_headers_in_preset_order() {
    let server = MockH1Server::start(OK_SIZED).await.unwrap();
    let t = transport();

    let mut resp = t
        .round_trip(
            Request::get(server.url("/page"))
                .unwrap()
                .header("X-Custom", "v"),
        )
        .await
        .unwrap();
    let _ = resp.bytes().await.unwrap();

    let heads = server.request_heads().await;
    let head = &heads[0];
    assert!(head.starts_with("GET /page HTTP/1.1\r\n"));

    // Preset-ordered defaults appear before user headers; names carry
    // canonical H1 casing.
    let ua = head.find("User-Agent:").expect("user-agent present");
    let accept = head.find("Accept:").expect("accept present");
    let lang = head.find("Accept-Language:").expect("accept-language present");
    let custom = head.find("X-Custom: v").expect("user header present");
    assert!(ua < accept && accept < lang, "preset order preserved");
    assert!(custom > lang, "user headers trail the declared order");
    assert!(head.contains("Chrome/145"));
}

#[tokio::test]
async fn test_user_header_overrides_preset_default() {
    let server = MockH1Server::start(OK_SIZED).await.unwrap();
    let t = transport();

    let mut resp = t
        .round_trip(
            Request::get(server.url("/"))
                .unwrap()
                .header("User-Agent", "MyBot/1.0"),
        )
        .await
        .unwrap();
    let _ = resp.bytes().await.unwrap();

    let heads = server.request_heads().await;
    assert!(heads[0].contains("User-Agent: MyBot/1.0"));
    assert!(!heads[0].contains("Chrome/145"));
}

#[tokio::test]
async fn test_tls_only_sends_only_user_headers() {
    let server = MockH1Server::start(OK_SIZED).await.unwrap();
    let t = Transport::new(
        "chrome-145",
        TransportOptions {
            tls_only: true,
            ..Default::default()
        },
    )
    .unwrap();

    let mut resp = t
        .round_trip(
            Request::get(server.url("/"))
                .unwrap()
                .header("User-Agent", "MyBot/1.0")
                .header("X-Custom", "v"),
        )
        .await
        .unwrap();
    let _ = resp.bytes().await.unwrap();

    let heads = server.request_heads().await;
    let head = &heads[0];
    assert!(head.contains("User-Agent: MyBot/1.0"));
    assert!(head.contains("X-Custom: v"));
    assert!(!head.contains("Sec-Ch-Ua"), "no preset sec-ch-ua headers");
    assert!(!head.contains("Accept-Language"), "no preset accept headers");
}

#[tokio::test]
async fn test_chunked_body_decoded() {
    let server = MockH1Server::start(OK_CHUNKED).await.unwrap();
    let t = transport();

    let mut resp = t
        .round_trip(Request::get(server.url("/")).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.bytes().await.unwrap(), "hello world");
}

#[tokio::test]
async fn test_keep_alive_connection_reused() {
    let server = MockH1Server::start(OK_SIZED).await.unwrap();
    let t = transport();

    let mut first = t
        .round_trip(Request::get(server.url("/a")).unwrap())
        .await
        .unwrap();
    let _ = first.bytes().await.unwrap();
    assert!(!first.reused);

    // Allow the body task to return the lease to the pool.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut second = t
        .round_trip(Request::get(server.url("/b")).unwrap())
        .await
        .unwrap();
    let _ = second.bytes().await.unwrap();
    assert!(second.reused, "keep-alive connection should be reused");

    // Reused connections report zero connection-formation timings.
    assert_eq!(second.timing.dns_lookup, 0.0);
    assert_eq!(second.timing.tcp_connect, 0.0);
    assert_eq!(second.timing.tls_handshake, 0.0);
    assert!(second.timing.total >= 0.0);
}

#[tokio::test]
async fn test_connection_close_not_reused() {
    let server = MockH1Server::start(OK_CLOSE).await.unwrap();
    let t = transport();

    let mut first = t
        .round_trip(Request::get(server.url("/")).unwrap())
        .await
        .unwrap();
    let _ = first.bytes().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut second = t
        .round_trip(Request::get(server.url("/")).unwrap())
        .await
        .unwrap();
    let _ = second.bytes().await.unwrap();
    assert!(!second.reused, "Connection: close forbids reuse");
}

#[tokio::test]
async fn test_post_gets_content_length() {
    let server = MockH1Server::start(OK_SIZED).await.unwrap();
    let t = transport();

    let mut resp = t
        .round_trip(
            Request::post(server.url("/submit"))
                .unwrap()
                .body("payload"),
        )
        .await
        .unwrap();
    let _ = resp.bytes().await.unwrap();

    let heads = server.request_heads().await;
    assert!(heads[0].contains("Content-Length: 7"));
    assert!(heads[0].contains("payload"));
}
