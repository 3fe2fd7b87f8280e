//! Facade protocol selection, support learning and racing.

mod helpers;

use helpers::mock_h1_server::{MockH1Server, OK_SIZED};
use httpcloak::request::HostKey;
use httpcloak::transport::racing::{self, RaceOutcome};
use httpcloak::transport::support::{KnownProtocol, SupportCache};
use httpcloak::{Error, HeaderMap, Request, Response, ResponseBody, Transport, TransportOptions};

fn response(protocol: &'static str) -> Response {
    Response::new(
        200,
        HeaderMap::new(),
        ResponseBody::empty(),
        "https://example.com/".to_string(),
        protocol,
    )
}

#[test]
fn test_support_cache_records_winner() {
    let cache = SupportCache::new();
    let key = HostKey::new("https", "cloudflare.com", 443);
    cache.record(&key, KnownProtocol::H3);
    assert_eq!(cache.get(&key), Some(KnownProtocol::H3));
}

#[test]
fn test_alpn_failure_pins_h1_permanently() {
    let cache = SupportCache::new();
    let key = HostKey::new("https", "legacy.example", 443);
    cache.record(&key, KnownProtocol::H1);
    // A later (spurious) success cannot upgrade the host.
    cache.record(&key, KnownProtocol::H2);
    cache.record(&key, KnownProtocol::H3);
    assert_eq!(cache.get(&key), Some(KnownProtocol::H1));
}

#[tokio::test]
async fn test_race_commits_on_response_not_connect() {
    // The H3 branch "connects" instantly but never produces headers; the
    // race must fall to H2 when H3 errors, not when H3 merely dials.
    let outcome = racing::race(
        async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Err(Error::timeout("h3_round_trip", "no response headers"))
        },
        async {
            tokio::time::sleep(std::time::Duration::from_millis(60)).await;
            Ok(response("h2"))
        },
    )
    .await;
    assert!(matches!(outcome, RaceOutcome::H2(_)));
}

#[tokio::test]
async fn test_race_loser_is_cancelled() {
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let outcome = racing::race(
        async { Ok(response("h3")) },
        async move {
            // If this branch survived cancellation it would signal.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let _ = done_tx.send(());
            Ok(response("h2"))
        },
    )
    .await;
    assert!(matches!(outcome, RaceOutcome::H3(_)));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let mut done_rx = done_rx;
    assert!(
        done_rx.try_recv().is_err(),
        "loser branch must be aborted, not left running"
    );
}

#[tokio::test]
async fn test_forced_protocol_never_falls_back() {
    // Reserve a port, then free it so the dial is refused immediately.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let t = Transport::new(
        "chrome-145",
        TransportOptions {
            protocol: httpcloak::Protocol::Http2,
            ..Default::default()
        },
    )
    .unwrap();

    // Forced H2 reports the H2 dial failure; no H1 attempt is made.
    let req = Request::get(format!("https://127.0.0.1:{}/", port)).unwrap();
    let err = t.round_trip(req).await.unwrap_err();
    assert_eq!(err.protocol, "h2");
    assert_eq!(err.category, httpcloak::ErrorCategory::Network);
}

#[tokio::test]
async fn test_forced_h3_on_preset_without_h3_makes_no_cache_writes() {
    let t = Transport::new(
        "chrome-133",
        TransportOptions {
            protocol: httpcloak::Protocol::Http3,
            ..Default::default()
        },
    )
    .unwrap();
    let err = t
        .round_trip(Request::get("https://example.com/").unwrap())
        .await
        .unwrap_err();
    assert!(err.is_protocol_class());
    assert!(t.session_cache().is_empty());
}

#[tokio::test]
async fn test_per_request_timeout_bounds_the_race() {
    let server = MockH1Server::start(OK_SIZED).await.unwrap();
    let t = Transport::new("chrome-145", TransportOptions::default()).unwrap();

    // An unroutable https target with a tiny request timeout: the deadline
    // fires for the request as a whole.
    let req = Request::get("https://192.0.2.1/") // TEST-NET, never routable
        .unwrap()
        .timeout(std::time::Duration::from_millis(100));
    let started = std::time::Instant::now();
    let err = t.round_trip(req).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < std::time::Duration::from_secs(5));

    // The plaintext server is still reachable afterwards.
    let mut ok = t
        .round_trip(Request::get(server.url("/")).unwrap())
        .await
        .unwrap();
    assert_eq!(ok.bytes().await.unwrap(), "hello");
}
