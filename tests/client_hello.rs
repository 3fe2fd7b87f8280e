//! ClientHello variant selection and session-stable extension ordering.

use httpcloak::fingerprint::{self, ClientHelloId};
use httpcloak::tls::hello::ClientHelloSpec;
use httpcloak::tls::session::{SessionKey, TlsSessionCache, TlsSessionState};
use httpcloak::{Transport, TransportOptions};

#[test]
fn test_extension_order_identical_across_connections_of_a_session() {
    let transport = Transport::new("chrome-145", TransportOptions::default()).unwrap();
    let seed = transport.shuffle_seed();
    let preset = transport.preset();
    let spec = ClientHelloSpec::for_id(preset.hello_id(false, false).unwrap()).unwrap();

    // The k-th connection derives the same order as the first.
    let first = spec.shuffled_extensions(seed);
    for _ in 0..16 {
        assert_eq!(spec.shuffled_extensions(seed), first);
    }
}

#[test]
fn test_distinct_sessions_draw_distinct_orders() {
    let a = Transport::new("chrome-145", TransportOptions::default()).unwrap();
    let b = Transport::new("chrome-145", TransportOptions::default()).unwrap();
    // Seeds are 64-bit random draws; a collision means the seed plumbing
    // is broken, not bad luck.
    assert_ne!(a.shuffle_seed(), b.shuffle_seed());

    let spec =
        ClientHelloSpec::for_id(a.preset().hello_id(false, false).unwrap()).unwrap();
    assert_ne!(
        spec.shuffled_extensions(a.shuffle_seed()),
        spec.shuffled_extensions(b.shuffle_seed())
    );
}

#[test]
fn test_psk_variant_only_with_fresh_session() {
    let preset = fingerprint::get("chrome-145").unwrap();

    // No session: the non-PSK variant.
    assert_eq!(
        preset.hello_id(false, false),
        Some(ClientHelloId("chrome-145"))
    );
    // With a session: the PSK variant.
    assert_eq!(
        preset.hello_id(false, true),
        Some(ClientHelloId("chrome-145-psk"))
    );
    assert_eq!(
        preset.hello_id(true, true),
        Some(ClientHelloId("chrome-145-quic-psk"))
    );
}

#[test]
fn test_expired_session_forces_non_psk_selection() {
    // The cache refuses stale entries, which is exactly the signal the
    // dialer uses to pick the non-PSK variant.
    let cache = TlsSessionCache::new();
    let key = SessionKey::new("chrome-145", "h2", "example.com", 443);
    let mut state = TlsSessionState::new(vec![1], vec![], None);
    state.created_at = 0; // far past the 23h TTL
    cache.put(key.clone(), state);
    assert!(cache.get(&key).is_none());
}

#[test]
fn test_firefox_quic_has_no_psk_variant() {
    let preset = fingerprint::get("firefox-133").unwrap();
    assert!(!preset.has_psk_variant(true));
    // Falls back to the plain QUIC variant rather than failing.
    assert_eq!(
        preset.hello_id(true, true),
        Some(ClientHelloId("firefox-133-quic"))
    );
}

#[test]
fn test_psk_spec_carries_early_data_and_non_psk_does_not() {
    let psk = ClientHelloSpec::for_id(ClientHelloId("chrome-145-quic-psk")).unwrap();
    assert!(psk.psk);
    assert!(psk.early_data);

    let fresh = ClientHelloSpec::for_id(ClientHelloId("chrome-145-quic")).unwrap();
    assert!(!fresh.psk);
    assert!(!fresh.early_data, "early_data absent on fresh connections");
}
