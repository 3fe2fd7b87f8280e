//! Session-state save/load and cache seeding.

use httpcloak::tls::session::{SessionKey, TlsSessionState};
use httpcloak::{CookieState, SessionState, Transport, TransportOptions, SESSION_STATE_VERSION};

fn transport() -> Transport {
    Transport::new("chrome-145", TransportOptions::default()).unwrap()
}

#[test]
fn test_save_load_file_roundtrip() {
    let t = transport();
    let preset = t.preset().name.to_string();
    t.session_cache().put(
        SessionKey::new(&preset, "h3", "cloudflare.com", 443),
        TlsSessionState::new(vec![], vec![0xde, 0xad], Some(vec![0xec])),
    );
    t.ech_cache().put(&preset, "cloudflare.com", 443, vec![0xec]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let state = SessionState::capture(
        &t,
        vec![CookieState {
            domain: "cloudflare.com".into(),
            path: "/".into(),
            name: "cf".into(),
            value: "1".into(),
            expires: None,
            secure: true,
            http_only: false,
        }],
    );
    state.save(&path).unwrap();

    let loaded = SessionState::load(&path).unwrap();
    assert_eq!(loaded.version, SESSION_STATE_VERSION);
    assert_eq!(loaded.preset, preset);
    assert_eq!(loaded.cookies.len(), 1);
    assert!(loaded.tls_sessions.contains_key("h3:cloudflare.com:443"));

    // A fresh transport seeded from the record resumes with the exact
    // session state and the exact ECH bytes the ticket was issued under.
    let t2 = transport();
    loaded.restore_into(&t2);
    let restored = t2
        .session_cache()
        .get(&SessionKey::new(&preset, "h3", "cloudflare.com", 443))
        .expect("session restored");
    assert_eq!(restored.state, vec![0xde, 0xad]);
    assert_eq!(restored.ech_config, Some(vec![0xec]));
}

#[test]
fn test_wire_form_is_versioned_json() {
    let t = transport();
    let state = SessionState::capture(&t, vec![]);
    let bytes = state.marshal().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["version"], 2);
    assert!(value["preset"].as_str().unwrap().starts_with("chrome-145"));
    assert!(value["created_at"].is_string());
}

#[test]
fn test_session_keys_do_not_cross_protocols() {
    let t = transport();
    let preset = t.preset().name.to_string();
    t.session_cache().put(
        SessionKey::new(&preset, "h2", "example.com", 443),
        TlsSessionState::new(vec![1], vec![], None),
    );

    let state = SessionState::capture(&t, vec![]);
    let t2 = transport();
    state.restore_into(&t2);

    assert!(t2
        .session_cache()
        .get(&SessionKey::new(&preset, "h2", "example.com", 443))
        .is_some());
    assert!(t2
        .session_cache()
        .get(&SessionKey::new(&preset, "h3", "example.com", 443))
        .is_none());
}

#[test]
fn test_refresh_preserves_session_cache() {
    let t = transport();
    let preset = t.preset().name.to_string();
    t.session_cache().put(
        SessionKey::new(&preset, "h3", "example.com", 443),
        TlsSessionState::new(vec![], vec![7], None),
    );

    // Closing connections (refresh / close_quic_connections) keeps the
    // resumption state intact.
    t.refresh();
    t.close_quic_connections();
    assert_eq!(t.session_cache().len(), 1);
}
