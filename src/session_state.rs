//! Versioned session-state persistence.
//!
//! A saved session captures everything needed to resume an identity in a
//! new process: the preset name, cookie data, TLS session states keyed
//! `"<protocol>:<host>:<port>"`, and the ECH configs those sessions were
//! issued under. Cookie handling itself lives in the outer session layer;
//! the record carries the data so state survives a round trip.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tls::session::{SessionKey, TlsSessionState};
use crate::transport::Transport;

/// Current record version.
pub const SESSION_STATE_VERSION: u32 = 2;

/// Serializable cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CookieState {
    pub domain: String,
    pub path: String,
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub http_only: bool,
}

/// One TLS session entry: base64 blobs plus creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSessionRecord {
    pub ticket: String,
    pub state: String,
    pub created_at: u64,
}

/// The complete saveable session state (version 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub preset: String,
    pub force_http3: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ech_config_domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cookies: Vec<CookieState>,
    pub tls_sessions: HashMap<String, TlsSessionRecord>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ech_configs: HashMap<String, String>,
}

impl SessionState {
    /// Capture the transport's resumable state plus caller-held cookies.
    pub fn capture(transport: &Transport, cookies: Vec<CookieState>) -> Self {
        let now = Utc::now();
        let mut tls_sessions = HashMap::new();
        for (key, state) in transport.session_cache().snapshot() {
            tls_sessions.insert(
                key.state_key(),
                TlsSessionRecord {
                    ticket: BASE64.encode(&state.ticket),
                    state: BASE64.encode(&state.state),
                    created_at: state.created_at,
                },
            );
        }
        let mut ech_configs = HashMap::new();
        for (host, bytes) in transport.ech_cache().snapshot() {
            ech_configs.insert(host, BASE64.encode(&bytes));
        }

        Self {
            version: SESSION_STATE_VERSION,
            preset: transport.preset().name.to_string(),
            force_http3: transport.protocol() == crate::transport::Protocol::Http3,
            ech_config_domain: transport.ech_config_domain().map(str::to_string),
            created_at: now,
            updated_at: now,
            cookies,
            tls_sessions,
            ech_configs,
        }
    }

    /// Seed a transport's caches from this record. The preset is expected
    /// to match (session keys embed it); mismatched entries simply never
    /// resume.
    pub fn restore_into(&self, transport: &Transport) {
        for (key, record) in &self.tls_sessions {
            let mut parts = key.splitn(3, ':');
            let (Some(protocol), Some(host), Some(port)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else { continue };
            let protocol: &'static str = match protocol {
                "h1" => "h1",
                "h2" => "h2",
                "h3" => "h3",
                _ => continue,
            };
            let (Ok(ticket), Ok(state)) =
                (BASE64.decode(&record.ticket), BASE64.decode(&record.state))
            else {
                continue;
            };
            let ech = self
                .ech_configs
                .get(host)
                .and_then(|b| BASE64.decode(b).ok());

            transport.session_cache().put(
                SessionKey::new(&self.preset, protocol, host, port),
                TlsSessionState {
                    ticket,
                    state,
                    ech_config: ech,
                    created_at: record.created_at,
                },
            );
        }
        for (host, config) in &self.ech_configs {
            if let Ok(bytes) = BASE64.decode(config) {
                transport.ech_cache().put(&self.preset, host, 443, bytes);
            }
        }
    }

    /// Serialize to the versioned JSON wire form.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let state: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::request("unmarshal_session", format!("invalid state: {}", e)))?;
        if state.version > SESSION_STATE_VERSION {
            return Err(Error::request(
                "unmarshal_session",
                format!("unsupported session state version {}", state.version),
            ));
        }
        Ok(state)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.marshal()?;
        std::fs::write(path, bytes).map_err(|e| Error::io("save_session", e))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io("load_session", e))?;
        Self::unmarshal(&bytes)
    }
}
