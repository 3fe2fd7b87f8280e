//! TLS session and ECH caches.
//!
//! Session states are keyed by `(preset, protocol, host, port)` so a preset
//! or protocol switch can never resume another identity's ticket. ECH
//! config bytes are cached separately under `(preset, host, port)` because
//! resumption must reuse the exact config that was in force when the ticket
//! was issued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::cache::{self, BackendHandle};

/// Entries older than this are ignored (and evicted on access).
pub const SESSION_TTL: Duration = Duration::from_secs(23 * 3600);

/// Maximum session states retained per host key.
const MAX_SESSIONS_PER_HOST: usize = 32;

/// Cache key for a session state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub preset: String,
    pub protocol: &'static str,
    pub host: String,
    pub port: u16,
}

impl SessionKey {
    pub fn new(preset: &str, protocol: &'static str, host: &str, port: u16) -> Self {
        Self {
            preset: preset.to_string(),
            protocol,
            host: host.to_string(),
            port,
        }
    }

    fn backend_key(&self) -> String {
        cache::session_key(&self.preset, self.protocol, &self.host, self.port)
    }

    /// `"<protocol>:<host>:<port>"`, the persisted-state map key.
    pub fn state_key(&self) -> String {
        format!("{}:{}:{}", self.protocol, self.host, self.port)
    }
}

/// Opaque session state captured when the peer delivers a ticket.
///
/// `ticket` holds the serialized TLS session (DER for the TCP stack); the
/// QUIC stack stores its combined session blob in `state`. The ECH config
/// in force at issuance rides along so resumption can pin it.
#[derive(Debug, Clone)]
pub struct TlsSessionState {
    pub ticket: Vec<u8>,
    pub state: Vec<u8>,
    pub ech_config: Option<Vec<u8>>,
    /// Unix seconds at creation.
    pub created_at: u64,
}

impl TlsSessionState {
    pub fn new(ticket: Vec<u8>, state: Vec<u8>, ech_config: Option<Vec<u8>>) -> Self {
        Self {
            ticket,
            state,
            ech_config,
            created_at: unix_now(),
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        unix_now().saturating_sub(self.created_at) < ttl.as_secs()
    }

    /// Serialize for the distributed backend / persisted state:
    /// `base64(ticket):base64(state):created_at[:base64(ech)]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut s = format!(
            "{}:{}:{}",
            BASE64.encode(&self.ticket),
            BASE64.encode(&self.state),
            self.created_at
        );
        if let Some(ech) = &self.ech_config {
            s.push(':');
            s.push_str(&BASE64.encode(ech));
        }
        s.into_bytes()
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        let s = std::str::from_utf8(raw).ok()?;
        let mut parts = s.split(':');
        let ticket = BASE64.decode(parts.next()?).ok()?;
        let state = BASE64.decode(parts.next()?).ok()?;
        let created_at = parts.next()?.parse().ok()?;
        let ech_config = match parts.next() {
            Some(e) => Some(BASE64.decode(e).ok()?),
            None => None,
        };
        Some(Self {
            ticket,
            state,
            ech_config,
            created_at,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-host LRU of session states, optionally fronted by a backend.
///
/// Read-mostly: lookups and stores take a short exclusive section; there is
/// no ordering between concurrent reads and writes and readers tolerate
/// absence.
#[derive(Clone)]
pub struct TlsSessionCache {
    inner: Arc<Mutex<HashMap<SessionKey, Vec<TlsSessionState>>>>,
    backend: Option<BackendHandle>,
    ttl: Duration,
}

impl TlsSessionCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            backend: None,
            ttl: SESSION_TTL,
        }
    }

    pub fn with_backend(mut self, backend: BackendHandle) -> Self {
        self.backend = Some(backend);
        self
    }

    #[cfg(test)]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Most recent fresh session for the key, consulting the backend on a
    /// local miss. Stale local entries are evicted on access.
    pub fn get(&self, key: &SessionKey) -> Option<TlsSessionState> {
        {
            let mut map = self.inner.lock().expect("session cache poisoned");
            if let Some(states) = map.get_mut(key) {
                states.retain(|s| s.is_fresh(self.ttl));
                if let Some(state) = states.last() {
                    return Some(state.clone());
                }
                if states.is_empty() {
                    map.remove(key);
                }
            }
        }

        let backend = self.backend.as_ref()?;
        let raw = backend.get(&key.backend_key())?;
        let state = TlsSessionState::decode(&raw)?;
        if !state.is_fresh(self.ttl) {
            return None;
        }
        self.put_local(key.clone(), state.clone());
        Some(state)
    }

    /// Record a freshly delivered session, evicting LRU past the per-host cap.
    pub fn put(&self, key: SessionKey, state: TlsSessionState) {
        if let Some(backend) = &self.backend {
            backend.put(&key.backend_key(), &state.encode());
        }
        self.put_local(key, state);
    }

    fn put_local(&self, key: SessionKey, state: TlsSessionState) {
        let mut map = self.inner.lock().expect("session cache poisoned");
        let states = map.entry(key).or_default();
        states.push(state);
        if states.len() > MAX_SESSIONS_PER_HOST {
            let excess = states.len() - MAX_SESSIONS_PER_HOST;
            states.drain(..excess);
        }
    }

    /// Drop the states for one key (e.g. the server refused resumption).
    pub fn remove(&self, key: &SessionKey) {
        self.inner.lock().expect("session cache poisoned").remove(key);
        if let Some(backend) = &self.backend {
            backend.delete(&key.backend_key());
        }
    }

    pub fn clear(&self) {
        self.inner.lock().expect("session cache poisoned").clear();
    }

    /// Snapshot for session persistence: latest state per key.
    pub fn snapshot(&self) -> Vec<(SessionKey, TlsSessionState)> {
        self.inner
            .lock()
            .expect("session cache poisoned")
            .iter()
            .filter_map(|(k, v)| v.last().map(|s| (k.clone(), s.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("session cache poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TlsSessionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// ECH config cache keyed by `(preset, host, port)`.
#[derive(Clone, Default)]
pub struct EchCache {
    inner: Arc<Mutex<HashMap<(String, String, u16), Vec<u8>>>>,
    backend: Option<BackendHandle>,
}

impl EchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendHandle) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn get(&self, preset: &str, host: &str, port: u16) -> Option<Vec<u8>> {
        let key = (preset.to_string(), host.to_string(), port);
        if let Some(bytes) = self.inner.lock().expect("ech cache poisoned").get(&key) {
            return Some(bytes.clone());
        }
        let backend = self.backend.as_ref()?;
        let bytes = backend.get_ech(&cache::ech_key(preset, host, port))?;
        self.inner
            .lock()
            .expect("ech cache poisoned")
            .insert(key, bytes.clone());
        Some(bytes)
    }

    pub fn put(&self, preset: &str, host: &str, port: u16, bytes: Vec<u8>) {
        if let Some(backend) = &self.backend {
            backend.put_ech(&cache::ech_key(preset, host, port), &bytes);
        }
        self.inner
            .lock()
            .expect("ech cache poisoned")
            .insert((preset.to_string(), host.to_string(), port), bytes);
    }

    pub fn clear(&self) {
        self.inner.lock().expect("ech cache poisoned").clear();
    }

    /// Snapshot for session persistence: host → config bytes.
    pub fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        self.inner
            .lock()
            .expect("ech cache poisoned")
            .iter()
            .map(|((_, host, _), v)| (host.clone(), v.clone()))
            .collect()
    }
}
