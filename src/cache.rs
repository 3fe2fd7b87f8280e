//! Optional distributed cache backend for TLS sessions and ECH configs.
//!
//! Backends let a fleet of clients share resumption state. Backend failures
//! are reported through the error callback and never fail the request; they
//! only force a full handshake.

use std::sync::Arc;
use std::time::Duration;

/// Recommended TTL for distributed entries, matching the local session TTL.
pub const RECOMMENDED_TTL: Duration = Duration::from_secs(23 * 3600);

/// Called with `(operation, key, error)` when a backend operation fails.
pub type CacheErrorCallback = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// External cache backend. Implementations are expected to be cheap enough
/// to call inline from the dial path (in-process maps, local daemons);
/// values are the base64 session blob or raw ECH bytes.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
    fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), String>;
    fn delete(&self, key: &str) -> Result<(), String>;

    /// ECH variants exist so backends can route config bytes to a separate
    /// keyspace; the default implementations reuse get/put.
    fn get_ech(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        self.get(key)
    }
    fn put_ech(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), String> {
        self.put(key, value, ttl)
    }
}

/// Key for a distributed TLS session entry.
pub fn session_key(preset: &str, protocol: &str, host: &str, port: u16) -> String {
    format!("httpcloak:sessions:{}:{}:{}:{}", preset, protocol, host, port)
}

/// Key for a distributed ECH config entry.
pub fn ech_key(preset: &str, host: &str, port: u16) -> String {
    format!("httpcloak:ech:{}:{}:{}", preset, host, port)
}

/// Backend plus error callback, as held by the session cache.
#[derive(Clone)]
pub struct BackendHandle {
    pub backend: Arc<dyn CacheBackend>,
    pub on_error: Option<CacheErrorCallback>,
}

impl BackendHandle {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            on_error: None,
        }
    }

    pub fn with_error_callback(mut self, cb: CacheErrorCallback) -> Self {
        self.on_error = Some(cb);
        self
    }

    fn report(&self, op: &str, key: &str, err: &str) {
        tracing::debug!(op, key, err, "cache backend error");
        if let Some(cb) = &self.on_error {
            cb(op, key, err);
        }
    }

    /// Fetch, swallowing errors (a miss forces a full handshake).
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.backend.get(key) {
            Ok(v) => v,
            Err(e) => {
                self.report("get", key, &e);
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: &[u8]) {
        if let Err(e) = self.backend.put(key, value, RECOMMENDED_TTL) {
            self.report("put", key, &e);
        }
    }

    pub fn delete(&self, key: &str) {
        if let Err(e) = self.backend.delete(key) {
            self.report("delete", key, &e);
        }
    }

    pub fn get_ech(&self, key: &str) -> Option<Vec<u8>> {
        match self.backend.get_ech(key) {
            Ok(v) => v,
            Err(e) => {
                self.report("get_ech", key, &e);
                None
            }
        }
    }

    pub fn put_ech(&self, key: &str, value: &[u8]) {
        if let Err(e) = self.backend.put_ech(key, value, RECOMMENDED_TTL) {
            self.report("put_ech", key, &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapBackend {
        map: Mutex<HashMap<String, Vec<u8>>>,
        fail: bool,
    }

    impl CacheBackend for MapBackend {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
            if self.fail {
                return Err("backend down".into());
            }
            Ok(self.map.lock().unwrap().get(key).cloned())
        }
        fn put(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<(), String> {
            if self.fail {
                return Err("backend down".into());
            }
            self.map.lock().unwrap().insert(key.into(), value.to_vec());
            Ok(())
        }
        fn delete(&self, key: &str) -> Result<(), String> {
            self.map.lock().unwrap().remove(key);
            Ok(())
        }
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(
            session_key("chrome-145", "h3", "example.com", 443),
            "httpcloak:sessions:chrome-145:h3:example.com:443"
        );
        assert_eq!(
            ech_key("chrome-145", "example.com", 443),
            "httpcloak:ech:chrome-145:example.com:443"
        );
    }

    #[test]
    fn test_errors_reported_not_raised() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let handle = BackendHandle::new(Arc::new(MapBackend {
            map: Mutex::new(HashMap::new()),
            fail: true,
        }))
        .with_error_callback(Arc::new(move |op, key, err| {
            calls2.lock().unwrap().push((op.to_string(), key.to_string(), err.to_string()));
        }));

        assert!(handle.get("k").is_none());
        handle.put("k", b"v");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "get");
        assert_eq!(calls[1].0, "put");
    }

    #[test]
    fn test_roundtrip() {
        let handle = BackendHandle::new(Arc::new(MapBackend {
            map: Mutex::new(HashMap::new()),
            fail: false,
        }));
        handle.put("k", b"v");
        assert_eq!(handle.get("k").as_deref(), Some(b"v" as &[u8]));
        handle.delete("k");
        assert!(handle.get("k").is_none());
    }
}
