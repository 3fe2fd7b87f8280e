//! Learned per-host protocol support.
//!
//! The cache is monotonic downward: once a host is recorded as `h1`
//! (after an ALPN-class failure) it can never silently upgrade for the
//! life of this cache. `set_preset` replaces the cache wholesale.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::request::HostKey;

/// Best known protocol for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownProtocol {
    H1,
    H2,
    H3,
}

#[derive(Default)]
pub struct SupportCache {
    map: RwLock<HashMap<(String, u16), KnownProtocol>>,
}

impl SupportCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &HostKey) -> Option<KnownProtocol> {
        self.map
            .read()
            .expect("support cache poisoned")
            .get(&(key.host.clone(), key.port))
            .copied()
    }

    /// Record a result. An existing `h1` entry is never overwritten.
    pub fn record(&self, key: &HostKey, protocol: KnownProtocol) {
        let mut map = self.map.write().expect("support cache poisoned");
        let slot = map.entry((key.host.clone(), key.port));
        match slot {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                if *e.get() != KnownProtocol::H1 {
                    e.insert(protocol);
                }
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(protocol);
            }
        }
    }

    pub fn clear(&self) {
        self.map.write().expect("support cache poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("support cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> HostKey {
        HostKey::new("https", "example.com", 443)
    }

    #[test]
    fn test_record_and_get() {
        let cache = SupportCache::new();
        assert!(cache.get(&key()).is_none());
        cache.record(&key(), KnownProtocol::H3);
        assert_eq!(cache.get(&key()), Some(KnownProtocol::H3));
    }

    #[test]
    fn test_h1_is_sticky() {
        let cache = SupportCache::new();
        cache.record(&key(), KnownProtocol::H1);
        cache.record(&key(), KnownProtocol::H3);
        assert_eq!(cache.get(&key()), Some(KnownProtocol::H1));
    }

    #[test]
    fn test_h3_can_downgrade() {
        let cache = SupportCache::new();
        cache.record(&key(), KnownProtocol::H3);
        cache.record(&key(), KnownProtocol::H1);
        assert_eq!(cache.get(&key()), Some(KnownProtocol::H1));
    }

    #[test]
    fn test_ports_are_distinct() {
        let cache = SupportCache::new();
        cache.record(&HostKey::new("https", "example.com", 443), KnownProtocol::H1);
        assert!(cache.get(&HostKey::new("https", "example.com", 8443)).is_none());
    }
}
