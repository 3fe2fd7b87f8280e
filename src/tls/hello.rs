//! ClientHello variant descriptions and the session-scoped extension shuffle.
//!
//! A [`ClientHelloSpec`] is a data description of one browser build's first
//! handshake message: cipher order, signature algorithms, curves, extension
//! ids and GREASE policy. The concrete byte layout is produced by the
//! BoringSSL engine; the spec tells it which variant to emit.
//!
//! Browsers permute extension order once per process, not per connection.
//! We reproduce that with a [`ShuffleSeed`] drawn once per transport and a
//! deterministic Fisher-Yates permutation, so the k-th connection of a
//! session produces the same extension order as the first.

use crate::error::{Error, Result};
use crate::fingerprint::ClientHelloId;

/// TLS extension ids (IANA).
pub mod ext {
    pub const SERVER_NAME: u16 = 0;
    pub const STATUS_REQUEST: u16 = 5;
    pub const SUPPORTED_GROUPS: u16 = 10;
    pub const EC_POINT_FORMATS: u16 = 11;
    pub const SIGNATURE_ALGORITHMS: u16 = 13;
    pub const ALPN: u16 = 16;
    pub const SCT: u16 = 18;
    pub const PADDING: u16 = 21;
    pub const EXTENDED_MASTER_SECRET: u16 = 23;
    pub const COMPRESS_CERTIFICATE: u16 = 27;
    pub const SESSION_TICKET: u16 = 35;
    pub const PRE_SHARED_KEY: u16 = 41;
    pub const EARLY_DATA: u16 = 42;
    pub const SUPPORTED_VERSIONS: u16 = 43;
    pub const PSK_KEY_EXCHANGE_MODES: u16 = 45;
    pub const KEY_SHARE: u16 = 51;
    pub const APPLICATION_SETTINGS: u16 = 17513;
    pub const ENCRYPTED_CLIENT_HELLO: u16 = 65037;
    pub const RENEGOTIATION_INFO: u16 = 65281;
}

/// Per-session shuffle seed, drawn once per logical session and reused for
/// every connection that session spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleSeed(pub u64);

impl ShuffleSeed {
    pub fn random() -> Self {
        let mut buf = [0u8; 8];
        // getrandom only fails on broken platforms; fall back to a clock-
        // derived seed rather than refusing to build a transport.
        if getrandom::getrandom(&mut buf).is_err() {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos() as u64)
                .unwrap_or(0x9e3779b9);
            return Self(nanos | 1);
        }
        Self(u64::from_le_bytes(buf))
    }

    /// Derive a sub-seed for an independent draw (e.g. the QUIC GREASE
    /// version) without disturbing the extension permutation.
    pub fn derive(self, salt: u64) -> u64 {
        splitmix64(self.0 ^ salt)
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Deterministic Fisher-Yates permutation of `items` driven by `seed`.
pub fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut state = seed;
    for i in (1..items.len()).rev() {
        state = splitmix64(state);
        let j = (state % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

/// Data description of one ClientHello variant.
#[derive(Debug, Clone)]
pub struct ClientHelloSpec {
    pub id: ClientHelloId,
    /// OpenSSL-style cipher names, TLS 1.3 suites first.
    pub cipher_list: Vec<&'static str>,
    pub sigalgs: Vec<&'static str>,
    pub curves: Vec<&'static str>,
    /// Extension ids before shuffling. GREASE slots are inserted by the
    /// engine, not listed here.
    pub extensions: Vec<u16>,
    pub grease: bool,
    /// Carries a `pre_shared_key` extension (resumption variants only).
    pub psk: bool,
    /// May carry `early_data`; suppressed on fresh connections.
    pub early_data: bool,
    pub alpn: Vec<&'static [u8]>,
}

impl ClientHelloSpec {
    /// Resolve a variant identifier to its spec. QUIC variants restrict the
    /// cipher and extension sets to what TLS 1.3 over QUIC permits.
    pub fn for_id(id: ClientHelloId) -> Result<Self> {
        let name = id.as_str();
        let quic = name.contains("-quic");
        let psk = name.ends_with("-psk");

        let spec = if name.starts_with("chrome") {
            Self::chrome(id, quic, psk)
        } else if name.starts_with("firefox") {
            Self::firefox(id, quic, psk)
        } else if name.starts_with("safari") {
            Self::safari(id, quic, psk)
        } else {
            return Err(Error::tls(
                "client_hello",
                format!("unknown ClientHello variant: {}", name),
            ));
        };
        Ok(spec)
    }

    /// Extension ids in the order this session emits them: the shuffled
    /// middle section between the pinned head and tail, matching how
    /// BoringSSL permutes. PSK must come last when present (RFC 8446).
    pub fn shuffled_extensions(&self, seed: ShuffleSeed) -> Vec<u16> {
        let mut exts: Vec<u16> = self
            .extensions
            .iter()
            .copied()
            .filter(|&e| e != ext::PRE_SHARED_KEY)
            .collect();
        shuffle(&mut exts, seed.0);
        if self.psk {
            exts.push(ext::PRE_SHARED_KEY);
        }
        exts
    }

    fn chrome(id: ClientHelloId, quic: bool, psk: bool) -> Self {
        let cipher_list = if quic {
            vec![
                "TLS_AES_128_GCM_SHA256",
                "TLS_AES_256_GCM_SHA384",
                "TLS_CHACHA20_POLY1305_SHA256",
            ]
        } else {
            vec![
                "TLS_AES_128_GCM_SHA256",
                "TLS_AES_256_GCM_SHA384",
                "TLS_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
                "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
                "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
                "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
                "TLS_RSA_WITH_AES_128_GCM_SHA256",
                "TLS_RSA_WITH_AES_256_GCM_SHA384",
                "TLS_RSA_WITH_AES_128_CBC_SHA",
                "TLS_RSA_WITH_AES_256_CBC_SHA",
            ]
        };
        let mut extensions = vec![
            ext::SERVER_NAME,
            ext::EXTENDED_MASTER_SECRET,
            ext::RENEGOTIATION_INFO,
            ext::SUPPORTED_GROUPS,
            ext::EC_POINT_FORMATS,
            ext::SESSION_TICKET,
            ext::ALPN,
            ext::STATUS_REQUEST,
            ext::SIGNATURE_ALGORITHMS,
            ext::SCT,
            ext::KEY_SHARE,
            ext::PSK_KEY_EXCHANGE_MODES,
            ext::SUPPORTED_VERSIONS,
            ext::COMPRESS_CERTIFICATE,
            ext::APPLICATION_SETTINGS,
            ext::ENCRYPTED_CLIENT_HELLO,
        ];
        if quic {
            extensions.retain(|&e| {
                e != ext::EC_POINT_FORMATS
                    && e != ext::SESSION_TICKET
                    && e != ext::EXTENDED_MASTER_SECRET
                    && e != ext::RENEGOTIATION_INFO
            });
        } else {
            extensions.push(ext::PADDING);
        }
        if psk {
            extensions.push(ext::PRE_SHARED_KEY);
        }
        Self {
            id,
            cipher_list,
            sigalgs: vec![
                "ecdsa_secp256r1_sha256",
                "rsa_pss_rsae_sha256",
                "rsa_pkcs1_sha256",
                "ecdsa_secp384r1_sha384",
                "rsa_pss_rsae_sha384",
                "rsa_pkcs1_sha384",
                "rsa_pss_rsae_sha512",
                "rsa_pkcs1_sha512",
            ],
            curves: vec!["X25519MLKEM768", "x25519", "P-256", "P-384"],
            extensions,
            grease: true,
            psk,
            early_data: psk,
            alpn: if quic {
                vec![b"h3"]
            } else {
                vec![b"h2", b"http/1.1"]
            },
        }
    }

    fn firefox(id: ClientHelloId, quic: bool, psk: bool) -> Self {
        let cipher_list = if quic {
            vec![
                "TLS_AES_128_GCM_SHA256",
                "TLS_CHACHA20_POLY1305_SHA256",
                "TLS_AES_256_GCM_SHA384",
            ]
        } else {
            vec![
                "TLS_AES_128_GCM_SHA256",
                "TLS_CHACHA20_POLY1305_SHA256",
                "TLS_AES_256_GCM_SHA384",
                "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
                "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
                "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
                "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
                "TLS_RSA_WITH_AES_128_GCM_SHA256",
                "TLS_RSA_WITH_AES_256_GCM_SHA384",
            ]
        };
        let mut extensions = vec![
            ext::SERVER_NAME,
            ext::EXTENDED_MASTER_SECRET,
            ext::RENEGOTIATION_INFO,
            ext::SUPPORTED_GROUPS,
            ext::EC_POINT_FORMATS,
            ext::SESSION_TICKET,
            ext::ALPN,
            ext::STATUS_REQUEST,
            ext::SIGNATURE_ALGORITHMS,
            ext::KEY_SHARE,
            ext::PSK_KEY_EXCHANGE_MODES,
            ext::SUPPORTED_VERSIONS,
            ext::ENCRYPTED_CLIENT_HELLO,
        ];
        if quic {
            extensions.retain(|&e| {
                e != ext::EC_POINT_FORMATS
                    && e != ext::SESSION_TICKET
                    && e != ext::RENEGOTIATION_INFO
            });
        }
        if psk {
            extensions.push(ext::PRE_SHARED_KEY);
        }
        Self {
            id,
            cipher_list,
            sigalgs: vec![
                "ecdsa_secp256r1_sha256",
                "ecdsa_secp384r1_sha384",
                "ecdsa_secp521r1_sha512",
                "rsa_pss_rsae_sha256",
                "rsa_pss_rsae_sha384",
                "rsa_pss_rsae_sha512",
                "rsa_pkcs1_sha256",
                "rsa_pkcs1_sha384",
                "rsa_pkcs1_sha512",
            ],
            curves: vec!["x25519", "P-256", "P-384", "P-521"],
            extensions,
            // Firefox does not send GREASE values.
            grease: false,
            psk,
            early_data: psk,
            alpn: if quic {
                vec![b"h3"]
            } else {
                vec![b"h2", b"http/1.1"]
            },
        }
    }

    fn safari(id: ClientHelloId, quic: bool, psk: bool) -> Self {
        let cipher_list = if quic {
            vec![
                "TLS_AES_128_GCM_SHA256",
                "TLS_AES_256_GCM_SHA384",
                "TLS_CHACHA20_POLY1305_SHA256",
            ]
        } else {
            vec![
                "TLS_AES_128_GCM_SHA256",
                "TLS_AES_256_GCM_SHA384",
                "TLS_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
                "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
                "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
                "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
                "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
                "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
            ]
        };
        let mut extensions = vec![
            ext::SERVER_NAME,
            ext::EXTENDED_MASTER_SECRET,
            ext::RENEGOTIATION_INFO,
            ext::SUPPORTED_GROUPS,
            ext::EC_POINT_FORMATS,
            ext::ALPN,
            ext::STATUS_REQUEST,
            ext::SIGNATURE_ALGORITHMS,
            ext::SCT,
            ext::KEY_SHARE,
            ext::PSK_KEY_EXCHANGE_MODES,
            ext::SUPPORTED_VERSIONS,
            ext::COMPRESS_CERTIFICATE,
            ext::PADDING,
        ];
        if quic {
            extensions.retain(|&e| {
                e != ext::EC_POINT_FORMATS
                    && e != ext::EXTENDED_MASTER_SECRET
                    && e != ext::RENEGOTIATION_INFO
                    && e != ext::PADDING
            });
        }
        if psk {
            extensions.push(ext::PRE_SHARED_KEY);
        }
        Self {
            id,
            cipher_list,
            sigalgs: vec![
                "ecdsa_secp256r1_sha256",
                "rsa_pss_rsae_sha256",
                "rsa_pkcs1_sha256",
                "ecdsa_secp384r1_sha384",
                "ecdsa_sha1",
                "rsa_pss_rsae_sha384",
                "rsa_pss_rsae_sha384",
                "rsa_pkcs1_sha384",
                "rsa_pss_rsae_sha512",
                "rsa_pkcs1_sha512",
                "rsa_pkcs1_sha1",
            ],
            curves: vec!["x25519", "P-256", "P-384", "P-521"],
            extensions,
            grease: true,
            psk,
            early_data: psk,
            alpn: if quic {
                vec![b"h3"]
            } else {
                vec![b"h2", b"http/1.1"]
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chrome_tcp() -> ClientHelloSpec {
        ClientHelloSpec::for_id(ClientHelloId("chrome-145")).unwrap()
    }

    #[test]
    fn test_shuffle_deterministic_per_seed() {
        let spec = chrome_tcp();
        let seed = ShuffleSeed(0x1234_5678_9abc_def0);
        let first = spec.shuffled_extensions(seed);
        for _ in 0..8 {
            assert_eq!(spec.shuffled_extensions(seed), first);
        }
    }

    #[test]
    fn test_shuffle_varies_across_seeds() {
        let spec = chrome_tcp();
        let a = spec.shuffled_extensions(ShuffleSeed(1));
        let b = spec.shuffled_extensions(ShuffleSeed(2));
        // Distinct seeds should permute differently for a 17-element list;
        // equal outputs would mean the seed is ignored.
        assert_ne!(a, b);
    }

    #[test]
    fn test_shuffle_preserves_element_set() {
        let spec = chrome_tcp();
        let mut shuffled = spec.shuffled_extensions(ShuffleSeed(42));
        let mut original = spec.extensions.clone();
        shuffled.sort_unstable();
        original.sort_unstable();
        assert_eq!(shuffled, original);
    }

    #[test]
    fn test_psk_extension_stays_last() {
        let spec = ClientHelloSpec::for_id(ClientHelloId("chrome-145-psk")).unwrap();
        assert!(spec.psk);
        for seed in [1u64, 7, 999] {
            let exts = spec.shuffled_extensions(ShuffleSeed(seed));
            assert_eq!(*exts.last().unwrap(), ext::PRE_SHARED_KEY);
        }
    }

    #[test]
    fn test_quic_variants_drop_tcp_only_extensions() {
        let spec = ClientHelloSpec::for_id(ClientHelloId("chrome-145-quic")).unwrap();
        assert!(!spec.extensions.contains(&ext::SESSION_TICKET));
        assert!(!spec.extensions.contains(&ext::EC_POINT_FORMATS));
        assert_eq!(spec.alpn, vec![b"h3" as &[u8]]);
    }

    #[test]
    fn test_firefox_no_grease() {
        let spec = ClientHelloSpec::for_id(ClientHelloId("firefox-133")).unwrap();
        assert!(!spec.grease);
        assert!(spec.curves.contains(&"P-521"));
    }
}
