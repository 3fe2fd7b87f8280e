//! Fingerprint preset data model.
//!
//! A preset bundles everything that makes one browser build recognizable on
//! the wire: default headers and their order, HTTP/2 SETTINGS tuple and
//! emission order, HTTP/3 SETTINGS, pseudo-header order, stream priority,
//! and the four ClientHello variant identifiers.

/// Browser family a preset belongs to. Variant-specific wire quirks live in
/// the data tables, not in per-family code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetKind {
    Chrome,
    Firefox,
    Safari,
    AndroidChrome,
    IosWebkit,
}

/// HTTP/2 SETTINGS identifiers (RFC 9113 + RFC 9218).
pub mod h2_setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
    pub const ENABLE_CONNECT_PROTOCOL: u16 = 0x8;
    pub const NO_RFC7540_PRIORITIES: u16 = 0x9;
}

/// HTTP/3 SETTINGS identifiers (RFC 9114 / RFC 9204 / RFC 9297).
pub mod h3_setting {
    pub const QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
    pub const MAX_FIELD_SECTION_SIZE: u64 = 0x06;
    pub const QPACK_BLOCKED_STREAMS: u64 = 0x07;
    pub const ENABLE_CONNECT_PROTOCOL: u64 = 0x08;
    pub const H3_DATAGRAM: u64 = 0x33;
}

/// HTTP/2 SETTINGS values for a preset.
///
/// `stream_weight` is the human-facing weight in `[1, 256]`; the wire
/// carries `weight - 1`.
#[derive(Debug, Clone)]
pub struct H2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    /// WINDOW_UPDATE increment sent on stream 0 right after SETTINGS.
    pub connection_window_update: u32,
    pub stream_weight: u16,
    pub stream_exclusive: bool,
    pub no_rfc7540_priorities: bool,
}

impl H2Settings {
    /// Wire value for a setting id, if this preset defines it.
    pub fn value_for(&self, id: u16) -> Option<u32> {
        match id {
            h2_setting::HEADER_TABLE_SIZE => Some(self.header_table_size),
            h2_setting::ENABLE_PUSH => Some(u32::from(self.enable_push)),
            h2_setting::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams,
            h2_setting::INITIAL_WINDOW_SIZE => Some(self.initial_window_size),
            h2_setting::MAX_FRAME_SIZE => Some(self.max_frame_size),
            h2_setting::MAX_HEADER_LIST_SIZE => Some(self.max_header_list_size),
            h2_setting::ENABLE_CONNECT_PROTOCOL => Some(1),
            h2_setting::NO_RFC7540_PRIORITIES => Some(u32::from(self.no_rfc7540_priorities)),
            _ => None,
        }
    }
}

/// Pseudo-header emission order for HEADERS frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PseudoHeaderOrder {
    /// `:method, :authority, :scheme, :path` (m,a,s,p)
    #[default]
    Masp,
    /// `:method, :path, :authority, :scheme` (m,p,a,s) — Firefox
    Mpas,
    /// `:method, :scheme, :authority, :path` (m,s,a,p) — Chrome
    Msap,
    /// `:method, :scheme, :path, :authority` (m,s,p,a) — Safari
    Mspa,
}

impl PseudoHeaderOrder {
    /// Indices into `[method, authority, scheme, path]` giving emission order.
    pub fn indices(self) -> [usize; 4] {
        match self {
            Self::Masp => [0, 1, 2, 3],
            Self::Mpas => [0, 3, 1, 2],
            Self::Msap => [0, 2, 1, 3],
            Self::Mspa => [0, 2, 3, 1],
        }
    }

    /// Akamai-style fingerprint component.
    pub fn akamai_string(self) -> &'static str {
        match self {
            Self::Masp => "m,a,s,p",
            Self::Mpas => "m,p,a,s",
            Self::Msap => "m,s,a,p",
            Self::Mspa => "m,s,p,a",
        }
    }
}

/// Identifier of one ClientHello variant understood by the TLS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHelloId(pub &'static str);

impl ClientHelloId {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

/// The four variant identifiers a preset may carry. Any may be absent;
/// a missing QUIC id means the preset cannot speak HTTP/3.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientHelloIds {
    pub tcp: Option<ClientHelloId>,
    pub tcp_psk: Option<ClientHelloId>,
    pub quic: Option<ClientHelloId>,
    pub quic_psk: Option<ClientHelloId>,
}

/// An immutable browser fingerprint preset.
#[derive(Debug, Clone)]
pub struct Preset {
    pub name: &'static str,
    pub kind: PresetKind,
    pub user_agent: &'static str,
    pub platform_tag: &'static str,
    /// Default headers in preset order.
    pub headers: Vec<(String, String)>,
    /// Declared header order; unlisted headers follow in insertion order.
    pub header_order: Vec<String>,
    pub pseudo_header_order: PseudoHeaderOrder,
    pub h2_settings: H2Settings,
    /// Setting ids to emit, in order. Must cover every emitted setting.
    pub h2_settings_order: Vec<u16>,
    /// HTTP/3 SETTINGS in enumeration order. A GREASE setting is appended
    /// at serialization time from the session seed.
    pub h3_settings: Vec<(u64, u64)>,
    pub client_hello_ids: ClientHelloIds,
    pub supports_h3: bool,
}

impl Preset {
    /// Validate structural invariants. Called by the registry tests; cheap
    /// enough to run in debug builds at registration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(1..=256).contains(&self.h2_settings.stream_weight) {
            return Err(format!(
                "{}: stream_weight {} outside [1,256]",
                self.name, self.h2_settings.stream_weight
            ));
        }
        for &id in &self.h2_settings_order {
            if self.h2_settings.value_for(id).is_none() {
                return Err(format!("{}: settings order names unset id 0x{:x}", self.name, id));
            }
        }
        if self.supports_h3 && self.client_hello_ids.quic.is_none() {
            return Err(format!("{}: supports_h3 without a quic hello id", self.name));
        }
        Ok(())
    }

    /// The ClientHello id for a (quic, resumption) combination, falling
    /// back to the non-PSK variant when no PSK variant exists.
    pub fn hello_id(&self, quic: bool, psk: bool) -> Option<ClientHelloId> {
        let ids = &self.client_hello_ids;
        match (quic, psk) {
            (false, false) => ids.tcp,
            (false, true) => ids.tcp_psk.or(ids.tcp),
            (true, false) => ids.quic,
            (true, true) => ids.quic_psk.or(ids.quic),
        }
    }

    /// Whether a PSK variant exists for the given transport.
    pub fn has_psk_variant(&self, quic: bool) -> bool {
        if quic {
            self.client_hello_ids.quic_psk.is_some()
        } else {
            self.client_hello_ids.tcp_psk.is_some()
        }
    }
}

/// Build an owned header table from a static slice.
pub(crate) fn header_table(rows: &[(&str, &str)]) -> Vec<(String, String)> {
    rows.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
}

/// Build an owned header-order list from a static slice.
pub(crate) fn order_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}
