//! Browser fingerprint presets and their registry.
//!
//! The registry is a read-only catalog: presets are constructed once per
//! lookup from static data tables and never mutated. A generic name such
//! as `chrome-145` resolves to the platform-specific variant at lookup
//! time; the resolved name is what every cache keys on.

mod chrome;
mod firefox;
pub mod preset;
mod safari;

pub use preset::{
    ClientHelloId, ClientHelloIds, H2Settings, Preset, PresetKind, PseudoHeaderOrder,
};

use crate::error::{Error, Result};

/// Preset used when the caller does not name one.
pub const DEFAULT_PRESET: &str = "chrome-145";

/// All registered preset names, in catalog order.
const PRESET_NAMES: &[&str] = &[
    "chrome-145",
    "chrome-145-windows",
    "chrome-145-linux",
    "chrome-143",
    "chrome-133",
    "firefox-133",
    "safari-18",
    "safari-18-ios",
];

/// Look up a preset by name.
///
/// `chrome-145` is platform-detected: on Windows and Linux it resolves to
/// the matching variant, elsewhere to the macOS baseline. All other names
/// resolve to themselves. Unknown names fail with a `Request` error.
pub fn get(name: &str) -> Result<Preset> {
    let resolved = resolve_name(name);
    let preset = match resolved {
        "chrome-145" => chrome::chrome_145(),
        "chrome-145-windows" => chrome::chrome_145_windows(),
        "chrome-145-linux" => chrome::chrome_145_linux(),
        "chrome-143" => chrome::chrome_143(),
        "chrome-133" => chrome::chrome_133(),
        "firefox-133" => firefox::firefox_133(),
        "safari-18" => safari::safari_18(),
        "safari-18-ios" => safari::safari_18_ios(),
        _ => {
            return Err(Error::request(
                "preset_lookup",
                format!("unknown preset: {}", name),
            ))
        }
    };
    debug_assert!(preset.validate().is_ok(), "invalid preset table");
    Ok(preset)
}

/// Names accepted by [`get`].
pub fn available() -> Vec<&'static str> {
    PRESET_NAMES.to_vec()
}

fn resolve_name(name: &str) -> &str {
    if name == "chrome-145" {
        if cfg!(target_os = "windows") {
            return "chrome-145-windows";
        }
        if cfg!(target_os = "linux") {
            return "chrome-145-linux";
        }
    }
    name
}
