//! NSS Key Log Format sink.
//!
//! A sink can be configured per transport or process-wide through the
//! `SSLKEYLOGFILE` environment variable; the per-transport path wins. Lines
//! are appended as BoringSSL/quiche hand them over, one record per line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::error::{Error, Result};

/// Append-only key log writer shared across handshakes.
#[derive(Clone)]
pub struct KeyLogSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl KeyLogSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io("open_keylog", e))?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one NSS-format line. Logging failures are swallowed; secrets
    /// capture must never break a handshake.
    pub fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line.trim_end());
            let _ = file.flush();
        }
    }
}

impl std::fmt::Debug for KeyLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyLogSink({})", self.path.display())
    }
}

/// `std::io::Write` adapter for engines that take a writer (quiche).
pub struct KeyLogWriter(pub KeyLogSink);

impl Write for KeyLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(s) = std::str::from_utf8(buf) {
            for line in s.lines() {
                if !line.is_empty() {
                    self.0.write_line(line);
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

static PROCESS_SINK: OnceLock<RwLock<Option<KeyLogSink>>> = OnceLock::new();

fn process_slot() -> &'static RwLock<Option<KeyLogSink>> {
    PROCESS_SINK.get_or_init(|| {
        let initial = std::env::var("SSLKEYLOGFILE")
            .ok()
            .filter(|p| !p.is_empty())
            .and_then(|p| KeyLogSink::open(p).ok());
        RwLock::new(initial)
    })
}

/// Process-wide sink: `SSLKEYLOGFILE` at first use, unless reconfigured.
pub fn process_sink() -> Option<KeyLogSink> {
    process_slot().read().ok()?.clone()
}

/// Reconfigure the process-wide sink. `None` disables it.
pub fn set_process_sink(sink: Option<KeyLogSink>) {
    if let Ok(mut slot) = process_slot().write() {
        *slot = sink;
    }
}

/// The sink a handshake should use: per-transport override, else process-wide.
pub fn effective_sink(per_transport: Option<&KeyLogSink>) -> Option<KeyLogSink> {
    per_transport.cloned().or_else(process_sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.log");
        let sink = KeyLogSink::open(&path).unwrap();
        sink.write_line("CLIENT_HANDSHAKE_TRAFFIC_SECRET aa bb");
        sink.write_line("SERVER_HANDSHAKE_TRAFFIC_SECRET cc dd\n");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("CLIENT_HANDSHAKE_TRAFFIC_SECRET"));
    }

    #[test]
    fn test_writer_adapter_splits_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.log");
        let sink = KeyLogSink::open(&path).unwrap();
        let mut writer = KeyLogWriter(sink);
        writer.write_all(b"LINE_ONE a b\nLINE_TWO c d\n").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_per_transport_overrides_process() {
        let dir = tempfile::tempdir().unwrap();
        let sink = KeyLogSink::open(dir.path().join("a.log")).unwrap();
        let chosen = effective_sink(Some(&sink)).unwrap();
        assert_eq!(chosen.path(), sink.path());
    }
}
