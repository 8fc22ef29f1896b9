//! Error types for capture, decoding, history and configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Failures of a single `start()` call on the capture source.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no adapter produced game traffic within {timeout_ms} ms")]
    NoDeviceFound { timeout_ms: u64 },

    #[error("capture device {0} does not exist")]
    DeviceNotFound(String),

    #[error("permission denied opening {device}: {reason}")]
    PermissionDenied { device: String, reason: String },

    #[error("failed to open capture on {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("capture is already running on {0}; call stop() first")]
    AlreadyRunning(String),

    #[error("pcap error")]
    Pcap(#[from] pcap::Error),
}

impl CaptureError {
    /// Classifies a libpcap open failure. libpcap only reports a message, so
    /// permission problems are recognised by their wording.
    pub(crate) fn from_open(device: &str, err: pcap::Error) -> Self {
        let reason = err.to_string();
        let lowered = reason.to_ascii_lowercase();
        if lowered.contains("permission") || lowered.contains("not permitted") || lowered.contains("access is denied") {
            CaptureError::PermissionDenied { device: device.to_string(), reason }
        } else if lowered.contains("no such device") {
            CaptureError::DeviceNotFound(device.to_string())
        } else {
            CaptureError::Open { device: device.to_string(), reason }
        }
    }
}

/// A framed message whose record failed its consistency checks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record for opcode {opcode:#06x} truncated: needed {needed} bytes at offset {offset}")]
    Truncated { opcode: u16, offset: usize, needed: usize },

    #[error("record for opcode {opcode:#06x} has invalid UTF-8 in a string field")]
    InvalidUtf8 { opcode: u16 },

    #[error("record for opcode {opcode:#06x} left {remaining} trailing bytes")]
    TrailingBytes { opcode: u16, remaining: usize },

    #[error("record for opcode {opcode:#06x} has unknown entity kind {kind}")]
    InvalidEntityKind { opcode: u16, kind: u8 },

    #[error("message of {0} bytes is too short to carry an opcode")]
    MissingOpcode(usize),
}

/// An event that cannot be laid out in the wire format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{field} is {len} bytes; strings are limited to 65535")]
    StringTooLong { field: &'static str, len: usize },
}

/// Failures while persisting a session snapshot. The in-memory store is never
/// touched by these.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to create history directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to publish snapshot {from} -> {to}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {what}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot directory {0} already exists")]
    AlreadyExists(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config {path} is not valid JSON")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
