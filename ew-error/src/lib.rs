//! Unified error handling for Emberwatch
//!
//! This crate provides the error type shared by every Emberwatch component,
//! plus the per-line [`DecodeError`] produced by the line reader.
//! Both use thiserror for Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using EmberwatchError
pub type Result<T> = std::result::Result<T, EmberwatchError>;

/// Unified error type for all Emberwatch operations
#[derive(thiserror::Error, Debug)]
pub enum EmberwatchError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Startup Preconditions
    // ============================================================================
    #[error("Startup precondition failed: {0}")]
    Precondition(String),

    #[error("Required path missing: {path} ({what})")]
    MissingPath {
        path: PathBuf,
        what: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // ============================================================================
    // Producer Process Errors
    // ============================================================================
    #[error("Failed to spawn {producer} producer: {source}")]
    Spawn {
        producer: String,
        source: io::Error,
    },

    #[error("Supervisor already stopped")]
    SupervisorStopped,

    // ============================================================================
    // Sensor Device Errors
    // ============================================================================
    #[error("Serial device error on {path}: {reason}")]
    Serial {
        path: PathBuf,
        reason: String,
    },

    #[error("Lost synchronization with sensor device after {lines} lines")]
    SyncLost {
        lines: usize,
    },

    #[error("Invalid sensor value {raw:?}: {reason}")]
    InvalidSensorValue {
        raw: String,
        reason: String,
    },

    #[error("Sensor device closed the stream")]
    DeviceClosed,

    // ============================================================================
    // Stream Decoding Errors
    // ============================================================================
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl EmberwatchError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid configuration value error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing path error
    pub fn missing_path(path: impl Into<PathBuf>, what: impl Into<String>) -> Self {
        Self::MissingPath {
            path: path.into(),
            what: what.into(),
        }
    }

    /// Create a serial device error
    pub fn serial(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Serial {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// Allow converting from String to EmberwatchError
impl From<String> for EmberwatchError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to EmberwatchError
impl From<&str> for EmberwatchError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

/// A single line could not be turned into text.
///
/// Never fatal to the stream: the reader reports it in place of the line
/// and keeps going.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid UTF-8 after {valid_up_to} bytes in a {len}-byte line")]
    InvalidUtf8 {
        valid_up_to: usize,
        len: usize,
    },

    #[error("line exceeds {limit} bytes and was discarded")]
    LineTooLong {
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = EmberwatchError::missing_path("/usr/bin/matlab", "classifier executable");
        assert_eq!(
            err.to_string(),
            "Required path missing: /usr/bin/matlab (classifier executable)"
        );

        let err = DecodeError::InvalidUtf8 { valid_up_to: 3, len: 5 };
        assert_eq!(err.to_string(), "invalid UTF-8 after 3 bytes in a 5-byte line");
    }
}
