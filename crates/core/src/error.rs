// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for VoiceDeck.
//!
//! One enum covers every error kind the subsystem produces, so callers can
//! match on the kind instead of parsing strings. All variants carry a
//! descriptive message.

use thiserror::Error;

/// Main error type for VoiceDeck operations.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Bitrate outside the supported range
    /// - Gain outside ±128 dB
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backing-file corruption: bad magic, truncated chain, impossible
    /// sizes. The current operation is aborted and partial allocations are
    /// released; persisted state stays consistent.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Codec error (encoder/decoder construction, encode failure).
    ///
    /// Decode errors during playback are not reported through this variant;
    /// they are replaced with silence locally so playback stays
    /// phase-aligned.
    #[error("Codec error: {0}")]
    Codec(String),

    /// External container format error (bad header, multistream input,
    /// truncated wire data).
    #[error("Container error: {0}")]
    Container(String),

    /// I/O error on a backing or interchange file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Contract violation by the caller: unknown stream id, no collection
    /// loaded. No state is changed.
    #[error("State error: {0}")]
    State(String),
}

/// Convenience type alias for Results using `VoiceError`.
pub type Result<T> = std::result::Result<T, VoiceError>;

impl From<String> for VoiceError {
    fn from(s: String) -> Self {
        Self::Storage(s)
    }
}

impl From<&str> for VoiceError {
    fn from(s: &str) -> Self {
        Self::Storage(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VoiceError::Configuration("bitrate out of range".to_string());
        assert_eq!(err.to_string(), "Configuration error: bitrate out of range");

        let err = VoiceError::State("no collection loaded".to_string());
        assert_eq!(err.to_string(), "State error: no collection loaded");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VoiceError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert!(err.to_string().contains("file not found"));
    }
}
