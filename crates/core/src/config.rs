// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Engine configuration.

use crate::error::{Result, VoiceError};
use serde::Deserialize;

/// Lowest encoder bitrate the engine accepts, in bits per second.
pub const MIN_BITRATE: i32 = 8_000;
/// Highest encoder bitrate the engine accepts, in bits per second.
pub const MAX_BITRATE: i32 = 255_000;

const fn default_bitrate() -> i32 {
    48_000
}

const fn default_max_bitrate() -> i32 {
    MAX_BITRATE
}

/// Recognised engine options.
///
/// `bitrate` is the encoder target; `max_bitrate` bounds the byte budget of
/// a single coded packet. Both live in `[MIN_BITRATE, MAX_BITRATE]`. The
/// serialised names are the option keys the embedder exposes.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(rename = "opus-bitrate")]
    pub bitrate: i32,
    #[serde(rename = "opus-max-bitrate")]
    pub max_bitrate: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { bitrate: default_bitrate(), max_bitrate: default_max_bitrate() }
    }
}

impl EngineConfig {
    /// Validate the configured bitrates.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Configuration` if either value falls outside
    /// `[MIN_BITRATE, MAX_BITRATE]`. Rejection happens before any engine
    /// state is touched.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("bitrate", self.bitrate), ("max_bitrate", self.max_bitrate)] {
            if !(MIN_BITRATE..=MAX_BITRATE).contains(&value) {
                return Err(VoiceError::Configuration(format!(
                    "{name} must be in [{MIN_BITRATE}, {MAX_BITRATE}], got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bitrate, 48_000);
        assert_eq!(config.max_bitrate, 255_000);
    }

    #[test]
    fn test_out_of_range_bitrate_rejected() {
        let config = EngineConfig { bitrate: 4_000, ..EngineConfig::default() };
        assert!(config.validate().is_err());

        let config = EngineConfig { max_bitrate: 500_000, ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }
}
