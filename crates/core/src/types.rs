// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared data types.
//!
//! All timestamps in the subsystem are expressed in samples at the codec
//! rate (48 kHz), regardless of the capture or playback device rates.

use crate::error::{Result, VoiceError};
use serde::Serialize;

/// The codec sampling rate. Every timebase and stream length is counted in
/// samples at this rate.
pub const SAMPLE_RATE: u64 = 48_000;

/// Summary of one stored stream, as reported to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub id: u64,
    /// Starting position on the movie timeline, in 48 kHz samples.
    pub timebase: u64,
    /// Audible length in samples (pregap and postgap already excluded).
    pub length: u64,
}

/// Interchange formats understood by stream import/export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalFormat {
    /// Linear PCM with a fixed 32-byte header and i32 samples.
    Sox,
    /// Page-structured container of coded packets.
    Ogg,
}

impl std::str::FromStr for ExternalFormat {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sox" | "pcm" => Ok(Self::Sox),
            "ogg" | "opus" => Ok(Self::Ogg),
            other => Err(VoiceError::Configuration(format!("unknown stream format '{other}'"))),
        }
    }
}

/// Parse a timebase argument.
///
/// A plain integer is taken as a sample count; a value suffixed with `s` is
/// taken as seconds and converted at 48 kHz (so `"1.5s"` is 72000).
///
/// # Errors
///
/// Returns `VoiceError::Configuration` on anything that parses as neither.
pub fn parse_timebase(input: &str) -> Result<u64> {
    let bad = || VoiceError::Configuration(format!("bad timebase '{input}'"));
    if let Some(seconds) = input.strip_suffix('s') {
        let seconds: f64 = seconds.parse().map_err(|_| bad())?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(bad());
        }
        // Timeline positions are far below 2^53, so the round-trip through
        // f64 is exact enough here.
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let samples = (seconds * SAMPLE_RATE as f64) as u64;
        Ok(samples)
    } else {
        input.parse().map_err(|_| bad())
    }
}

/// Convert a sample timestamp to seconds for display.
#[allow(clippy::cast_precision_loss)]
pub fn timebase_seconds(ts: u64) -> f64 {
    ts as f64 / SAMPLE_RATE as f64
}
