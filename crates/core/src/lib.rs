// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared infrastructure for the VoiceDeck voice-commentary subsystem:
//! the error type, the engine configuration and the types that cross crate
//! boundaries.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, MAX_BITRATE, MIN_BITRATE};
pub use error::{Result, VoiceError};
pub use types::{parse_timebase, timebase_seconds, ExternalFormat, StreamInfo, SAMPLE_RATE};
