// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The realtime voice-commentary engine.
//!
//! Recording: a push-to-talk tangent gates microphone capture, which is
//! resampled to 48 kHz, encoded, and appended to a stream stamped with the
//! current movie-timeline position. Playback: timeline updates from the
//! emulator start and stop stored streams, which are decoded, mixed and
//! resampled out to the playback device. Both run inside a single driver
//! task cycling every ~15 ms.

pub mod audio;
pub mod engine;
pub mod tracker;


pub use audio::{MemoryAudio, VoiceAudio};
pub use engine::VoiceEngine;
pub use tracker::BitrateTracker;
