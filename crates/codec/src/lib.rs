// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Codec and DSP wrappers: the Opus voice codec (mono, 48 kHz) and a
//! streaming resampler for device-rate conversion.

pub mod resample;
pub mod voice;

pub use resample::StreamResampler;
pub use voice::{
    byte_budget, packet_ticks, VoiceDecoder, VoiceEncoder, CONVERGE_BOUND, FRAME_SIZE,
    MAX_PACKET_SAMPLES, TICK_SAMPLES,
};
