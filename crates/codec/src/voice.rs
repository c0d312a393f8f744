// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Thin wrappers around the Opus codec.
//!
//! The rest of the subsystem never touches the codec crate directly; in
//! particular, the encoder lookahead is surfaced here so callers only know
//! "this many samples to discard at the start of decoded output".

use voicedeck_core::{Result, VoiceError};

/// Samples per tick; packet lengths on disk are stored in ticks.
pub const TICK_SAMPLES: u32 = 120;

/// Encode frame size in samples (20 ms at 48 kHz).
pub const FRAME_SIZE: usize = 960;

/// Maximum PCM output of a single coded packet (120 ms at 48 kHz).
pub const MAX_PACKET_SAMPLES: usize = 5760;

/// Decoder state converges within this many samples, so packets farther
/// from the target can be skipped without decoding.
pub const CONVERGE_BOUND: u64 = 5760;

/// Byte budget for one coded block, derived from the configured maximum
/// bitrate: `max_bitrate` bits/s over `block` samples at 48 kHz.
#[allow(clippy::cast_sign_loss)]
pub fn byte_budget(max_bitrate: i32, block: usize) -> usize {
    max_bitrate as usize * block / 384_000
}

/// Number of ticks a coded packet spans, from its table-of-contents byte.
///
/// Returns 0 for packets whose layout is invalid (a code-3 packet claiming
/// more than 120 ms).
#[allow(clippy::cast_possible_truncation)]
pub fn packet_ticks(packet: &[u8]) -> u8 {
    if packet.is_empty() {
        return 0;
    }
    let toc = packet[0];
    let mut per_frame: u8 = (if toc >= 0x70 { 1 } else { 4 }) << ((toc >> 3) & 3);
    per_frame = per_frame.min(24);
    let frames: u8 = if packet.len() < 2 { 255 } else { packet[1] & 0x3F };
    let total = u16::from(per_frame) * u16::from(frames);
    match toc & 3 {
        0 => per_frame,
        1 | 2 => per_frame << 1,
        3 if total <= 48 => total as u8,
        _ => 0,
    }
}

/// Mono 48 kHz voice encoder.
pub struct VoiceEncoder {
    inner: opus::Encoder,
    scratch: Vec<u8>,
}

impl VoiceEncoder {
    /// Create an encoder with the given target bitrate.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Codec` if the codec rejects the configuration.
    pub fn new(bitrate: i32) -> Result<Self> {
        let mut inner =
            opus::Encoder::new(48_000, opus::Channels::Mono, opus::Application::Voip)
                .map_err(|e| VoiceError::Codec(format!("encoder construction failed: {e}")))?;
        inner
            .set_bitrate(opus::Bitrate::Bits(bitrate))
            .map_err(|e| VoiceError::Codec(format!("failed to set bitrate: {e}")))?;
        Ok(Self { inner, scratch: vec![0u8; 4000] })
    }

    /// Reset codec state and apply a (possibly changed) target bitrate.
    /// Called on every positive tangent edge.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Codec` if the codec rejects either control.
    pub fn reset(&mut self, bitrate: i32) -> Result<()> {
        self.inner
            .reset_state()
            .map_err(|e| VoiceError::Codec(format!("encoder reset failed: {e}")))?;
        self.inner
            .set_bitrate(opus::Bitrate::Bits(bitrate))
            .map_err(|e| VoiceError::Codec(format!("failed to set bitrate: {e}")))?;
        Ok(())
    }

    /// Encoder lookahead in samples. Recorded as the pregap of streams
    /// produced by this encoder.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Codec` if the codec query fails.
    pub fn lookahead(&mut self) -> Result<u32> {
        let samples = self
            .inner
            .get_lookahead()
            .map_err(|e| VoiceError::Codec(format!("lookahead query failed: {e}")))?;
        #[allow(clippy::cast_sign_loss)]
        let samples = samples.max(0) as u32;
        Ok(samples)
    }

    /// Encode one frame under a byte budget. `pcm.len()` must be a legal
    /// frame size (120, 240, 480 or 960 samples).
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Codec` on encode failure (including a budget
    /// too small for any packet).
    pub fn encode_frame(&mut self, pcm: &[f32], max_bytes: usize) -> Result<Vec<u8>> {
        let budget = max_bytes.min(self.scratch.len()).max(2);
        let written = self
            .inner
            .encode_float(pcm, &mut self.scratch[..budget])
            .map_err(|e| VoiceError::Codec(format!("encode failed: {e}")))?;
        Ok(self.scratch[..written].to_vec())
    }
}

impl std::fmt::Debug for VoiceEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceEncoder").finish_non_exhaustive()
    }
}

/// Mono 48 kHz voice decoder.
pub struct VoiceDecoder {
    inner: opus::Decoder,
}

impl VoiceDecoder {
    /// # Errors
    ///
    /// Returns `VoiceError::Codec` if the decoder cannot be constructed.
    pub fn new() -> Result<Self> {
        let inner = opus::Decoder::new(48_000, opus::Channels::Mono)
            .map_err(|e| VoiceError::Codec(format!("decoder construction failed: {e}")))?;
        Ok(Self { inner })
    }

    /// Decode one packet into `out`, returning the number of samples
    /// produced.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Codec` on a malformed packet. Callers on the
    /// playback path substitute silence instead of propagating.
    pub fn decode(&mut self, packet: &[u8], out: &mut [f32]) -> Result<usize> {
        self.inner
            .decode_float(packet, out, false)
            .map_err(|e| VoiceError::Codec(format!("decode failed: {e}")))
    }
}

impl std::fmt::Debug for VoiceDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceDecoder").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut enc = VoiceEncoder::new(48_000).unwrap();
        let mut dec = VoiceDecoder::new().unwrap();

        let pcm = vec![0.25f32; FRAME_SIZE];
        let packet = enc.encode_frame(&pcm, byte_budget(255_000, FRAME_SIZE)).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() <= byte_budget(255_000, FRAME_SIZE));

        let mut out = vec![0f32; MAX_PACKET_SAMPLES];
        let decoded = dec.decode(&packet, &mut out).unwrap();
        assert_eq!(decoded, FRAME_SIZE);
    }

    #[test]
    fn test_encoded_packet_reports_its_ticks() {
        let mut enc = VoiceEncoder::new(48_000).unwrap();
        for block in [120usize, 240, 480, 960] {
            let pcm = vec![0.1f32; block];
            let packet = enc.encode_frame(&pcm, 1276).unwrap();
            #[allow(clippy::cast_possible_truncation)]
            let expected = (block / TICK_SAMPLES as usize) as u8;
            assert_eq!(packet_ticks(&packet), expected, "block size {block}");
        }
    }

    #[test]
    fn test_packet_ticks_edge_cases() {
        assert_eq!(packet_ticks(&[]), 0);
        // Code-3 packet with an impossible frame count decodes to 0 ticks.
        assert_eq!(packet_ticks(&[0x03, 0x3F]), 0);
    }

    #[test]
    fn test_lookahead_is_reported() {
        let mut enc = VoiceEncoder::new(48_000).unwrap();
        let lookahead = enc.lookahead().unwrap();
        assert!(lookahead > 0, "voice encoder should have nonzero lookahead");
        assert!(lookahead < FRAME_SIZE as u32);
    }

    #[test]
    fn test_byte_budget() {
        assert_eq!(byte_budget(255_000, FRAME_SIZE), 637);
        assert_eq!(byte_budget(8_000, 120), 2);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let mut dec = VoiceDecoder::new().unwrap();
        let mut out = vec![0f32; MAX_PACKET_SAMPLES];
        assert!(dec.decode(&[0xFF, 0xFE, 0xFD, 4, 4, 4, 4], &mut out).is_err());
    }
}
