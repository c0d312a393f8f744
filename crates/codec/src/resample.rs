// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Streaming mono resampler.
//!
//! Wraps rubato's fixed-input resampler with the buffering needed to feed
//! it from arbitrarily sized device reads. When the source and target rates
//! match, samples pass through untouched.

use rubato::{FastFixedIn, Resampler};
use voicedeck_core::{Result, VoiceError};

/// Fixed input chunk (10 ms at 48 kHz). Smaller chunks add scheduling
/// overhead, larger ones add latency to the capture path.
const CHUNK_FRAMES: usize = 480;

pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Create a resampler converting `from_rate` to `to_rate`.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Configuration` if either rate is zero or rubato
    /// rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VoiceError::Configuration(format!(
                "invalid resample rates {from_rate} -> {to_rate}"
            )));
        }
        let inner = if from_rate == to_rate {
            None
        } else {
            tracing::debug!(from_rate, to_rate, "creating resampler");
            Some(
                FastFixedIn::<f32>::new(
                    f64::from(to_rate) / f64::from(from_rate),
                    1.0, // Maximum relative ratio change (not used for FastFixedIn)
                    rubato::PolynomialDegree::Linear,
                    CHUNK_FRAMES,
                    1,
                )
                .map_err(|e| {
                    VoiceError::Configuration(format!("failed to create resampler: {e}"))
                })?,
            )
        };
        Ok(Self { inner, pending: Vec::new() })
    }

    /// Queue source-rate samples.
    pub fn feed(&mut self, input: &[f32]) {
        self.pending.extend_from_slice(input);
    }

    /// Number of queued source samples not yet converted.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any queued input (used when recording restarts).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Convert queued samples into `out`, never growing it past `max_len`.
    /// Input is consumed one fixed chunk at a time; a partial chunk stays
    /// queued until more samples arrive.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::Codec` if rubato fails mid-stream.
    pub fn receive(&mut self, out: &mut Vec<f32>, max_len: usize) -> Result<()> {
        match self.inner.as_mut() {
            None => {
                let room = max_len.saturating_sub(out.len()).min(self.pending.len());
                out.extend(self.pending.drain(..room));
            },
            Some(resampler) => {
                while self.pending.len() >= CHUNK_FRAMES {
                    if out.len() + resampler.output_frames_next() > max_len {
                        break;
                    }
                    let chunk = [&self.pending[..CHUNK_FRAMES]];
                    let converted = resampler
                        .process(&chunk, None)
                        .map_err(|e| VoiceError::Codec(format!("resample failed: {e}")))?;
                    out.extend_from_slice(&converted[0]);
                    self.pending.drain(..CHUNK_FRAMES);
                }
            },
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResampler").field("pending", &self.pending.len()).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_moves_samples() {
        let mut rs = StreamResampler::new(48_000, 48_000).unwrap();
        rs.feed(&[0.5; 100]);
        let mut out = Vec::new();
        rs.receive(&mut out, 64).unwrap();
        assert_eq!(out.len(), 64);
        assert_eq!(rs.pending_len(), 36);
        rs.receive(&mut out, 1000).unwrap();
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn test_upsample_ratio() {
        let mut rs = StreamResampler::new(24_000, 48_000).unwrap();
        rs.feed(&vec![0.1; 4800]);
        let mut out = Vec::new();
        rs.receive(&mut out, usize::MAX).unwrap();
        // 10 full chunks at ratio 2.0; rubato keeps a little history, so
        // allow a chunk of slack.
        assert!(out.len() > 8 * 2 * CHUNK_FRAMES, "got {} samples", out.len());
        assert!(rs.pending_len() < CHUNK_FRAMES);
    }

    #[test]
    fn test_output_cap_respected() {
        let mut rs = StreamResampler::new(44_100, 48_000).unwrap();
        rs.feed(&vec![0.0; 44_100]);
        let mut out = Vec::new();
        rs.receive(&mut out, 960).unwrap();
        assert!(out.len() <= 960);
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(StreamResampler::new(0, 48_000).is_err());
        assert!(StreamResampler::new(48_000, 0).is_err());
    }
}
