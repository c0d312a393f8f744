// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Encode bitrate statistics, reported when the tangent is released and
//! after imports.

use voicedeck_core::SAMPLE_RATE;

#[derive(Debug, Default)]
pub struct BitrateTracker {
    blocks: u64,
    samples: u64,
    bytes: u64,
    min_rate: u32,
    max_rate: u32,
}

impl BitrateTracker {
    pub fn new() -> Self {
        Self { min_rate: u32::MAX, ..Self::default() }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record one encoded block.
    pub fn submit(&mut self, bytes: usize, samples: usize) {
        if samples == 0 {
            return;
        }
        self.blocks += 1;
        self.samples += samples as u64;
        self.bytes += bytes as u64;
        #[allow(clippy::cast_possible_truncation)]
        let rate = (bytes as u64 * 8 * SAMPLE_RATE / samples as u64) as u32;
        self.min_rate = self.min_rate.min(rate);
        self.max_rate = self.max_rate.max(rate);
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn seconds(&self) -> f64 {
        self.samples as f64 / SAMPLE_RATE as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn avg_kbps(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.bytes as f64 / (125.0 * self.samples as f64 / SAMPLE_RATE as f64)
    }
}

impl std::fmt::Display for BitrateTracker {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.blocks == 0 {
            return write!(f, "no blocks encoded");
        }
        write!(
            f,
            "{} bytes for {:.2}s ({} blocks), kbps min {:.1} avg {:.1} max {:.1}",
            self.bytes,
            self.seconds(),
            self.blocks,
            self.min_rate as f64 / 1000.0,
            self.avg_kbps(),
            self.max_rate as f64 / 1000.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_accumulates() {
        let mut tracker = BitrateTracker::new();
        tracker.submit(120, 960);
        tracker.submit(130, 960);
        assert_eq!(tracker.blocks(), 2);
        assert_eq!(tracker.bytes(), 250);
        assert!((tracker.seconds() - 0.04).abs() < 1e-9);
        let text = tracker.to_string();
        assert!(text.contains("250 bytes"));
        assert!(text.contains("2 blocks"));
    }

    #[test]
    fn test_empty_tracker_displays() {
        let tracker = BitrateTracker::new();
        assert_eq!(tracker.to_string(), "no blocks encoded");
    }
}
