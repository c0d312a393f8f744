// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The audio device boundary.
//!
//! The engine never talks to sound hardware directly; the embedder hands
//! it a [`VoiceAudio`] implementation. All calls are non-blocking: the
//! engine polls availability, reads what is there, and writes only while
//! the playback backlog is small.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Microphone capture and speaker playback, at the device's native rates.
/// Samples are mono `f32` at nominal ±1.0.
pub trait VoiceAudio: Send + Sync {
    /// Native capture sampling rate in Hz.
    fn capture_rate(&self) -> u32;

    /// Native playback sampling rate in Hz.
    fn playback_rate(&self) -> u32;

    /// Number of capture samples ready to read.
    fn capture_ready(&self) -> usize;

    /// Read up to `buf.len()` captured samples; returns the count copied.
    fn read_capture(&self, buf: &mut [f32]) -> usize;

    /// Number of queued playback samples the device has not consumed yet.
    fn playback_pending(&self) -> usize;

    /// Queue samples for playback.
    fn write_playback(&self, samples: &[f32]);
}

/// In-memory device: capture reads from a queue the caller fills,
/// playback accumulates into a buffer the caller drains. The playback
/// backlog always reports empty, so the engine never throttles output.
#[derive(Debug)]
pub struct MemoryAudio {
    capture_rate: u32,
    playback_rate: u32,
    capture: Mutex<VecDeque<f32>>,
    playback: Mutex<Vec<f32>>,
}

impl MemoryAudio {
    pub fn new(capture_rate: u32, playback_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            capture_rate,
            playback_rate,
            capture: Mutex::new(VecDeque::new()),
            playback: Mutex::new(Vec::new()),
        })
    }

    /// Queue samples for the engine to capture.
    pub fn push_capture(&self, samples: &[f32]) {
        // Mutex poisoning is a fatal error - standard pattern in Rust
        #[allow(clippy::unwrap_used)]
        self.capture.lock().unwrap().extend(samples.iter().copied());
    }

    /// Take everything the engine has played so far.
    pub fn take_playback(&self) -> Vec<f32> {
        // Mutex poisoning is a fatal error - standard pattern in Rust
        #[allow(clippy::unwrap_used)]
        std::mem::take(&mut *self.playback.lock().unwrap())
    }
}

impl VoiceAudio for MemoryAudio {
    fn capture_rate(&self) -> u32 {
        self.capture_rate
    }

    fn playback_rate(&self) -> u32 {
        self.playback_rate
    }

    fn capture_ready(&self) -> usize {
        // Mutex poisoning is a fatal error - standard pattern in Rust
        #[allow(clippy::unwrap_used)]
        self.capture.lock().unwrap().len()
    }

    fn read_capture(&self, buf: &mut [f32]) -> usize {
        // Mutex poisoning is a fatal error - standard pattern in Rust
        #[allow(clippy::unwrap_used)]
        let mut queue = self.capture.lock().unwrap();
        let count = buf.len().min(queue.len());
        for slot in &mut buf[..count] {
            // The count bound guarantees a sample is present.
            #[allow(clippy::unwrap_used)]
            {
                *slot = queue.pop_front().unwrap();
            }
        }
        count
    }

    fn playback_pending(&self) -> usize {
        0
    }

    fn write_playback(&self, samples: &[f32]) {
        // Mutex poisoning is a fatal error - standard pattern in Rust
        #[allow(clippy::unwrap_used)]
        self.playback.lock().unwrap().extend_from_slice(samples);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_audio_roundtrip() {
        let audio = MemoryAudio::new(44_100, 48_000);
        assert_eq!(audio.capture_rate(), 44_100);
        assert_eq!(audio.playback_rate(), 48_000);

        audio.push_capture(&[0.1, 0.2, 0.3]);
        assert_eq!(audio.capture_ready(), 3);
        let mut buf = [0f32; 2];
        assert_eq!(audio.read_capture(&mut buf), 2);
        assert_eq!(buf, [0.1, 0.2]);
        assert_eq!(audio.capture_ready(), 1);

        audio.write_playback(&[0.5, 0.6]);
        assert_eq!(audio.playback_pending(), 0);
        assert_eq!(audio.take_playback(), vec![0.5, 0.6]);
        assert!(audio.take_playback().is_empty());
    }
}
