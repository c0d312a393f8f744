// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Transient decode-side wrapper over a stored stream.
//!
//! A playback stream owns its decoder and an output accumulator. Pregap
//! samples are discarded from the front as packets decode; the postgap is
//! discarded once, when the final packet has been consumed. Creating a
//! playback stream locks its source so the timeline does not start a
//! second copy.

use crate::stream::SharedStream;
use voicedeck_core::Result;
use voicedeck_codec::{VoiceDecoder, CONVERGE_BOUND, MAX_PACKET_SAMPLES};

/// Samples mixed per engine output block (30 ms at 48 kHz).
pub const OUTPUT_BLOCK: usize = 1440;

pub struct PlaybackStream {
    stream: SharedStream,
    decoder: VoiceDecoder,
    output: Vec<f32>,
    pregap_thrown: u32,
    postgap_thrown: bool,
    next_block: u32,
    blocks: u32,
}

impl PlaybackStream {
    /// Start playback of `stream`, locking it against timeline
    /// auto-start.
    ///
    /// # Errors
    ///
    /// Fails if the decoder cannot be constructed.
    pub fn new(stream: SharedStream) -> Result<Self> {
        stream.lock();
        let blocks = stream.packet_count();
        Ok(Self {
            decoder: VoiceDecoder::new()?,
            stream,
            output: Vec::with_capacity(MAX_PACKET_SAMPLES),
            pregap_thrown: 0,
            postgap_thrown: false,
            next_block: 0,
            blocks,
        })
    }

    /// True once every packet is decoded and the accumulator is drained.
    pub fn eof(&self) -> bool {
        self.next_block >= self.blocks && self.output.is_empty()
    }

    pub fn source(&self) -> &SharedStream {
        &self.stream
    }

    /// Decode one packet into the accumulator if there is room. A packet
    /// that fails to decode becomes silence of its nominal length, keeping
    /// the stream phase-aligned.
    fn decode_block(&mut self) -> Result<()> {
        if self.next_block >= self.blocks || self.output.len() >= MAX_PACKET_SAMPLES {
            return Ok(());
        }
        let nominal = self.stream.packet_length(self.next_block) as usize;
        if nominal + self.output.len() > MAX_PACKET_SAMPLES {
            return Ok(());
        }
        let packet = self.stream.packet(self.next_block)?;
        let base = self.output.len();
        self.output.resize(MAX_PACKET_SAMPLES, 0.0);
        match self.decoder.decode(&packet, &mut self.output[base..]) {
            Ok(decoded) => self.output.truncate((base + decoded).min(MAX_PACKET_SAMPLES)),
            Err(e) => {
                tracing::debug!(block = self.next_block, "substituting silence: {e}");
                self.output.truncate(base);
                self.output.extend(std::iter::repeat(0f32).take(nominal));
            },
        }
        // Throw away pregap samples as they surface.
        let pregap = self.stream.pregap();
        if self.pregap_thrown < pregap {
            #[allow(clippy::cast_possible_truncation)]
            let throw = ((pregap - self.pregap_thrown) as usize).min(self.output.len());
            self.output.drain(..throw);
            #[allow(clippy::cast_possible_truncation)]
            {
                self.pregap_thrown += throw as u32;
            }
        }
        self.next_block += 1;
        Ok(())
    }

    /// Fill `data` with gain-scaled samples, zero-padding past the end of
    /// the stream.
    ///
    /// # Errors
    ///
    /// Fails on filesystem errors; decode errors surface as silence.
    pub fn read(&mut self, data: &mut [f32]) -> Result<()> {
        let gain = self.stream.gain_linear();
        let mut at = 0usize;
        while at < data.len() {
            self.decode_block()?;
            if self.next_block >= self.blocks && !self.postgap_thrown {
                // Final packet decoded; drop the postgap from the tail.
                let throw = (self.stream.postgap() as usize).min(self.output.len());
                self.output.truncate(self.output.len() - throw);
                self.postgap_thrown = true;
            }
            if self.next_block >= self.blocks && self.output.is_empty() {
                for sample in &mut data[at..] {
                    *sample = 0.0;
                }
                return Ok(());
            }
            let copy = (data.len() - at).min(self.output.len());
            for (dst, src) in data[at..at + copy].iter_mut().zip(self.output.drain(..copy)) {
                *dst = src * gain;
            }
            at += copy;
        }
        Ok(())
    }

    /// Jump forward by `samples` audible samples. Packets far enough from
    /// the target are skipped without decoding, relying on the decoder's
    /// convergence bound; the remainder is decoded and discarded. The
    /// pregap is accounted as already thrown.
    ///
    /// # Errors
    ///
    /// Fails on filesystem errors.
    pub fn skip(&mut self, samples: u64) -> Result<()> {
        self.pregap_thrown = self.stream.pregap();
        let mut remaining = samples + u64::from(self.pregap_thrown);
        self.postgap_thrown = false;
        if remaining < self.output.len() as u64 {
            #[allow(clippy::cast_possible_truncation)]
            self.output.drain(..remaining as usize);
            return self.decode_block();
        }
        remaining -= self.output.len() as u64;
        self.output.clear();
        while remaining > CONVERGE_BOUND {
            remaining = remaining.saturating_sub(u64::from(
                self.stream.packet_length(self.next_block),
            ));
            self.next_block += 1;
            if self.next_block >= self.blocks {
                return Ok(());
            }
        }
        while remaining > 0 {
            self.decode_block()?;
            if self.next_block >= self.blocks && self.output.is_empty() {
                return Ok(());
            }
            #[allow(clippy::cast_possible_truncation)]
            let throw = (remaining.min(self.output.len() as u64)) as usize;
            self.output.drain(..throw);
            remaining -= throw as u64;
        }
        // Prime one block so the next read starts immediately.
        self.decode_block()
    }
}

// Dropping a playback stream leaves the source locked; only a timeline
// jump unlocks it.

impl std::fmt::Debug for PlaybackStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackStream")
            .field("next_block", &self.next_block)
            .field("blocks", &self.blocks)
            .field("buffered", &self.output.len())
            .finish()
    }
}
