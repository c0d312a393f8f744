// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The stream collection: an index of streams by timeline position.
//!
//! Cluster 2 of the backing filesystem holds an array of 16-byte slots
//! `{timebase BE u64, ctrl_head BE u32, data_head BE u32}`; a zero control
//! head marks a free slot. In-memory ids are monotonic and never reused
//! within a session.

use crate::filesys::{ChainCursor, FsHandle, INDEX_CLUSTER};
use crate::playback::{PlaybackStream, OUTPUT_BLOCK};
use crate::stream::{SharedStream, VoiceStream};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use voicedeck_core::{Result, StreamInfo, VoiceError};

const SLOT_SIZE: u32 = 16;

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    next_slot: u64,
    free_slots: BTreeSet<u64>,
    entries: HashMap<u64, u64>,
    /// `(timebase, id)` pairs; iteration order is the canonical "by time,
    /// then by insertion" stream order.
    streams_by_time: BTreeSet<(u64, u64)>,
    streams: BTreeMap<u64, SharedStream>,
}

/// A loaded stream collection.
#[derive(Debug)]
pub struct StreamCollection {
    fs: FsHandle,
    inner: Mutex<Inner>,
}

impl StreamCollection {
    /// Parse the index in cluster 2, constructing a stream for every
    /// occupied slot.
    ///
    /// # Errors
    ///
    /// Fails if any referenced stream cannot be parsed.
    pub fn open(fs: FsHandle) -> Result<Self> {
        let mut inner = Inner::default();
        let mut cur = ChainCursor::new(INDEX_CLUSTER);
        let mut slot = 0u64;
        loop {
            let mut buf = [0u8; SLOT_SIZE as usize];
            let got = fs.read_data(&mut cur, &mut buf)?;
            if got < buf.len() {
                break;
            }
            let timebase = u64::from_be_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]);
            let ctrl_head = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
            let data_head = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
            if ctrl_head == 0 {
                inner.free_slots.insert(slot);
            } else {
                let stream = VoiceStream::open(timebase, fs.clone(), ctrl_head, data_head)
                    .map_err(|e| {
                        VoiceError::Storage(format!("failed to parse stream collection: {e}"))
                    })?;
                let id = inner.next_id;
                inner.next_id += 1;
                inner.entries.insert(id, slot);
                inner.streams_by_time.insert((timebase, id));
                inner.streams.insert(id, Arc::new(stream));
            }
            slot += 1;
        }
        inner.next_slot = slot;
        Ok(Self { fs, inner: Mutex::new(inner) })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // Mutex poisoning is a fatal error - standard pattern in Rust
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap()
    }

    pub fn filesystem(&self) -> FsHandle {
        self.fs.clone()
    }

    fn write_slot(&self, slot: u64, bytes: &[u8]) -> Result<()> {
        let mut cur = ChainCursor::new(INDEX_CLUSTER);
        let skip = u32::try_from(slot * u64::from(SLOT_SIZE))
            .map_err(|_| VoiceError::Storage("index slot out of range".to_string()))?;
        if self.fs.skip_data(&mut cur, skip)? != skip {
            return Err(VoiceError::Storage("index chain shorter than slot table".to_string()));
        }
        self.fs.write_data(&mut cur, bytes)?;
        Ok(())
    }

    /// Add a sealed stream to the collection, persisting its slot and
    /// locking it so the timeline does not immediately start it.
    ///
    /// # Errors
    ///
    /// Fails on filesystem errors; the in-memory maps stay untouched on
    /// failure.
    pub fn add(&self, stream: SharedStream) -> Result<u64> {
        let mut inner = self.inner();
        stream.lock();
        let (slot, from_free) = match inner.free_slots.pop_first() {
            Some(slot) => (slot, true),
            None => {
                let slot = inner.next_slot;
                inner.next_slot += 1;
                (slot, false)
            },
        };
        let (ctrl_head, data_head) = stream.chain_heads();
        let timebase = stream.timebase();
        let mut buf = [0u8; SLOT_SIZE as usize];
        buf[..8].copy_from_slice(&timebase.to_be_bytes());
        buf[8..12].copy_from_slice(&ctrl_head.to_be_bytes());
        buf[12..16].copy_from_slice(&data_head.to_be_bytes());
        if let Err(e) = self.write_slot(slot, &buf) {
            if from_free {
                inner.free_slots.insert(slot);
            } else {
                inner.next_slot -= 1;
            }
            return Err(e);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, slot);
        inner.streams_by_time.insert((timebase, id));
        inner.streams.insert(id, stream);
        Ok(id)
    }

    /// Remove a stream: zero its slot and release its chains once no
    /// playback holds a reference.
    ///
    /// # Errors
    ///
    /// `VoiceError::State` on an unknown id; filesystem errors otherwise.
    pub fn delete(&self, id: u64) -> Result<()> {
        let mut inner = self.inner();
        let stream = inner
            .streams
            .get(&id)
            .cloned()
            .ok_or_else(|| VoiceError::State(format!("unknown stream id {id}")))?;
        if let Some(&slot) = inner.entries.get(&id) {
            self.write_slot(slot, &[0u8; SLOT_SIZE as usize])?;
            inner.entries.remove(&id);
            inner.free_slots.insert(slot);
        }
        inner.streams_by_time.remove(&(stream.timebase(), id));
        inner.streams.remove(&id);
        stream.mark_delete();
        Ok(())
    }

    /// Move a stream on the timeline, rewriting the persisted timebase.
    ///
    /// # Errors
    ///
    /// `VoiceError::State` on an unknown id; filesystem errors otherwise.
    pub fn retime(&self, id: u64, timebase: u64) -> Result<()> {
        let mut inner = self.inner();
        let stream = inner
            .streams
            .get(&id)
            .cloned()
            .ok_or_else(|| VoiceError::State(format!("unknown stream id {id}")))?;
        if let Some(&slot) = inner.entries.get(&id) {
            self.write_slot(slot, &timebase.to_be_bytes())?;
        }
        inner.streams_by_time.remove(&(stream.timebase(), id));
        stream.set_timebase(timebase);
        inner.streams_by_time.insert((timebase, id));
        Ok(())
    }

    /// Change a stream's gain and rewrite its trailer.
    ///
    /// # Errors
    ///
    /// `VoiceError::State` on an unknown id; filesystem errors otherwise.
    pub fn regain(&self, id: u64, gain: i16) -> Result<()> {
        let stream = self
            .get(id)
            .ok_or_else(|| VoiceError::State(format!("unknown stream id {id}")))?;
        stream.set_gain(gain);
        stream.write_trailer()
    }

    /// The stream with the given id, if any.
    pub fn get(&self, id: u64) -> Option<SharedStream> {
        self.inner().streams.get(&id).cloned()
    }

    /// Ids of every stream whose `[timebase, timebase + length)` interval
    /// contains `point`, in insertion order.
    pub fn streams_at(&self, point: u64) -> Vec<u64> {
        let inner = self.inner();
        inner
            .streams
            .iter()
            .filter(|(_, stream)| {
                let start = stream.timebase();
                point >= start && point < start + stream.length()
            })
            .map(|(&id, _)| id)
            .collect()
    }

    /// Every stream id, ordered by timebase then insertion.
    pub fn all_streams(&self) -> Vec<u64> {
        self.inner().streams_by_time.iter().map(|&(_, id)| id).collect()
    }

    /// Clear all stream locks (done on a timeline jump).
    pub fn unlock_all(&self) {
        for stream in self.inner().streams.values() {
            stream.unlock();
        }
    }

    /// Summaries of every stream in time order.
    pub fn infos(&self) -> Vec<StreamInfo> {
        let inner = self.inner();
        inner
            .streams_by_time
            .iter()
            .filter_map(|&(_, id)| {
                inner.streams.get(&id).map(|s| StreamInfo {
                    id,
                    timebase: s.timebase(),
                    length: s.length(),
                })
            })
            .collect()
    }

    /// Render the full mixed timeline as linear PCM in the sox layout.
    /// Streams are opened for playback as the cursor reaches their
    /// timebase and mixed in `OUTPUT_BLOCK` chunks with their gain
    /// applied.
    ///
    /// # Errors
    ///
    /// Fails on filesystem or output I/O errors.
    pub fn export_superstream(&self, out: &mut impl Write) -> Result<()> {
        let ordered: Vec<SharedStream> =
            self.all_streams().into_iter().filter_map(|id| self.get(id)).collect();
        let total = ordered.iter().map(|s| s.timebase() + s.length()).max().unwrap_or(0);
        crate::container::sox::write_header(out, total)?;

        let mut upcoming = ordered.into_iter().peekable();
        let mut active: Vec<PlaybackStream> = Vec::new();
        let mut position = 0u64;
        while position < total {
            while let Some(next) = upcoming.peek() {
                if next.timebase() > position {
                    break;
                }
                // Start (and thereby lock) every stream whose time has
                // come.
                if let Some(stream) = upcoming.next() {
                    active.push(PlaybackStream::new(stream)?);
                }
            }
            let next_start = upcoming.peek().map_or(total, |s| s.timebase());
            #[allow(clippy::cast_possible_truncation)]
            let block = (next_start - position).min(total - position).min(OUTPUT_BLOCK as u64)
                as usize;
            let mut mix = vec![0f32; block];
            let mut tmp = vec![0f32; block];
            for playback in &mut active {
                playback.read(&mut tmp)?;
                for (acc, sample) in mix.iter_mut().zip(&tmp) {
                    *acc += sample;
                }
            }
            active.retain(|p| !p.eof());
            crate::container::sox::write_samples(out, &mix)?;
            position += block as u64;
        }
        Ok(())
    }
}
