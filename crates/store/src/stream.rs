// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! A stored voice stream.
//!
//! One stream is two cluster chains. The control chain holds 4-byte packet
//! descriptors and the trailer records; the data chain holds the raw coded
//! bytes back to back. Appending a packet always overwrites the previous
//! trailer terminator in place, so a sealed stream can be reopened and
//! extended.

use crate::filesys::{ChainCursor, FsHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use voicedeck_core::{Result, VoiceError};
use voicedeck_codec::TICK_SAMPLES;

/// Control-record kinds (low byte of each 4-byte record).
const KIND_TERMINATOR: u8 = 0;
const KIND_PACKET: u8 = 1;
const KIND_PREGAP: u8 = 2;
const KIND_POSTGAP: u8 = 3;
const KIND_GAIN: u8 = 4;

/// One packet descriptor, packed as `size[16] | ticks[8] | offset[40]`.
/// The offset is the packet's absolute byte position in the backing file's
/// data chain.
#[derive(Debug, Clone, Copy)]
struct PacketInfo(u64);

impl PacketInfo {
    fn new(size: u16, ticks: u8, offset: u64) -> Self {
        Self((offset & 0xFF_FFFF_FFFF) | (u64::from(ticks) << 40) | (u64::from(size) << 48))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn size(self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ticks(self) -> u8 {
        (self.0 >> 40) as u8
    }

    fn samples(self) -> u32 {
        TICK_SAMPLES * u32::from(self.ticks())
    }

    fn offset(self) -> u64 {
        self.0 & 0xFF_FFFF_FFFF
    }
}

#[derive(Debug)]
struct StreamState {
    packets: Vec<PacketInfo>,
    total_len: u64,
    timebase: u64,
    pregap: u32,
    postgap: u32,
    gain: i16,
    ctrl_head: u32,
    data_head: u32,
    /// Where the next control record goes; after a trailer write this still
    /// points at the terminator so an append overwrites it.
    ctrl_cursor: ChainCursor,
    /// Where the next packet's data goes.
    data_cursor: ChainCursor,
}

/// A voice stream stored in a cluster filesystem.
///
/// Shared as `Arc<VoiceStream>`: the collection holds one reference and
/// every playback holds another. When the last reference drops and the
/// stream was flagged for deletion, both chains are released.
#[derive(Debug)]
pub struct VoiceStream {
    fs: FsHandle,
    locked: AtomicBool,
    deleting: AtomicBool,
    state: Mutex<StreamState>,
}

impl VoiceStream {
    /// Create a new empty stream with the given base time. Chain heads are
    /// allocated lazily on the first packet write.
    pub fn create(timebase: u64, fs: FsHandle) -> Self {
        Self {
            fs,
            locked: AtomicBool::new(false),
            deleting: AtomicBool::new(false),
            state: Mutex::new(StreamState {
                packets: Vec::new(),
                total_len: 0,
                timebase,
                pregap: 0,
                postgap: 0,
                gain: 0,
                ctrl_head: 0,
                data_head: 0,
                ctrl_cursor: ChainCursor::new(0),
                data_cursor: ChainCursor::new(0),
            }),
        }
    }

    /// Open a stored stream from its chain heads, parsing the control
    /// chain to recover packet descriptors, trailer values and the cursor
    /// at which the next write resumes.
    ///
    /// # Errors
    ///
    /// Fails on a truncated data chain, an unknown record kind, or
    /// filesystem corruption.
    pub fn open(timebase: u64, fs: FsHandle, ctrl_head: u32, data_head: u32) -> Result<Self> {
        let stream = Self::create(timebase, fs);
        {
            // Satisfies the borrow checker; the stream is not shared yet.
            #[allow(clippy::unwrap_used)]
            let mut st = stream.state.lock().unwrap();
            st.ctrl_head = ctrl_head;
            st.data_head = data_head;
            st.ctrl_cursor = ChainCursor::new(ctrl_head);
            st.data_cursor = ChainCursor::new(data_head);
            stream.parse_control_chain(&mut st)?;
        }
        Ok(stream)
    }

    /// Walk the control chain. Packet records accumulate descriptors; the
    /// first terminator starts the trailer section and is captured as the
    /// append cursor; a second terminator ends the scan (zero-initialised
    /// clusters guarantee one).
    fn parse_control_chain(&self, st: &mut MutexGuard<'_, StreamState>) -> Result<()> {
        let mut ctrl = st.ctrl_cursor;
        let mut data = st.data_cursor;
        let mut buf = vec![0u8; crate::filesys::CLUSTER_SIZE as usize];
        let mut trailers = false;
        let mut saved: Option<ChainCursor> = None;
        'scan: loop {
            let buf_cluster = ctrl.cluster;
            let got = self.fs.read_data(&mut ctrl, &mut buf)?;
            if got == 0 {
                break;
            }
            let mut at = 0usize;
            while at + 4 <= got {
                let kind = buf[at + 3];
                if trailers {
                    match kind {
                        KIND_TERMINATOR => break 'scan,
                        KIND_PREGAP => {
                            st.pregap =
                                u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], 0]) >> 8;
                        },
                        KIND_POSTGAP => {
                            st.postgap =
                                u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], 0]) >> 8;
                        },
                        KIND_GAIN => {
                            st.gain = i16::from_be_bytes([buf[at], buf[at + 1]]);
                        },
                        other => {
                            return Err(VoiceError::Storage(format!(
                                "unknown trailer record kind {other}"
                            )));
                        },
                    }
                } else if kind == KIND_TERMINATOR {
                    #[allow(clippy::cast_possible_truncation)]
                    let cursor = ChainCursor { cluster: buf_cluster, offset: at as u32 };
                    saved = Some(cursor);
                    trailers = true;
                } else if kind == KIND_PACKET {
                    let size = u16::from_be_bytes([buf[at], buf[at + 1]]);
                    let ticks = buf[at + 2];
                    let offset = data.byte_offset();
                    let skipped = self.fs.skip_data(&mut data, u32::from(size))?;
                    if skipped < u32::from(size) {
                        return Err(VoiceError::Storage("incomplete data chain".to_string()));
                    }
                    let info = PacketInfo::new(size, ticks, offset);
                    st.total_len += u64::from(info.samples());
                    st.packets.push(info);
                } else {
                    return Err(VoiceError::Storage(format!(
                        "unknown control record kind {kind}"
                    )));
                }
                at += 4;
            }
        }
        st.ctrl_cursor = saved.unwrap_or(ctrl);
        st.data_cursor = data;
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        // Mutex poisoning is a fatal error - standard pattern in Rust
        #[allow(clippy::unwrap_used)]
        self.state.lock().unwrap()
    }

    pub fn filesystem(&self) -> FsHandle {
        self.fs.clone()
    }

    pub fn timebase(&self) -> u64 {
        self.state().timebase
    }

    pub fn set_timebase(&self, timebase: u64) {
        self.state().timebase = timebase;
    }

    /// Audible length in samples; pregap and postgap are already excluded.
    pub fn length(&self) -> u64 {
        let st = self.state();
        let gaps = u64::from(st.pregap) + u64::from(st.postgap);
        st.total_len.saturating_sub(gaps)
    }

    pub fn pregap(&self) -> u32 {
        self.state().pregap
    }

    pub fn set_pregap(&self, pregap: u32) {
        self.state().pregap = pregap;
    }

    pub fn postgap(&self) -> u32 {
        self.state().postgap
    }

    pub fn set_postgap(&self, postgap: u32) {
        self.state().postgap = postgap;
    }

    /// Gain in 1/256 dB steps.
    pub fn gain(&self) -> i16 {
        self.state().gain
    }

    pub fn set_gain(&self, gain: i16) {
        self.state().gain = gain;
    }

    /// Linear gain factor applied to decoded samples.
    pub fn gain_linear(&self) -> f32 {
        10f32.powf(f32::from(self.gain()) / 256.0 / 20.0)
    }

    /// Number of stored packets.
    #[allow(clippy::cast_possible_truncation)]
    pub fn packet_count(&self) -> u32 {
        self.state().packets.len() as u32
    }

    /// Length in samples of packet `index`, 0 when out of range.
    pub fn packet_length(&self, index: u32) -> u32 {
        self.state().packets.get(index as usize).map_or(0, |p| p.samples())
    }

    /// Read the coded bytes of packet `index`; empty when out of range.
    ///
    /// # Errors
    ///
    /// Fails if the data chain ends before the descriptor's size is
    /// satisfied.
    pub fn packet(&self, index: u32) -> Result<bytes::Bytes> {
        let info = match self.state().packets.get(index as usize) {
            Some(info) => *info,
            None => return Ok(bytes::Bytes::new()),
        };
        #[allow(clippy::cast_possible_truncation)]
        let cluster = (info.offset() / u64::from(crate::filesys::CLUSTER_SIZE)) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let offset = (info.offset() % u64::from(crate::filesys::CLUSTER_SIZE)) as u32;
        let mut cur = ChainCursor { cluster, offset };
        let mut data = vec![0u8; usize::from(info.size())];
        let got = self.fs.read_data(&mut cur, &mut data)?;
        if got != data.len() {
            return Err(VoiceError::Storage("incomplete packet read".to_string()));
        }
        Ok(data.into())
    }

    /// Append one coded packet spanning `ticks` ticks.
    ///
    /// # Errors
    ///
    /// Fails on oversized payloads or filesystem errors.
    pub fn write(&self, ticks: u8, payload: &[u8]) -> Result<()> {
        let size = u16::try_from(payload.len())
            .map_err(|_| VoiceError::Storage("packet exceeds 65535 bytes".to_string()))?;
        let mut st = self.state();
        if st.data_cursor.cluster == 0 {
            let head = self.fs.allocate_cluster()?;
            st.data_head = head;
            st.data_cursor = ChainCursor::new(head);
        }
        if st.ctrl_cursor.cluster == 0 {
            let head = self.fs.allocate_cluster()?;
            st.ctrl_head = head;
            st.ctrl_cursor = ChainCursor::new(head);
        }
        let mut descriptor = [0u8; 4];
        descriptor[..2].copy_from_slice(&size.to_be_bytes());
        descriptor[2] = ticks;
        descriptor[3] = KIND_PACKET;
        let mut data_cursor = st.data_cursor;
        let written_at = self.fs.write_data(&mut data_cursor, payload)?;
        st.data_cursor = data_cursor;
        let mut ctrl_cursor = st.ctrl_cursor;
        self.fs.write_data(&mut ctrl_cursor, &descriptor)?;
        st.ctrl_cursor = ctrl_cursor;
        let info = PacketInfo::new(size, ticks, written_at.byte_offset());
        st.total_len += u64::from(info.samples());
        st.packets.push(info);
        Ok(())
    }

    /// Write the trailer: a terminator followed by the pregap, postgap and
    /// gain records. The stored control cursor is deliberately left at the
    /// terminator, so a subsequent [`Self::write`] overwrites the trailer
    /// in place.
    ///
    /// # Errors
    ///
    /// Fails on filesystem errors.
    pub fn write_trailer(&self) -> Result<()> {
        let mut st = self.state();
        if st.ctrl_cursor.cluster == 0 {
            let head = self.fs.allocate_cluster()?;
            st.ctrl_head = head;
            st.ctrl_cursor = ChainCursor::new(head);
        }
        let mut descriptor = [0u8; 16];
        descriptor[4..8].copy_from_slice(&((st.pregap << 8) | u32::from(KIND_PREGAP)).to_be_bytes());
        descriptor[8..12]
            .copy_from_slice(&((st.postgap << 8) | u32::from(KIND_POSTGAP)).to_be_bytes());
        descriptor[12..14].copy_from_slice(&st.gain.to_be_bytes());
        descriptor[14..16].copy_from_slice(&u16::from(KIND_GAIN).to_be_bytes());
        // Write through a copy of the cursor so appends return here.
        let mut scratch = st.ctrl_cursor;
        self.fs.write_data(&mut scratch, &descriptor)?;
        Ok(())
    }

    /// Chain heads `(control, data)`; zero when never written.
    pub fn chain_heads(&self) -> (u32, u32) {
        let st = self.state();
        (st.ctrl_head, st.data_head)
    }

    /// Prevent the timeline from auto-starting another playback of this
    /// stream.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Flag the stream for deletion; the chains are freed once the last
    /// reference drops.
    pub fn mark_delete(&self) {
        self.deleting.store(true, Ordering::SeqCst);
    }
}

impl Drop for VoiceStream {
    fn drop(&mut self) {
        if !self.deleting.load(Ordering::SeqCst) {
            return;
        }
        let (ctrl, data) = {
            // Mutex poisoning is a fatal error - standard pattern in Rust
            #[allow(clippy::unwrap_used)]
            let st = self.state.lock().unwrap();
            (st.ctrl_head, st.data_head)
        };
        for head in [ctrl, data] {
            if head != 0 {
                if let Err(e) = self.fs.free_cluster_chain(head) {
                    tracing::warn!(head, "failed to release stream chain: {e}");
                }
            }
        }
    }
}

/// Convenience alias used throughout the engine.
pub type SharedStream = Arc<VoiceStream>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fresh_fs() -> (tempfile::TempDir, FsHandle) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsHandle::open(&dir.path().join("collection.vdfs")).unwrap();
        (dir, fs)
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_write_packets_and_reopen() {
        let (_dir, fs) = fresh_fs();
        let stream = VoiceStream::create(48_000, fs.clone());
        stream.write(8, &payload(80, 1)).unwrap();
        stream.write(8, &payload(82, 2)).unwrap();
        stream.write(8, &payload(79, 3)).unwrap();
        stream.set_pregap(312);
        stream.set_gain(-512);
        stream.write_trailer().unwrap();
        let (ctrl, data) = stream.chain_heads();
        assert_ne!(ctrl, 0);
        assert_ne!(data, 0);

        let reopened = VoiceStream::open(48_000, fs, ctrl, data).unwrap();
        assert_eq!(reopened.packet_count(), 3);
        assert_eq!(reopened.pregap(), 312);
        assert_eq!(reopened.postgap(), 0);
        assert_eq!(reopened.gain(), -512);
        assert_eq!(reopened.length(), 3 * 8 * 120 - 312);
        assert_eq!(reopened.packet(0).unwrap(), payload(80, 1));
        assert_eq!(reopened.packet(1).unwrap(), payload(82, 2));
        assert_eq!(reopened.packet(2).unwrap(), payload(79, 3));
    }

    #[test]
    fn test_append_overwrites_trailer_in_place() {
        let (_dir, fs) = fresh_fs();
        let stream = VoiceStream::create(0, fs.clone());
        stream.write(8, &payload(100, 5)).unwrap();
        stream.write_trailer().unwrap();

        // Extend past the trailer, then seal again.
        stream.write(4, &payload(50, 6)).unwrap();
        stream.write_trailer().unwrap();

        let (ctrl, data) = stream.chain_heads();
        let reopened = VoiceStream::open(0, fs, ctrl, data).unwrap();
        assert_eq!(reopened.packet_count(), 2);
        assert_eq!(reopened.packet(1).unwrap(), payload(50, 6));
        assert_eq!(reopened.length(), (8 + 4) * 120);
    }

    #[test]
    fn test_reopened_stream_accepts_further_appends() {
        let (_dir, fs) = fresh_fs();
        let (ctrl, data) = {
            let stream = VoiceStream::create(0, fs.clone());
            stream.write(8, &payload(64, 9)).unwrap();
            stream.write_trailer().unwrap();
            stream.chain_heads()
        };
        let stream = VoiceStream::open(0, fs.clone(), ctrl, data).unwrap();
        stream.write(8, &payload(65, 10)).unwrap();
        stream.write_trailer().unwrap();

        let reopened = VoiceStream::open(0, fs, ctrl, data).unwrap();
        assert_eq!(reopened.packet_count(), 2);
        assert_eq!(reopened.packet(0).unwrap(), payload(64, 9));
        assert_eq!(reopened.packet(1).unwrap(), payload(65, 10));
    }

    #[test]
    fn test_many_packets_span_multiple_clusters() {
        let (_dir, fs) = fresh_fs();
        let stream = VoiceStream::create(0, fs.clone());
        // 3000 descriptors (12000 bytes) overflow the control cluster, and
        // the payloads overflow several data clusters.
        for i in 0..3000u32 {
            stream.write(1, &payload(40, (i % 256) as u8)).unwrap();
        }
        stream.write_trailer().unwrap();
        let (ctrl, data) = stream.chain_heads();
        let reopened = VoiceStream::open(0, fs, ctrl, data).unwrap();
        assert_eq!(reopened.packet_count(), 3000);
        assert_eq!(reopened.packet(2999).unwrap(), payload(40, (2999 % 256) as u8));
        assert_eq!(reopened.length(), 3000 * 120);
    }

    #[test]
    fn test_gaps_larger_than_stream_clamp_length_to_zero() {
        let (_dir, fs) = fresh_fs();
        let stream = VoiceStream::create(0, fs);
        stream.write(1, &payload(10, 0)).unwrap();
        stream.set_pregap(100);
        stream.set_postgap(100);
        assert_eq!(stream.length(), 0);
    }

    #[test]
    fn test_delete_flag_frees_chains_on_drop() {
        let (_dir, fs) = fresh_fs();
        let stream = VoiceStream::create(0, fs.clone());
        stream.write(8, &payload(64, 1)).unwrap();
        stream.write_trailer().unwrap();
        let (ctrl, data) = stream.chain_heads();
        assert_eq!((ctrl, data), (4, 3));
        stream.mark_delete();
        drop(stream);
        // Both chains returned to the free pool.
        assert_eq!(fs.allocate_cluster().unwrap(), 3);
        assert_eq!(fs.allocate_cluster().unwrap(), 4);
    }

    #[test]
    fn test_lock_flags() {
        let (_dir, fs) = fresh_fs();
        let stream = VoiceStream::create(0, fs);
        assert!(!stream.is_locked());
        stream.lock();
        assert!(stream.is_locked());
        stream.unlock();
        assert!(!stream.is_locked());
    }

    #[test]
    fn test_gain_linear() {
        let (_dir, fs) = fresh_fs();
        let stream = VoiceStream::create(0, fs);
        assert!((stream.gain_linear() - 1.0).abs() < 1e-6);
        // +6 dB is 6*256 in stored units and roughly doubles amplitude.
        stream.set_gain(6 * 256);
        assert!((stream.gain_linear() - 1.995).abs() < 0.01);
    }
}
