// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The realtime engine.
//!
//! One cooperative driver task cycles roughly every 15 ms: it handles
//! tangent edges, drains and resamples the capture device, encodes full
//! frames into the active stream, applies timeline updates (starting and
//! stopping playback streams), mixes active playback, and resamples the
//! mix out to the playback device. The embedder drives it through the
//! [`VoiceEngine`] handle from its own threads.

use crate::audio::VoiceAudio;
use crate::tracker::BitrateTracker;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use voicedeck_core::{EngineConfig, ExternalFormat, Result, StreamInfo, VoiceError};
use voicedeck_codec::{byte_budget, StreamResampler, VoiceEncoder, FRAME_SIZE, TICK_SAMPLES};
use voicedeck_store::container;
use voicedeck_store::filesys::FsHandle;
use voicedeck_store::playback::{PlaybackStream, OUTPUT_BLOCK};
use voicedeck_store::stream::{SharedStream, VoiceStream};
use voicedeck_store::StreamCollection;

/// Mix ahead only while less than this many codec-rate samples are queued.
const BLOCK_THRESHOLD: usize = 1200;
/// Driver cycle period.
const ITERATION_TIME: Duration = Duration::from_micros(15_000);
/// Capture intake cap per iteration: `rate_in / 40` samples (~25 ms).
const REC_THRESHOLD_DIV: u32 = 40;
/// Playback backlog cap: `rate_out / 30` samples (~33 ms).
const PLAY_THRESHOLD_DIV: u32 = 30;
/// Native-rate staging buffer bound.
const BUF_MAX: usize = 6144;

#[derive(Debug, Default)]
struct TimeState {
    current: u64,
    jump: bool,
    last_frame: u64,
    last_rate: f64,
}

type ActiveList = Vec<Arc<Mutex<PlaybackStream>>>;

struct Shared {
    audio: Arc<dyn VoiceAudio>,
    config: Mutex<EngineConfig>,
    time: Mutex<TimeState>,
    active: Mutex<ActiveList>,
    collection: Mutex<Option<Arc<StreamCollection>>>,
    tangent: AtomicBool,
    quit: AtomicBool,
    codec_ready: Mutex<bool>,
    codec_cond: Condvar,
}

// Mutex poisoning is a fatal error - standard pattern in Rust
#[allow(clippy::unwrap_used)]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

impl Shared {
    fn collection(&self) -> Option<Arc<StreamCollection>> {
        lock(&self.collection).clone()
    }

    fn signal_codec_ready(&self) {
        *lock(&self.codec_ready) = true;
        self.codec_cond.notify_all();
    }

    fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        // Wake the driver if it is still waiting on the codec.
        let _guard = lock(&self.codec_ready);
        self.codec_cond.notify_all();
    }

    /// Block until the codec is ready; false means quit was requested
    /// first.
    fn wait_codec_ready(&self) -> bool {
        let mut ready = lock(&self.codec_ready);
        while !*ready && !self.quit.load(Ordering::SeqCst) {
            // Mutex poisoning is a fatal error - standard pattern in Rust
            #[allow(clippy::unwrap_used)]
            {
                ready = self.codec_cond.wait(ready).unwrap();
            }
        }
        *ready && !self.quit.load(Ordering::SeqCst)
    }
}

/// Handle to a running voice engine.
///
/// Dropping the handle asks the driver to quit; [`VoiceEngine::shutdown`]
/// additionally waits for it, which also seals any stream still being
/// recorded.
pub struct VoiceEngine {
    shared: Arc<Shared>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl VoiceEngine {
    /// Validate the configuration, start the driver task and bootstrap
    /// the codec.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is out of range or the codec probe
    /// fails. Must be called within a tokio runtime.
    pub fn spawn(config: EngineConfig, audio: Arc<dyn VoiceAudio>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            audio,
            config: Mutex::new(config),
            time: Mutex::new(TimeState::default()),
            active: Mutex::new(Vec::new()),
            collection: Mutex::new(None),
            tangent: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            codec_ready: Mutex::new(false),
            codec_cond: Condvar::new(),
        });
        let task = tokio::task::spawn_blocking({
            let shared = Arc::clone(&shared);
            move || driver_loop(&shared)
        });
        // Codec bootstrap: the driver waits until a probe construction
        // proves the codec usable.
        match VoiceEncoder::new(config.bitrate) {
            Ok(_) => shared.signal_codec_ready(),
            Err(e) => {
                shared.request_quit();
                return Err(e);
            },
        }
        Ok(Self { shared, task: Some(task) })
    }

    /// Timeline notification, once per video frame. A non-successor frame
    /// number or a materially changed rate flags a time jump.
    pub fn frame_number(&self, frame: u64, rate: f64) {
        let mut time = lock(&self.shared.time);
        #[allow(clippy::float_cmp)]
        if rate == time.last_rate && time.last_frame == frame {
            return;
        }
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss,
            clippy::cast_sign_loss
        )]
        {
            time.current = (frame as f64 / rate * 48_000.0) as u64;
        }
        if (rate - time.last_rate).abs() > 1e-6 || time.last_frame + 1 != frame {
            time.jump = true;
        }
        time.last_frame = frame;
        time.last_rate = rate;
    }

    /// Engage the push-to-talk tangent.
    pub fn tangent_on(&self) {
        self.shared.tangent.store(true, Ordering::SeqCst);
    }

    /// Release the push-to-talk tangent.
    pub fn tangent_off(&self) {
        self.shared.tangent.store(false, Ordering::SeqCst);
    }

    pub fn collection_loaded(&self) -> bool {
        self.shared.collection().is_some()
    }

    /// Open (or create) a collection image and make it current.
    ///
    /// # Errors
    ///
    /// Fails if the image cannot be opened or parsed; the previous
    /// collection stays loaded in that case.
    pub fn load_collection(&self, path: &Path) -> Result<()> {
        let fs = FsHandle::open(path)?;
        let collection = Arc::new(StreamCollection::open(fs)?);
        *lock(&self.shared.collection) = Some(collection);
        Ok(())
    }

    pub fn unload_collection(&self) {
        *lock(&self.shared.collection) = None;
    }

    /// Summaries of every stream, in time order. Empty when no collection
    /// is loaded.
    pub fn stream_info(&self) -> Vec<StreamInfo> {
        self.shared.collection().map_or_else(Vec::new, |c| c.infos())
    }

    /// Number of playback streams currently mixing.
    pub fn active_playback_count(&self) -> usize {
        lock(&self.shared.active).len()
    }

    /// Start a stream immediately, regardless of the timeline.
    ///
    /// # Errors
    ///
    /// `VoiceError::State` without a collection or on an unknown id.
    pub fn play_stream(&self, id: u64) -> Result<()> {
        let collection = self.require_collection()?;
        let stream = collection
            .get(id)
            .ok_or_else(|| VoiceError::State(format!("unknown stream id {id}")))?;
        let playback = PlaybackStream::new(stream)?;
        lock(&self.shared.active).push(Arc::new(Mutex::new(playback)));
        Ok(())
    }

    /// # Errors
    ///
    /// `VoiceError::State` without a collection or on an unknown id.
    pub fn delete_stream(&self, id: u64) -> Result<()> {
        self.require_collection()?.delete(id)
    }

    /// # Errors
    ///
    /// `VoiceError::State` without a collection or on an unknown id.
    pub fn retime_stream(&self, id: u64, timebase: u64) -> Result<()> {
        self.require_collection()?.retime(id, timebase)
    }

    /// Stream gain in dB.
    ///
    /// # Errors
    ///
    /// `VoiceError::State` without a collection or on an unknown id.
    pub fn gain(&self, id: u64) -> Result<f32> {
        let stream = self
            .require_collection()?
            .get(id)
            .ok_or_else(|| VoiceError::State(format!("unknown stream id {id}")))?;
        Ok(f32::from(stream.gain()) / 256.0)
    }

    /// Set stream gain in dB, rejected outside ±128.
    ///
    /// # Errors
    ///
    /// `VoiceError::Configuration` when out of range; `VoiceError::State`
    /// without a collection or on an unknown id.
    pub fn set_gain(&self, id: u64, db: f32) -> Result<()> {
        let units = (db * 256.0).round();
        if !(f32::from(i16::MIN)..=f32::from(i16::MAX)).contains(&units) {
            return Err(VoiceError::Configuration("gain out of range (±128 dB)".to_string()));
        }
        #[allow(clippy::cast_possible_truncation)]
        let units = units as i16;
        self.require_collection()?.regain(id, units)
    }

    /// Import an external file as a new stream at `timebase`.
    ///
    /// # Errors
    ///
    /// `VoiceError::State` without a collection; container errors
    /// otherwise.
    pub fn import_stream(
        &self,
        timebase: u64,
        path: &Path,
        format: ExternalFormat,
    ) -> Result<u64> {
        let collection = self.require_collection()?;
        let config = *lock(&self.shared.config);
        let stream = Arc::new(container::import_stream(
            &collection.filesystem(),
            timebase,
            path,
            format,
            &config,
        )?);
        let id = match collection.add(Arc::clone(&stream)) {
            Ok(id) => id,
            Err(e) => {
                stream.mark_delete();
                return Err(e);
            },
        };
        // Imported streams start unlocked: they were never part of a
        // recording session that could hear itself back.
        stream.unlock();
        Ok(id)
    }

    /// Export a stream to an external file.
    ///
    /// # Errors
    ///
    /// `VoiceError::State` without a collection or on an unknown id.
    pub fn export_stream(&self, id: u64, path: &Path, format: ExternalFormat) -> Result<()> {
        let stream = self
            .require_collection()?
            .get(id)
            .ok_or_else(|| VoiceError::State(format!("unknown stream id {id}")))?;
        container::export_stream(&stream, path, format)
    }

    /// Render the whole mixed timeline to a PCM file.
    ///
    /// # Errors
    ///
    /// `VoiceError::State` without a collection; I/O errors otherwise.
    pub fn export_superstream(&self, path: &Path) -> Result<()> {
        let collection = self.require_collection()?;
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        collection.export_superstream(&mut out)?;
        std::io::Write::flush(&mut out)?;
        Ok(())
    }

    /// Stop the driver and wait for it; an in-flight recording is sealed
    /// on the way out.
    pub async fn shutdown(mut self) {
        self.shared.request_quit();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn require_collection(&self) -> Result<Arc<StreamCollection>> {
        self.shared
            .collection()
            .ok_or_else(|| VoiceError::State("no collection loaded".to_string()))
    }
}

impl Drop for VoiceEngine {
    fn drop(&mut self) {
        self.shared.request_quit();
    }
}

impl std::fmt::Debug for VoiceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceEngine").finish_non_exhaustive()
    }
}

fn drain_input(audio: &dyn VoiceAudio) {
    let mut scratch = [0f32; 256];
    while audio.capture_ready() > 0 {
        if audio.read_capture(&mut scratch) == 0 {
            break;
        }
    }
}

fn read_input(audio: &dyn VoiceAudio, to_codec: &mut StreamResampler, cap: usize) {
    let room = cap.saturating_sub(to_codec.pending_len());
    let toread = audio.capture_ready().min(room);
    if toread > 0 {
        let mut buf = vec![0f32; toread];
        let got = audio.read_capture(&mut buf);
        to_codec.feed(&buf[..got]);
    }
}

/// Encode the largest legal block available from the front of `pcm`.
fn compress_block(
    encoder: &mut VoiceEncoder,
    pcm: &mut Vec<f32>,
    stream: &VoiceStream,
    config: &EngineConfig,
    tracker: &mut BitrateTracker,
) {
    let block = [960usize, 480, 240, 120].into_iter().find(|&b| pcm.len() >= b);
    let Some(block) = block else { return };
    let budget = byte_budget(config.max_bitrate, block);
    match encoder.encode_frame(&pcm[..block], budget) {
        Ok(packet) => {
            tracker.submit(packet.len(), block);
            #[allow(clippy::cast_possible_truncation)]
            if let Err(e) = stream.write((block / TICK_SAMPLES as usize) as u8, &packet) {
                tracing::warn!("error writing coded block: {e}");
            }
        },
        Err(e) => {
            // Encode failures drop the block; recording continues.
            tracing::warn!("encoder error: {e}");
        },
    }
    pcm.drain(..block);
}

fn tangent_engaged(
    shared: &Shared,
    encoder: &mut VoiceEncoder,
    tracker: &mut BitrateTracker,
) -> Option<SharedStream> {
    let collection = shared.collection()?;
    let config = *lock(&shared.config);
    if let Err(e) = encoder.reset(config.bitrate) {
        tracing::warn!("can't start recording: {e}");
        return None;
    }
    tracker.reset();
    let now = lock(&shared.time).current;
    let stream = VoiceStream::create(now, collection.filesystem());
    match encoder.lookahead() {
        Ok(lookahead) => stream.set_pregap(lookahead),
        Err(e) => {
            tracing::warn!("can't start recording: {e}");
            return None;
        },
    }
    tracing::info!(timebase = now, "tangent engaged");
    Some(Arc::new(stream))
}

fn tangent_released(shared: &Shared, stream: &SharedStream, tracker: &BitrateTracker) {
    tracing::info!(%tracker, "tangent released");
    if let Err(e) = stream.write_trailer() {
        tracing::warn!("can't seal stream: {e}");
    }
    if let Some(collection) = shared.collection() {
        match collection.add(Arc::clone(stream)) {
            Ok(id) => tracing::debug!(id, "stream added to collection"),
            Err(e) => tracing::warn!("can't add stream: {e}"),
        }
    }
}

fn advance_time(shared: &Shared, now: u64) {
    let Some(collection) = shared.collection() else {
        lock(&shared.active).clear();
        return;
    };
    for id in collection.streams_at(now) {
        let Some(stream) = collection.get(id) else { continue };
        // Locked streams are never auto-started; this is what keeps an
        // already-playing or just-recorded stream from double-playing.
        if stream.is_locked() {
            continue;
        }
        match PlaybackStream::new(stream) {
            Ok(playback) => lock(&shared.active).push(Arc::new(Mutex::new(playback))),
            Err(e) => tracing::warn!(id, "can't start stream: {e}"),
        }
    }
}

fn jump_time(shared: &Shared, now: u64) {
    let Some(collection) = shared.collection() else {
        lock(&shared.active).clear();
        return;
    };
    lock(&shared.active).clear();
    // Every stream becomes startable again after a jump.
    collection.unlock_all();
    for id in collection.streams_at(now) {
        let Some(stream) = collection.get(id) else { continue };
        let offset = now - stream.timebase();
        match PlaybackStream::new(stream) {
            Ok(mut playback) => {
                if let Err(e) = playback.skip(offset) {
                    tracing::warn!(id, "seek failed: {e}");
                }
                lock(&shared.active).push(Arc::new(Mutex::new(playback)));
            },
            Err(e) => tracing::warn!(id, "can't start stream: {e}"),
        }
    }
}

fn update_time(shared: &Shared) {
    let (now, jumped) = {
        let mut time = lock(&shared.time);
        let jumped = time.jump;
        time.jump = false;
        (time.current, jumped)
    };
    if jumped {
        jump_time(shared, now);
    } else {
        advance_time(shared, now);
    }
}

/// Mix one output block from every active playback stream, then drop the
/// ones that finished. The list lock is held only to snapshot and to
/// splice; decoding happens outside it.
fn decompress_active(shared: &Shared, mix: &mut [f32]) {
    let snapshot: ActiveList = lock(&shared.active).clone();
    let mut tmp = vec![0f32; mix.len()];
    for playback in &snapshot {
        let mut playback = lock(playback);
        if let Err(e) = playback.read(&mut tmp) {
            tracing::warn!("playback failed: {e}");
            tmp.fill(0.0);
        }
        for (acc, sample) in mix.iter_mut().zip(&tmp) {
            *acc += sample;
        }
    }
    lock(&shared.active).retain(|playback| !lock(playback).eof());
}

fn driver_loop(shared: &Arc<Shared>) {
    if !shared.wait_codec_ready() {
        return;
    }
    let config = *lock(&shared.config);
    let rate_in = shared.audio.capture_rate();
    let rate_out = shared.audio.playback_rate();
    let mut encoder = match VoiceEncoder::new(config.bitrate) {
        Ok(encoder) => encoder,
        Err(e) => {
            tracing::error!("voice engine cannot start: {e}");
            return;
        },
    };
    let (mut to_codec, mut from_codec) = match (
        StreamResampler::new(rate_in, 48_000),
        StreamResampler::new(48_000, rate_out),
    ) {
        (Ok(input), Ok(output)) => (input, output),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("voice engine cannot start: {e}");
            return;
        },
    };
    let mut encode_buf: Vec<f32> = Vec::with_capacity(FRAME_SIZE);
    let mut play_buf: Vec<f32> = Vec::with_capacity(BUF_MAX);
    let mut tracker = BitrateTracker::new();
    let mut active_stream: Option<SharedStream> = None;

    drain_input(&*shared.audio);
    loop {
        let started = Instant::now();
        let quitting = shared.quit.load(Ordering::SeqCst);
        let engaged = shared.tangent.load(Ordering::SeqCst) && !quitting;

        if engaged && active_stream.is_none() {
            // Stale capture must not leak into the new stream.
            drain_input(&*shared.audio);
            to_codec.clear();
            encode_buf.clear();
            active_stream = tangent_engaged(shared, &mut encoder, &mut tracker);
        } else if !engaged {
            if let Some(stream) = active_stream.take() {
                tangent_released(shared, &stream, &tracker);
            }
        }
        if quitting {
            break;
        }

        // Accept at most ~25 ms of capture per iteration. The encode
        // buffer takes two frames so the resampler's chunk granularity
        // can always push it past one full frame.
        read_input(&*shared.audio, &mut to_codec, (rate_in / REC_THRESHOLD_DIV) as usize);
        if let Err(e) = to_codec.receive(&mut encode_buf, 2 * FRAME_SIZE) {
            tracing::warn!("capture resample failed: {e}");
        }
        if encode_buf.len() >= FRAME_SIZE {
            if let Some(stream) = &active_stream {
                compress_block(&mut encoder, &mut encode_buf, stream, &config, &mut tracker);
            }
        }

        update_time(shared);

        if from_codec.pending_len() < BLOCK_THRESHOLD {
            let mut mix = vec![0f32; OUTPUT_BLOCK];
            decompress_active(shared, &mut mix);
            from_codec.feed(&mix);
        }
        if let Err(e) = from_codec.receive(&mut play_buf, BUF_MAX) {
            tracing::warn!("playback resample failed: {e}");
        }
        if !play_buf.is_empty()
            && shared.audio.playback_pending() < (rate_out / PLAY_THRESHOLD_DIV) as usize
        {
            shared.audio.write_playback(&play_buf);
            play_buf.clear();
        }

        let elapsed = started.elapsed();
        if elapsed < ITERATION_TIME {
            std::thread::sleep(ITERATION_TIME - elapsed);
        }
    }
    // Seal anything still recording, then let the collection go.
    if let Some(stream) = active_stream.take() {
        tangent_released(shared, &stream, &tracker);
    }
    lock(&shared.active).clear();
    *lock(&shared.collection) = None;
    tracing::debug!("voice engine stopped");
}
