// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Linear PCM interchange.
//!
//! 32-byte header: magic `2E 53 6F 58`, a header-size byte (0x1C), three
//! zero bytes, the total sample count (LE u64), the sampling rate as an
//! IEEE-754 double (LE, always 48000.0) and the channel count (LE u64,
//! always 1). The body is signed 32-bit LE samples scaled by 2^28.

use crate::filesys::FsHandle;
use crate::stream::VoiceStream;
use std::io::{Read, Write};
use voicedeck_core::{EngineConfig, Result, VoiceError};
use voicedeck_codec::{
    byte_budget, VoiceDecoder, VoiceEncoder, FRAME_SIZE, MAX_PACKET_SAMPLES, TICK_SAMPLES,
};

/// Magic plus header-size byte, as one LE u64.
const MAGIC_AND_SIZE: u64 = 0x1C_586F_532E;
/// Bit pattern of 48000.0 as an IEEE-754 double.
const RATE_BITS: u64 = 4_676_829_883_349_860_352;
/// Sample scale: nominal ±1.0 maps to ±2^28.
const SCALE: f32 = 268_435_456.0;

pub(crate) fn write_header(out: &mut impl Write, samples: u64) -> Result<()> {
    let mut header = [0u8; 32];
    header[..8].copy_from_slice(&MAGIC_AND_SIZE.to_le_bytes());
    header[8..16].copy_from_slice(&samples.to_le_bytes());
    header[16..24].copy_from_slice(&RATE_BITS.to_le_bytes());
    header[24..32].copy_from_slice(&1u64.to_le_bytes());
    out.write_all(&header)?;
    Ok(())
}

pub(crate) fn write_samples(out: &mut impl Write, samples: &[f32]) -> Result<()> {
    let mut raw = Vec::with_capacity(samples.len() * 4);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        raw.extend_from_slice(&((sample * SCALE) as i32).to_le_bytes());
    }
    out.write_all(&raw)?;
    Ok(())
}

/// Decode a whole stream to linear PCM. Pregap and postgap samples are
/// discarded and the stream gain is baked into the output.
///
/// # Errors
///
/// Fails on I/O errors or an undecodable packet.
pub fn export(stream: &VoiceStream, out: &mut impl Write) -> Result<()> {
    write_header(out, stream.length())?;
    let mut decoder = VoiceDecoder::new()?;
    let gain = stream.gain_linear();
    let count = stream.packet_count();
    let mut pregap_left = stream.pregap() as usize;
    let mut pcm = vec![0f32; MAX_PACKET_SAMPLES];
    for index in 0..count {
        let nominal = stream.packet_length(index) as usize;
        let packet = stream.packet(index)?;
        let decoded = decoder
            .decode(&packet, &mut pcm)
            .map_err(|e| VoiceError::Codec(format!("error decoding packet {index}: {e}")))?;
        for sample in &mut pcm[decoded..nominal.max(decoded)] {
            *sample = 0.0;
        }
        let start = pregap_left.min(nominal);
        pregap_left -= start;
        let end = if index + 1 == count {
            nominal - (stream.postgap() as usize).min(nominal - start)
        } else {
            nominal
        };
        let scaled: Vec<f32> = pcm[start..end].iter().map(|s| s * gain).collect();
        write_samples(out, &scaled)?;
    }
    Ok(())
}

/// Encode a PCM file into a fresh stream. The encoder lookahead becomes
/// the pregap; a short final block becomes the postgap.
///
/// # Errors
///
/// Fails on a malformed header, short reads, or encoder errors. The
/// partial stream's clusters are released on failure.
pub fn import(
    fs: &FsHandle,
    timebase: u64,
    input: &mut impl Read,
    config: &EngineConfig,
) -> Result<VoiceStream> {
    let mut header = [0u8; 32];
    input
        .read_exact(&mut header)
        .map_err(|_| VoiceError::Container("can't read PCM header".to_string()))?;
    if u32::from_le_bytes([header[0], header[1], header[2], header[3]]) != 0x586F_532E {
        return Err(VoiceError::Container("bad PCM header magic".to_string()));
    }
    if header[4] > 28 {
        // Tolerate an extended header by skipping the surplus.
        let mut surplus = vec![0u8; usize::from(header[4]) - 28];
        input
            .read_exact(&mut surplus)
            .map_err(|_| VoiceError::Container("can't read PCM header".to_string()))?;
    }
    if u64::from_le_bytes(header[16..24].try_into().unwrap_or_default()) != RATE_BITS {
        return Err(VoiceError::Container("unsupported PCM sampling rate".to_string()));
    }
    if u64::from_le_bytes(header[24..32].try_into().unwrap_or_default()) != 1 {
        return Err(VoiceError::Container("only mono streams are supported".to_string()));
    }
    let samples = u64::from_le_bytes(header[8..16].try_into().unwrap_or_default());

    let stream = VoiceStream::create(timebase, fs.clone());
    match encode_body(&stream, input, samples, config) {
        Ok(()) => Ok(stream),
        Err(e) => {
            stream.mark_delete();
            Err(e)
        },
    }
}

fn encode_body(
    stream: &VoiceStream,
    input: &mut impl Read,
    samples: u64,
    config: &EngineConfig,
) -> Result<()> {
    let mut encoder = VoiceEncoder::new(config.bitrate)?;
    let pregap = encoder.lookahead()?;
    stream.set_pregap(pregap);
    let total = samples + u64::from(pregap);
    let budget = byte_budget(config.max_bitrate, FRAME_SIZE);
    let mut raw = vec![0u8; 4 * FRAME_SIZE];
    let mut pcm = vec![0f32; FRAME_SIZE];
    let mut blocks = 0u64;
    let mut bytes = 0u64;
    let mut at = 0u64;
    while at < total {
        #[allow(clippy::cast_possible_truncation)]
        let block = (total - at).min(FRAME_SIZE as u64) as usize;
        #[allow(clippy::cast_possible_truncation)]
        let readable = (samples.saturating_sub(at)).min(block as u64) as usize;
        if readable > 0 {
            input
                .read_exact(&mut raw[..4 * readable])
                .map_err(|_| VoiceError::Container("can't read PCM data".to_string()))?;
        }
        for (slot, chunk) in pcm[..readable].iter_mut().zip(raw.chunks_exact(4)) {
            #[allow(clippy::cast_precision_loss)]
            {
                *slot = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f32 / SCALE;
            }
        }
        for slot in &mut pcm[readable..] {
            *slot = 0.0;
        }
        if block < FRAME_SIZE {
            #[allow(clippy::cast_possible_truncation)]
            stream.set_postgap((FRAME_SIZE - block) as u32);
        }
        let packet = encoder.encode_frame(&pcm, budget)?;
        bytes += packet.len() as u64;
        blocks += 1;
        #[allow(clippy::cast_possible_truncation)]
        stream.write((FRAME_SIZE / TICK_SAMPLES as usize) as u8, &packet)?;
        at += block as u64;
    }
    stream.write_trailer()?;
    tracing::info!(blocks, bytes, samples, "imported PCM stream");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fresh_fs() -> (tempfile::TempDir, FsHandle) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsHandle::open(&dir.path().join("collection.vdfs")).unwrap();
        (dir, fs)
    }

    fn pcm_file(samples: &[f32]) -> Vec<u8> {
        let mut out = Vec::new();
        write_header(&mut out, samples.len() as u64).unwrap();
        write_samples(&mut out, samples).unwrap();
        out
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.03).sin() * 0.4).collect()
    }

    #[test]
    fn test_header_layout() {
        let mut out = Vec::new();
        write_header(&mut out, 7).unwrap();
        assert_eq!(&out[..8], &[0x2E, 0x53, 0x6F, 0x58, 0x1C, 0, 0, 0]);
        assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 7);
        assert_eq!(f64::from_le_bytes(out[16..24].try_into().unwrap()), 48_000.0);
        assert_eq!(u64::from_le_bytes(out[24..32].try_into().unwrap()), 1);
    }

    #[test]
    fn test_import_sets_gaps_and_length() {
        let (_dir, fs) = fresh_fs();
        let file = pcm_file(&tone(4_800));
        let stream =
            import(&fs, 0, &mut Cursor::new(file), &EngineConfig::default()).unwrap();
        assert_eq!(stream.length(), 4_800);
        assert!(stream.pregap() > 0);
        // pregap + samples is not a multiple of the frame size, so the
        // last block was padded.
        assert_eq!(
            (u64::from(stream.pregap()) + 4_800 + u64::from(stream.postgap())) % 960,
            0
        );
    }

    #[test]
    fn test_import_export_roundtrip_sample_count() {
        let (_dir, fs) = fresh_fs();
        let file = pcm_file(&tone(9_600));
        let stream =
            import(&fs, 0, &mut Cursor::new(file), &EngineConfig::default()).unwrap();

        let mut exported = Vec::new();
        export(&stream, &mut exported).unwrap();
        assert_eq!(u64::from_le_bytes(exported[8..16].try_into().unwrap()), 9_600);
        assert_eq!(exported.len(), 32 + 9_600 * 4);
    }

    #[test]
    fn test_import_rejects_bad_magic() {
        let (_dir, fs) = fresh_fs();
        let mut file = pcm_file(&tone(960));
        file[0] = 0x2F;
        let err = import(&fs, 0, &mut Cursor::new(file), &EngineConfig::default());
        assert!(matches!(err, Err(VoiceError::Container(_))));
    }

    #[test]
    fn test_import_rejects_stereo() {
        let (_dir, fs) = fresh_fs();
        let mut file = pcm_file(&tone(960));
        file[24] = 2;
        let err = import(&fs, 0, &mut Cursor::new(file), &EngineConfig::default());
        assert!(matches!(err, Err(VoiceError::Container(_))));
    }

    #[test]
    fn test_failed_import_releases_clusters() {
        let (_dir, fs) = fresh_fs();
        let mut file = pcm_file(&tone(9_600));
        file.truncate(32 + 4 * 2_000); // body cut short after two full blocks
        let err = import(&fs, 0, &mut Cursor::new(file), &EngineConfig::default());
        assert!(err.is_err());
        // Whatever the partial import allocated is free again.
        assert_eq!(fs.allocate_cluster().unwrap(), 3);
    }

    #[test]
    fn test_import_skips_extended_header() {
        let (_dir, fs) = fresh_fs();
        let samples = tone(960);
        let mut file = Vec::new();
        write_header(&mut file, samples.len() as u64).unwrap();
        file[4] = 32; // header claims four extra bytes
        file.extend_from_slice(&[0u8; 4]);
        write_samples(&mut file, &samples).unwrap();
        let stream =
            import(&fs, 0, &mut Cursor::new(file), &EngineConfig::default()).unwrap();
        assert_eq!(stream.length(), 960);
    }
}
