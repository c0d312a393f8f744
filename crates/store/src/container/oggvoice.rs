// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Coded-packet container interchange over Ogg.
//!
//! The logical stream follows the Opus-in-Ogg layout: an `OpusHead`
//! identification packet (preskip = pregap, rate 48 kHz, mono), an
//! `OpusTags` comment packet carrying the encoder tag and a
//! `LSNES_STREAM_TS=<timebase>` tag (the interchange format's name for the
//! timeline position), then the coded packets with the final granule
//! position set to the true sample count less the postgap.

use crate::filesys::FsHandle;
use crate::stream::VoiceStream;
use ogg::{PacketReader, PacketWriteEndInfo, PacketWriter};
use std::io::{Read, Seek, Write};
use voicedeck_core::{Result, VoiceError};
use voicedeck_codec::{packet_ticks, TICK_SAMPLES};

const STREAM_SERIAL: u32 = 1;

/// Export a stream as a single-logical-stream container.
///
/// # Errors
///
/// Fails on an empty stream, an unreadable packet, or output I/O errors.
pub fn export(stream: &VoiceStream, out: &mut impl Write) -> Result<()> {
    let count = stream.packet_count();
    if count == 0 {
        return Err(VoiceError::Container("empty stream is not valid".to_string()));
    }
    let preskip = u16::try_from(stream.pregap())
        .map_err(|_| VoiceError::Container("pregap too large for container".to_string()))?;
    let mut writer = PacketWriter::new(out);

    // Identification header, RFC 7845 §5.1 layout.
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(1); // channels
    head.extend_from_slice(&preskip.to_le_bytes());
    head.extend_from_slice(&48_000u32.to_le_bytes());
    head.extend_from_slice(&stream.gain().to_le_bytes());
    head.push(0); // channel mapping family
    writer.write_packet(head, STREAM_SERIAL, PacketWriteEndInfo::EndPage, 0)?;

    // Comment header.
    let vendor = "voicedeck";
    let comments = [
        format!("ENCODER=voicedeck {}", env!("CARGO_PKG_VERSION")),
        format!("LSNES_STREAM_TS={}", stream.timebase()),
    ];
    let mut tags = Vec::new();
    tags.extend_from_slice(b"OpusTags");
    #[allow(clippy::cast_possible_truncation)]
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor.as_bytes());
    #[allow(clippy::cast_possible_truncation)]
    tags.extend_from_slice(&(comments.len() as u32).to_le_bytes());
    for comment in &comments {
        #[allow(clippy::cast_possible_truncation)]
        tags.extend_from_slice(&(comment.len() as u32).to_le_bytes());
        tags.extend_from_slice(comment.as_bytes());
    }
    writer.write_packet(tags, STREAM_SERIAL, PacketWriteEndInfo::EndPage, 0)?;

    let mut granule = 0u64;
    for index in 0..count {
        let packet = stream.packet(index)?;
        if packet.is_empty() {
            return Err(VoiceError::Container("empty coded packet is not valid".to_string()));
        }
        let samples = u64::from(packet_ticks(&packet)) * u64::from(TICK_SAMPLES);
        if index + 1 < count {
            granule += samples;
        } else {
            // The final granule reports the audible sample count.
            granule =
                granule.max((granule + samples).saturating_sub(u64::from(stream.postgap())));
        }
        let end_info = if index + 1 == count {
            PacketWriteEndInfo::EndStream
        } else {
            PacketWriteEndInfo::NormalPacket
        };
        writer.write_packet(packet.to_vec(), STREAM_SERIAL, end_info, granule)?;
    }
    Ok(())
}

/// Import a container as a new stream with the given base time.
///
/// Parsing runs through four states (header, tags, data, end of stream);
/// multistream containers are rejected, a granule/sample mismatch logs a
/// warning, and the final granule deficit becomes the postgap.
///
/// # Errors
///
/// Fails on malformed input; the partial stream's clusters are released on
/// failure.
pub fn import(fs: &FsHandle, timebase: u64, input: impl Read + Seek) -> Result<VoiceStream> {
    let stream = VoiceStream::create(timebase, fs.clone());
    match parse_container(&stream, input) {
        Ok(()) => Ok(stream),
        Err(e) => {
            stream.mark_delete();
            Err(e)
        },
    }
}

fn parse_container(stream: &VoiceStream, input: impl Read + Seek) -> Result<()> {
    let mut reader = PacketReader::new(input);
    let mut state = 0u8;
    let mut serial: Option<u32> = None;
    let mut datalen = 0u64;
    let mut last_datalen = 0u64;
    let mut last_granule = 0u64;
    let mut postgap = 0u64;
    loop {
        let packet = match reader.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => {
                return Err(VoiceError::Container(format!("malformed container: {e}")));
            },
        };
        match serial {
            None => serial = Some(packet.stream_serial()),
            Some(first) if first != packet.stream_serial() => {
                return Err(VoiceError::Container(
                    "multistream containers are not supported".to_string(),
                ));
            },
            Some(_) => {},
        }
        match state {
            0 => {
                parse_header(&packet.data, stream)?;
                state = 1;
            },
            1 => {
                if packet.data.len() < 8 || &packet.data[..8] != b"OpusTags" {
                    return Err(VoiceError::Container("bad tags magic".to_string()));
                }
                state = 2;
            },
            _ => {
                let ticks = packet_ticks(&packet.data);
                if ticks != 0 {
                    stream.write(ticks, &packet.data)?;
                    datalen += u64::from(ticks) * u64::from(TICK_SAMPLES);
                }
                if packet.last_in_page() {
                    let granule = packet.absgp_page();
                    let mut samples = granule.wrapping_sub(last_granule);
                    if samples > granule {
                        samples = 0;
                    }
                    let decoded = datalen - last_datalen;
                    let at_eos = packet.last_in_stream();
                    if (samples > decoded && state == 3) || (samples < decoded && !at_eos) {
                        tracing::warn!(
                            granule_samples = samples,
                            packet_samples = decoded,
                            "granule position does not match sample count"
                        );
                    }
                    last_datalen = datalen;
                    last_granule = granule;
                    if at_eos {
                        if samples < decoded {
                            postgap = decoded - samples;
                        }
                        state = 4;
                        break;
                    }
                }
                state = 3;
            },
        }
    }
    match state {
        0 => Err(VoiceError::Container("no voice stream found".to_string())),
        1 => Err(VoiceError::Container("stream missing required tags page".to_string())),
        other => {
            if other == 2 || other == 3 {
                tracing::warn!("incomplete container stream");
            }
            if datalen <= u64::from(stream.pregap()) {
                return Err(VoiceError::Container(
                    "stream too short (entire pregap not present)".to_string(),
                ));
            }
            #[allow(clippy::cast_possible_truncation)]
            stream.set_postgap(postgap as u32);
            stream.write_trailer()
        },
    }
}

fn parse_header(data: &[u8], stream: &VoiceStream) -> Result<()> {
    if data.len() < 19 || &data[..8] != b"OpusHead" {
        return Err(VoiceError::Container("bad identification header magic".to_string()));
    }
    if data[8] & 0xF0 != 0 {
        return Err(VoiceError::Container("unsupported header version".to_string()));
    }
    let channels = data[9];
    if channels == 0 {
        return Err(VoiceError::Container("zero channels not allowed".to_string()));
    }
    let preskip = u16::from_le_bytes([data[10], data[11]]);
    let gain = i16::from_le_bytes([data[16], data[17]]);
    let map_family = data[18];
    if map_family == 0 {
        if channels > 2 {
            return Err(VoiceError::Container(
                "only 1 or 2 channels allowed with mapping family 0".to_string(),
            ));
        }
    } else if data.len() < 21 {
        return Err(VoiceError::Container("identification header truncated".to_string()));
    } else if data[19] != 1 {
        return Err(VoiceError::Container(
            "multistream containers are not supported".to_string(),
        ));
    }
    stream.set_pregap(u32::from(preskip));
    stream.set_gain(gain);
    Ok(())
}
