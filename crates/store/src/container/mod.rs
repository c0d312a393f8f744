// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Interchange with external container formats.
//!
//! Two layouts are supported: a fixed-header linear PCM file (`sox`) and a
//! page-structured container of coded packets (`ogg`). Import always
//! produces a sealed stream; a failed import releases any clusters the
//! partial stream allocated.

pub mod oggvoice;
pub mod sox;

use crate::filesys::FsHandle;
use crate::stream::VoiceStream;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use voicedeck_core::{EngineConfig, ExternalFormat, Result};

/// Import `path` as a new stream with the given base time.
///
/// # Errors
///
/// Fails on I/O errors, malformed input, or encoder errors (sox input is
/// transcoded with the configured bitrates).
pub fn import_stream(
    fs: &FsHandle,
    timebase: u64,
    path: &Path,
    format: ExternalFormat,
    config: &EngineConfig,
) -> Result<VoiceStream> {
    let mut reader = BufReader::new(File::open(path)?);
    match format {
        ExternalFormat::Sox => sox::import(fs, timebase, &mut reader, config),
        ExternalFormat::Ogg => oggvoice::import(fs, timebase, reader),
    }
}

/// Export a stream to `path`.
///
/// # Errors
///
/// Fails on I/O errors or (for sox output) decode errors.
pub fn export_stream(stream: &VoiceStream, path: &Path, format: ExternalFormat) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    match format {
        ExternalFormat::Sox => sox::export(stream, &mut writer)?,
        ExternalFormat::Ogg => oggvoice::export(stream, &mut writer)?,
    }
    writer.flush()?;
    Ok(())
}
