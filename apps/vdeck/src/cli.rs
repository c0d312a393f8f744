// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Offline maintenance of commentary collection images: everything the
//! in-emulator engine can do to a collection, minus the realtime parts.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use voicedeck_core::{parse_timebase, timebase_seconds, EngineConfig, ExternalFormat};
use voicedeck_rrdata::RerecordSet;
use voicedeck_store::container;
use voicedeck_store::filesys::FsHandle;
use voicedeck_store::StreamCollection;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the streams in a collection image
    List {
        /// Path to the collection image
        collection: PathBuf,
    },
    /// Import an external audio file as a new stream
    Import {
        collection: PathBuf,
        /// Input file (PCM "sox" or coded-packet "ogg")
        input: PathBuf,
        /// Timeline position: samples at 48 kHz, or seconds with an `s`
        /// suffix (e.g. `12.5s`)
        #[arg(long, default_value = "0")]
        at: String,
        #[arg(long, value_parser = parse_format, default_value = "ogg")]
        format: ExternalFormat,
        /// Encoder bitrate for PCM input, bits per second
        #[arg(long, default_value_t = 48_000)]
        bitrate: i32,
    },
    /// Export a stream to an external audio file
    Export {
        collection: PathBuf,
        id: u64,
        output: PathBuf,
        #[arg(long, value_parser = parse_format, default_value = "ogg")]
        format: ExternalFormat,
    },
    /// Delete a stream from a collection
    Delete {
        collection: PathBuf,
        id: u64,
    },
    /// Move a stream on the timeline
    Retime {
        collection: PathBuf,
        id: u64,
        /// New position: samples at 48 kHz, or seconds with an `s` suffix
        at: String,
    },
    /// Change a stream's gain
    Gain {
        collection: PathBuf,
        id: u64,
        /// Gain in dB, within ±128
        db: f32,
    },
    /// Render the whole mixed timeline to a PCM file
    Mixdown {
        collection: PathBuf,
        output: PathBuf,
    },
    /// Report the rerecord count of a project's identifier log
    Rerecords {
        /// Path to the rerecord log file
        project: PathBuf,
    },
}

fn parse_format(value: &str) -> Result<ExternalFormat, String> {
    value.parse().map_err(|e| format!("{e}"))
}

fn open_collection(path: &Path) -> anyhow::Result<StreamCollection> {
    let fs = FsHandle::open(path)
        .with_context(|| format!("can't open collection image {}", path.display()))?;
    StreamCollection::open(fs).context("can't parse collection")
}

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::List { collection } => {
            let collection = open_collection(collection)?;
            let infos = collection.infos();
            if infos.is_empty() {
                println!("no streams");
                return Ok(());
            }
            for info in infos {
                let gain_db = collection
                    .get(info.id)
                    .map_or(0.0, |s| f32::from(s.gain()) / 256.0);
                println!(
                    "#{:<4} at {:>12} ({:>9.3}s)  length {:>10} ({:>8.3}s)  gain {:+.2} dB",
                    info.id,
                    info.timebase,
                    timebase_seconds(info.timebase),
                    info.length,
                    timebase_seconds(info.length),
                    gain_db,
                );
            }
        },
        Commands::Import { collection, input, at, format, bitrate } => {
            let timebase = parse_timebase(at)?;
            let config = EngineConfig { bitrate: *bitrate, ..EngineConfig::default() };
            config.validate()?;
            let collection = open_collection(collection)?;
            let stream = container::import_stream(
                &collection.filesystem(),
                timebase,
                input,
                *format,
                &config,
            )?;
            let stream = std::sync::Arc::new(stream);
            let id = collection.add(std::sync::Arc::clone(&stream))?;
            stream.unlock();
            println!("imported as stream #{id} ({} samples)", stream.length());
        },
        Commands::Export { collection, id, output, format } => {
            let collection = open_collection(collection)?;
            let stream = collection
                .get(*id)
                .with_context(|| format!("no stream #{id}"))?;
            container::export_stream(&stream, output, *format)?;
            println!("exported stream #{id} to {}", output.display());
        },
        Commands::Delete { collection, id } => {
            let collection = open_collection(collection)?;
            collection.delete(*id)?;
            println!("deleted stream #{id}");
        },
        Commands::Retime { collection, id, at } => {
            let timebase = parse_timebase(at)?;
            let collection = open_collection(collection)?;
            collection.retime(*id, timebase)?;
            println!("stream #{id} moved to {timebase}");
        },
        Commands::Gain { collection, id, db } => {
            let units = (db * 256.0).round();
            anyhow::ensure!(
                (f32::from(i16::MIN)..=f32::from(i16::MAX)).contains(&units),
                "gain out of range (±128 dB)"
            );
            let collection = open_collection(collection)?;
            #[allow(clippy::cast_possible_truncation)]
            collection.regain(*id, units as i16)?;
            println!("stream #{id} gain set to {db:+.2} dB");
        },
        Commands::Mixdown { collection, output } => {
            let collection = open_collection(collection)?;
            let mut out = std::io::BufWriter::new(
                std::fs::File::create(output)
                    .with_context(|| format!("can't create {}", output.display()))?,
            );
            collection.export_superstream(&mut out)?;
            std::io::Write::flush(&mut out)?;
            println!("wrote mixed timeline to {}", output.display());
        },
        Commands::Rerecords { project } => {
            let mut set = RerecordSet::new();
            set.read_base(project, false)?;
            println!("{}", set.count());
            set.close();
        },
    }
    Ok(())
}
