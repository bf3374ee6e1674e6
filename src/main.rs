//! CLI entry point for daq-recorder
//!
//! Provides two commands:
//! - `record`: drive a synthetic acquisition (sine + noise, TTL toggles, text
//!   messages) through the full recording pipeline
//! - `inspect`: print the header of a recorded file
//!
//! # Usage
//!
//! ```bash
//! daq-recorder record --dir /tmp/rec --base test --channels 8 --seconds 5
//! daq-recorder inspect /tmp/rec/test.dat
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use daq_recorder::engine::header::HeaderFields;
use daq_recorder::engine::metadata::SessionMetadata;
use daq_recorder::engine::npy::NpyHeader;
use daq_recorder::{logging, ChannelInfo, EventRecord, Ingest, Recorder, RecorderConfig, SpikeSourceInfo};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "daq-recorder")]
#[command(about = "Real-time multichannel recorder", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = "config/recorder.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record synthetic data
    Record {
        /// Destination directory
        #[arg(long, default_value = "recordings")]
        dir: PathBuf,

        /// Base file name
        #[arg(long, default_value = "session")]
        base: String,

        /// Number of continuous channels
        #[arg(long, default_value = "4")]
        channels: usize,

        /// Seconds of data to generate
        #[arg(long, default_value = "2.0")]
        seconds: f64,

        /// Sample rate in Hz
        #[arg(long, default_value = "30000")]
        rate: f32,

        /// Scale in microvolts per raw unit
        #[arg(long, default_value = "0.195")]
        scale: f64,

        /// Samples per block
        #[arg(long, default_value = "1024")]
        block: usize,

        /// Engines to enable, overriding the configuration
        #[arg(long = "engine")]
        engines: Vec<String>,

        /// Pace blocks at the sample rate instead of as fast as possible
        #[arg(long)]
        realtime: bool,
    },

    /// Print the header of a recorded file
    Inspect {
        /// `.dat`, `.din`, `.spk`, `.npy` or `.json` file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = RecorderConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Record {
            dir,
            base,
            channels,
            seconds,
            rate,
            scale,
            block,
            engines,
            realtime,
        } => {
            if !engines.is_empty() {
                config.engines.enabled = engines;
            }
            config.validate().map_err(|e| anyhow!(e))?;
            logging::init_from_config(&config).map_err(|e| anyhow!(e))?;
            let settings = Synthetic {
                channels,
                seconds,
                rate,
                scale,
                block,
                realtime,
            };
            record(config, dir, &base, &settings)
        }
        Commands::Inspect { file } => inspect(&file),
    }
}

struct Synthetic {
    channels: usize,
    seconds: f64,
    rate: f32,
    scale: f64,
    block: usize,
    realtime: bool,
}

fn record(config: RecorderConfig, dir: PathBuf, base: &str, synth: &Synthetic) -> Result<()> {
    let mut recorder = Recorder::new(config)?;
    for i in 0..synth.channels {
        recorder.add_channel(ChannelInfo::new(format!("CH{}", i + 1), 100, synth.rate, synth.scale))?;
    }
    recorder.add_spike_source(SpikeSourceInfo::new("Tetrode 1", 4, 40, synth.rate))?;

    let session = recorder.start_session(&dir, base)?;
    println!("Recording session {} to {}", session, dir.display());
    if let Some(usage) = recorder.free_space() {
        println!(
            "   Free space: {:.1} GiB ({:.0}% used)",
            usage.available as f64 / (1u64 << 30) as f64,
            usage.used_fraction() * 100.0
        );
    }

    let ingress = recorder.ingress();
    let total_samples = (synth.seconds * f64::from(synth.rate)) as i64;
    let block_period = Duration::from_secs_f64(synth.block as f64 / f64::from(synth.rate));
    let mut rng = rand::thread_rng();
    let mut buffer = vec![0.0f32; synth.block];
    let mut dropped = 0u64;
    let mut ttl_high = false;
    let started = Instant::now();

    let mut timestamp = 0i64;
    while timestamp < total_samples {
        for channel in 0..synth.channels {
            let freq = 5.0 + channel as f32 * 3.0;
            for (i, sample) in buffer.iter_mut().enumerate() {
                let t = (timestamp + i as i64) as f32 / synth.rate;
                *sample = 100.0 * (2.0 * std::f32::consts::PI * freq * t).sin() + rng.gen_range(-5.0..5.0);
            }
            if ingress.on_sample_block(channel, &buffer, timestamp) == Ingest::Dropped {
                dropped += 1;
            }
        }

        // one TTL edge per 100 ms of data
        let tick = (f64::from(synth.rate) / 10.0) as i64;
        let next = timestamp + synth.block as i64;
        if tick > 0 && timestamp / tick != next / tick {
            ttl_high = !ttl_high;
            let edge = (next / tick) * tick;
            ingress.on_event(EventRecord::ttl(edge, 0, 0, ttl_high, u64::from(ttl_high)));
            if rng.gen_bool(0.2) {
                ingress.on_spike(daq_recorder::SpikeRecord {
                    timestamp: edge,
                    source: 0,
                    sorted_unit: 0,
                    waveform: (0..160).map(|_| rng.gen_range(-80.0..80.0)).collect(),
                    gains: vec![synth.scale as f32; 4],
                    thresholds: vec![-50.0; 4],
                });
            }
        }
        timestamp = next;

        if synth.realtime {
            std::thread::sleep(block_period);
        }
    }
    ingress.on_event(EventRecord::text(timestamp, 0, "synthetic acquisition finished"));

    let report = recorder
        .stop_session()?
        .ok_or_else(|| anyhow!("session ended before stop"))?;
    println!();
    println!("Session {} stopped after {:.2?}", report.session_number, started.elapsed());
    println!(
        "   {} blocks, {} samples, {} events, {} spikes written",
        report.stats.blocks, report.stats.samples, report.stats.events, report.stats.spikes
    );
    if dropped > 0 || report.drops.total() > 0 {
        println!("   dropped on ingress: {}", report.drops);
    }
    for file in report.files() {
        println!("   {} ({} records)", file.path.display(), file.records);
    }
    for warning in &report.warnings {
        eprintln!("   warning: {warning}");
    }
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let name = file.to_string_lossy();
    if name.ends_with(".npy") {
        let header = NpyHeader::read(file)?;
        println!("{}", file.display());
        println!("   descr: {}", header.descr);
        println!("   shape: {:?}", header.shape);
        println!("   data offset: {}", header.data_offset);
    } else if name.ends_with(".json") {
        let metadata = SessionMetadata::read(file)?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    } else {
        let fields = HeaderFields::read(file)?;
        println!("{} ({} header bytes)", file.display(), fields.header_bytes);
        for (key, value) in fields.iter() {
            println!("   {key} = {value}");
        }
    }
    Ok(())
}
