//! Structured session metadata written next to the data files.

use crate::channel::ChannelMap;
use crate::engine::{AlignmentStats, SessionContext};
use crate::error::{RecordError, RecordResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Format identifier written into every metadata file.
pub const FORMAT_NAME: &str = "DAQ-RAW";
/// Format version written into every metadata file and header.
pub const FORMAT_VERSION: &str = "0.4";

/// One recorded channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMeta {
    /// Channel number, offset by `channel_base`
    pub index: usize,
    /// Display name
    pub name: String,
    /// Source processor
    pub processor_id: u16,
    /// Samples per second
    pub sample_rate: f32,
    /// Physical units per raw unit
    pub scale: f64,
    /// Timestamp of the channel's first sample, once known
    pub start_timestamp: Option<i64>,
}

/// One interleaved continuous-data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousMeta {
    /// File name relative to the session directory
    pub file: String,
    /// Source processor
    pub processor_id: u16,
    /// Channel numbers in column order, offset by `channel_base`
    pub chans: Vec<usize>,
    /// Records written
    pub records: u64,
    /// Frames written
    pub frames: u64,
    /// Samples zero-filled or dropped while aligning channels
    #[serde(default)]
    pub alignment: AlignmentStats,
}

/// One spike file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeMeta {
    /// File name relative to the session directory
    pub file: String,
    /// Electrode name
    pub name: String,
    /// Channels per waveform
    pub num_channels: u16,
    /// Samples per channel per waveform
    pub samples_per_channel: u16,
    /// Records written
    pub records: u64,
}

/// Contents of a session metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Format identifier
    pub format: String,
    /// Format version
    pub version: String,
    /// Engine that wrote the session
    pub engine: String,
    /// Session creation time
    pub created: DateTime<Utc>,
    /// Session number within the directory
    pub session_number: u32,
    /// Base name of the session files
    pub base_name: String,
    /// Number added to 0-based channel indices in `chans`
    pub channel_base: u32,
    /// Number of recorded channels
    pub nchans: usize,
    /// Sample rate shared by all channels, if any
    pub sample_rate: Option<f32>,
    /// On-disk sample type
    pub dtype: String,
    /// Scale shared by all channels, if any
    pub scale: Option<f64>,
    /// Channel numbers in channel-map order
    pub chans: Vec<usize>,
    /// Per-channel details
    pub channels: Vec<ChannelMeta>,
    /// Continuous-data files
    pub continuous: Vec<ContinuousMeta>,
    /// TTL word file, if written
    pub ttl_file: Option<String>,
    /// Text message file, if written
    pub message_file: Option<String>,
    /// Spike files
    pub spikes: Vec<SpikeMeta>,
    /// Set once the session closed cleanly
    pub closed: bool,
}

impl SessionMetadata {
    /// Metadata for a freshly opened session.
    pub fn for_session(engine: &str, ctx: &SessionContext, channel_base: u32) -> Self {
        let map: &ChannelMap = &ctx.channels;
        let base = channel_base as usize;
        let channels: Vec<ChannelMeta> = map
            .entries()
            .iter()
            .map(|c| ChannelMeta {
                index: c.index + base,
                name: c.info.name.clone(),
                processor_id: c.info.processor_id,
                sample_rate: c.info.sample_rate,
                scale: c.info.scale,
                start_timestamp: None,
            })
            .collect();

        let uniform = |values: Vec<f64>| -> Option<f64> {
            let first = *values.first()?;
            values.iter().all(|&v| v == first).then_some(first)
        };
        let sample_rate = uniform(channels.iter().map(|c| f64::from(c.sample_rate)).collect())
            .map(|r| r as f32);
        let scale = uniform(channels.iter().map(|c| c.scale).collect());

        Self {
            format: FORMAT_NAME.to_string(),
            version: FORMAT_VERSION.to_string(),
            engine: engine.to_string(),
            created: ctx.created,
            session_number: ctx.session_number,
            base_name: ctx.base_name.clone(),
            channel_base,
            nchans: channels.len(),
            sample_rate,
            dtype: "int16".to_string(),
            scale,
            chans: channels.iter().map(|c| c.index).collect(),
            channels,
            continuous: Vec::new(),
            ttl_file: None,
            message_file: None,
            spikes: Vec::new(),
            closed: false,
        }
    }

    /// Write to a path that must not exist yet.
    pub fn create(&self, path: &Path) -> RecordResult<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| RecordError::fs(path, e))?;
        self.write_to(file, path)
    }

    /// Replace the contents of an existing metadata file.
    pub fn rewrite(&self, path: &Path) -> RecordResult<()> {
        let file = File::create(path).map_err(|e| RecordError::fs(path, e))?;
        self.write_to(file, path)
    }

    /// Load a metadata file.
    pub fn read(path: impl AsRef<Path>) -> RecordResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RecordError::fs(path, e))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    fn write_to(&self, file: File, path: &Path) -> RecordResult<()> {
        let mut out = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.write_all(b"\n")
            .and_then(|_| out.flush())
            .map_err(|e| RecordError::fs(path, e))
    }
}
