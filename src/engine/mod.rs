//! Recording engines: pluggable serializers for one session's data.
//!
//! An engine is owned by the writer thread for the duration of a session and is
//! never touched by any other thread while it is recording, so engines need no
//! internal locking. Every active engine receives every record, in the same
//! order.
//!
//! Two engines ship with the crate:
//! - [`BinaryEngine`] (`binary`): interleaved `i16` `.dat` files with text headers,
//!   `.din` TTL words, `.spk` spike files, a `.msg` text log and `.json` metadata.
//! - [`NpyEngine`] (`npy`): the same streams as NumPy arrays.

pub mod binary;
pub(crate) mod frames;
pub mod header;
pub(crate) mod messages;
pub mod metadata;
pub mod npy;
pub mod npy_engine;
pub mod scale;

pub use binary::BinaryEngine;
pub use frames::AlignmentStats;
pub use npy_engine::NpyEngine;

use crate::channel::{ChannelIndex, ChannelInfo, ChannelMap, SpikeSourceInfo};
use crate::config::EngineConfig;
use crate::error::{RecordError, RecordResult};
use crate::paths::session_file_name;
use crate::record::{EventRecord, SpikeRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything an engine needs to open one session's files.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Destination directory (already created)
    pub directory: PathBuf,
    /// Base file name
    pub base_name: String,
    /// Session number within the directory
    pub session_number: u32,
    /// Channels recorded this session
    pub channels: Arc<ChannelMap>,
    /// Electrodes recorded this session, indexed by spike source id
    pub spike_sources: Arc<Vec<SpikeSourceInfo>>,
    /// Session creation time
    pub created: DateTime<Utc>,
    /// Frames a channel may run ahead of another before records are padded
    pub max_lag_frames: usize,
}

impl SessionContext {
    /// Path of one session file.
    pub fn file_path(&self, qualifier: Option<&str>, extension: &str) -> PathBuf {
        self.directory.join(session_file_name(
            &self.base_name,
            self.session_number,
            qualifier,
            extension,
        ))
    }

    /// Qualifier for processor group `group`: only used when several processors record.
    pub fn processor_qualifier(&self, group: usize) -> Option<String> {
        let groups = self.channels.groups();
        (groups.len() > 1).then(|| groups[group].processor_id.to_string())
    }
}

/// Result of opening a session.
#[derive(Debug, Clone, Default)]
pub struct OpenReport {
    /// Files created
    pub files: Vec<PathBuf>,
    /// Non-fatal problems, e.g. a file that already existed and was skipped
    pub warnings: Vec<String>,
}

/// Final state of one file at close.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSummary {
    /// File path
    pub path: PathBuf,
    /// Records in the file
    pub records: u64,
}

/// Result of closing a session.
#[derive(Debug, Clone, Default)]
pub struct CloseSummary {
    /// Engine identifier
    pub engine: String,
    /// Every file that was open
    pub files: Vec<FileSummary>,
    /// Files that could not be finalized cleanly
    pub errors: Vec<String>,
    /// Files whose channels needed zero-filling or dropped samples
    pub warnings: Vec<String>,
}

impl CloseSummary {
    /// Records written to the first file whose name ends with `suffix`.
    pub fn records_for(&self, suffix: &str) -> Option<u64> {
        self.files
            .iter()
            .find(|f| f.path.to_string_lossy().ends_with(suffix))
            .map(|f| f.records)
    }
}

/// A serializer that persists one session's records.
pub trait RecordEngine: Send {
    /// Registry name, e.g. `binary`.
    fn engine_id(&self) -> &str;

    /// The live channel set was cleared.
    fn reset_channels(&mut self) {}

    /// A channel was added to the live channel set.
    fn channel_added(&mut self, _index: ChannelIndex, _info: &ChannelInfo) {}

    /// Create this session's files.
    ///
    /// Files that already exist are skipped with a warning. Fails when no file
    /// could be opened at all, or on any other I/O error.
    fn open_session(&mut self, ctx: &SessionContext) -> RecordResult<OpenReport>;

    /// Append one block of channel-map slot `slot`, first sample at `timestamp`.
    fn write_continuous(&mut self, slot: usize, timestamp: i64, samples: &[f32]) -> RecordResult<()>;

    /// Append one event.
    fn write_event(&mut self, event: &EventRecord) -> RecordResult<()>;

    /// Append one spike.
    fn write_spike(&mut self, spike: &SpikeRecord) -> RecordResult<()>;

    /// Flush, rewrite counts and close every file.
    fn close_session(&mut self) -> RecordResult<CloseSummary>;

    /// Abandon a session that failed to start: close and remove its files.
    fn discard_session(&mut self);
}

/// Keep going when a session file already exists; any other error is fatal.
pub(crate) fn skip_existing<T>(result: RecordResult<T>, report: &mut OpenReport) -> RecordResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(RecordError::FileAlreadyExists { path }) => {
            tracing::warn!(path = %path.display(), "file already exists, not recording to it");
            report
                .warnings
                .push(format!("{} already exists, not recording to it", path.display()));
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Report a continuous file whose channels did not line up.
pub(crate) fn note_alignment(summary: &mut CloseSummary, path: &std::path::Path, stats: AlignmentStats) {
    if stats.is_clean() {
        return;
    }
    tracing::warn!(path = %path.display(), %stats, "continuous file was realigned");
    summary.warnings.push(format!("{}: {stats}", file_name(path)));
}

/// File name component of a session file path.
pub(crate) fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Best-effort removal of files created by a session that never started.
pub(crate) fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!(path = %path.display(), error = %e, "could not remove discarded file");
        }
    }
}

/// Options shared by the built-in engines.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Frames per continuous record
    pub block_length: usize,
    /// Largest timestamp gap zero-filled on a continuous channel
    pub max_gap_frames: usize,
    /// Records between in-place header rewrites
    pub count_update_interval: u64,
    /// Persist TTL words
    pub record_ttl_words: bool,
    /// Base added to channel numbers in metadata
    pub channel_base: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            block_length: config.block_length.max(1),
            max_gap_frames: config.max_gap_frames,
            count_update_interval: config.count_update_interval.max(1),
            record_ttl_words: config.record_ttl_words,
            channel_base: config.channel_base,
        }
    }
}

type EngineFactory = Box<dyn Fn(&EngineOptions) -> Box<dyn RecordEngine> + Send + Sync>;

/// Registry of engine factories keyed by name.
///
/// The built-in engines are registered on construction; applications can add
/// their own with [`EngineRegistry::register`].
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    /// Registry with `binary` and `npy`.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("binary", |opts| Box::new(BinaryEngine::new(opts.clone())));
        registry.register("npy", |opts| Box::new(NpyEngine::new(opts.clone())));
        registry
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&EngineOptions) -> Box<dyn RecordEngine> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate one engine.
    pub fn create(&self, name: &str, options: &EngineOptions) -> RecordResult<Box<dyn RecordEngine>> {
        self.factories
            .get(name)
            .map(|factory| factory(options))
            .ok_or_else(|| {
                RecordError::Configuration(format!(
                    "Unknown engine '{}'. Available: {}",
                    name,
                    self.list().join(", ")
                ))
            })
    }

    /// Instantiate every engine enabled in `config`, in order.
    pub fn create_enabled(&self, config: &EngineConfig) -> RecordResult<Vec<Box<dyn RecordEngine>>> {
        let options = EngineOptions::from(config);
        config
            .enabled
            .iter()
            .map(|name| self.create(name, &options))
            .collect()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
