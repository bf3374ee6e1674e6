//! Recorder configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/recorder.toml` (base configuration)
//! 2. Environment variables (prefixed with `DAQ_RECORDER_`, sections split on `__`)
//!
//! Every field carries a serde default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use daq_recorder::config::RecorderConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RecorderConfig::load()?;
//! config.validate()?;
//! println!("Engines: {:?}", config.engines.enabled);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine names accepted in `[engines] enabled`.
pub const KNOWN_ENGINES: [&str; 2] = ["binary", "npy"];

/// Top-level recorder configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Queue sizing
    pub queues: QueueConfig,
    /// Writer thread timing
    pub writer: WriterConfig,
    /// Recording engine selection and file layout
    pub engines: EngineConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Capacities of the per-session queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Samples per channel per acquisition block
    pub block_samples: usize,
    /// Blocks buffered per channel
    pub data_blocks: usize,
    /// Event records buffered
    pub event_capacity: usize,
    /// Spike records buffered
    pub spike_capacity: usize,
}

/// Writer thread timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Sleep between polls when every queue is empty
    pub poll_interval_ms: u64,
    /// Upper bound on draining after a stop request
    pub drain_timeout_ms: u64,
    /// How long `stop_session` waits for the thread before reporting a timeout
    pub join_timeout_ms: u64,
    /// How long `force_stop` waits for files to close
    pub force_timeout_ms: u64,
    /// Interval between queue overflow warnings
    pub overflow_report_interval_ms: u64,
}

/// Engine selection and shared file layout options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engines opened for every session, in dispatch order
    pub enabled: Vec<String>,
    /// Frames per continuous record
    pub block_length: usize,
    /// Largest timestamp gap, in frames, zero-filled on a continuous channel;
    /// larger jumps are recorded as discontinuities
    pub max_gap_frames: usize,
    /// Records between in-place header count rewrites
    pub count_update_interval: u64,
    /// Persist TTL words
    pub record_ttl_words: bool,
    /// Base written to metadata so consumers know how `chans` is numbered
    pub channel_base: u32,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            block_samples: 1024,
            data_blocks: 64,
            event_capacity: 1024,
            spike_capacity: 4096,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2,
            drain_timeout_ms: 2000,
            join_timeout_ms: 2500,
            force_timeout_ms: 100,
            overflow_report_interval_ms: 1000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["binary".to_string()],
            block_length: 1024,
            max_gap_frames: 1 << 20,
            count_update_interval: 1,
            record_ttl_words: true,
            channel_base: 0,
        }
    }
}

impl QueueConfig {
    /// Sample capacity of each per-channel ring.
    pub fn samples_per_channel(&self) -> usize {
        self.block_samples.saturating_mul(self.data_blocks)
    }
}

impl WriterConfig {
    /// Idle poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Drain bound after stop
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Join bound for `stop_session`
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Join bound for `force_stop`
    pub fn force_timeout(&self) -> Duration {
        Duration::from_millis(self.force_timeout_ms)
    }

    /// Overflow warning cadence
    pub fn overflow_report_interval(&self) -> Duration {
        Duration::from_millis(self.overflow_report_interval_ms)
    }
}

impl RecorderConfig {
    /// Load configuration from `config/recorder.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `DAQ_RECORDER_`.
    /// Example: `DAQ_RECORDER_QUEUES__DATA_BLOCKS=128`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/recorder.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack used by [`RecorderConfig::load_from`].
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(RecorderConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_RECORDER_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let q = &self.queues;
        for (name, value) in [
            ("block_samples", q.block_samples),
            ("data_blocks", q.data_blocks),
            ("event_capacity", q.event_capacity),
            ("spike_capacity", q.spike_capacity),
        ] {
            if value == 0 {
                return Err(format!("Invalid queues.{name} 0. Must be at least 1"));
            }
        }

        if self.writer.drain_timeout_ms == 0 || self.writer.join_timeout_ms == 0 {
            return Err("Writer drain and join timeouts must be non-zero".to_string());
        }

        if self.engines.enabled.is_empty() {
            return Err("At least one recording engine must be enabled".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.engines.enabled {
            if !KNOWN_ENGINES.contains(&name.as_str()) {
                return Err(format!(
                    "Unknown engine '{}'. Must be one of: {}",
                    name,
                    KNOWN_ENGINES.join(", ")
                ));
            }
            if !seen.insert(name) {
                return Err(format!("Duplicate engine: {name}"));
            }
        }

        if self.engines.block_length == 0 {
            return Err("Invalid engines.block_length 0. Must be at least 1".to_string());
        }
        if self.engines.max_gap_frames < self.engines.block_length {
            return Err(format!(
                "Invalid engines.max_gap_frames {}. Must be at least block_length ({})",
                self.engines.max_gap_frames, self.engines.block_length
            ));
        }
        if self.engines.count_update_interval == 0 {
            return Err("Invalid engines.count_update_interval 0. Must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = RecorderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queues.samples_per_channel(), 1024 * 64);
        assert_eq!(config.engines.enabled, vec!["binary".to_string()]);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[queues]\ndata_blocks = 8\n\n[engines]\nenabled = [\"binary\", \"npy\"]\nblock_length = 64"
        )
        .unwrap();

        let config = RecorderConfig::load_from(file.path()).unwrap();
        assert_eq!(config.queues.data_blocks, 8);
        assert_eq!(config.queues.block_samples, 1024);
        assert_eq!(config.engines.block_length, 64);
        assert_eq!(config.engines.enabled.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecorderConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RecorderConfig::default());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = RecorderConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = RecorderConfig::default();
        config.queues.event_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("event_capacity"));
    }

    #[test]
    fn test_gap_bound_below_block_length_rejected() {
        let mut config = RecorderConfig::default();
        config.engines.max_gap_frames = 16;
        let err = config.validate().unwrap_err();
        assert!(err.contains("max_gap_frames"));
    }

    #[test]
    fn test_unknown_and_duplicate_engines() {
        let mut config = RecorderConfig::default();
        config.engines.enabled = vec!["hdf5".to_string()];
        assert!(config.validate().unwrap_err().contains("hdf5"));

        config.engines.enabled = vec!["npy".to_string(), "npy".to_string()];
        assert!(config.validate().unwrap_err().contains("Duplicate"));
    }
}
