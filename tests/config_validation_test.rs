//! The shipped configuration file loads, validates and matches the built-in defaults.

use daq_recorder::config::RecorderConfig;
use daq_recorder::logging::TracingConfig;
use daq_recorder::Recorder;
use std::path::PathBuf;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/recorder.toml")
}

#[test]
fn test_shipped_config_matches_defaults() {
    let config = RecorderConfig::load_from(shipped_config()).expect("config/recorder.toml parses");
    assert!(config.validate().is_ok());
    assert_eq!(config, RecorderConfig::default());
}

#[test]
fn test_shipped_config_builds_a_recorder() {
    let config = RecorderConfig::load_from(shipped_config()).unwrap();
    let logging = TracingConfig::from_recorder_config(&config).unwrap();
    assert_eq!(logging.level, tracing::Level::INFO);

    let recorder = Recorder::new(config).unwrap();
    assert_eq!(recorder.engine_ids(), vec!["binary"]);
}

#[test]
fn test_invalid_config_refused_by_recorder() {
    let mut config = RecorderConfig::default();
    config.engines.enabled = vec!["parquet".to_string()];
    assert!(Recorder::new(config).is_err());
}
