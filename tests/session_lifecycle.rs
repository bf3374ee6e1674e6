//! Session start/stop protocol: idle stops, slow writers, forced closes,
//! failing and panicking engines, timestamp jumps and resets.

use daq_recorder::engine::binary::spike_record_bytes;
use daq_recorder::engine::header::HeaderFields;
use daq_recorder::engine::metadata::SessionMetadata;
use daq_recorder::engine::{CloseSummary, OpenReport, SessionContext};
use daq_recorder::{
    ChannelInfo, EventRecord, Ingest, RecordEngine, RecordError, RecordResult, Recorder, RecorderConfig,
    RecorderState, SpikeRecord, SpikeSourceInfo, StatusLevel, StatusLog, StopOutcome,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[derive(Clone, Copy, PartialEq)]
enum Behaviour {
    Slow(Duration),
    PanicOnEvent,
    FailOpen,
}

struct TestEngine {
    behaviour: Behaviour,
}

impl TestEngine {
    fn boxed(behaviour: Behaviour) -> Box<dyn RecordEngine> {
        Box::new(Self { behaviour })
    }
}

impl RecordEngine for TestEngine {
    fn engine_id(&self) -> &str {
        "test"
    }

    fn open_session(&mut self, ctx: &SessionContext) -> RecordResult<OpenReport> {
        if self.behaviour == Behaviour::FailOpen {
            return Err(RecordError::FileSystem {
                path: ctx.directory.clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        Ok(OpenReport::default())
    }

    fn write_continuous(&mut self, _slot: usize, _timestamp: i64, _samples: &[f32]) -> RecordResult<()> {
        if let Behaviour::Slow(delay) = self.behaviour {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn write_event(&mut self, _event: &EventRecord) -> RecordResult<()> {
        if self.behaviour == Behaviour::PanicOnEvent {
            panic!("engine bug");
        }
        Ok(())
    }

    fn write_spike(&mut self, _spike: &SpikeRecord) -> RecordResult<()> {
        Ok(())
    }

    fn close_session(&mut self) -> RecordResult<CloseSummary> {
        Ok(CloseSummary {
            engine: "test".to_string(),
            ..CloseSummary::default()
        })
    }

    fn discard_session(&mut self) {}
}

fn recorder(config: RecorderConfig, channels: usize) -> Recorder {
    let mut recorder = Recorder::new(config).unwrap();
    for i in 0..channels {
        recorder
            .add_channel(ChannelInfo::new(format!("CH{i}"), 100, 30000.0, 0.195))
            .unwrap();
    }
    recorder
}

fn small_config() -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.queues.block_samples = 16;
    config.queues.data_blocks = 64;
    config.engines.block_length = 16;
    config
}

#[test]
fn test_stop_without_session_is_a_noop() {
    let mut recorder = recorder(small_config(), 2);
    assert!(recorder.stop_session().unwrap().is_none());
    assert!(recorder.stop_session().unwrap().is_none());
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert_eq!(recorder.session_number(), None);

    let dir = tempdir().unwrap();
    recorder.start_session(dir.path(), "rec").unwrap();
    assert!(recorder.stop_session().unwrap().is_some());
    assert!(recorder.stop_session().unwrap().is_none());
}

#[test]
fn test_slow_writer_times_out_then_waits() {
    let dir = tempdir().unwrap();
    let mut config = small_config();
    config.writer.join_timeout_ms = 20;
    config.writer.drain_timeout_ms = 10_000;
    let mut recorder = recorder(config, 1);
    recorder
        .add_engine(TestEngine::boxed(Behaviour::Slow(Duration::from_millis(10))))
        .unwrap();

    recorder.start_session(dir.path(), "slow").unwrap();
    for n in 0..30 {
        assert_eq!(recorder.on_sample_block(0, &[1.0; 16], n * 16), Ingest::Queued);
    }

    let err = recorder.stop_session().unwrap_err();
    assert!(matches!(err, RecordError::ThreadTimeout { .. }));
    assert!(err.is_recoverable());
    assert_eq!(recorder.state(), RecorderState::Stopping);
    // ingress is already closed while the writer drains
    assert_eq!(recorder.on_sample_block(0, &[1.0; 16], 480), Ingest::Idle);
    assert!(matches!(
        recorder.set_channel_enabled(0, false),
        Err(RecordError::InvalidState(_))
    ));

    let report = recorder
        .wait_for_writer(Duration::from_secs(10))
        .unwrap()
        .expect("writer finished");
    assert_eq!(report.outcome, StopOutcome::Clean);
    assert_eq!(report.stats.blocks, 30);
    assert_eq!(recorder.state(), RecorderState::Idle);

    let fields = HeaderFields::read(dir.path().join("slow.dat")).unwrap();
    assert_eq!(fields.get_u64("record_count"), Some(30));
}

#[test]
fn test_force_stop_closes_files_and_warns() {
    let dir = tempdir().unwrap();
    let mut config = small_config();
    config.writer.join_timeout_ms = 10;
    config.writer.drain_timeout_ms = 10_000;
    config.writer.force_timeout_ms = 2_000;
    let log = StatusLog::new(64);
    let mut recorder = recorder(config, 1).with_status_log(Arc::clone(&log));
    recorder
        .add_engine(TestEngine::boxed(Behaviour::Slow(Duration::from_millis(20))))
        .unwrap();

    recorder.start_session(dir.path(), "forced").unwrap();
    for n in 0..50 {
        recorder.on_sample_block(0, &[1.0; 16], n * 16);
    }
    assert!(matches!(
        recorder.stop_session(),
        Err(RecordError::ThreadTimeout { .. })
    ));

    let report = recorder.force_stop().unwrap().expect("session was stopping");
    let StopOutcome::Forced { discarded } = report.outcome else {
        panic!("expected a forced close, got {:?}", report.outcome);
    };
    assert!(discarded > 0);
    assert_eq!(discarded as u64 + report.stats.blocks, 50);
    assert!(!report.is_clean());
    assert_eq!(recorder.state(), RecorderState::Idle);

    let warnings = log.with_level(StatusLevel::Warning);
    assert!(warnings
        .iter()
        .any(|w| w.starts_with("Recording stopped before all data was written")));

    // the header count matches what reached the file
    let fields = HeaderFields::read(dir.path().join("forced.dat")).unwrap();
    assert_eq!(fields.get_u64("record_count"), Some(report.stats.blocks));
    assert!(SessionMetadata::read(dir.path().join("forced.json")).unwrap().closed);
}

#[test]
fn test_panicking_engine_surfaces_error_and_recovers() {
    let dir = tempdir().unwrap();
    let mut recorder = recorder(small_config(), 1);
    recorder.add_engine(TestEngine::boxed(Behaviour::PanicOnEvent)).unwrap();

    recorder.start_session(dir.path(), "panic").unwrap();
    recorder.on_sample_block(0, &[1.0; 16], 0);
    recorder.on_event(EventRecord::text(3, 0, "trigger"));
    let err = recorder.stop_session().unwrap_err();
    assert!(matches!(err, RecordError::WriterPanicked(ref m) if m.contains("engine bug")));
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert_eq!(recorder.engine_ids(), vec!["binary", "test"]);

    // the other engine still closed its files
    assert!(HeaderFields::read(dir.path().join("panic.dat")).is_ok());

    // and the recorder can record again
    assert_eq!(recorder.start_session(dir.path(), "panic").unwrap(), 1);
    recorder.stop_session().unwrap();
}

#[test]
fn test_failed_start_cleans_up_opened_engines() {
    let dir = tempdir().unwrap();
    let log = StatusLog::new(16);
    let mut recorder = recorder(small_config(), 2).with_status_log(Arc::clone(&log));
    recorder.add_engine(TestEngine::boxed(Behaviour::FailOpen)).unwrap();

    let err = recorder.start_session(dir.path(), "broken").unwrap_err();
    assert!(matches!(err, RecordError::FileSystem { .. }));
    assert!(!err.is_recoverable());
    assert_eq!(recorder.state(), RecorderState::Idle);
    assert_eq!(recorder.on_sample_block(0, &[0.0; 16], 0), Ingest::Idle);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "files left behind: {leftovers:?}");
    assert_eq!(log.with_level(StatusLevel::Error).len(), 1);
}

#[test]
fn test_destination_that_is_a_file_fails() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let mut recorder = recorder(small_config(), 1);
    let err = recorder.start_session(blocker.join("sub"), "rec").unwrap_err();
    assert!(matches!(err, RecordError::FileSystem { .. }));
    assert_eq!(recorder.state(), RecorderState::Idle);
}

#[test]
fn test_sync_channels_between_sessions() {
    let dir = tempdir().unwrap();
    let mut recorder = recorder(small_config(), 2);
    recorder.start_session(dir.path(), "topo").unwrap();
    let provider = vec![ChannelInfo::new("X", 100, 30000.0, 1.0)];
    assert!(matches!(
        recorder.sync_channels(&provider),
        Err(RecordError::InvalidState(_))
    ));
    recorder.stop_session().unwrap();

    let provider = vec![
        ChannelInfo::new("X", 100, 30000.0, 1.0),
        ChannelInfo::new("Y", 100, 30000.0, 1.0).with_enabled(false),
        ChannelInfo::new("Z", 100, 30000.0, 1.0),
    ];
    recorder.sync_channels(&provider).unwrap();
    assert_eq!(recorder.channels().len(), 3);

    recorder.start_session(dir.path(), "topo").unwrap();
    let status = recorder.channel_status();
    assert_eq!(
        status.iter().map(|s| s.recording).collect::<Vec<_>>(),
        vec![true, false, true]
    );
    recorder.stop_session().unwrap();

    let metadata = SessionMetadata::read(dir.path().join("topo_1.json")).unwrap();
    assert_eq!(metadata.chans, vec![0, 2]);
}

#[test]
fn test_spikes_written_with_fixed_layout() {
    let dir = tempdir().unwrap();
    let mut recorder = recorder(small_config(), 1);
    let source = SpikeSourceInfo::new("TT1", 4, 40, 30000.0);
    assert_eq!(recorder.add_spike_source(source.clone()).unwrap(), 0);

    recorder.start_session(dir.path(), "spk").unwrap();
    for n in 0..3 {
        let spike = SpikeRecord {
            timestamp: 100 * n,
            source: 0,
            sorted_unit: n as u16,
            waveform: vec![1.5; 160],
            gains: vec![0.195; 4],
            thresholds: vec![-40.0; 4],
        };
        assert_eq!(recorder.on_spike(spike), Ingest::Queued);
    }
    let report = recorder.stop_session().unwrap().unwrap();
    assert_eq!(report.stats.spikes, 3);

    let path = dir.path().join("spk-TT1.spk");
    let fields = HeaderFields::read(&path).unwrap();
    assert_eq!(fields.get_u64("record_count"), Some(3));
    assert_eq!(fields.get("electrode"), Some("TT1"));
    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, fields.header_bytes + 3 * spike_record_bytes(&source) as u64);
}

#[test]
fn test_session_queries() {
    let dir = tempdir().unwrap();
    let mut recorder = recorder(small_config(), 1);
    assert!(recorder.free_space().is_none());

    recorder.start_session(dir.path(), "q").unwrap();
    assert_eq!(recorder.session_number(), Some(0));
    assert_eq!(recorder.destination(), Some(dir.path()));
    assert!(recorder.session_files().iter().any(|p| p.ends_with("q.dat")));
    if let Some(usage) = recorder.free_space() {
        assert!(usage.available <= usage.total);
        assert!((0.0..=1.0).contains(&usage.used_fraction()));
    }
    recorder.stop_session().unwrap();
    assert_eq!(recorder.drop_counts().total(), 0);
}

#[test]
fn test_drop_while_recording_finalizes_files() {
    let dir = tempdir().unwrap();
    {
        let mut recorder = recorder(small_config(), 2);
        recorder.start_session(dir.path(), "dropped").unwrap();
        recorder.on_sample_block(0, &[1.0; 16], 0);
        recorder.on_sample_block(1, &[1.0; 16], 0);
    }
    assert!(HeaderFields::read(dir.path().join("dropped.dat")).is_ok());
    assert!(SessionMetadata::read(dir.path().join("dropped.json")).is_ok());
}

#[test]
fn test_timestamp_jump_is_recorded_as_discontinuity() {
    let dir = tempdir().unwrap();
    let log = StatusLog::new(64);
    let mut recorder = recorder(small_config(), 1).with_status_log(Arc::clone(&log));
    recorder.start_session(dir.path(), "jump").unwrap();
    assert_eq!(recorder.on_sample_block(0, &[1.0; 16], 0), Ingest::Queued);
    assert_eq!(recorder.on_sample_block(0, &[2.0], 200_000_000), Ingest::Queued);

    let start = Instant::now();
    let report = recorder.stop_session().unwrap().expect("session was active");
    assert!(start.elapsed() < Duration::from_secs(2), "stop took {:?}", start.elapsed());
    assert_eq!(report.outcome, StopOutcome::Clean);
    assert!(!report.is_clean());
    assert!(
        report.warnings.iter().any(|w| w.contains("1 timestamp discontinuities")),
        "warnings: {:?}",
        report.warnings
    );
    assert!(log
        .with_level(StatusLevel::Warning)
        .iter()
        .any(|w| w.contains("jump.dat")));

    // the channel continues after its last frame instead of zero-filling the jump
    let path = dir.path().join("jump.dat");
    let fields = HeaderFields::read(&path).unwrap();
    assert_eq!(fields.get_u64("sample_count"), Some(17));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), fields.header_bytes + 17 * 2);

    let meta = SessionMetadata::read(dir.path().join("jump.json")).unwrap();
    assert_eq!(meta.continuous[0].alignment.discontinuities, 1);
    assert_eq!(meta.continuous[0].alignment.padded_samples, 0);
    assert!(meta.closed);
}

#[test]
fn test_force_stop_after_timestamp_jump() {
    let dir = tempdir().unwrap();
    let mut config = small_config();
    config.writer.join_timeout_ms = 10;
    config.writer.drain_timeout_ms = 10_000;
    config.writer.force_timeout_ms = 1_000;
    let mut recorder = recorder(config, 1);
    recorder
        .add_engine(TestEngine::boxed(Behaviour::Slow(Duration::from_millis(20))))
        .unwrap();

    recorder.start_session(dir.path(), "jumpforced").unwrap();
    for n in 0..20i64 {
        let timestamp = if n < 10 { n * 16 } else { 200_000_000 + n * 16 };
        assert_eq!(recorder.on_sample_block(0, &[1.0; 16], timestamp), Ingest::Queued);
    }
    assert!(matches!(
        recorder.stop_session(),
        Err(RecordError::ThreadTimeout { .. })
    ));

    let report = recorder.force_stop().unwrap().expect("session was stopping");
    assert!(matches!(report.outcome, StopOutcome::Forced { .. }));
    assert_eq!(recorder.state(), RecorderState::Idle);

    // every block that reached the file is one record; the jump added none
    let fields = HeaderFields::read(dir.path().join("jumpforced.dat")).unwrap();
    assert_eq!(fields.get_u64("record_count"), Some(report.stats.blocks));
    assert_eq!(fields.get_u64("sample_count"), Some(report.stats.blocks * 16));
}

#[test]
fn test_timestamp_reset_drops_rewritten_frames() {
    let dir = tempdir().unwrap();
    let mut config = small_config();
    config.queues.block_samples = 64;
    config.engines.block_length = 64;
    let log = StatusLog::new(64);
    let mut recorder = recorder(config, 1).with_status_log(Arc::clone(&log));
    recorder.start_session(dir.path(), "reset").unwrap();
    for timestamp in [0, 0, 64] {
        assert_eq!(recorder.on_sample_block(0, &[1.0; 64], timestamp), Ingest::Queued);
    }

    let report = recorder.stop_session().unwrap().expect("session was active");
    assert_eq!(report.stats.samples, 192);
    assert!(!report.is_clean());
    assert!(
        report.warnings.iter().any(|w| w.contains("64 samples dropped")),
        "warnings: {:?}",
        report.warnings
    );
    let summary = report.summaries.iter().find(|s| s.engine == "binary").unwrap();
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.errors.is_empty());
    assert!(log
        .with_level(StatusLevel::Warning)
        .iter()
        .any(|w| w.contains("64 samples dropped")));

    let fields = HeaderFields::read(dir.path().join("reset.dat")).unwrap();
    assert_eq!(fields.get_u64("sample_count"), Some(128));
    let meta = SessionMetadata::read(dir.path().join("reset.json")).unwrap();
    assert_eq!(meta.continuous[0].alignment.dropped_samples, 64);
    assert_eq!(meta.continuous[0].frames, 128);
}
