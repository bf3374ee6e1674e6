//! Both engines active at once: the NumPy arrays carry the same samples as the
//! raw `.dat` file, and the file sets do not collide.

use daq_recorder::engine::header::HeaderFields;
use daq_recorder::engine::metadata::SessionMetadata;
use daq_recorder::engine::npy::{NpyHeader, NPY_HEADER_LEN};
use daq_recorder::{ChannelInfo, EventRecord, Ingest, Recorder, RecorderConfig, SpikeRecord, SpikeSourceInfo};
use tempfile::tempdir;

fn i16_payload(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[test]
fn test_binary_and_npy_record_the_same_session() {
    let dir = tempdir().unwrap();
    let mut config = RecorderConfig::default();
    config.engines.enabled = vec!["binary".to_string(), "npy".to_string()];
    config.queues.block_samples = 32;
    config.queues.data_blocks = 32;
    config.engines.block_length = 32;

    let mut recorder = Recorder::new(config).unwrap();
    assert_eq!(recorder.engine_ids(), vec!["binary", "npy"]);
    for i in 0..3 {
        recorder
            .add_channel(ChannelInfo::new(format!("CH{i}"), 100, 25000.0, 0.5))
            .unwrap();
    }
    recorder
        .add_spike_source(SpikeSourceInfo::new("SE0", 1, 8, 25000.0))
        .unwrap();

    recorder.start_session(dir.path(), "both").unwrap();
    for n in 0..10i64 {
        for channel in 0..3 {
            let block: Vec<f32> = (0..32).map(|i| (n * 32 + i) as f32 * 0.5 - channel as f32).collect();
            assert_eq!(recorder.on_sample_block(channel, &block, n * 32), Ingest::Queued);
        }
    }
    recorder.on_event(EventRecord::ttl(64, 0, 2, true, 4));
    recorder.on_event(EventRecord::text(70, 0, "hello"));
    recorder.on_spike(SpikeRecord {
        timestamp: 75,
        source: 0,
        sorted_unit: 2,
        waveform: vec![0.0; 8],
        gains: vec![1.0],
        thresholds: vec![-30.0],
    });
    let report = recorder.stop_session().unwrap().unwrap();
    assert!(report.is_clean(), "{:?}", report.warnings);
    assert_eq!(report.summaries.len(), 2);

    let npy = NpyHeader::read(dir.path().join("both.dat.npy")).unwrap();
    assert_eq!(npy.descr, "<i2");
    assert_eq!(npy.shape, vec![320, 3]);
    assert_eq!(npy.data_offset, NPY_HEADER_LEN as u64);

    let dat_path = dir.path().join("both.dat");
    let fields = HeaderFields::read(&dat_path).unwrap();
    let dat = std::fs::read(&dat_path).unwrap();
    let npy_bytes = std::fs::read(dir.path().join("both.dat.npy")).unwrap();
    assert_eq!(
        i16_payload(&dat[fields.header_bytes as usize..]),
        i16_payload(&npy_bytes[NPY_HEADER_LEN..])
    );

    let ttl = NpyHeader::read(dir.path().join("both.din.npy")).unwrap();
    assert_eq!((ttl.descr.as_str(), ttl.shape.clone()), ("<i8", vec![1, 2]));
    let spikes = NpyHeader::read(dir.path().join("both.spikes.npy")).unwrap();
    assert_eq!(spikes.shape, vec![1, 3]);

    let messages = std::fs::read_to_string(dir.path().join("both.msg.txt")).unwrap();
    assert!(messages.lines().any(|l| l.starts_with("## ")));
    assert!(messages.ends_with("70\thello\n"));

    let binary_meta = SessionMetadata::read(dir.path().join("both.json")).unwrap();
    let npy_meta = SessionMetadata::read(dir.path().join("both.dat.json")).unwrap();
    assert_eq!(binary_meta.engine, "binary");
    assert_eq!(npy_meta.engine, "npy");
    assert_eq!(binary_meta.chans, npy_meta.chans);
}
