//! NumPy engine.
//!
//! Writes the session as arrays that load directly with `numpy.load`:
//! - `<stem>[-<processor>].dat.npy`: `<i2`, shape `(frames, channels)`
//! - `<stem>.din.npy`: `<i8`, shape `(N, 2)` of `(timestamp, ttl word)`
//! - `<stem>.spikes.npy`: `<i8`, shape `(N, 3)` of `(timestamp, source, sorted unit)`
//! - `<stem>.msg.txt`: `## ` preamble, then `timestamp<TAB>message` lines
//! - `<stem>.dat.json`: [`SessionMetadata`]

use crate::engine::frames::FrameAssembler;
use crate::engine::messages::MessageLog;
use crate::engine::metadata::{ContinuousMeta, SessionMetadata};
use crate::engine::npy::NpyFile;
use crate::engine::{
    file_name, note_alignment, remove_files, scale, skip_existing, AlignmentStats, CloseSummary, EngineOptions,
    FileSummary, OpenReport, RecordEngine, SessionContext,
};
use crate::error::{RecordError, RecordResult};
use crate::record::{EventPayload, EventRecord, SpikeRecord};
use std::path::PathBuf;
use tracing::{info, warn};

struct Stream {
    group: usize,
    file: NpyFile,
    assembler: FrameAssembler,
    bytes: Vec<u8>,
    records: u64,
}

struct OpenSession {
    ctx: SessionContext,
    metadata: SessionMetadata,
    metadata_path: Option<PathBuf>,
    continuous: Vec<Option<Stream>>,
    ttl: Option<NpyFile>,
    spikes: Option<NpyFile>,
    messages: Option<MessageLog>,
    scratch: Vec<i16>,
    created: Vec<PathBuf>,
}

/// Engine writing `.npy` arrays.
pub struct NpyEngine {
    options: EngineOptions,
    session: Option<OpenSession>,
}

impl NpyEngine {
    /// Engine with the given options.
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            session: None,
        }
    }

    fn open_files(&self, ctx: &SessionContext, report: &mut OpenReport, created: &mut Vec<PathBuf>) -> RecordResult<OpenSession> {
        let interval = self.options.count_update_interval;
        let mut metadata = SessionMetadata::for_session(self.engine_id(), ctx, self.options.channel_base);

        let mut continuous = Vec::new();
        for (group, processor) in ctx.channels.groups().iter().enumerate() {
            let qualifier = ctx.processor_qualifier(group);
            let path = ctx.file_path(qualifier.as_deref(), "dat.npy");
            let columns = processor.num_channels();
            let Some(file) = skip_existing(NpyFile::create(path, "<i2", columns, interval), report)? else {
                continuous.push(None);
                continue;
            };
            created.push(file.path().to_path_buf());
            metadata.continuous.push(ContinuousMeta {
                file: file_name(file.path()),
                processor_id: processor.processor_id,
                chans: processor.slots.iter().map(|&s| metadata.chans[s]).collect(),
                records: 0,
                frames: 0,
                alignment: AlignmentStats::default(),
            });
            continuous.push(Some(Stream {
                group,
                file,
                assembler: FrameAssembler::new(
                    columns,
                    self.options.block_length,
                    ctx.max_lag_frames,
                    self.options.max_gap_frames,
                ),
                bytes: Vec::new(),
                records: 0,
            }));
        }

        let mut ttl = None;
        if self.options.record_ttl_words {
            ttl = skip_existing(NpyFile::create(ctx.file_path(None, "din.npy"), "<i8", 2, interval), report)?;
            if let Some(file) = &ttl {
                created.push(file.path().to_path_buf());
                metadata.ttl_file = Some(file_name(file.path()));
            }
        }

        let spikes = if ctx.spike_sources.is_empty() {
            None
        } else {
            skip_existing(NpyFile::create(ctx.file_path(None, "spikes.npy"), "<i8", 3, 1), report)?
        };
        if let Some(file) = &spikes {
            created.push(file.path().to_path_buf());
        }

        let preamble = [
            format!("session {} of {}", ctx.session_number, ctx.base_name),
            format!("created {}", ctx.created.to_rfc3339()),
            "timestamp\tmessage".to_string(),
        ];
        let messages = skip_existing(MessageLog::create(ctx.file_path(None, "msg.txt"), &preamble), report)?;
        if let Some(log) = &messages {
            created.push(log.path().to_path_buf());
            metadata.message_file = Some(file_name(log.path()));
        }

        let path = ctx.file_path(None, "dat.json");
        let metadata_path = skip_existing(metadata.create(&path).map(|_| path), report)?;
        if let Some(path) = &metadata_path {
            created.push(path.clone());
        }

        Ok(OpenSession {
            ctx: ctx.clone(),
            metadata,
            metadata_path,
            continuous,
            ttl,
            spikes,
            messages,
            scratch: Vec::new(),
            created: Vec::new(),
        })
    }
}

fn record_file(summary: &mut CloseSummary, path: PathBuf, result: RecordResult<u64>) {
    match result {
        Ok(records) => summary.files.push(FileSummary { path, records }),
        Err(e) => {
            warn!(error = %e, "failed to finalize file");
            summary.errors.push(e.to_string());
        }
    }
}

fn append_block(file: &mut NpyFile, bytes: &mut Vec<u8>, block: &[i16], frames: usize) -> RecordResult<()> {
    bytes.clear();
    for value in block {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    file.append_rows(bytes, frames as u64)
}

fn append_i64_row(file: &mut NpyFile, row: &[i64]) -> RecordResult<()> {
    let mut bytes = [0u8; 24];
    let len = row.len().min(3) * 8;
    for (chunk, value) in bytes.chunks_exact_mut(8).zip(row) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    file.append_rows(&bytes[..len], 1)
}

impl RecordEngine for NpyEngine {
    fn engine_id(&self) -> &str {
        "npy"
    }

    fn open_session(&mut self, ctx: &SessionContext) -> RecordResult<OpenReport> {
        if self.session.is_some() {
            return Err(RecordError::InvalidState(
                "npy engine already has an open session".to_string(),
            ));
        }

        let mut report = OpenReport::default();
        let mut created = Vec::new();
        let mut session = match self.open_files(ctx, &mut report, &mut created) {
            Ok(session) => session,
            Err(e) => {
                remove_files(&created);
                return Err(e);
            }
        };
        if created.is_empty() {
            return Err(RecordError::FileSystem {
                path: ctx.directory.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("no file could be opened for session {}", ctx.session_number),
                ),
            });
        }

        report.files = created.clone();
        session.created = created;
        info!(session = ctx.session_number, files = report.files.len(), "npy engine opened session");
        self.session = Some(session);
        Ok(report)
    }

    fn write_continuous(&mut self, slot: usize, timestamp: i64, samples: &[f32]) -> RecordResult<()> {
        let Some(s) = self.session.as_mut() else {
            return Err(RecordError::InvalidState("no open session".to_string()));
        };
        let Some(channel) = s.ctx.channels.get(slot) else {
            return Err(RecordError::Configuration(format!(
                "slot {slot} is not in the channel map"
            )));
        };
        let (group, column) = (channel.group, channel.column);
        scale::scale_into(samples, channel.info.scale, &mut s.scratch);

        let Some(Stream {
            file,
            assembler,
            bytes,
            records,
            ..
        }) = s.continuous.get_mut(group).and_then(Option::as_mut)
        else {
            return Ok(());
        };
        assembler.push(column, timestamp, &s.scratch, |block, frames| {
            *records += 1;
            append_block(file, bytes, block, frames)
        })
    }

    fn write_event(&mut self, event: &EventRecord) -> RecordResult<()> {
        let Some(s) = self.session.as_mut() else {
            return Err(RecordError::InvalidState("no open session".to_string()));
        };
        match &event.payload {
            EventPayload::Ttl { word, .. } => match s.ttl.as_mut() {
                // stored as int64, reinterpreting the top bit
                Some(file) => append_i64_row(file, &[event.timestamp, *word as i64]),
                None => Ok(()),
            },
            EventPayload::Text(message) => match s.messages.as_mut() {
                Some(log) => log.append(event.timestamp, message),
                None => Ok(()),
            },
        }
    }

    fn write_spike(&mut self, spike: &SpikeRecord) -> RecordResult<()> {
        let Some(s) = self.session.as_mut() else {
            return Err(RecordError::InvalidState("no open session".to_string()));
        };
        if usize::from(spike.source) >= s.ctx.spike_sources.len() {
            return Err(RecordError::Configuration(format!(
                "spike from unknown source {}",
                spike.source
            )));
        }
        match s.spikes.as_mut() {
            Some(file) => append_i64_row(
                file,
                &[
                    spike.timestamp,
                    i64::from(spike.source),
                    i64::from(spike.sorted_unit),
                ],
            ),
            None => Ok(()),
        }
    }

    fn close_session(&mut self) -> RecordResult<CloseSummary> {
        let Some(mut s) = self.session.take() else {
            return Err(RecordError::InvalidState("no open session".to_string()));
        };
        let mut summary = CloseSummary {
            engine: self.engine_id().to_string(),
            ..CloseSummary::default()
        };
        let mut continuous_meta = s.metadata.continuous.iter_mut();
        for stream in s.continuous.into_iter().flatten() {
            let Stream {
                group,
                mut file,
                mut assembler,
                mut bytes,
                mut records,
            } = stream;
            let flushed = assembler.finish(|block, frames| {
                records += 1;
                append_block(&mut file, &mut bytes, block, frames)
            });
            let slots = &s.ctx.channels.groups()[group].slots;
            for (&slot, start) in slots.iter().zip(assembler.first_timestamps()) {
                if let Some(meta) = s.metadata.channels.get_mut(slot) {
                    meta.start_timestamp = start;
                }
            }

            let path = file.path().to_path_buf();
            let alignment = assembler.stats();
            note_alignment(&mut summary, &path, alignment);
            let result = flushed.and_then(|_| file.finish());
            if let (Ok(frames), Some(meta)) = (&result, continuous_meta.next()) {
                meta.frames = *frames;
                meta.records = records;
                meta.alignment = alignment;
            }
            record_file(&mut summary, path, result.map(|_| records));
        }

        for file in [s.ttl.take(), s.spikes.take()].into_iter().flatten() {
            let path = file.path().to_path_buf();
            record_file(&mut summary, path, file.finish());
        }
        if let Some(log) = s.messages.take() {
            let path = log.path().to_path_buf();
            record_file(&mut summary, path, log.finish());
        }

        s.metadata.closed = summary.errors.is_empty();
        if let Some(path) = &s.metadata_path {
            if let Err(e) = s.metadata.rewrite(path) {
                summary.errors.push(e.to_string());
            }
        }
        info!(session = s.ctx.session_number, files = summary.files.len(), "npy engine closed session");
        Ok(summary)
    }

    fn discard_session(&mut self) {
        if let Some(s) = self.session.take() {
            let created = s.created.clone();
            drop(s);
            remove_files(&created);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelInfo, ChannelMap, SpikeSourceInfo};
    use crate::engine::npy::NpyHeader;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::Arc;

    fn context(dir: &Path) -> SessionContext {
        let channels = vec![
            ChannelInfo::new("CH1", 100, 30000.0, 0.5),
            ChannelInfo::new("CH2", 100, 30000.0, 0.5),
            ChannelInfo::new("AUX", 200, 1000.0, 1.0),
        ];
        SessionContext {
            directory: dir.to_path_buf(),
            base_name: "rec".to_string(),
            session_number: 3,
            channels: Arc::new(ChannelMap::build(&channels).unwrap()),
            spike_sources: Arc::new(vec![SpikeSourceInfo::new("se0", 1, 40, 30000.0)]),
            created: Utc::now(),
            max_lag_frames: 1024,
        }
    }

    #[test]
    fn test_short_channel_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = NpyEngine::new(EngineOptions {
            block_length: 8,
            ..EngineOptions::default()
        });
        engine.open_session(&context(dir.path())).unwrap();
        engine.write_continuous(0, 0, &[1.0; 8]).unwrap();
        engine.write_continuous(1, 0, &[1.0; 4]).unwrap();
        let summary = engine.close_session().unwrap();

        assert!(summary.errors.is_empty());
        assert_eq!(
            summary.warnings,
            vec!["rec_3-100.dat.npy: 4 samples zero-filled, 0 samples dropped, 0 timestamp discontinuities"]
        );
        let meta = SessionMetadata::read(dir.path().join("rec_3.dat.json")).unwrap();
        assert_eq!(meta.continuous[0].frames, 8);
        assert_eq!(meta.continuous[0].alignment.padded_samples, 4);
        assert!(meta.continuous[1].alignment.is_clean());
        assert!(meta.closed);
    }

    #[test]
    fn test_writes_loadable_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = NpyEngine::new(EngineOptions {
            block_length: 8,
            ..EngineOptions::default()
        });
        engine.open_session(&context(dir.path())).unwrap();

        engine.write_continuous(0, 100, &[1.0; 10]).unwrap();
        engine.write_continuous(1, 100, &[-1.0; 10]).unwrap();
        engine.write_continuous(2, 5, &[2.0; 3]).unwrap();
        engine.write_event(&EventRecord::ttl(500, 0, 0, true, 1)).unwrap();
        engine.write_event(&EventRecord::text(501, 0, "note")).unwrap();
        engine
            .write_spike(&SpikeRecord {
                timestamp: 900,
                source: 0,
                sorted_unit: 4,
                waveform: vec![0.0; 40],
                gains: vec![1.0],
                thresholds: vec![-50.0],
            })
            .unwrap();
        let summary = engine.close_session().unwrap();
        assert!(summary.errors.is_empty());
        assert!(summary.warnings.is_empty());

        let dat = NpyHeader::read(dir.path().join("rec_3-100.dat.npy")).unwrap();
        assert_eq!(dat.descr, "<i2");
        assert_eq!(dat.shape, vec![10, 2]);
        let aux = NpyHeader::read(dir.path().join("rec_3-200.dat.npy")).unwrap();
        assert_eq!(aux.shape, vec![3, 1]);
        assert_eq!(NpyHeader::read(dir.path().join("rec_3.din.npy")).unwrap().shape, vec![1, 2]);
        assert_eq!(NpyHeader::read(dir.path().join("rec_3.spikes.npy")).unwrap().shape, vec![1, 3]);

        let bytes = std::fs::read(dir.path().join("rec_3-100.dat.npy")).unwrap();
        let first = i16::from_le_bytes([bytes[128], bytes[129]]);
        let second = i16::from_le_bytes([bytes[130], bytes[131]]);
        assert_eq!((first, second), (2, -2));

        let text = std::fs::read_to_string(dir.path().join("rec_3.msg.txt")).unwrap();
        assert!(text.starts_with("## session 3 of rec\n"));
        assert!(text.ends_with("501\tnote\n"));

        let meta = SessionMetadata::read(dir.path().join("rec_3.dat.json")).unwrap();
        assert!(meta.closed);
        assert_eq!(meta.chans, vec![0, 1, 2]);
        assert_eq!(meta.continuous[0].records, 2);
        assert_eq!(meta.continuous[0].frames, 10);
        assert_eq!(meta.channels[2].start_timestamp, Some(5));
        assert_eq!(meta.sample_rate, None);
    }

    #[test]
    fn test_unknown_spike_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = NpyEngine::new(EngineOptions::default());
        engine.open_session(&context(dir.path())).unwrap();
        let spike = SpikeRecord {
            timestamp: 1,
            source: 9,
            sorted_unit: 0,
            waveform: vec![],
            gains: vec![],
            thresholds: vec![],
        };
        assert!(engine.write_spike(&spike).is_err());
        engine.close_session().unwrap();
    }
}
