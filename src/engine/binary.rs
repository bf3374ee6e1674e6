//! Raw binary engine.
//!
//! Per session it writes:
//! - `<stem>[-<processor>].dat`: text header, then interleaved little-endian `i16`
//!   frames in channel-map order, one file per source processor
//! - `<stem>.din`: text header, then 16-byte `(i64 timestamp, u64 ttl word)` records
//! - `<stem>-<electrode>.spk`: text header, then one fixed-layout record per spike
//! - `<stem>.msg`: `timestamp<TAB>message` lines
//! - `<stem>.json`: [`SessionMetadata`]
//!
//! Every headered file carries a `record_count` field that is rewritten in place,
//! so a file cut short by a crash still describes itself.

use crate::channel::{ChannelIndex, ChannelInfo, SpikeSourceInfo};
use crate::engine::frames::FrameAssembler;
use crate::engine::header::{CountedFile, TextHeader};
use crate::engine::messages::MessageLog;
use crate::engine::metadata::{
    ContinuousMeta, SessionMetadata, SpikeMeta, FORMAT_NAME, FORMAT_VERSION,
};
use crate::engine::{
    file_name, note_alignment, remove_files, scale, skip_existing, AlignmentStats, CloseSummary, EngineOptions,
    FileSummary, OpenReport, RecordEngine, SessionContext,
};
use crate::error::{RecordError, RecordResult};
use crate::record::{EventPayload, EventRecord, SpikeRecord};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Bytes in one `.din` record.
pub const TTL_RECORD_BYTES: usize = 16;

/// Bytes in one `.spk` record for an electrode.
pub fn spike_record_bytes(source: &SpikeSourceInfo) -> usize {
    let n = usize::from(source.num_channels);
    16 + 4 * (source.waveform_len() + 2 * n)
}

struct ContinuousStream {
    group: usize,
    file: CountedFile,
    assembler: FrameAssembler,
    bytes: Vec<u8>,
}

struct SpikeStream {
    source: SpikeSourceInfo,
    file: CountedFile,
    bytes: Vec<u8>,
}

struct OpenSession {
    ctx: SessionContext,
    metadata: SessionMetadata,
    metadata_path: Option<PathBuf>,
    continuous: Vec<Option<ContinuousStream>>,
    ttl: Option<CountedFile>,
    messages: Option<MessageLog>,
    spikes: Vec<Option<SpikeStream>>,
    scratch: Vec<i16>,
    created: Vec<PathBuf>,
}

/// Engine writing raw interleaved `.dat` files with self-describing text headers.
pub struct BinaryEngine {
    options: EngineOptions,
    known_channels: usize,
    session: Option<OpenSession>,
}

impl BinaryEngine {
    /// Engine with the given options.
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            known_channels: 0,
            session: None,
        }
    }

    fn common_fields(header: &mut TextHeader, ctx: &SessionContext, description: &str) {
        header
            .field("format", FORMAT_NAME)
            .field("version", FORMAT_VERSION)
            .field("description", description)
            .field("date_created", ctx.created.format("%d-%b-%Y %H%M%S"))
            .field("session_number", ctx.session_number);
    }

    fn continuous_header(&self, ctx: &SessionContext, group: usize) -> TextHeader {
        let map = &ctx.channels;
        let slots = &map.groups()[group].slots;
        let base = self.options.channel_base as usize;

        let mut header = TextHeader::new();
        Self::common_fields(
            &mut header,
            ctx,
            "interleaved little-endian int16 frames, one column per entry of channels; \
             multiply column N by bitVoltsN for physical units",
        );
        let chans: Vec<String> = slots
            .iter()
            .filter_map(|&s| map.get(s))
            .map(|c| (c.index + base).to_string())
            .collect();
        header
            .field("processor_id", map.groups()[group].processor_id)
            .field("num_channels", slots.len())
            .field("channels", chans.join(","));
        match map.group_sample_rate(group) {
            Some(rate) => {
                header.field("sampleRate", rate);
            }
            None => {
                header.field("sampleRate", "mixed");
                for (column, &slot) in slots.iter().enumerate() {
                    if let Some(c) = map.get(slot) {
                        header.field(&format!("sampleRate{column}"), c.info.sample_rate);
                    }
                }
            }
        }
        for (column, &slot) in slots.iter().enumerate() {
            if let Some(c) = map.get(slot) {
                header.field(&format!("bitVolts{column}"), c.info.scale);
            }
        }
        header
            .field("blockLength", self.options.block_length)
            .field("dtype", "<i2")
            .field("layout", "interleaved")
            .counter("record_count")
            .counter("sample_count");
        header
    }

    fn ttl_header(ctx: &SessionContext) -> TextHeader {
        let mut header = TextHeader::new();
        Self::common_fields(
            &mut header,
            ctx,
            "little-endian records of int64 timestamp followed by uint64 ttl word",
        );
        header
            .field("record_bytes", TTL_RECORD_BYTES)
            .counter("record_count");
        header
    }

    fn spike_header(ctx: &SessionContext, id: usize, source: &SpikeSourceInfo) -> TextHeader {
        let mut header = TextHeader::new();
        Self::common_fields(
            &mut header,
            ctx,
            "little-endian records of int64 timestamp, uint16 source, uint16 sorted unit, \
             uint16 num_channels, uint16 num_samples, float32 waveform[num_channels*num_samples], \
             float32 gains[num_channels], float32 thresholds[num_channels]",
        );
        header
            .field("electrode", &source.name)
            .field("source_id", id)
            .field("num_channels", source.num_channels)
            .field("num_samples", source.samples_per_channel)
            .field("sampleRate", source.sample_rate)
            .field("record_bytes", spike_record_bytes(source))
            .counter("record_count");
        header
    }

    fn open_files(
        &self,
        ctx: &SessionContext,
        report: &mut OpenReport,
        created: &mut Vec<PathBuf>,
    ) -> RecordResult<OpenSession> {
        let interval = self.options.count_update_interval;
        let mut metadata =
            SessionMetadata::for_session(self.engine_id(), ctx, self.options.channel_base);

        let mut continuous = Vec::new();
        for (group, processor) in ctx.channels.groups().iter().enumerate() {
            let qualifier = ctx.processor_qualifier(group);
            let path = ctx.file_path(qualifier.as_deref(), "dat");
            let header = self.continuous_header(ctx, group);
            let Some(file) = skip_existing(CountedFile::create(path, &header, interval), report)? else {
                continuous.push(None);
                continue;
            };
            created.push(file.path().to_path_buf());
            let chans = processor.slots.iter().map(|&s| metadata.chans[s]).collect();
            metadata.continuous.push(ContinuousMeta {
                file: file_name(file.path()),
                processor_id: processor.processor_id,
                chans,
                records: 0,
                frames: 0,
                alignment: AlignmentStats::default(),
            });
            continuous.push(Some(ContinuousStream {
                group,
                file,
                assembler: FrameAssembler::new(
                    processor.num_channels(),
                    self.options.block_length,
                    ctx.max_lag_frames,
                    self.options.max_gap_frames,
                ),
                bytes: Vec::new(),
            }));
        }

        let mut ttl = None;
        if self.options.record_ttl_words {
            let path = ctx.file_path(None, "din");
            ttl = skip_existing(CountedFile::create(path, &Self::ttl_header(ctx), interval), report)?;
            if let Some(file) = &ttl {
                created.push(file.path().to_path_buf());
                metadata.ttl_file = Some(file_name(file.path()));
            }
        }

        let messages = skip_existing(MessageLog::create(ctx.file_path(None, "msg"), &[]), report)?;
        if let Some(log) = &messages {
            created.push(log.path().to_path_buf());
            metadata.message_file = Some(file_name(log.path()));
        }

        let mut spikes = Vec::new();
        for (id, source) in ctx.spike_sources.iter().enumerate() {
            let path = ctx.file_path(Some(&source.name), "spk");
            let header = Self::spike_header(ctx, id, source);
            // spike counts are kept current after every record
            let Some(file) = skip_existing(CountedFile::create(path, &header, 1), report)? else {
                spikes.push(None);
                continue;
            };
            created.push(file.path().to_path_buf());
            metadata.spikes.push(SpikeMeta {
                file: file_name(file.path()),
                name: source.name.clone(),
                num_channels: source.num_channels,
                samples_per_channel: source.samples_per_channel,
                records: 0,
            });
            spikes.push(Some(SpikeStream {
                source: source.clone(),
                file,
                bytes: Vec::with_capacity(spike_record_bytes(source)),
            }));
        }

        let path = ctx.file_path(None, "json");
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
            messages,
            spikes,
            scratch: Vec::new(),
            created: Vec::new(),
        })
    }
}

fn note_failure(summary: &mut CloseSummary, e: RecordError) {
    warn!(error = %e, "failed to finalize file");
    summary.errors.push(e.to_string());
}

fn write_block(stream_file: &mut CountedFile, bytes: &mut Vec<u8>, block: &[i16], frames: usize) -> RecordResult<()> {
    bytes.clear();
    for value in block {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    stream_file.write_payload(bytes)?;
    stream_file.record_written(&[1, frames as u64])
}

impl RecordEngine for BinaryEngine {
    fn engine_id(&self) -> &str {
        "binary"
    }

    fn reset_channels(&mut self) {
        self.known_channels = 0;
    }

    fn channel_added(&mut self, index: ChannelIndex, info: &ChannelInfo) {
        self.known_channels = self.known_channels.max(index + 1);
        debug!(index, name = %info.name, processor = info.processor_id, "binary engine saw new channel");
    }

    fn open_session(&mut self, ctx: &SessionContext) -> RecordResult<OpenReport> {
        if self.session.is_some() {
            return Err(RecordError::InvalidState(
                "binary engine already has an open session".to_string(),
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
        info!(
            session = ctx.session_number,
            files = session.created.len(),
            known_channels = self.known_channels,
            "binary engine opened session"
        );
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

        let Some(ContinuousStream {
            file,
            assembler,
            bytes,
            ..
        }) = s.continuous.get_mut(group).and_then(Option::as_mut)
        else {
            return Ok(());
        };
        assembler.push(column, timestamp, &s.scratch, |block, frames| {
            write_block(file, bytes, block, frames)
        })
    }

    fn write_event(&mut self, event: &EventRecord) -> RecordResult<()> {
        let Some(s) = self.session.as_mut() else {
            return Err(RecordError::InvalidState("no open session".to_string()));
        };
        match &event.payload {
            EventPayload::Ttl { word, .. } => {
                if let Some(file) = s.ttl.as_mut() {
                    let mut record = [0u8; TTL_RECORD_BYTES];
                    record[..8].copy_from_slice(&event.timestamp.to_le_bytes());
                    record[8..].copy_from_slice(&word.to_le_bytes());
                    file.write_payload(&record)?;
                    file.record_written(&[1])?;
                }
            }
            EventPayload::Text(message) => {
                if let Some(log) = s.messages.as_mut() {
                    log.append(event.timestamp, message)?;
                }
            }
        }
        Ok(())
    }

    fn write_spike(&mut self, spike: &SpikeRecord) -> RecordResult<()> {
        let Some(s) = self.session.as_mut() else {
            return Err(RecordError::InvalidState("no open session".to_string()));
        };
        let Some(stream) = s
            .spikes
            .get_mut(usize::from(spike.source))
            .and_then(Option::as_mut)
        else {
            if usize::from(spike.source) >= s.ctx.spike_sources.len() {
                return Err(RecordError::Configuration(format!(
                    "spike from unknown source {}",
                    spike.source
                )));
            }
            return Ok(());
        };

        let source = &stream.source;
        let n = usize::from(source.num_channels);
        if spike.waveform.len() != source.waveform_len()
            || spike.gains.len() != n
            || spike.thresholds.len() != n
        {
            return Err(RecordError::Configuration(format!(
                "spike for '{}' has {} samples, {} gains, {} thresholds; expected {}, {n}, {n}",
                source.name,
                spike.waveform.len(),
                spike.gains.len(),
                spike.thresholds.len(),
                source.waveform_len(),
            )));
        }

        let bytes = &mut stream.bytes;
        bytes.clear();
        bytes.extend_from_slice(&spike.timestamp.to_le_bytes());
        bytes.extend_from_slice(&spike.source.to_le_bytes());
        bytes.extend_from_slice(&spike.sorted_unit.to_le_bytes());
        bytes.extend_from_slice(&source.num_channels.to_le_bytes());
        bytes.extend_from_slice(&source.samples_per_channel.to_le_bytes());
        for value in spike.waveform.iter().chain(&spike.gains).chain(&spike.thresholds) {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        stream.file.write_payload(bytes)?;
        stream.file.record_written(&[1])
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
            let ContinuousStream {
                group,
                mut file,
                mut assembler,
                mut bytes,
            } = stream;
            if let Err(e) = assembler.finish(|block, frames| write_block(&mut file, &mut bytes, block, frames)) {
                note_failure(&mut summary, e);
            }

            let slots = &s.ctx.channels.groups()[group].slots;
            for (&slot, start) in slots.iter().zip(assembler.first_timestamps()) {
                if let Some(meta) = s.metadata.channels.get_mut(slot) {
                    meta.start_timestamp = start;
                }
            }

            let path = file.path().to_path_buf();
            let meta = continuous_meta.next();
            let alignment = assembler.stats();
            note_alignment(&mut summary, &path, alignment);
            match file.finish() {
                Ok(counts) => {
                    if let Some(meta) = meta {
                        meta.records = counts[0];
                        meta.frames = counts[1];
                        meta.alignment = alignment;
                    }
                    summary.files.push(FileSummary {
                        path,
                        records: counts[0],
                    });
                }
                Err(e) => note_failure(&mut summary, e),
            }
        }

        if let Some(file) = s.ttl.take() {
            let path = file.path().to_path_buf();
            match file.finish() {
                Ok(counts) => summary.files.push(FileSummary {
                    path,
                    records: counts[0],
                }),
                Err(e) => note_failure(&mut summary, e),
            }
        }

        if let Some(log) = s.messages.take() {
            let path = log.path().to_path_buf();
            match log.finish() {
                Ok(lines) => summary.files.push(FileSummary {
                    path,
                    records: lines,
                }),
                Err(e) => note_failure(&mut summary, e),
            }
        }

        let mut spike_meta = s.metadata.spikes.iter_mut();
        for stream in s.spikes.into_iter().flatten() {
            let path = stream.file.path().to_path_buf();
            match stream.file.finish() {
                Ok(counts) => {
                    if let Some(meta) = spike_meta.next() {
                        meta.records = counts[0];
                    }
                    summary.files.push(FileSummary {
                        path,
                        records: counts[0],
                    });
                }
                Err(e) => note_failure(&mut summary, e),
            }
        }

        s.metadata.closed = summary.errors.is_empty();
        if let Some(path) = &s.metadata_path {
            if let Err(e) = s.metadata.rewrite(path) {
                note_failure(&mut summary, e);
            }
        }

        info!(
            session = s.ctx.session_number,
            files = summary.files.len(),
            errors = summary.errors.len(),
            "binary engine closed session"
        );
        Ok(summary)
    }

    fn discard_session(&mut self) {
        if let Some(s) = self.session.take() {
            let created = s.created.clone();
            drop(s);
            remove_files(&created);
            debug!(files = created.len(), "binary engine discarded session");
        }
    }
}
