//! Recording orchestrator.
//!
//! [`Recorder`] owns the live channel set, the recording engines and the session
//! lifecycle. [`RecordIngress`] is the cheap, cloneable handle the real-time
//! acquisition thread uses to feed an active session.
//!
//! State machine:
//!
//! ```text
//! Idle --start_session--> Recording --stop_session--> Idle
//!                              |                        ^
//!                              +--(writer slow)--> Stopping
//!                                                   |  wait_for_writer / force_stop
//! ```
//!
//! Channel and engine changes are only accepted in `Idle`.

use crate::channel::{
    ChannelIndex, ChannelInfo, ChannelMap, ChannelProvider, ChannelStatus, SpikeSourceInfo,
};
use crate::config::RecorderConfig;
use crate::engine::{
    remove_files, CloseSummary, EngineRegistry, FileSummary, RecordEngine, SessionContext,
};
use crate::error::{RecordError, RecordResult};
use crate::paths::{self, VolumeUsage};
use crate::queue::{session_queues, DropCounts, DropKind, IngressStats, SessionProducers};
use crate::record::{EventRecord, SpikeRecord};
use crate::status::{StatusLog, StatusMessage, StatusSink, TracingStatusSink};
use crate::writer::{spawn_writer, FinishedWriter, StopOutcome, WriterHandle, WriterSettings, WriterStats};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`Recorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecorderState {
    /// No session; channels and engines may change.
    Idle,
    /// A session is active and accepting data.
    Recording,
    /// Ingress is closed but the writer thread has not finished yet.
    Stopping,
}

/// What happened to one record handed to the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Queued for the writer thread
    Queued,
    /// No session is active
    Idle,
    /// The channel is not part of the session's channel map
    NotRecorded,
    /// Queue full or session in transition; the record was lost and counted
    Dropped,
}

/// A record the ingress did not queue, returned to the caller.
#[derive(Debug)]
pub struct Rejected<T> {
    /// Why it was not queued
    pub outcome: Ingest,
    /// The record, untouched
    pub record: T,
}

impl<T> Rejected<T> {
    fn new(outcome: Ingest, record: T) -> Self {
        Self { outcome, record }
    }
}

struct ActiveIngress {
    producers: SessionProducers,
    /// Channel index to channel-map slot
    slots: Vec<Option<usize>>,
}

/// Real-time entry points into the active session.
///
/// Every call completes in bounded time: it never blocks on a lock, allocates
/// or touches a file. While a session starts or stops the ingress lock may be held
/// by the control thread, in which case the record is dropped and counted.
///
/// Events and spikes own heap payloads (message text, waveforms). When one is not
/// queued, [`on_event`](Self::on_event) and [`on_spike`](Self::on_spike) drop it,
/// which frees that payload on the caller's thread. Callers that must not free
/// memory there use [`offer_event`](Self::offer_event) and
/// [`offer_spike`](Self::offer_spike), which hand the record back for reuse.
#[derive(Clone)]
pub struct RecordIngress {
    active: Arc<Mutex<Option<ActiveIngress>>>,
    stats: Arc<IngressStats>,
}

impl RecordIngress {
    fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(None)),
            stats: Arc::new(IngressStats::default()),
        }
    }

    /// Queue one block of samples for `channel`; `timestamp` is the sample
    /// number of its first sample.
    #[inline]
    pub fn on_sample_block(&self, channel: ChannelIndex, samples: &[f32], timestamp: i64) -> Ingest {
        let Some(mut guard) = self.active.try_lock() else {
            self.stats.record_drop(DropKind::Block, true);
            return Ingest::Dropped;
        };
        let Some(active) = guard.as_mut() else {
            return Ingest::Idle;
        };
        let Some(slot) = active.slots.get(channel).copied().flatten() else {
            return Ingest::NotRecorded;
        };
        match active.producers.data.write(slot, timestamp, samples) {
            Ok(()) => Ingest::Queued,
            Err(_) => {
                self.stats.record_drop(DropKind::Block, false);
                Ingest::Dropped
            }
        }
    }

    /// Queue one TTL or text event.
    ///
    /// A record that is not queued is dropped on the calling thread, freeing its
    /// payload there. Use [`offer_event`](Self::offer_event) to keep it instead.
    #[inline]
    pub fn on_event(&self, event: EventRecord) -> Ingest {
        match self.offer_event(event) {
            Ok(()) => Ingest::Queued,
            Err(rejected) => rejected.outcome,
        }
    }

    /// Queue one event, handing it back if it was not queued.
    ///
    /// Drops are counted exactly as for [`on_event`](Self::on_event).
    #[inline]
    pub fn offer_event(&self, event: EventRecord) -> Result<(), Rejected<EventRecord>> {
        let Some(mut guard) = self.active.try_lock() else {
            self.stats.record_drop(DropKind::Event, true);
            return Err(Rejected::new(Ingest::Dropped, event));
        };
        let Some(active) = guard.as_mut() else {
            return Err(Rejected::new(Ingest::Idle, event));
        };
        active.producers.events.try_write(event).map_err(|event| {
            self.stats.record_drop(DropKind::Event, false);
            Rejected::new(Ingest::Dropped, event)
        })
    }

    /// Queue one spike. A spike that is not queued is dropped on the calling
    /// thread; see [`offer_spike`](Self::offer_spike).
    #[inline]
    pub fn on_spike(&self, spike: SpikeRecord) -> Ingest {
        match self.offer_spike(spike) {
            Ok(()) => Ingest::Queued,
            Err(rejected) => rejected.outcome,
        }
    }

    /// Queue one spike, handing it back if it was not queued.
    #[inline]
    pub fn offer_spike(&self, spike: SpikeRecord) -> Result<(), Rejected<SpikeRecord>> {
        let Some(mut guard) = self.active.try_lock() else {
            self.stats.record_drop(DropKind::Spike, true);
            return Err(Rejected::new(Ingest::Dropped, spike));
        };
        let Some(active) = guard.as_mut() else {
            return Err(Rejected::new(Ingest::Idle, spike));
        };
        active.producers.spikes.try_write(spike).map_err(|spike| {
            self.stats.record_drop(DropKind::Spike, false);
            Rejected::new(Ingest::Dropped, spike)
        })
    }

    /// Records dropped since the current (or last) session started.
    pub fn drop_counts(&self) -> DropCounts {
        self.stats.snapshot()
    }

    fn install(&self, active: ActiveIngress) {
        self.stats.reset();
        *self.active.lock() = Some(active);
    }

    fn detach(&self) {
        // dropping the producers closes the session's ingress side
        self.active.lock().take();
    }
}

/// Identity of the current or most recent session.
#[derive(Debug, Clone)]
struct SessionInfo {
    number: u32,
    directory: PathBuf,
    base_name: String,
    map: Arc<ChannelMap>,
    started: DateTime<Utc>,
    files: Vec<PathBuf>,
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct StopReport {
    /// Session number
    pub session_number: u32,
    /// Destination directory
    pub directory: PathBuf,
    /// Whether the queues drained before the files were closed
    pub outcome: StopOutcome,
    /// Records written by the writer thread
    pub stats: WriterStats,
    /// Records lost on ingress
    pub drops: DropCounts,
    /// Per-engine close summaries
    pub summaries: Vec<CloseSummary>,
    /// Problems surfaced to the status sink while stopping
    pub warnings: Vec<String>,
}

impl StopReport {
    /// Every record reached disk and every file closed cleanly.
    pub fn is_clean(&self) -> bool {
        self.outcome.is_clean() && self.drops.total() == 0 && self.warnings.is_empty()
    }

    /// Every file of every engine.
    pub fn files(&self) -> impl Iterator<Item = &FileSummary> {
        self.summaries.iter().flat_map(|s| s.files.iter())
    }
}

/// Session lifecycle, channel set and engines of one recording node.
pub struct Recorder {
    config: RecorderConfig,
    registry: EngineRegistry,
    engines: Vec<Box<dyn RecordEngine>>,
    channels: Vec<ChannelInfo>,
    spike_sources: Vec<SpikeSourceInfo>,
    status: Arc<dyn StatusSink>,
    status_log: Option<Arc<StatusLog>>,
    ingress: RecordIngress,
    state: RecorderState,
    writer: Option<WriterHandle>,
    session: Option<SessionInfo>,
}

impl Recorder {
    /// Recorder with the engines enabled in `config`.
    pub fn new(config: RecorderConfig) -> RecordResult<Self> {
        Self::with_registry(config, EngineRegistry::new())
    }

    /// Recorder whose engines come from a custom registry.
    pub fn with_registry(config: RecorderConfig, registry: EngineRegistry) -> RecordResult<Self> {
        config.validate().map_err(RecordError::Configuration)?;
        let engines = registry.create_enabled(&config.engines)?;
        Ok(Self {
            config,
            registry,
            engines,
            channels: Vec::new(),
            spike_sources: Vec::new(),
            status: Arc::new(TracingStatusSink),
            status_log: None,
            ingress: RecordIngress::new(),
            state: RecorderState::Idle,
            writer: None,
            session: None,
        })
    }

    /// Send status messages to `sink` instead of the log.
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = sink;
        self.status_log = None;
        self
    }

    /// Send status messages to `log`, which keeps them for [`Recorder::status_history`].
    pub fn with_status_log(mut self, log: Arc<StatusLog>) -> Self {
        self.status = Arc::clone(&log) as Arc<dyn StatusSink>;
        self.status_log = Some(log);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Whether a session is recording or still finishing.
    pub fn is_recording(&self) -> bool {
        self.state != RecorderState::Idle
    }

    fn require_idle(&self, operation: &str) -> RecordResult<()> {
        match self.state {
            RecorderState::Idle => Ok(()),
            state => Err(RecordError::InvalidState(format!(
                "cannot {operation} while {state:?}"
            ))),
        }
    }

    // --- channels and engines ---

    /// Register a continuous channel. Returns its stable index.
    pub fn add_channel(&mut self, info: ChannelInfo) -> RecordResult<ChannelIndex> {
        self.require_idle("add a channel")?;
        info.validate()?;
        let index = self.channels.len();
        for engine in &mut self.engines {
            engine.channel_added(index, &info);
        }
        debug!(index, name = %info.name, processor = info.processor_id, "channel added");
        self.channels.push(info);
        Ok(index)
    }

    /// Include or exclude a channel from the next session.
    pub fn set_channel_enabled(&mut self, index: ChannelIndex, enabled: bool) -> RecordResult<()> {
        self.require_idle("change channel enablement")?;
        let channel = self
            .channels
            .get_mut(index)
            .ok_or_else(|| RecordError::Configuration(format!("no channel with index {index}")))?;
        channel.enabled = enabled;
        Ok(())
    }

    /// Register an electrode. Returns its spike source id.
    pub fn add_spike_source(&mut self, info: SpikeSourceInfo) -> RecordResult<u16> {
        self.require_idle("add a spike source")?;
        info.validate()?;
        let id = u16::try_from(self.spike_sources.len())
            .map_err(|_| RecordError::Configuration("too many spike sources".to_string()))?;
        self.spike_sources.push(info);
        Ok(id)
    }

    /// Replace the channel set and electrodes with what `provider` reports.
    ///
    /// Used when the acquisition topology changed between recordings.
    pub fn sync_channels(&mut self, provider: &dyn ChannelProvider) -> RecordResult<()> {
        self.require_idle("change channels")?;
        let channels = provider.channels();
        let spike_sources = provider.spike_sources();
        for channel in &channels {
            channel.validate()?;
        }
        for source in &spike_sources {
            source.validate()?;
        }

        for engine in &mut self.engines {
            engine.reset_channels();
            for (index, info) in channels.iter().enumerate() {
                engine.channel_added(index, info);
            }
        }
        info!(
            channels = channels.len(),
            spike_sources = spike_sources.len(),
            "channel set synchronized"
        );
        self.channels = channels;
        self.spike_sources = spike_sources;
        Ok(())
    }

    /// Live channel set.
    pub fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    /// Registered electrodes.
    pub fn spike_sources(&self) -> &[SpikeSourceInfo] {
        &self.spike_sources
    }

    /// Add another engine; it receives every record alongside the existing ones.
    pub fn add_engine(&mut self, mut engine: Box<dyn RecordEngine>) -> RecordResult<()> {
        self.require_idle("add an engine")?;
        if self.engine_ids().iter().any(|id| id == engine.engine_id()) {
            return Err(RecordError::Configuration(format!(
                "engine '{}' is already active",
                engine.engine_id()
            )));
        }
        engine.reset_channels();
        for (index, info) in self.channels.iter().enumerate() {
            engine.channel_added(index, info);
        }
        self.engines.push(engine);
        Ok(())
    }

    /// Identifiers of the active engines, in dispatch order.
    pub fn engine_ids(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.engine_id().to_string()).collect()
    }

    // --- session lifecycle ---

    /// Start a session writing to `directory` with file names based on `base_name`.
    ///
    /// Returns the session number. On failure no engine keeps a file open and
    /// files created for this session are removed.
    pub fn start_session(&mut self, directory: impl AsRef<Path>, base_name: &str) -> RecordResult<u32> {
        self.require_idle("start a session")?;
        let directory = directory.as_ref().to_path_buf();
        if base_name.is_empty() || base_name.contains(&['/', '\\'][..]) {
            return Err(RecordError::Configuration(format!(
                "invalid base name '{base_name}'"
            )));
        }
        if self.engines.is_empty() {
            return Err(RecordError::Configuration("no recording engine is active".to_string()));
        }

        std::fs::create_dir_all(&directory).map_err(|e| RecordError::fs(&directory, e))?;

        let first_candidate = match &self.session {
            Some(last) if last.directory == directory && last.base_name == base_name => last.number + 1,
            _ => 0,
        };
        let number = paths::next_session_number(&directory, base_name, first_candidate)?;

        let map = Arc::new(ChannelMap::build(&self.channels)?);
        if map.is_empty() {
            warn!(session = number, "no channels enabled, recording events only");
        }
        let queues = &self.config.queues;
        let ctx = SessionContext {
            directory: directory.clone(),
            base_name: base_name.to_string(),
            session_number: number,
            channels: Arc::clone(&map),
            spike_sources: Arc::new(self.spike_sources.clone()),
            created: Utc::now(),
            max_lag_frames: 2 * queues.block_samples * queues.data_blocks,
        };

        let mut files = Vec::new();
        for i in 0..self.engines.len() {
            match self.engines[i].open_session(&ctx) {
                Ok(report) => {
                    for warning in &report.warnings {
                        self.status.warn(warning);
                    }
                    files.extend(report.files);
                }
                Err(e) => {
                    for engine in &mut self.engines[..i] {
                        engine.discard_session();
                    }
                    self.status.error(&format!(
                        "Could not start recording in {}: {e}",
                        directory.display()
                    ));
                    return Err(e);
                }
            }
        }

        let (producers, consumers) = session_queues(map.len(), queues);
        let engines = std::mem::take(&mut self.engines);
        let writer = match spawn_writer(
            number,
            engines,
            consumers,
            Arc::clone(&self.ingress.stats),
            Arc::clone(&self.status),
            WriterSettings::from(&self.config.writer),
        ) {
            Ok(writer) => writer,
            Err(e) => {
                // the engines went down with the thread closure
                remove_files(&files);
                self.status.error(&format!("Could not start the writer thread: {e}"));
                self.restore_engines()?;
                return Err(e);
            }
        };

        let mut slots = vec![None; self.channels.len()];
        for (slot, entry) in map.entries().iter().enumerate() {
            slots[entry.index] = Some(slot);
        }
        self.ingress.install(ActiveIngress { producers, slots });

        info!(
            session = number,
            directory = %directory.display(),
            channels = map.len(),
            files = files.len(),
            "recording started"
        );
        self.status.info(&format!(
            "Recording session {number} to {}",
            directory.display()
        ));

        self.writer = Some(writer);
        self.session = Some(SessionInfo {
            number,
            directory,
            base_name: base_name.to_string(),
            map,
            started: ctx.created,
            files,
        });
        self.state = RecorderState::Recording;
        Ok(number)
    }

    /// Stop the active session, draining queued records first.
    ///
    /// Calling this with no session active does nothing and returns `Ok(None)`.
    /// If the writer thread does not finish within the join timeout this returns
    /// [`RecordError::ThreadTimeout`] and the recorder stays in
    /// [`RecorderState::Stopping`]; call [`Recorder::wait_for_writer`] to keep
    /// waiting or [`Recorder::force_stop`] to close the files now.
    pub fn stop_session(&mut self) -> RecordResult<Option<StopReport>> {
        match self.state {
            RecorderState::Idle => return Ok(None),
            RecorderState::Recording => {
                self.ingress.detach();
                self.state = RecorderState::Stopping;
                if let Some(writer) = &self.writer {
                    writer.request_stop();
                }
            }
            RecorderState::Stopping => {}
        }
        self.wait_for_writer(self.config.writer.join_timeout())
    }

    /// Keep waiting for a stopping session's writer thread.
    pub fn wait_for_writer(&mut self, timeout: Duration) -> RecordResult<Option<StopReport>> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(None);
        };
        match writer.wait(timeout) {
            Some(finished) => self.finish(finished).map(Some),
            None => {
                warn!(waited = ?timeout, "writer thread still draining");
                Err(RecordError::ThreadTimeout { waited: timeout })
            }
        }
    }

    /// Close the session's files now, discarding records still queued.
    ///
    /// Trailing records may be missing from the files; the header counts always
    /// match what was written.
    pub fn force_stop(&mut self) -> RecordResult<Option<StopReport>> {
        if self.state == RecorderState::Idle {
            return Ok(None);
        }
        self.ingress.detach();
        self.state = RecorderState::Stopping;
        if let Some(writer) = &self.writer {
            writer.request_force();
        }
        self.wait_for_writer(self.config.writer.force_timeout())
    }

    fn finish(&mut self, finished: FinishedWriter) -> RecordResult<StopReport> {
        self.writer = None;
        self.state = RecorderState::Idle;

        let FinishedWriter { report, engines } = finished;
        if engines.is_empty() {
            warn!("writer thread lost its engines, recreating the configured ones");
            self.restore_engines()?;
        } else {
            self.engines = engines;
        }

        let (number, directory) = self
            .session
            .as_ref()
            .map(|s| (s.number, s.directory.clone()))
            .unwrap_or_default();
        let drops = self.ingress.drop_counts();

        let mut warnings = Vec::new();
        match &report.outcome {
            StopOutcome::Clean => {}
            StopOutcome::Forced { discarded } => warnings.push(format!(
                "Recording stopped before all data was written: {discarded} queued records discarded, files may lack trailing records"
            )),
            StopOutcome::Panicked(message) => {
                warnings.push(format!("Recording engine failed: {message}"))
            }
        }
        if drops.total() > 0 {
            warnings.push(format!("Session {number} lost data on ingress: {drops}"));
        }
        warnings.extend(report.close_errors.iter().cloned());
        for summary in &report.summaries {
            warnings.extend(summary.warnings.iter().map(|w| format!("{}: {w}", summary.engine)));
        }
        for warning in &warnings {
            self.status.warn(warning);
        }

        info!(
            session = number,
            blocks = report.stats.blocks,
            events = report.stats.events,
            spikes = report.stats.spikes,
            dropped = drops.total(),
            clean = report.outcome.is_clean(),
            "recording stopped"
        );
        self.status.info(&format!("Recording session {number} stopped"));

        if let Some(err) = report.outcome.error() {
            return Err(err);
        }
        Ok(StopReport {
            session_number: number,
            directory,
            outcome: report.outcome,
            stats: report.stats,
            drops,
            summaries: report.summaries,
            warnings,
        })
    }

    /// Rebuild the configured engines after the writer thread lost them.
    /// Engines added with [`Recorder::add_engine`] are not recreated.
    fn restore_engines(&mut self) -> RecordResult<()> {
        self.engines = self.registry.create_enabled(&self.config.engines)?;
        for engine in &mut self.engines {
            for (index, info) in self.channels.iter().enumerate() {
                engine.channel_added(index, info);
            }
        }
        Ok(())
    }

    // --- real-time ingress ---

    /// Handle for the real-time thread.
    pub fn ingress(&self) -> RecordIngress {
        self.ingress.clone()
    }

    /// See [`RecordIngress::on_sample_block`].
    pub fn on_sample_block(&self, channel: ChannelIndex, samples: &[f32], timestamp: i64) -> Ingest {
        self.ingress.on_sample_block(channel, samples, timestamp)
    }

    /// See [`RecordIngress::on_event`].
    pub fn on_event(&self, event: EventRecord) -> Ingest {
        self.ingress.on_event(event)
    }

    /// See [`RecordIngress::on_spike`].
    pub fn on_spike(&self, spike: SpikeRecord) -> Ingest {
        self.ingress.on_spike(spike)
    }

    // --- queries ---

    /// Number of the active session, or of the last one.
    pub fn session_number(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.number)
    }

    /// Destination directory of the active session, or of the last one.
    pub fn destination(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.directory.as_path())
    }

    /// Start time of the active session, or of the last one.
    pub fn session_started(&self) -> Option<DateTime<Utc>> {
        self.session.as_ref().map(|s| s.started)
    }

    /// Files created by the active session, or by the last one.
    pub fn session_files(&self) -> &[PathBuf] {
        self.session.as_ref().map_or(&[], |s| s.files.as_slice())
    }

    /// Recording status of every live channel.
    pub fn channel_status(&self) -> Vec<ChannelStatus> {
        let map = self
            .session
            .as_ref()
            .filter(|_| self.is_recording())
            .map(|s| &s.map);
        self.channels
            .iter()
            .enumerate()
            .map(|(index, info)| ChannelStatus {
                index,
                name: info.name.clone(),
                enabled: info.enabled,
                recording: map.is_some_and(|m| m.slot_of(index).is_some()),
            })
            .collect()
    }

    /// Free space on the destination volume of the active or last session.
    pub fn free_space(&self) -> Option<VolumeUsage> {
        self.destination().and_then(paths::free_space)
    }

    /// Records dropped on ingress during the active or last session.
    pub fn drop_counts(&self) -> DropCounts {
        self.ingress.drop_counts()
    }

    /// Status history, when built with [`Recorder::with_status_log`].
    pub fn status_history(&self) -> Vec<StatusMessage> {
        self.status_log.as_ref().map(|l| l.entries()).unwrap_or_default()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.state == RecorderState::Idle {
            return;
        }
        warn!("recorder dropped while recording, forcing the session closed");
        if let Err(e) = self.force_stop() {
            warn!(error = %e, "session did not close cleanly on drop");
        }
    }
}
