//! Background writer thread.
//!
//! One thread per session drains the session queues and hands every record to
//! every active engine. It owns the engines (and through them every open file)
//! until the session ends, then hands them back through its join handle.
//!
//! Each iteration takes sample blocks first (one block per channel per round,
//! so channels advance together), then events, then spikes. When every queue is
//! empty the thread parks for the poll interval.
//!
//! Stop protocol: after [`WriterHandle::request_stop`] the thread keeps draining
//! until the queues are empty or the drain timeout expires; a timeout or a
//! [`WriterHandle::request_force`] discards what is still queued. In every case
//! the engines are closed and a [`WriterReport`] tells the recorder how it went.

use crate::config::WriterConfig;
use crate::engine::{CloseSummary, RecordEngine};
use crate::error::{RecordError, RecordResult};
use crate::queue::{DropCounts, IngressStats, SessionConsumers};
use crate::record::{EventRecord, SpikeRecord};
use crate::status::StatusSink;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Maximum sample blocks processed before the event and spike queues get a turn.
const BLOCK_BUDGET: usize = 512;

/// Write errors logged individually before they are only counted.
const LOGGED_WRITE_ERRORS: u64 = 8;

/// Timing knobs of the writer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    /// Park time when all queues are empty
    pub poll_interval: Duration,
    /// Longest drain after a stop request
    pub drain_timeout: Duration,
    /// Minimum spacing of overflow warnings
    pub overflow_report_interval: Duration,
}

impl From<&WriterConfig> for WriterSettings {
    fn from(config: &WriterConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            drain_timeout: config.drain_timeout(),
            overflow_report_interval: config.overflow_report_interval(),
        }
    }
}

/// Records the writer handed to the engines during one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    /// Sample blocks dequeued
    pub blocks: u64,
    /// Samples in those blocks
    pub samples: u64,
    /// Events dequeued
    pub events: u64,
    /// Spikes dequeued
    pub spikes: u64,
    /// Engine write calls that failed
    pub write_errors: u64,
}

/// How the writer thread finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every queued record reached the engines.
    Clean,
    /// Draining stopped early; `discarded` queued records were thrown away.
    Forced {
        /// Records still queued when the files were closed
        discarded: usize,
    },
    /// An engine panicked; the message of the panic.
    Panicked(String),
}

impl StopOutcome {
    /// Whether every record was written.
    pub fn is_clean(&self) -> bool {
        matches!(self, StopOutcome::Clean)
    }

    /// The error a stop surfaces for this outcome, if any.
    pub fn error(&self) -> Option<RecordError> {
        match self {
            StopOutcome::Panicked(message) => Some(RecordError::WriterPanicked(message.clone())),
            _ => None,
        }
    }
}

/// Sent by the writer thread once its engines are closed.
#[derive(Debug, Clone)]
pub struct WriterReport {
    /// How the loop ended
    pub outcome: StopOutcome,
    /// Records processed
    pub stats: WriterStats,
    /// One summary per engine that closed
    pub summaries: Vec<CloseSummary>,
    /// Engines that failed to close cleanly
    pub close_errors: Vec<String>,
}

/// Flags shared between the recorder and the writer thread.
#[derive(Debug, Default)]
struct WriterControl {
    stop: AtomicBool,
    force: AtomicBool,
}

impl WriterControl {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn forced(&self) -> bool {
        self.force.load(Ordering::Acquire)
    }
}

/// Recorder-side handle of a running writer thread.
pub struct WriterHandle {
    control: Arc<WriterControl>,
    reports: Receiver<WriterReport>,
    thread: Option<JoinHandle<Vec<Box<dyn RecordEngine>>>>,
}

/// A finished writer: its report and the engines it owned.
pub struct FinishedWriter {
    /// Outcome, statistics and close summaries
    pub report: WriterReport,
    /// Engines, ready for the next session
    pub engines: Vec<Box<dyn RecordEngine>>,
}

/// Start the writer thread for one session.
pub fn spawn_writer(
    session: u32,
    engines: Vec<Box<dyn RecordEngine>>,
    queues: SessionConsumers,
    ingress: Arc<IngressStats>,
    status: Arc<dyn StatusSink>,
    settings: WriterSettings,
) -> RecordResult<WriterHandle> {
    let control = Arc::new(WriterControl::default());
    let (report_tx, reports) = bounded(1);

    let worker = Worker {
        session,
        engines,
        queues,
        ingress,
        status,
        settings,
        control: Arc::clone(&control),
        stats: WriterStats::default(),
        scratch: Vec::new(),
        reported_drops: DropCounts::default(),
        last_overflow_check: Instant::now(),
    };

    let thread = thread::Builder::new()
        .name("record-writer".to_string())
        .spawn(move || worker.run(report_tx))?;

    Ok(WriterHandle {
        control,
        reports,
        thread: Some(thread),
    })
}

impl WriterHandle {
    /// Ask the thread to drain and stop.
    pub fn request_stop(&self) {
        self.control.stop.store(true, Ordering::Release);
        self.unpark();
    }

    /// Ask the thread to stop now, discarding whatever is still queued.
    pub fn request_force(&self) {
        self.control.force.store(true, Ordering::Release);
        self.request_stop();
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait up to `timeout` for the thread to finish.
    ///
    /// Returns `None` while the thread is still running; the handle stays usable
    /// so the caller can wait again or force.
    pub fn wait(&mut self, timeout: Duration) -> Option<FinishedWriter> {
        match self.reports.recv_timeout(timeout) {
            Ok(report) => {
                let engines = self.join().unwrap_or_default();
                Some(FinishedWriter { report, engines })
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // the thread died before reporting
                let message = match self.join() {
                    Err(message) => message,
                    Ok(_) => "writer thread exited without a report".to_string(),
                };
                Some(FinishedWriter {
                    report: WriterReport {
                        outcome: StopOutcome::Panicked(message),
                        stats: WriterStats::default(),
                        summaries: Vec::new(),
                        close_errors: Vec::new(),
                    },
                    engines: Vec::new(),
                })
            }
        }
    }

    fn join(&mut self) -> Result<Vec<Box<dyn RecordEngine>>, String> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|payload| panic_message(payload.as_ref())),
            None => Ok(Vec::new()),
        }
    }

    fn unpark(&self) {
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.request_force();
            if self.wait(Duration::from_secs(1)).is_none() {
                tracing::error!("writer thread did not exit, detaching it");
            }
        }
    }
}

struct Worker {
    session: u32,
    engines: Vec<Box<dyn RecordEngine>>,
    queues: SessionConsumers,
    ingress: Arc<IngressStats>,
    status: Arc<dyn StatusSink>,
    settings: WriterSettings,
    control: Arc<WriterControl>,
    stats: WriterStats,
    scratch: Vec<f32>,
    reported_drops: DropCounts,
    last_overflow_check: Instant,
}

impl Worker {
    fn run(mut self, report_tx: Sender<WriterReport>) -> Vec<Box<dyn RecordEngine>> {
        tracing::info!(session = self.session, engines = self.engines.len(), "writer thread started");

        let outcome = match catch_unwind(AssertUnwindSafe(|| self.write_loop())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(session = self.session, panic = %message, "engine panicked in writer thread");
                let discarded = self.queues.reset();
                if discarded > 0 {
                    tracing::warn!(discarded, "queued records discarded after panic");
                }
                StopOutcome::Panicked(message)
            }
        };
        self.report_overflow();

        let (summaries, close_errors) = self.close_engines();
        tracing::info!(
            session = self.session,
            blocks = self.stats.blocks,
            events = self.stats.events,
            spikes = self.stats.spikes,
            write_errors = self.stats.write_errors,
            ?outcome,
            "writer thread stopped"
        );

        let report = WriterReport {
            outcome,
            stats: self.stats,
            summaries,
            close_errors,
        };
        if report_tx.send(report).is_err() {
            tracing::warn!("recorder went away before the writer report was delivered");
        }
        self.engines
    }

    fn write_loop(&mut self) -> StopOutcome {
        loop {
            if self.control.forced() {
                return self.discard_remaining();
            }
            if self.control.stopping() {
                return self.drain();
            }
            let processed = self.pump();
            self.maybe_report_overflow();
            if processed == 0 {
                thread::park_timeout(self.settings.poll_interval);
            }
        }
    }

    fn drain(&mut self) -> StopOutcome {
        let deadline = Instant::now() + self.settings.drain_timeout;
        tracing::debug!(pending = self.queues.pending(), "draining queues");
        loop {
            if self.control.forced() || Instant::now() >= deadline {
                return self.discard_remaining();
            }
            if self.pump() == 0 && self.queues.is_empty() {
                return StopOutcome::Clean;
            }
        }
    }

    fn discard_remaining(&mut self) -> StopOutcome {
        let discarded = self.queues.reset();
        tracing::warn!(session = self.session, discarded, "writer stopped before the queues drained");
        StopOutcome::Forced { discarded }
    }

    /// One pass over every queue. Returns the records processed.
    fn pump(&mut self) -> usize {
        let mut processed = 0;

        let channels = self.queues.data.channels();
        let mut scratch = std::mem::take(&mut self.scratch);
        'blocks: loop {
            let mut round = 0;
            for slot in 0..channels {
                if self.control.forced() {
                    break 'blocks;
                }
                if let Some(timestamp) = self.queues.data.read(slot, &mut scratch) {
                    self.write_block(slot, timestamp, &scratch);
                    round += 1;
                }
            }
            processed += round;
            if round == 0 || processed >= BLOCK_BUDGET {
                break;
            }
        }
        self.scratch = scratch;

        while let Some(event) = self.queues.events.read() {
            self.write_event(&event);
            processed += 1;
            if self.control.forced() {
                return processed;
            }
        }

        while let Some(spike) = self.queues.spikes.read() {
            self.write_spike(&spike);
            processed += 1;
            if self.control.forced() {
                return processed;
            }
        }

        processed
    }

    fn write_block(&mut self, slot: usize, timestamp: i64, samples: &[f32]) {
        self.stats.blocks += 1;
        self.stats.samples += samples.len() as u64;
        for i in 0..self.engines.len() {
            let result = self.engines[i].write_continuous(slot, timestamp, samples);
            self.check(i, result);
        }
    }

    fn write_event(&mut self, event: &EventRecord) {
        self.stats.events += 1;
        for i in 0..self.engines.len() {
            let result = self.engines[i].write_event(event);
            self.check(i, result);
        }
    }

    fn write_spike(&mut self, spike: &SpikeRecord) {
        self.stats.spikes += 1;
        for i in 0..self.engines.len() {
            let result = self.engines[i].write_spike(spike);
            self.check(i, result);
        }
    }

    fn check(&mut self, engine: usize, result: RecordResult<()>) {
        let Err(e) = result else {
            return;
        };
        self.stats.write_errors += 1;
        let id = self.engines[engine].engine_id().to_string();
        if self.stats.write_errors <= LOGGED_WRITE_ERRORS {
            tracing::warn!(engine = %id, error = %e, "write failed");
        }
        if self.stats.write_errors == 1 {
            self.status.warn(&format!("{id}: write failed: {e}"));
        }
    }

    fn maybe_report_overflow(&mut self) {
        if self.last_overflow_check.elapsed() >= self.settings.overflow_report_interval {
            self.report_overflow();
        }
    }

    fn report_overflow(&mut self) {
        self.last_overflow_check = Instant::now();
        let now = self.ingress.snapshot();
        let delta = now.since(&self.reported_drops);
        if delta.total() > 0 {
            tracing::warn!(
                session = self.session,
                blocks = delta.blocks,
                events = delta.events,
                spikes = delta.spikes,
                "recording queue overflow"
            );
            self.status.warn(&format!("Recording queue overflow: {delta}"));
        }
        self.reported_drops = now;
    }

    fn close_engines(&mut self) -> (Vec<CloseSummary>, Vec<String>) {
        let mut summaries = Vec::with_capacity(self.engines.len());
        let mut errors = Vec::new();
        for engine in &mut self.engines {
            let id = engine.engine_id().to_string();
            match catch_unwind(AssertUnwindSafe(|| engine.close_session())) {
                Ok(Ok(summary)) => {
                    errors.extend(summary.errors.iter().map(|e| format!("{id}: {e}")));
                    summaries.push(summary);
                }
                Ok(Err(e)) => {
                    tracing::error!(engine = %id, error = %e, "engine failed to close");
                    errors.push(format!("{id}: {e}"));
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(engine = %id, panic = %message, "engine panicked while closing");
                    errors.push(format!("{id}: panicked while closing: {message}"));
                }
            }
        }
        (summaries, errors)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
