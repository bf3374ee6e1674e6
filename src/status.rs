//! Status-message sink.
//!
//! The recorder never blocks on user interaction. Anything a user should hear
//! about (forced close, a file that already existed, queue overflow) goes to a
//! [`StatusSink`]. The default sink forwards to `tracing`; [`StatusLog`] keeps a
//! bounded history that session queries and tests can read back.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    /// Informational (session started, files closed)
    Info,
    /// Something was lost or skipped
    Warning,
    /// A session-control operation failed
    Error,
}

/// One human-readable status message.
#[derive(Debug, Clone, Serialize)]
pub struct StatusMessage {
    /// When the message was produced
    pub at: DateTime<Utc>,
    /// Severity
    pub level: StatusLevel,
    /// Text shown to the user
    pub text: String,
}

/// Receiver of human-readable status messages.
///
/// Called from the control thread and from the writer thread, never from the
/// real-time ingress path.
pub trait StatusSink: Send + Sync {
    /// Deliver one message.
    fn report(&self, level: StatusLevel, text: &str);

    /// Shorthand for an informational message.
    fn info(&self, text: &str) {
        self.report(StatusLevel::Info, text);
    }

    /// Shorthand for a warning.
    fn warn(&self, text: &str) {
        self.report(StatusLevel::Warning, text);
    }

    /// Shorthand for an error.
    fn error(&self, text: &str) {
        self.report(StatusLevel::Error, text);
    }
}

/// Default sink: forwards every message to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn report(&self, level: StatusLevel, text: &str) {
        match level {
            StatusLevel::Info => tracing::info!(target: "daq_recorder::status", "{text}"),
            StatusLevel::Warning => tracing::warn!(target: "daq_recorder::status", "{text}"),
            StatusLevel::Error => tracing::error!(target: "daq_recorder::status", "{text}"),
        }
    }
}

/// Sink that remembers the most recent messages and also logs them.
#[derive(Debug)]
pub struct StatusLog {
    capacity: usize,
    entries: Mutex<VecDeque<StatusMessage>>,
}

impl StatusLog {
    /// History holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        })
    }

    /// Copy of the current history, oldest first.
    pub fn entries(&self) -> Vec<StatusMessage> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Messages at `level`, oldest first.
    pub fn with_level(&self, level: StatusLevel) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|m| m.level == level)
            .map(|m| m.text.clone())
            .collect()
    }

    /// Drop the history.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl StatusSink for StatusLog {
    fn report(&self, level: StatusLevel, text: &str) {
        TracingStatusSink.report(level, text);
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(StatusMessage {
            at: Utc::now(),
            level,
            text: text.to_string(),
        });
    }
}
