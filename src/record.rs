//! Discrete records carried through the event and spike queues.

use serde::Serialize;

/// Kind of a discrete event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Digital line transition
    Ttl,
    /// Free-form text message
    Text,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// A digital line changed state; `word` is the full line state after the change.
    Ttl {
        /// Line that changed
        line: u8,
        /// New state of that line
        high: bool,
        /// All lines, bit `n` = line `n`
        word: u64,
    },
    /// A text message.
    Text(String),
}

/// A discrete occurrence on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Sample number the event belongs to
    pub timestamp: i64,
    /// Channel (or event stream) that produced it
    pub source_channel: u16,
    /// What happened
    pub payload: EventPayload,
}

impl EventRecord {
    /// A TTL transition.
    pub fn ttl(timestamp: i64, source_channel: u16, line: u8, high: bool, word: u64) -> Self {
        Self {
            timestamp,
            source_channel,
            payload: EventPayload::Ttl { line, high, word },
        }
    }

    /// A text message.
    pub fn text(timestamp: i64, source_channel: u16, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            source_channel,
            payload: EventPayload::Text(message.into()),
        }
    }

    /// Kind of the payload.
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Ttl { .. } => EventKind::Ttl,
            EventPayload::Text(_) => EventKind::Text,
        }
    }
}

/// A detected spike waveform.
///
/// `waveform` is channel-major (`num_channels` runs of `samples_per_channel`),
/// `gains` and `thresholds` have one entry per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeRecord {
    /// Sample number of the spike peak
    pub timestamp: i64,
    /// Index of the spike source (registration order)
    pub source: u16,
    /// Sorted unit, 0 when unsorted
    pub sorted_unit: u16,
    /// Waveform samples at full precision
    pub waveform: Vec<f32>,
    /// Per-channel gain
    pub gains: Vec<f32>,
    /// Per-channel detection threshold
    pub thresholds: Vec<f32>,
}
