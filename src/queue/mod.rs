//! Bounded single-producer/single-consumer queues between the real-time thread
//! and the writer thread.
//!
//! A fresh set is built for every session and dropped when it ends, so no queue
//! state crosses a session boundary. Capacities never change while a session
//! runs; a full queue drops the incoming record.

pub mod data;
pub mod record;

pub use data::{data_queue, BlockHeader, DataConsumer, DataProducer};
pub use record::{record_queue, RecordConsumer, RecordProducer};

use crate::config::QueueConfig;
use crate::record::{EventRecord, SpikeRecord};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Producer halves of one session's queues.
pub struct SessionProducers {
    /// Sample blocks, per channel-map slot
    pub data: DataProducer,
    /// TTL and text events
    pub events: RecordProducer<EventRecord>,
    /// Spike waveforms
    pub spikes: RecordProducer<SpikeRecord>,
}

/// Consumer halves of one session's queues.
pub struct SessionConsumers {
    /// Sample blocks, per channel-map slot
    pub data: DataConsumer,
    /// TTL and text events
    pub events: RecordConsumer<EventRecord>,
    /// Spike waveforms
    pub spikes: RecordConsumer<SpikeRecord>,
}

/// Build the queues for a session recording `channels` channel-map slots.
pub fn session_queues(channels: usize, config: &QueueConfig) -> (SessionProducers, SessionConsumers) {
    let (data_tx, data_rx) = data_queue(channels, config.block_samples, config.data_blocks);
    let (events_tx, events_rx) = record_queue(config.event_capacity, "event");
    let (spikes_tx, spikes_rx) = record_queue(config.spike_capacity, "spike");
    (
        SessionProducers {
            data: data_tx,
            events: events_tx,
            spikes: spikes_tx,
        },
        SessionConsumers {
            data: data_rx,
            events: events_rx,
            spikes: spikes_rx,
        },
    )
}

impl SessionConsumers {
    /// Records waiting across all queues.
    pub fn pending(&self) -> usize {
        self.data.pending() + self.events.len() + self.spikes.len()
    }

    /// Whether every queue is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.events.is_empty() && self.spikes.is_empty()
    }

    /// Discard everything queued. Returns the records dropped.
    pub fn reset(&mut self) -> usize {
        self.data.reset() + self.events.reset() + self.spikes.reset()
    }
}

/// Records lost on the real-time path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    /// Sample blocks dropped
    pub blocks: u64,
    /// Events dropped
    pub events: u64,
    /// Spikes dropped
    pub spikes: u64,
    /// Drops caused by a session transition holding the ingress lock
    pub contended: u64,
}

impl DropCounts {
    /// Records dropped of any kind.
    pub fn total(&self) -> u64 {
        self.blocks + self.events + self.spikes
    }

    /// Drops that happened after `earlier` was taken.
    pub fn since(&self, earlier: &DropCounts) -> DropCounts {
        DropCounts {
            blocks: self.blocks.saturating_sub(earlier.blocks),
            events: self.events.saturating_sub(earlier.events),
            spikes: self.spikes.saturating_sub(earlier.spikes),
            contended: self.contended.saturating_sub(earlier.contended),
        }
    }
}

impl std::fmt::Display for DropCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sample blocks, {} events, {} spikes dropped",
            self.blocks, self.events, self.spikes
        )
    }
}

/// Kind of record dropped on ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    /// A sample block
    Block,
    /// An event
    Event,
    /// A spike
    Spike,
}

/// Lock-free drop counters shared by the ingress path and the writer thread.
#[derive(Debug, Default)]
pub struct IngressStats {
    blocks: AtomicU64,
    events: AtomicU64,
    spikes: AtomicU64,
    contended: AtomicU64,
}

impl IngressStats {
    /// Count one dropped record. `contended` marks a drop caused by lock contention.
    #[inline]
    pub fn record_drop(&self, kind: DropKind, contended: bool) {
        let counter = match kind {
            DropKind::Block => &self.blocks,
            DropKind::Event => &self.events,
            DropKind::Spike => &self.spikes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contended.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current totals.
    pub fn snapshot(&self) -> DropCounts {
        DropCounts {
            blocks: self.blocks.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            spikes: self.spikes.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [&self.blocks, &self.events, &self.spikes, &self.contended] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
