//! Per-channel sample-block queue.
//!
//! Each channel-map slot gets two rings: one of raw `f32` samples sized
//! `block_samples * blocks`, and one of [`BlockHeader`]s sized `blocks`. The
//! producer pushes the samples first and the header last, so a header visible to
//! the consumer always has its samples behind it.

use crate::error::{RecordError, RecordResult};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::time::{Duration, Instant};

/// Timestamp and length of one queued block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Sample number of the block's first sample
    pub timestamp: i64,
    /// Samples in the block
    pub len: u32,
}

struct ChannelProducer {
    samples: HeapProducer<f32>,
    headers: HeapProducer<BlockHeader>,
}

struct ChannelConsumer {
    samples: HeapConsumer<f32>,
    headers: HeapConsumer<BlockHeader>,
}

/// Real-time half of the sample queue.
pub struct DataProducer {
    channels: Vec<ChannelProducer>,
}

/// Writer-thread half of the sample queue.
pub struct DataConsumer {
    channels: Vec<ChannelConsumer>,
}

/// Build a sample queue for `channels` slots, each holding `blocks` blocks of up
/// to `block_samples` samples.
pub fn data_queue(channels: usize, block_samples: usize, blocks: usize) -> (DataProducer, DataConsumer) {
    let sample_capacity = block_samples.max(1).saturating_mul(blocks.max(1));
    let (producers, consumers) = (0..channels)
        .map(|_| {
            let (samples, samples_out) = HeapRb::<f32>::new(sample_capacity).split();
            let (headers, headers_out) = HeapRb::<BlockHeader>::new(blocks.max(1)).split();
            (
                ChannelProducer { samples, headers },
                ChannelConsumer {
                    samples: samples_out,
                    headers: headers_out,
                },
            )
        })
        .unzip();
    (
        DataProducer { channels: producers },
        DataConsumer { channels: consumers },
    )
}

impl DataProducer {
    /// Queue one block for `slot`.
    ///
    /// Wait-free and allocation-free. Fails without writing anything when either
    /// ring lacks room; the block is then lost.
    #[inline]
    pub fn write(&mut self, slot: usize, timestamp: i64, samples: &[f32]) -> RecordResult<()> {
        let full = RecordError::QueueFull { queue: "sample" };
        let Some(channel) = self.channels.get_mut(slot) else {
            return Err(full);
        };
        let Ok(len) = u32::try_from(samples.len()) else {
            return Err(full);
        };
        if channel.headers.is_full() || channel.samples.free_len() < samples.len() {
            return Err(full);
        }
        channel.samples.push_slice(samples);
        // header last: publishes the block
        let _ = channel.headers.push(BlockHeader { timestamp, len });
        Ok(())
    }

    /// Number of channel slots.
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Free block slots for `slot`.
    pub fn free_blocks(&self, slot: usize) -> usize {
        self.channels.get(slot).map_or(0, |c| c.headers.free_len())
    }
}

impl DataConsumer {
    /// Pop the oldest block of `slot` into `out`, returning its timestamp.
    pub fn read(&mut self, slot: usize, out: &mut Vec<f32>) -> Option<i64> {
        let channel = self.channels.get_mut(slot)?;
        let header = channel.headers.pop()?;
        out.clear();
        out.resize(header.len as usize, 0.0);
        let read = channel.samples.pop_slice(out);
        out.truncate(read);
        Some(header.timestamp)
    }

    /// Like [`DataConsumer::read`], but waits up to `timeout` for a block.
    pub fn read_timeout(&mut self, slot: usize, out: &mut Vec<f32>, timeout: Duration) -> Option<i64> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ts) = self.read(slot, out) {
                return Some(ts);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::park_timeout((deadline - now).min(Duration::from_millis(1)));
        }
    }

    /// Number of channel slots.
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Blocks waiting in `slot`.
    pub fn pending_blocks(&self, slot: usize) -> usize {
        self.channels.get(slot).map_or(0, |c| c.headers.len())
    }

    /// Blocks waiting across all slots.
    pub fn pending(&self) -> usize {
        self.channels.iter().map(|c| c.headers.len()).sum()
    }

    /// Whether no block is waiting.
    pub fn is_empty(&self) -> bool {
        self.channels.iter().all(|c| c.headers.is_empty())
    }

    /// Discard everything queued. Returns the blocks dropped.
    pub fn reset(&mut self) -> usize {
        let mut dropped = 0;
        for channel in &mut self.channels {
            dropped += channel.headers.clear();
            channel.samples.clear();
        }
        dropped
    }
}
