//! Alignment of per-channel blocks into interleaved frames.
//!
//! Channels of one processor arrive as independent blocks, possibly out of step
//! with each other. Each channel's first block timestamp fixes its origin; a
//! sample's frame index is `timestamp - origin`. Gaps are zero-filled, samples
//! for frames already written are dropped. A record of `block_length` frames is
//! emitted as soon as every channel has that many staged, or, when one channel
//! falls too far behind, as soon as the fullest channel reaches `max_lag`
//! frames, with the lagging channels zero-padded.
//!
//! A jump of more than `max_gap` frames in either direction is a discontinuity:
//! the channel is re-originated so its samples continue where it left off,
//! instead of padding or discarding an unbounded number of frames. Padding,
//! drops and discontinuities are counted in [`AlignmentStats`].

use crate::error::RecordResult;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// Samples the assembler had to invent or discard for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentStats {
    /// Zero samples written for frames a channel had no data for
    pub padded_samples: u64,
    /// Samples discarded because their frames were already written
    pub dropped_samples: u64,
    /// Timestamp jumps larger than the gap bound; the channel was re-originated
    pub discontinuities: u64,
}

impl AlignmentStats {
    /// Whether every sample landed at its own frame.
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for AlignmentStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} samples zero-filled, {} samples dropped, {} timestamp discontinuities",
            self.padded_samples, self.dropped_samples, self.discontinuities
        )
    }
}

#[derive(Debug, Default)]
struct Lane {
    origin: Option<i64>,
    /// Frame index one past the last staged sample
    end: i64,
    staged: VecDeque<i16>,
}

/// Interleaves the channels of one processor into fixed-size records.
#[derive(Debug)]
pub(crate) struct FrameAssembler {
    lanes: Vec<Lane>,
    block_length: usize,
    max_lag: usize,
    max_gap: usize,
    frames_emitted: i64,
    interleaved: Vec<i16>,
    stats: AlignmentStats,
}

impl FrameAssembler {
    pub fn new(channels: usize, block_length: usize, max_lag: usize, max_gap: usize) -> Self {
        let block_length = block_length.max(1);
        let max_lag = max_lag.max(block_length);
        Self {
            lanes: (0..channels).map(|_| Lane::default()).collect(),
            block_length,
            max_lag,
            max_gap: max_gap.max(max_lag),
            frames_emitted: 0,
            interleaved: Vec::with_capacity(block_length * channels),
            stats: AlignmentStats::default(),
        }
    }

    /// Frames written so far.
    pub fn frames(&self) -> u64 {
        self.frames_emitted as u64
    }

    /// Timestamp of the first block of each channel.
    pub fn first_timestamps(&self) -> Vec<Option<i64>> {
        self.lanes.iter().map(|l| l.origin).collect()
    }

    /// Padding, drops and discontinuities so far.
    pub fn stats(&self) -> AlignmentStats {
        self.stats
    }

    /// Stage one block for `column`; calls `emit(interleaved, frames)` once per
    /// completed record.
    ///
    /// Work per call is bounded by the block length plus `max_gap` frames.
    pub fn push<F>(&mut self, column: usize, timestamp: i64, samples: &[i16], mut emit: F) -> RecordResult<()>
    where
        F: FnMut(&[i16], usize) -> RecordResult<()>,
    {
        let max_gap = self.max_gap as u64;
        let Some(lane) = self.lanes.get_mut(column) else {
            return Ok(());
        };
        let origin = *lane.origin.get_or_insert(timestamp);

        let mut position = timestamp.saturating_sub(origin);
        let jump = position.saturating_sub(lane.end);
        if jump.unsigned_abs() > max_gap {
            lane.origin = Some(origin.saturating_add(jump));
            position = lane.end;
            self.stats.discontinuities += 1;
            warn!(column, timestamp, jump, "timestamp discontinuity, channel continues without padding");
        }

        let mut data = samples;
        if position < lane.end {
            let overlap = usize::try_from(lane.end - position).unwrap_or(usize::MAX);
            let dropped = overlap.min(data.len());
            if self.stats.dropped_samples == 0 {
                warn!(column, timestamp, dropped, "samples for frames already written, dropping them");
            }
            self.stats.dropped_samples += dropped as u64;
            if overlap >= data.len() {
                return Ok(());
            }
            data = &data[overlap..];
        } else {
            let mut gap = position - lane.end;
            while gap > 0 {
                let n = gap.min(self.block_length as i64);
                let lane = &mut self.lanes[column];
                lane.staged.extend(std::iter::repeat(0).take(n as usize));
                lane.end += n;
                self.stats.padded_samples += n as u64;
                gap -= n;
                self.drain(&mut emit)?;
            }
        }

        let lane = &mut self.lanes[column];
        lane.staged.extend(data.iter().copied());
        lane.end += data.len() as i64;
        self.drain(&mut emit)
    }

    /// Emit everything still staged, the last record possibly short.
    pub fn finish<F>(&mut self, mut emit: F) -> RecordResult<()>
    where
        F: FnMut(&[i16], usize) -> RecordResult<()>,
    {
        loop {
            let most = self.lanes.iter().map(|l| l.staged.len()).max().unwrap_or(0);
            if most == 0 {
                return Ok(());
            }
            self.emit_frames(most.min(self.block_length), &mut emit)?;
        }
    }

    fn drain<F>(&mut self, emit: &mut F) -> RecordResult<()>
    where
        F: FnMut(&[i16], usize) -> RecordResult<()>,
    {
        loop {
            let fewest = self.lanes.iter().map(|l| l.staged.len()).min().unwrap_or(0);
            let most = self.lanes.iter().map(|l| l.staged.len()).max().unwrap_or(0);
            let frames = if fewest >= self.block_length {
                self.block_length
            } else if most >= self.max_lag {
                tracing::debug!(fewest, most, "channel lagging, zero-padding record");
                self.block_length
            } else {
                return Ok(());
            };
            self.emit_frames(frames, emit)?;
        }
    }

    fn emit_frames<F>(&mut self, frames: usize, emit: &mut F) -> RecordResult<()>
    where
        F: FnMut(&[i16], usize) -> RecordResult<()>,
    {
        self.interleaved.clear();
        for _ in 0..frames {
            for lane in &mut self.lanes {
                let value = match lane.staged.pop_front() {
                    Some(value) => value,
                    None => {
                        self.stats.padded_samples += 1;
                        0
                    }
                };
                self.interleaved.push(value);
            }
        }
        self.frames_emitted += frames as i64;
        for lane in &mut self.lanes {
            lane.end = lane.end.max(self.frames_emitted);
        }
        emit(&self.interleaved, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(asm: &mut FrameAssembler, column: usize, ts: i64, samples: &[i16], out: &mut Vec<Vec<i16>>) {
        asm.push(column, ts, samples, |block, _| {
            out.push(block.to_vec());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_interleaves_when_all_channels_ready() {
        let mut asm = FrameAssembler::new(2, 2, 100, 1000);
        let mut out = Vec::new();
        collect(&mut asm, 0, 10, &[1, 2, 3], &mut out);
        assert!(out.is_empty());
        collect(&mut asm, 1, 10, &[-1, -2, -3], &mut out);
        assert_eq!(out, vec![vec![1, -1, 2, -2]]);

        asm.finish(|block, frames| {
            assert_eq!(frames, 1);
            out.push(block.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(out[1], vec![3, -3]);
        assert_eq!(asm.frames(), 3);
        assert_eq!(asm.first_timestamps(), vec![Some(10), Some(10)]);
    }

    #[test]
    fn test_gap_is_zero_filled_and_overlap_dropped() {
        let mut asm = FrameAssembler::new(1, 4, 100, 1000);
        let mut out = Vec::new();
        collect(&mut asm, 0, 0, &[1, 2], &mut out);
        collect(&mut asm, 0, 3, &[4], &mut out);
        assert_eq!(out, vec![vec![1, 2, 0, 4]]);

        // frames 2..4 are already written
        collect(&mut asm, 0, 2, &[9, 9, 5, 6, 7, 8], &mut out);
        assert_eq!(out[1], vec![5, 6, 7, 8]);

        let stats = asm.stats();
        assert_eq!((stats.padded_samples, stats.dropped_samples), (1, 2));
        assert_eq!(stats.discontinuities, 0);
    }

    #[test]
    fn test_timestamp_reset_drops_and_counts_overlap() {
        let mut asm = FrameAssembler::new(1, 64, 4096, 1 << 20);
        let mut out = Vec::new();
        collect(&mut asm, 0, 0, &[1; 64], &mut out);
        collect(&mut asm, 0, 0, &[2; 64], &mut out);
        collect(&mut asm, 0, 64, &[3; 64], &mut out);
        assert_eq!(out, vec![vec![1; 64], vec![3; 64]]);
        assert_eq!(asm.frames(), 128);
        assert_eq!(asm.stats().dropped_samples, 64);
        assert!(!asm.stats().is_clean());
    }

    #[test]
    fn test_large_jump_is_a_discontinuity() {
        let mut asm = FrameAssembler::new(1, 4, 16, 64);
        let mut out = Vec::new();
        collect(&mut asm, 0, 0, &[1, 2, 3, 4], &mut out);
        collect(&mut asm, 0, 200_000_000, &[5], &mut out);
        collect(&mut asm, 0, 200_000_001, &[6, 7, 8], &mut out);
        // no padding: the channel continues right after its last frame
        assert_eq!(out, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(asm.stats().discontinuities, 1);
        assert_eq!(asm.stats().padded_samples, 0);

        // a jump backwards past the gap bound is handled the same way
        collect(&mut asm, 0, 0, &[9, 9, 9, 9], &mut out);
        assert_eq!(out[2], vec![9; 4]);
        assert_eq!(asm.stats().discontinuities, 2);
        assert_eq!(asm.stats().dropped_samples, 0);
    }

    #[test]
    fn test_gap_up_to_bound_is_zero_filled() {
        let mut asm = FrameAssembler::new(1, 4, 4, 64);
        let mut records = 0;
        let mut push = |asm: &mut FrameAssembler, ts: i64, samples: &[i16]| {
            asm.push(0, ts, samples, |_, _| {
                records += 1;
                Ok(())
            })
            .unwrap();
        };
        push(&mut asm, 0, &[1, 2, 3, 4]);
        push(&mut asm, 68, &[5, 6, 7, 8]);
        assert_eq!(asm.frames(), 72);
        assert_eq!(asm.stats().padded_samples, 64);
        assert_eq!(asm.stats().discontinuities, 0);
        drop(push);
        assert_eq!(records, 18);
    }

    #[test]
    fn test_lagging_channel_is_padded() {
        let mut asm = FrameAssembler::new(2, 2, 4, 64);
        let mut out = Vec::new();
        collect(&mut asm, 0, 0, &[1, 2, 3, 4], &mut out);
        assert_eq!(out, vec![vec![1, 0, 2, 0]]);

        // frames 0..2 of channel 1 were padded, its late samples for them are dropped
        collect(&mut asm, 1, 0, &[7, 7, 7, 7, 8, 8], &mut out);
        assert_eq!(out[1], vec![3, 7, 4, 7]);
        collect(&mut asm, 0, 4, &[5, 6], &mut out);
        assert_eq!(out[2], vec![5, 8, 6, 8]);

        let stats = asm.stats();
        assert_eq!((stats.padded_samples, stats.dropped_samples), (2, 2));
    }
}
