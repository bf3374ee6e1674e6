//! Channel metadata and the per-session channel map.
//!
//! The recorder owns a live, ordered set of [`ChannelInfo`]; a channel's stable
//! index is its position in that set. At session start the enabled channels are
//! snapshotted into an immutable [`ChannelMap`] that fixes on-disk order for the
//! session's lifetime.

use crate::error::{RecordError, RecordResult};
use serde::{Deserialize, Serialize};

/// Stable index of a channel in the recorder's live channel set.
pub type ChannelIndex = usize;

/// Metadata describing one continuous channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Display name, e.g. `CH1`
    pub name: String,
    /// Identity of the processor producing this channel
    pub processor_id: u16,
    /// Samples per second
    pub sample_rate: f32,
    /// Physical units per raw unit (e.g. 0.195 µV per AD count)
    pub scale: f64,
    /// Recorded when a session starts
    pub enabled: bool,
}

impl ChannelInfo {
    /// An enabled channel.
    pub fn new(name: impl Into<String>, processor_id: u16, sample_rate: f32, scale: f64) -> Self {
        Self {
            name: name.into(),
            processor_id,
            sample_rate,
            scale,
            enabled: true,
        }
    }

    /// Builder-style enablement toggle.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Reject metadata that cannot be scaled to fixed point.
    pub fn validate(&self) -> RecordResult<()> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(RecordError::Configuration(format!(
                "channel '{}' has invalid scale {}",
                self.name, self.scale
            )));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(RecordError::Configuration(format!(
                "channel '{}' has invalid sample rate {}",
                self.name, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// An electrode whose spike waveforms are recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeSourceInfo {
    /// Electrode name, used as a file-name qualifier
    pub name: String,
    /// Channels per waveform
    pub num_channels: u16,
    /// Samples per channel per waveform
    pub samples_per_channel: u16,
    /// Samples per second
    pub sample_rate: f32,
}

impl SpikeSourceInfo {
    /// Describe an electrode.
    pub fn new(
        name: impl Into<String>,
        num_channels: u16,
        samples_per_channel: u16,
        sample_rate: f32,
    ) -> Self {
        Self {
            name: name.into(),
            num_channels,
            samples_per_channel,
            sample_rate,
        }
    }

    /// Number of waveform values in one record.
    pub fn waveform_len(&self) -> usize {
        usize::from(self.num_channels) * usize::from(self.samples_per_channel)
    }

    /// Reject empty electrodes and names that cannot be part of a file name.
    pub fn validate(&self) -> RecordResult<()> {
        if self.num_channels == 0 || self.samples_per_channel == 0 {
            return Err(RecordError::Configuration(format!(
                "spike source '{}' has an empty waveform",
                self.name
            )));
        }
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(RecordError::Configuration(format!(
                "spike source name '{}' is not usable in a file name",
                self.name
            )));
        }
        Ok(())
    }
}

/// Supplies channel topology to the recorder.
///
/// Implemented by whatever owns the signal graph; the recorder pulls from it in
/// [`crate::recorder::Recorder::sync_channels`] whenever the topology changes
/// between recordings.
pub trait ChannelProvider {
    /// Current continuous channels, in index order.
    fn channels(&self) -> Vec<ChannelInfo>;

    /// Current spike sources. Defaults to none.
    fn spike_sources(&self) -> Vec<SpikeSourceInfo> {
        Vec::new()
    }
}

impl ChannelProvider for Vec<ChannelInfo> {
    fn channels(&self) -> Vec<ChannelInfo> {
        self.clone()
    }
}

/// One recorded channel as seen by the engines.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedChannel {
    /// Stable index in the live channel set
    pub index: ChannelIndex,
    /// Snapshot of the metadata at session start
    pub info: ChannelInfo,
    /// Which processor group the channel belongs to
    pub group: usize,
    /// Column inside the group's interleaved file
    pub column: usize,
}

/// Channels of one processor; recorded into one interleaved file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorGroup {
    /// Processor identity
    pub processor_id: u16,
    /// Map slots of the group's channels, in file column order
    pub slots: Vec<usize>,
}

impl ProcessorGroup {
    /// Columns in the group's interleaved file.
    pub fn num_channels(&self) -> usize {
        self.slots.len()
    }
}

/// Immutable per-session mapping from live channel indices to on-disk order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelMap {
    entries: Vec<MappedChannel>,
    groups: Vec<ProcessorGroup>,
    slot_of: Vec<Option<usize>>,
}

impl ChannelMap {
    /// Snapshot the enabled channels of `channels`, in index order.
    ///
    /// Processor groups are ordered by the first enabled channel of each processor.
    pub fn build(channels: &[ChannelInfo]) -> RecordResult<Self> {
        let mut entries = Vec::new();
        let mut groups: Vec<ProcessorGroup> = Vec::new();
        let mut slot_of = vec![None; channels.len()];

        for (index, info) in channels.iter().enumerate() {
            if !info.enabled {
                continue;
            }
            info.validate()?;

            let slot = entries.len();
            let group = match groups.iter().position(|g| g.processor_id == info.processor_id) {
                Some(g) => g,
                None => {
                    groups.push(ProcessorGroup {
                        processor_id: info.processor_id,
                        slots: Vec::new(),
                    });
                    groups.len() - 1
                }
            };
            let column = groups[group].slots.len();
            groups[group].slots.push(slot);
            slot_of[index] = Some(slot);
            entries.push(MappedChannel {
                index,
                info: info.clone(),
                group,
                column,
            });
        }

        Ok(Self {
            entries,
            groups,
            slot_of,
        })
    }

    /// Number of recorded channels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no channel is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded channels in map order.
    pub fn entries(&self) -> &[MappedChannel] {
        &self.entries
    }

    /// Channel at a map slot.
    pub fn get(&self, slot: usize) -> Option<&MappedChannel> {
        self.entries.get(slot)
    }

    /// Processor groups in first-appearance order.
    pub fn groups(&self) -> &[ProcessorGroup] {
        &self.groups
    }

    /// Map slot of a live channel index, `None` when not recorded.
    pub fn slot_of(&self, index: ChannelIndex) -> Option<usize> {
        self.slot_of.get(index).copied().flatten()
    }

    /// Live indices of the recorded channels, in map order.
    pub fn indices(&self) -> Vec<ChannelIndex> {
        self.entries.iter().map(|c| c.index).collect()
    }

    /// Sample rate shared by every channel of a group, if there is one.
    pub fn group_sample_rate(&self, group: usize) -> Option<f32> {
        let slots = &self.groups.get(group)?.slots;
        let first = self.entries.get(*slots.first()?)?.info.sample_rate;
        slots
            .iter()
            .all(|&s| self.entries[s].info.sample_rate == first)
            .then_some(first)
    }
}

/// Recording status of one live channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    /// Stable index
    pub index: ChannelIndex,
    /// Display name
    pub name: String,
    /// Enabled for the next session
    pub enabled: bool,
    /// Part of the active session's channel map
    pub recording: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Vec<ChannelInfo> {
        vec![
            ChannelInfo::new("A0", 100, 30000.0, 0.195),
            ChannelInfo::new("A1", 100, 30000.0, 0.195).with_enabled(false),
            ChannelInfo::new("B0", 101, 2000.0, 1.0),
            ChannelInfo::new("A2", 100, 30000.0, 0.195),
        ]
    }

    #[test]
    fn test_map_keeps_enabled_in_index_order() {
        let map = ChannelMap::build(&channels()).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.indices(), vec![0, 2, 3]);
        assert_eq!(map.slot_of(1), None);
        assert_eq!(map.slot_of(3), Some(2));
        assert_eq!(map.slot_of(99), None);
    }

    #[test]
    fn test_groups_by_first_appearance() {
        let map = ChannelMap::build(&channels()).unwrap();
        let groups = map.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].processor_id, 100);
        assert_eq!(groups[0].slots, vec![0, 2]);
        assert_eq!(groups[1].slots, vec![1]);
        assert_eq!(map.get(2).unwrap().column, 1);
        assert_eq!(map.group_sample_rate(0), Some(30000.0));
    }

    #[test]
    fn test_invalid_scale_rejected() {
        let bad = vec![ChannelInfo::new("X", 1, 1000.0, 0.0)];
        assert!(matches!(
            ChannelMap::build(&bad),
            Err(RecordError::Configuration(_))
        ));

        // disabled channels are not validated
        let skipped = vec![ChannelInfo::new("X", 1, f32::NAN, 0.0).with_enabled(false)];
        assert!(ChannelMap::build(&skipped).unwrap().is_empty());
    }

    #[test]
    fn test_spike_source_validation() {
        assert!(SpikeSourceInfo::new("tetrode 1", 4, 40, 30000.0).validate().is_ok());
        assert!(SpikeSourceInfo::new("a/b", 4, 40, 30000.0).validate().is_err());
        assert!(SpikeSourceInfo::new("se", 0, 40, 30000.0).validate().is_err());
        assert_eq!(SpikeSourceInfo::new("st", 2, 40, 30000.0).waveform_len(), 80);
    }
}
