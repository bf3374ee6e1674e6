//! # DAQ Recorder
//!
//! Real-time multichannel recording core. Acquisition code hands sample blocks,
//! TTL/text events and spike waveforms to a [`RecordIngress`] from its real-time
//! thread; the records travel through bounded lock-free queues to a background
//! writer thread, which feeds every active recording engine.
//!
//! ## Crate Structure
//!
//! - **`recorder`**: the [`Recorder`] orchestrator (channel set, session
//!   lifecycle, engines) and the real-time [`RecordIngress`].
//! - **`queue`**: single-producer/single-consumer queues for sample blocks,
//!   events and spikes, rebuilt for every session.
//! - **`writer`**: the writer thread and its drain/force stop protocol.
//! - **`engine`**: the [`RecordEngine`] trait, the engine registry and the
//!   built-in `binary` and `npy` engines with their file codecs.
//! - **`channel`**: channel metadata and the per-session channel map.
//! - **`record`**: event and spike records.
//! - **`paths`**: session file naming, session numbering, free space.
//! - **`config`**: figment-backed [`RecorderConfig`].
//! - **`logging`**: tracing subscriber setup.
//! - **`status`**: the status-message sink.
//! - **`error`**: [`RecordError`].
//!
//! ## Example
//!
//! ```no_run
//! use daq_recorder::{ChannelInfo, Recorder, RecorderConfig};
//!
//! # fn main() -> daq_recorder::RecordResult<()> {
//! let mut recorder = Recorder::new(RecorderConfig::default())?;
//! for i in 0..4 {
//!     recorder.add_channel(ChannelInfo::new(format!("CH{i}"), 100, 30000.0, 0.195))?;
//! }
//! let ingress = recorder.ingress();
//!
//! recorder.start_session("/data/mouse42", "experiment")?;
//! // on the acquisition thread:
//! ingress.on_sample_block(0, &[0.0; 1024], 0);
//! // ...
//! if let Some(report) = recorder.stop_session()? {
//!     assert!(report.is_clean());
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod paths;
pub mod queue;
pub mod record;
pub mod recorder;
pub mod status;
pub mod writer;

pub use channel::{ChannelIndex, ChannelInfo, ChannelMap, ChannelProvider, ChannelStatus, SpikeSourceInfo};
pub use config::RecorderConfig;
pub use engine::{EngineRegistry, RecordEngine};
pub use error::{RecordError, RecordResult};
pub use record::{EventPayload, EventRecord, SpikeRecord};
pub use recorder::{Ingest, RecordIngress, Recorder, RecorderState, Rejected, StopReport};
pub use status::{StatusLevel, StatusLog, StatusSink};
pub use writer::StopOutcome;
