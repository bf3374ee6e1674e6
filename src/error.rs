//! Custom error types for the recording core.
//!
//! This module defines the primary error type, `RecordError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while a session is configured, started and stopped.
//!
//! ## Error Hierarchy
//!
//! - **`QueueFull`**: A producer-side record drop. Never returned on the real-time
//!   path (ingress degrades to [`crate::recorder::Ingest::Dropped`] plus a counter); it
//!   is what the queues themselves report.
//! - **`FileSystem`**: Create/open/write failure with the offending path attached.
//!   Aborts session start for the affected engine.
//! - **`FileAlreadyExists`**: A naming collision. Engines report it as a warning and
//!   keep going without that file.
//! - **`ThreadTimeout`**: The writer thread did not exit within the bounded wait. The
//!   caller decides between waiting longer and forcing a close.
//! - **`InvalidState`**: An operation that is not allowed in the current session state,
//!   e.g. toggling channel enablement while recording.
//! - **`Configuration`**: Semantic errors in configuration or channel metadata.
//!
//! By using `#[from]`, `RecordError` can be created from the underlying error types,
//! simplifying error handling with the `?` operator.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RecordResult<T> = std::result::Result<T, RecordError>;

/// Primary error type for the recording core.
#[derive(Error, Debug)]
pub enum RecordError {
    /// A bounded queue had no room for the record; the record was dropped.
    #[error("{queue} queue is full, record dropped")]
    QueueFull {
        /// Which queue overflowed ("sample", "event" or "spike").
        queue: &'static str,
    },

    /// Creating, opening or writing a file failed.
    #[error("File system error on {}: {source}", path.display())]
    FileSystem {
        /// File or directory the operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A fresh file was expected but one already exists at this path.
    #[error("File already exists: {}", path.display())]
    FileAlreadyExists {
        /// Path of the existing file.
        path: PathBuf,
    },

    /// The writer thread did not exit within the bounded wait.
    ///
    /// **Recovery Strategy**: call `wait_for_writer` to give it more time, or
    /// `force_stop` to close files immediately (trailing records may be lost).
    #[error("Writer thread did not exit within {waited:?}")]
    ThreadTimeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The operation is not permitted in the current session state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration or channel metadata failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Standard I/O operation failed without a known path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A recording engine panicked inside the writer thread.
    #[error("Writer thread panicked: {0}")]
    WriterPanicked(String),
}

impl From<figment::Error> for RecordError {
    fn from(err: figment::Error) -> Self {
        RecordError::Figment(Box::new(err))
    }
}

impl RecordError {
    /// Wrap an I/O error with the path it happened on.
    pub fn fs(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            RecordError::FileAlreadyExists { path }
        } else {
            RecordError::FileSystem { path, source }
        }
    }

    /// Whether the trigger caller can reasonably retry the failed operation.
    ///
    /// Timeouts and state errors clear up on their own (wait, or stop first);
    /// file system and configuration problems need the caller to change something.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RecordError::QueueFull { .. }
                | RecordError::ThreadTimeout { .. }
                | RecordError::InvalidState(_)
                | RecordError::FileAlreadyExists { .. }
        )
    }
}
