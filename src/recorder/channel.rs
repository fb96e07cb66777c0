//! Capture channel abstraction
//!
//! A channel is the camera side of a recording: it writes one segment file
//! at a time. Hardware access and preview live behind this trait.

use super::state::RecordingState;
use crate::media::MediaError;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera initialization failed: {0}")]
    Initialization(String),

    #[error("Segment write failed: {0}")]
    SegmentWrite(String),

    #[error("Joining segments failed: {0}")]
    Join(#[source] MediaError),

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: RecordingState,
    },

    #[error("Recording budget exhausted")]
    BudgetExhausted,
}

pub type RecordingResult<T> = Result<T, RecordingError>;

/// Camera segment writer
#[async_trait]
pub trait CaptureChannel: Send + Sync {
    /// Channel identifier for logs
    fn id(&self) -> &str;

    /// Bring up the camera session. Called once before the first segment.
    async fn initialize(&self) -> RecordingResult<()>;

    /// Begin writing a new segment to `path`
    async fn open_segment(&self, path: &Path) -> RecordingResult<()>;

    /// Finalize the segment currently being written
    async fn close_segment(&self) -> RecordingResult<()>;
}
