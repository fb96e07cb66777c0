//! Recording state management
//!
//! Defines the recording state machine, segments and the snapshots
//! published to subscribers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    #[default]
    Idle,
    /// Camera session is being brought up
    Initializing,
    /// Currently recording
    Recording,
    /// Recording is paused
    Paused,
    /// Segments are being joined
    Processing,
    /// Recording completed, output available
    Completed,
    /// Recording failed; segments kept for diagnostics
    Error,
    /// Recording was discarded
    Cancelled,
}

impl RecordingState {
    /// Whether a fresh session may be started from this state
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            RecordingState::Idle
                | RecordingState::Completed
                | RecordingState::Error
                | RecordingState::Cancelled
        )
    }

    /// Whether a session is live (recording or paused)
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordingState::Idle => "idle",
            RecordingState::Initializing => "initializing",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Processing => "processing",
            RecordingState::Completed => "completed",
            RecordingState::Error => "error",
            RecordingState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One contiguous slice recorded between a start/resume and a pause/stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub file_path: PathBuf,
    /// Offset of this segment within the final clip (milliseconds)
    pub start_offset_ms: u64,
    pub duration_ms: u64,
}

/// Result of a completed recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    /// Path to the joined clip
    pub file_path: PathBuf,

    /// Total duration in milliseconds as reported by the joiner
    pub duration_ms: u64,

    /// Number of segments that went into the clip
    pub segment_count: usize,
}

/// Immutable view of the recorder, published on every transition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSnapshot {
    pub state: RecordingState,
    /// Finalized segments of the current session, in recorded order
    pub segments: Vec<Segment>,
    /// Sum of finalized segment durations
    pub recorded_ms: u64,
    /// Budget left when the snapshot was taken
    pub remaining_ms: u64,
    pub output: Option<RecordingOutput>,
    pub error: Option<String>,
}

impl RecordingSnapshot {
    /// Fraction of the budget used by finalized segments (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        let total = self.recorded_ms + self.remaining_ms;
        if total == 0 {
            return 0.0;
        }
        (self.recorded_ms as f64 / total as f64).clamp(0.0, 1.0)
    }
}
