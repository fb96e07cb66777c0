//! Media capability types
//!
//! Inputs, outputs and failure reasons shared by the segment joiner and the
//! transcoder implementations.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// How the joined clip is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropPolicy {
    /// Centre-crop every segment to a square frame
    #[default]
    Square,
    /// Keep the camera's native framing
    None,
}

impl CropPolicy {
    /// Whether joining under this policy needs a re-encode
    pub fn requires_reencode(&self) -> bool {
        matches!(self, CropPolicy::Square)
    }
}

/// One input to the joiner, in recorded order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInput {
    pub file_path: PathBuf,
}

/// Output of a successful join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedClip {
    /// Path to the single concatenated file
    pub file_path: PathBuf,
    /// Total duration in milliseconds
    pub duration_ms: u64,
}

/// How audio is stripped from a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StripMode {
    /// Copy the video stream untouched, drop audio
    StreamCopy,
    /// Re-encode the video stream, drop audio
    ReEncode,
}

/// Transformation requested from the transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TranscodeOp {
    StripAudio { mode: StripMode },
}

impl TranscodeOp {
    pub fn strip_audio(mode: StripMode) -> Self {
        TranscodeOp::StripAudio { mode }
    }
}

/// Failures reported by the external media capabilities
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Stream copy cannot express the requested operation; re-encode instead
    #[error("Stream copy unsupported: {0}")]
    StreamCopyUnsupported(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),
}
