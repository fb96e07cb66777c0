//! Media capabilities
//!
//! Segment joining and audio stripping are consumed through traits, with an
//! FFmpeg-backed implementation for desktop hosts.

pub mod ffmpeg;
pub mod traits;
pub mod types;

pub use ffmpeg::{FfmpegJoiner, FfmpegTranscoder};
pub use traits::{MediaTranscoder, SegmentJoiner};
pub use types::{CropPolicy, JoinedClip, MediaError, SegmentInput, StripMode, TranscodeOp};
