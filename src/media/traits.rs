//! Media capability traits
//!
//! Joining and transcoding are external capabilities. Business logic only
//! sees these traits; the concrete implementation is chosen once when the
//! studio is assembled.

use super::types::{CropPolicy, JoinedClip, MediaError, SegmentInput, TranscodeOp};
use async_trait::async_trait;
use std::path::Path;

/// Concatenates recorded segments into one clip
#[async_trait]
pub trait SegmentJoiner: Send + Sync {
    /// Join `segments` (in order) into `output`
    async fn join(
        &self,
        segments: &[SegmentInput],
        crop: CropPolicy,
        output: &Path,
    ) -> Result<JoinedClip, MediaError>;
}

/// Produces derived files from a single input
#[async_trait]
pub trait MediaTranscoder: Send + Sync {
    /// Apply `op` to `input`, writing the result to `output`
    async fn transcode(
        &self,
        input: &Path,
        op: TranscodeOp,
        output: &Path,
    ) -> Result<(), MediaError>;
}
