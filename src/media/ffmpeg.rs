//! FFmpeg-backed joiner and transcoder
//!
//! Both shell out to `ffmpeg`/`ffprobe` on the host. Every invocation runs
//! under a timeout and the child is killed if the timeout fires.

use super::traits::{MediaTranscoder, SegmentJoiner};
use super::types::{CropPolicy, JoinedClip, MediaError, SegmentInput, StripMode, TranscodeOp};
use crate::utils::fs::remove_file_logged;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// stderr fragments meaning "this cannot be done without re-encoding"
const STREAM_COPY_MARKERS: &[&str] = &[
    "could not find tag for codec",
    "not currently supported in container",
    "codec copy is not supported",
    "incompatible with output codec",
    "error initializing output stream",
];

/// stderr fragments meaning the input itself is unreadable
const UNSUPPORTED_INPUT_MARKERS: &[&str] = &[
    "invalid data found when processing input",
    "moov atom not found",
    "unknown format",
];

/// Joins segments with the ffmpeg concat demuxer
#[derive(Debug, Clone)]
pub struct FfmpegJoiner {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfmpegJoiner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            timeout,
        }
    }

    /// Use explicit binaries instead of whatever is on PATH
    pub fn with_binaries(mut self, ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        self.ffmpeg = ffmpeg;
        self.ffprobe = ffprobe;
        self
    }
}

#[async_trait]
impl SegmentJoiner for FfmpegJoiner {
    async fn join(
        &self,
        segments: &[SegmentInput],
        crop: CropPolicy,
        output: &Path,
    ) -> Result<JoinedClip, MediaError> {
        if segments.is_empty() {
            return Err(MediaError::UnsupportedFormat("no segments to join".to_string()));
        }

        let list_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let mut list = tempfile::Builder::new()
            .prefix("concat_")
            .suffix(".txt")
            .tempfile_in(list_dir)?;
        list.write_all(concat_list(segments).as_bytes())?;
        list.flush()?;

        let args = join_args(list.path(), crop, output);
        tracing::info!("Joining {} segments: {:?}", segments.len(), args);

        let result = run(&self.ffmpeg, &args, self.timeout).await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(classify_input_failure(&stderr));
        }

        let duration_ms = probe_duration_ms(&self.ffprobe, output, self.timeout).await?;
        tracing::info!("Joined clip {:?}: {}ms", output, duration_ms);

        Ok(JoinedClip {
            file_path: output.to_path_buf(),
            duration_ms,
        })
    }
}

/// Strips audio with ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(timeout: Duration) -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            timeout,
        }
    }

    pub fn with_binary(mut self, ffmpeg: PathBuf) -> Self {
        self.ffmpeg = ffmpeg;
        self
    }
}

#[async_trait]
impl MediaTranscoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        op: TranscodeOp,
        output: &Path,
    ) -> Result<(), MediaError> {
        let TranscodeOp::StripAudio { mode } = op;
        let args = strip_audio_args(input, mode, output);
        tracing::info!("Stripping audio ({:?}): {:?}", mode, args);

        let result = run(&self.ffmpeg, &args, self.timeout).await?;
        if result.status.success() {
            return Ok(());
        }

        // ffmpeg may leave a truncated output behind
        remove_file_logged(output, "partial derived clip").await;

        let stderr = String::from_utf8_lossy(&result.stderr);
        match mode {
            StripMode::StreamCopy => Err(classify_stream_copy_failure(&stderr)),
            StripMode::ReEncode => Err(classify_input_failure(&stderr)),
        }
    }
}

async fn run(binary: &Path, args: &[String], timeout: Duration) -> Result<Output, MediaError> {
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(result) => result.map_err(|e| {
            MediaError::Ffmpeg(format!("Failed to start {}: {}", binary.display(), e))
        }),
        Err(_) => Err(MediaError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Get media duration in milliseconds using ffprobe
async fn probe_duration_ms(
    ffprobe: &Path,
    path: &Path,
    timeout: Duration,
) -> Result<u64, MediaError> {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-show_entries".to_string(),
        "format=duration".to_string(),
        "-of".to_string(),
        "default=noprint_wrappers=1:nokey=1".to_string(),
        path.to_string_lossy().to_string(),
    ];
    let output = run(ffprobe, &args, timeout).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaError::Ffmpeg(format!("ffprobe failed: {}", stderr)));
    }

    parse_duration_ms(&String::from_utf8_lossy(&output.stdout))
}

fn parse_duration_ms(raw: &str) -> Result<u64, MediaError> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| MediaError::Ffmpeg(format!("Unexpected ffprobe output: {}", raw.trim())))?;
    Ok((secs * 1000.0).round() as u64)
}

/// Body of a concat demuxer list file
fn concat_list(segments: &[SegmentInput]) -> String {
    segments
        .iter()
        .map(|s| {
            let path = s.file_path.to_string_lossy().replace('\'', "'\\''");
            format!("file '{}'\n", path)
        })
        .collect()
}

fn join_args(list_path: &Path, crop: CropPolicy, output: &Path) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list_path.to_string_lossy().to_string(),
    ];

    match crop {
        CropPolicy::Square => {
            args.extend([
                "-vf".to_string(),
                "crop='min(iw,ih)':'min(iw,ih)'".to_string(),
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "veryfast".to_string(),
                "-crf".to_string(),
                "20".to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                "128k".to_string(),
            ]);
        }
        CropPolicy::None => {
            args.extend(["-c".to_string(), "copy".to_string()]);
        }
    }

    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

fn strip_audio_args(input: &Path, mode: StripMode, output: &Path) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-map".to_string(),
        "0:v".to_string(),
    ];

    match mode {
        StripMode::StreamCopy => {
            args.extend(["-c:v".to_string(), "copy".to_string()]);
        }
        StripMode::ReEncode => {
            args.extend([
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "veryfast".to_string(),
                "-crf".to_string(),
                "18".to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
            ]);
        }
    }

    args.extend([
        "-an".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

fn classify_stream_copy_failure(stderr: &str) -> MediaError {
    let lower = stderr.to_lowercase();
    if STREAM_COPY_MARKERS.iter().any(|m| lower.contains(m)) {
        MediaError::StreamCopyUnsupported(last_line(stderr))
    } else {
        classify_input_failure(stderr)
    }
}

fn classify_input_failure(stderr: &str) -> MediaError {
    let lower = stderr.to_lowercase();
    if UNSUPPORTED_INPUT_MARKERS.iter().any(|m| lower.contains(m)) {
        MediaError::UnsupportedFormat(last_line(stderr))
    } else {
        MediaError::Ffmpeg(last_line(stderr))
    }
}

fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("ffmpeg exited with an error")
        .trim()
        .to_string()
}
