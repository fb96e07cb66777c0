//! Application configuration
//!
//! Loaded from a JSON file; every field has a default so a missing or
//! partial file still yields a usable configuration.

use crate::media::CropPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Shortest recording the capture screen allows
pub const MIN_RECORDING_MS: u64 = 3_000;
/// Longest recording the capture screen allows
pub const MAX_RECORDING_MS: u64 = 15_000;
/// Default recording budget
pub const DEFAULT_RECORDING_MS: u64 = 6_300;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingSettings {
    /// Total recording budget in milliseconds
    pub max_duration_ms: u64,
    /// Stop automatically when the budget runs out
    pub auto_stop: bool,
    /// Framing applied when joining segments
    pub crop: CropPolicy,
    /// Where in-progress segments are written
    pub segments_dir: PathBuf,
    /// Where finished clips are written
    pub clips_dir: PathBuf,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            max_duration_ms: DEFAULT_RECORDING_MS,
            auto_stop: true,
            crop: CropPolicy::Square,
            segments_dir: PathBuf::from("segments"),
            clips_dir: PathBuf::from("clips"),
        }
    }
}

impl RecordingSettings {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    /// Clamp the budget into `MIN_RECORDING_MS..=MAX_RECORDING_MS`
    pub fn normalized(mut self) -> Self {
        let requested = self.max_duration_ms;
        self.max_duration_ms = requested.clamp(MIN_RECORDING_MS, MAX_RECORDING_MS);
        if requested != self.max_duration_ms {
            tracing::warn!(
                "maxDurationMs {} out of range, clamped to {}",
                requested,
                self.max_duration_ms
            );
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessingSettings {
    /// Where derived (muted) clips are written
    pub derived_dir: PathBuf,
    pub transcode_timeout_ms: u64,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            derived_dir: PathBuf::from("derived"),
            transcode_timeout_ms: 60_000,
        }
    }
}

impl ProcessingSettings {
    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_millis(self.transcode_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSettings {
    /// Upload target; also the circuit breaker key
    pub endpoint: String,
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before a probe
    pub cooldown_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Guard timeout around a single transport call
    pub timeout_ms: u64,
    /// Bytes per streamed chunk (cancellation checkpoint granularity)
    pub chunk_size: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://localhost/upload".to_string(),
            failure_threshold: 3,
            cooldown_ms: 30_000,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            timeout_ms: 120_000,
            chunk_size: 256 * 1024,
        }
    }
}

impl UploadSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl StorageSettings {
    pub fn drafts_file(&self) -> PathBuf {
        self.data_dir.join("drafts.json")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub recording: RecordingSettings,
    pub processing: ProcessingSettings,
    pub upload: UploadSettings,
    pub storage: StorageSettings,
}

impl AppConfig {
    /// Load configuration from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default().normalized());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::debug!("Loaded config from {:?}", path);
        Ok(config.normalized())
    }

    /// Default configuration with every directory placed under `root`
    pub fn with_root(root: &Path) -> Self {
        let mut config = Self::default();
        config.recording.segments_dir = root.join("segments");
        config.recording.clips_dir = root.join("clips");
        config.processing.derived_dir = root.join("derived");
        config.storage.data_dir = root.join("data");
        config
    }

    /// Clamp values into their supported ranges
    pub fn normalized(mut self) -> Self {
        self.recording = self.recording.normalized();
        self.upload.failure_threshold = self.upload.failure_threshold.max(1);
        self.upload.chunk_size = self.upload.chunk_size.max(1024);
        self
    }
}
