//! Draft schema definitions
//!
//! The persisted record layout and the publish-status state machine.

use crate::recorder::RecordingOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where a draft is in its publish lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    #[default]
    Draft,
    Publishing,
    Failed,
    Published,
}

impl PublishStatus {
    /// Whether a publish may begin from this status
    pub fn can_publish(&self) -> bool {
        matches!(self, PublishStatus::Draft | PublishStatus::Failed)
    }

    /// Whether an explicit retry may begin from this status
    pub fn can_retry(&self) -> bool {
        matches!(self, PublishStatus::Failed)
    }
}

/// User-editable metadata carried into the broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftMetadata {
    pub title: String,
    pub description: String,
    pub hashtags: Vec<String>,
    pub frame_count: u32,
    pub approach: String,
}

/// An in-progress, not-yet-published post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: String,

    /// Playable file; never empty
    #[serde(rename = "currentFilePath")]
    current: PathBuf,

    /// Untouched recording while `current` is a derived file
    #[serde(rename = "originalFilePath")]
    original: Option<PathBuf>,

    pub title: String,
    pub description: String,

    /// Display order preserved, identity is order-insensitive
    hashtags: Vec<String>,

    pub frame_count: u32,

    #[serde(rename = "approach")]
    pub approach_tag: String,

    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,

    publish_status: PublishStatus,
    publish_error: Option<String>,
    publish_attempts: u32,
}

impl Draft {
    /// Build the initial draft for a finished recording
    pub fn new_from_recording(output: &RecordingOutput, metadata: DraftMetadata) -> Self {
        Self::new(output.file_path.clone(), metadata)
    }

    /// Create a draft for a clip already on disk
    pub fn new(current: PathBuf, metadata: DraftMetadata) -> Self {
        let now = Utc::now();
        let mut draft = Self {
            id: Uuid::new_v4().to_string(),
            current,
            original: None,
            title: metadata.title,
            description: metadata.description,
            hashtags: Vec::new(),
            frame_count: metadata.frame_count,
            approach_tag: metadata.approach,
            created_at: now,
            last_modified: now,
            publish_status: PublishStatus::Draft,
            publish_error: None,
            publish_attempts: 0,
        };
        draft.set_hashtags(metadata.hashtags);
        draft
    }

    pub fn current(&self) -> &Path {
        &self.current
    }

    pub fn original(&self) -> Option<&Path> {
        self.original.as_deref()
    }

    /// Audio is muted exactly when a derived file is current
    pub fn mute_audio(&self) -> bool {
        self.original.is_some()
    }

    pub fn hashtags(&self) -> &[String] {
        &self.hashtags
    }

    /// Order-insensitive hashtag identity
    pub fn hashtag_set(&self) -> BTreeSet<String> {
        self.hashtags.iter().map(|t| t.to_lowercase()).collect()
    }

    /// Replace hashtags: strips leading '#', drops blanks and
    /// case-insensitive duplicates, keeps first-seen order.
    pub fn set_hashtags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        self.hashtags = tags
            .into_iter()
            .filter_map(|tag| {
                let tag = tag.as_ref().trim().trim_start_matches('#').trim();
                if tag.is_empty() || !seen.insert(tag.to_lowercase()) {
                    None
                } else {
                    Some(tag.to_string())
                }
            })
            .collect();
    }

    pub fn publish_status(&self) -> PublishStatus {
        self.publish_status
    }

    pub fn publish_error(&self) -> Option<&str> {
        self.publish_error.as_deref()
    }

    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts
    }

    /// Metadata handed to the broadcaster
    pub fn metadata(&self) -> DraftMetadata {
        DraftMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
            hashtags: self.hashtags.clone(),
            frame_count: self.frame_count,
            approach: self.approach_tag.clone(),
        }
    }

    /// Every file this draft owns on disk
    pub fn files(&self) -> Vec<&Path> {
        let mut files = vec![self.current.as_path()];
        if let Some(original) = &self.original {
            files.push(original.as_path());
        }
        files
    }

    /// Make `derived` current, preserving the untouched recording.
    ///
    /// Returns the derived file this replaces, if any.
    pub(crate) fn apply_derived(&mut self, derived: PathBuf) -> Option<PathBuf> {
        match self.original.take() {
            Some(original) => {
                let previous = std::mem::replace(&mut self.current, derived);
                self.original = Some(original);
                Some(previous)
            }
            None => {
                let original = std::mem::replace(&mut self.current, derived);
                self.original = Some(original);
                None
            }
        }
    }

    /// Make the untouched recording current again.
    ///
    /// Returns the derived file that was current, or `None` if there was no
    /// original to restore.
    pub(crate) fn restore_original(&mut self) -> Option<PathBuf> {
        let original = self.original.take()?;
        Some(std::mem::replace(&mut self.current, original))
    }

    pub(crate) fn touch(&mut self) {
        self.last_modified = Utc::now();
    }

    /// draft|failed -> publishing. On refusal returns the blocking status.
    pub(crate) fn begin_publish(&mut self) -> Result<(), PublishStatus> {
        if !self.publish_status.can_publish() {
            return Err(self.publish_status);
        }
        self.publish_status = PublishStatus::Publishing;
        self.publish_error = None;
        self.publish_attempts += 1;
        Ok(())
    }

    /// publishing -> published
    pub(crate) fn mark_published(&mut self) {
        self.publish_status = PublishStatus::Published;
        self.publish_error = None;
    }

    /// publishing -> failed
    pub(crate) fn mark_failed(&mut self, message: impl Into<String>) {
        self.publish_status = PublishStatus::Failed;
        self.publish_error = Some(message.into());
    }
}
