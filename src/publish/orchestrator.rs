//! Publish orchestration
//!
//! draft -> publishing -> {published | failed}; failed -> publishing again
//! through `retry`. Published is terminal. Retries are not capped;
//! `publishAttempts` only counts them.

use crate::drafts::{Draft, DraftMetadata, DraftStore, PublishStatus, StorageError};
use crate::upload::{RemoteUpload, UploadCoordinator, UploadError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    #[error("Draft not found: {0}")]
    NotFound(String),

    #[error("Draft {0} is already published")]
    AlreadyPublished(String),

    #[error("Draft {0} is already being published")]
    AlreadyPublishing(String),

    #[error("Draft {id} has not failed, nothing to retry")]
    NotRetryable { id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct BroadcastError(pub String);

/// Announces an uploaded clip to the outside world
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(
        &self,
        remote: &RemoteUpload,
        metadata: &DraftMetadata,
    ) -> Result<(), BroadcastError>;
}

pub struct PublishOrchestrator {
    store: Arc<DraftStore>,
    uploads: UploadCoordinator,
    broadcaster: Arc<dyn Broadcaster>,
}

impl PublishOrchestrator {
    pub fn new(
        store: Arc<DraftStore>,
        uploads: UploadCoordinator,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            store,
            uploads,
            broadcaster,
        }
    }

    /// Publish a draft in `draft` or `failed` status
    pub async fn publish(&self, draft_id: &str) -> Result<Draft, PublishError> {
        self.run(draft_id, false).await
    }

    /// Publish again after a failure
    pub async fn retry(&self, draft_id: &str) -> Result<Draft, PublishError> {
        self.run(draft_id, true).await
    }

    /// Drafts left in `publishing` by an earlier process can never finish;
    /// mark them failed so they can be retried. Returns how many were reset.
    pub fn recover_interrupted(&self) -> Result<usize, PublishError> {
        let stuck: Vec<String> = self
            .store
            .get_all()
            .into_iter()
            .filter(|d| d.publish_status() == PublishStatus::Publishing)
            .map(|d| d.id)
            .collect();

        for id in &stuck {
            self.store.update::<PublishError, _>(id, |d| {
                d.mark_failed("Publish interrupted");
                Ok(())
            })?;
            tracing::warn!("Draft {} was left publishing, marked failed", id);
        }
        Ok(stuck.len())
    }

    async fn run(&self, draft_id: &str, retry_only: bool) -> Result<Draft, PublishError> {
        let draft = self
            .store
            .update(draft_id, |d| Self::begin(d, retry_only))
            .map_err(|e| match e {
                PublishError::Storage(StorageError::NotFound(id)) => PublishError::NotFound(id),
                e => e,
            })?;

        tracing::info!(
            "Publishing draft {} (attempt {})",
            draft.id,
            draft.publish_attempts()
        );

        match self.upload_and_broadcast(&draft).await {
            Ok(remote) => {
                let published = self.store.update::<PublishError, _>(draft_id, |d| {
                    d.mark_published();
                    Ok(())
                })?;
                tracing::info!("Published draft {} as {}", draft_id, remote.url);
                Ok(published)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!("Publishing draft {} failed: {}", draft_id, message);
                if let Err(store_err) = self.store.update::<PublishError, _>(draft_id, |d| {
                    d.mark_failed(message);
                    Ok(())
                }) {
                    tracing::warn!("Could not record publish failure for {}: {}", draft_id, store_err);
                }
                Err(e)
            }
        }
    }

    fn begin(draft: &mut Draft, retry_only: bool) -> Result<(), PublishError> {
        match draft.publish_status() {
            PublishStatus::Published => {
                return Err(PublishError::AlreadyPublished(draft.id.clone()))
            }
            PublishStatus::Publishing => {
                return Err(PublishError::AlreadyPublishing(draft.id.clone()))
            }
            PublishStatus::Draft if retry_only => {
                return Err(PublishError::NotRetryable {
                    id: draft.id.clone(),
                })
            }
            _ => {}
        }
        draft
            .begin_publish()
            .map_err(|_| PublishError::AlreadyPublishing(draft.id.clone()))
    }

    async fn upload_and_broadcast(&self, draft: &Draft) -> Result<RemoteUpload, PublishError> {
        let remote = self.uploads.ensure_uploaded(&draft.id, draft.current()).await?;
        self.broadcaster
            .broadcast(&remote, &draft.metadata())
            .await
            .map_err(|e| PublishError::Broadcast(e.0))?;
        Ok(remote)
    }
}
