//! Composition root
//!
//! Builds every component once from configuration and the injected external
//! collaborators. Nothing here is global; hosts hold a `ClipStudio`.

use crate::config::AppConfig;
use crate::drafts::{Draft, DraftMetadata, DraftStore};
use crate::media::{FfmpegJoiner, FfmpegTranscoder, MediaTranscoder, SegmentJoiner};
use crate::processing::DerivedMediaProcessor;
use crate::publish::{Broadcaster, PublishOrchestrator};
use crate::recorder::{CaptureChannel, RecordingController, RecordingOutput};
use crate::upload::{
    AuthContext, BreakerRegistry, HttpUploadTransport, UploadCoordinator, UploadTransport,
};
use crate::utils::error::{AppError, AppResult};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;

/// External capabilities the studio is assembled from
pub struct Collaborators {
    pub camera: Arc<dyn CaptureChannel>,
    pub joiner: Arc<dyn SegmentJoiner>,
    pub transcoder: Arc<dyn MediaTranscoder>,
    pub transport: Arc<dyn UploadTransport>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

pub struct ClipStudio {
    config: AppConfig,
    recorder: RecordingController,
    store: Arc<DraftStore>,
    processor: DerivedMediaProcessor,
    uploads: UploadCoordinator,
    publisher: PublishOrchestrator,
}

impl ClipStudio {
    pub fn new(config: AppConfig, parts: Collaborators) -> AppResult<Self> {
        let config = config.normalized();

        let store = Arc::new(DraftStore::open(config.storage.drafts_file())?);
        let breakers =
            BreakerRegistry::new(config.upload.failure_threshold, config.upload.cooldown());
        let uploads = UploadCoordinator::new(config.upload.clone(), parts.transport, &breakers);
        let processor = DerivedMediaProcessor::new(
            config.processing.derived_dir.clone(),
            parts.transcoder,
            store.clone(),
            Arc::new(uploads.clone()),
        );
        let recorder =
            RecordingController::new(config.recording.clone(), parts.camera, parts.joiner);
        let publisher = PublishOrchestrator::new(store.clone(), uploads.clone(), parts.broadcaster);

        let interrupted = publisher.recover_interrupted()?;
        if interrupted > 0 {
            tracing::info!("Recovered {} interrupted publishes", interrupted);
        }

        tracing::info!("Clip studio ready (drafts at {:?})", store.path());
        Ok(Self {
            config,
            recorder,
            store,
            processor,
            uploads,
            publisher,
        })
    }

    /// Desktop assembly: FFmpeg media tools and the HTTP upload transport
    pub fn desktop(
        config_path: &Path,
        camera: Arc<dyn CaptureChannel>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> anyhow::Result<Self> {
        let config = AppConfig::load(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?;

        let media_timeout = config.processing.transcode_timeout();
        let transport = HttpUploadTransport::new(
            config.upload.endpoint.clone(),
            config.upload.timeout(),
            config.upload.chunk_size,
        )
        .context("building upload client")?;

        let parts = Collaborators {
            camera,
            joiner: Arc::new(FfmpegJoiner::new(media_timeout)),
            transcoder: Arc::new(FfmpegTranscoder::new(media_timeout)),
            transport: Arc::new(transport),
            broadcaster,
        };
        Self::new(config, parts).context("assembling clip studio")
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn recorder(&self) -> &RecordingController {
        &self.recorder
    }

    pub fn uploads(&self) -> &UploadCoordinator {
        &self.uploads
    }

    pub fn set_auth(&self, auth: AuthContext) {
        self.uploads.set_auth(auth);
    }

    pub fn drafts(&self) -> Vec<Draft> {
        self.store.get_all()
    }

    pub fn draft(&self, id: &str) -> AppResult<Draft> {
        self.store
            .get(id)
            .ok_or_else(|| AppError::DraftNotFound(id.to_string()))
    }

    /// Save a finished recording as a new draft and start uploading it in
    /// the background
    pub async fn create_draft_from_recording(
        &self,
        output: &RecordingOutput,
        metadata: DraftMetadata,
    ) -> AppResult<Draft> {
        let draft = self
            .store
            .save(&Draft::new_from_recording(output, metadata))?;
        tracing::info!("Created draft {} from {:?}", draft.id, output.file_path);

        self.uploads.enqueue(&draft.id, draft.current());
        drop(self.uploads.spawn(&draft.id));
        Ok(draft)
    }

    /// Replace the user-editable metadata
    pub fn update_metadata(&self, id: &str, metadata: DraftMetadata) -> AppResult<Draft> {
        self.store
            .update::<AppError, _>(id, |d| {
                d.title = metadata.title;
                d.description = metadata.description;
                d.frame_count = metadata.frame_count;
                d.approach_tag = metadata.approach;
                d.set_hashtags(metadata.hashtags);
                Ok(())
            })
            .map_err(|e| match e {
                AppError::Storage(crate::drafts::StorageError::NotFound(id)) => {
                    AppError::DraftNotFound(id)
                }
                e => e,
            })
    }

    pub async fn set_mute(&self, id: &str, enable: bool) -> AppResult<Draft> {
        let draft = self.draft(id)?;
        Ok(self.processor.toggle_mute(&draft, enable).await?)
    }

    /// Stop any upload of the draft, then delete the record and its files.
    ///
    /// Returns whether the draft existed.
    pub async fn delete_draft(&self, id: &str) -> AppResult<bool> {
        self.uploads.forget(id).await;
        Ok(self.store.delete(id)?.is_some())
    }

    /// Delete every draft. Returns how many were removed.
    pub async fn clear_drafts(&self) -> AppResult<usize> {
        for draft in self.store.get_all() {
            self.uploads.forget(&draft.id).await;
        }
        Ok(self.store.clear_all()?)
    }

    pub async fn publish(&self, id: &str) -> AppResult<Draft> {
        Ok(self.publisher.publish(id).await?)
    }

    pub async fn retry_publish(&self, id: &str) -> AppResult<Draft> {
        Ok(self.publisher.retry(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafts::PublishStatus;
    use crate::processing::ProcessingError;
    use crate::testing::{FakeBroadcaster, FakeCamera, FakeJoiner, FakeTranscoder, FakeTransport};
    use crate::upload::UploadStatus;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Harness {
        studio: Arc<ClipStudio>,
        transport: Arc<FakeTransport>,
        transcoder: Arc<FakeTranscoder>,
    }

    fn harness(root: &Path) -> Harness {
        let transport = Arc::new(FakeTransport::default());
        let transcoder = Arc::new(FakeTranscoder::default());
        let parts = Collaborators {
            camera: Arc::new(FakeCamera::default()),
            joiner: Arc::new(FakeJoiner::default()),
            transcoder: transcoder.clone(),
            transport: transport.clone(),
            broadcaster: Arc::new(FakeBroadcaster::default()),
        };
        let studio = ClipStudio::new(AppConfig::with_root(root), parts).unwrap();
        Harness {
            studio: Arc::new(studio),
            transport,
            transcoder,
        }
    }

    fn studio(root: &Path) -> (Arc<ClipStudio>, Arc<FakeTransport>) {
        let h = harness(root);
        (h.studio, h.transport)
    }

    async fn record(studio: &ClipStudio) -> RecordingOutput {
        studio.recorder().start().await.unwrap();
        tokio::time::advance(Duration::from_millis(2_500)).await;
        studio.recorder().stop().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_draft_mute_publish() {
        let dir = tempdir().unwrap();
        let (studio, transport) = studio(dir.path());

        let output = record(&studio).await;
        let draft = studio
            .create_draft_from_recording(
                &output,
                DraftMetadata {
                    title: "Loop".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(draft.current(), output.file_path.as_path());

        let muted = studio.set_mute(&draft.id, true).await.unwrap();
        assert!(muted.mute_audio());
        assert_eq!(studio.uploads().get(&draft.id).unwrap().file_path, muted.current());

        let published = studio.publish(&draft.id).await.unwrap();
        assert_eq!(published.publish_status(), PublishStatus::Published);
        assert_eq!(transport.paths().last().map(|p| p.as_path()), Some(muted.current()));
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_upload_and_removes_files() {
        let dir = tempdir().unwrap();
        let (studio, transport) = studio(dir.path());
        transport.hold();

        let output = record(&studio).await;
        let draft = studio
            .create_draft_from_recording(&output, DraftMetadata::default())
            .await
            .unwrap();
        transport.wait_for_calls(1).await;
        assert_eq!(
            studio.uploads().get(&draft.id).unwrap().status,
            UploadStatus::Active
        );

        assert!(studio.delete_draft(&draft.id).await.unwrap());
        assert_eq!(transport.in_flight(), 0);
        assert!(studio.uploads().get(&draft.id).is_none());
        assert!(!output.file_path.exists());
        assert!(studio.drafts().is_empty());
        assert!(!studio.delete_draft(&draft.id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_metadata() {
        let dir = tempdir().unwrap();
        let (studio, _) = studio(dir.path());
        let output = record(&studio).await;
        let draft = studio
            .create_draft_from_recording(&output, DraftMetadata::default())
            .await
            .unwrap();

        let updated = studio
            .update_metadata(
                &draft.id,
                DraftMetadata {
                    title: "Renamed".to_string(),
                    hashtags: vec!["#a".to_string(), "A".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.hashtags(), &["a".to_string()]);

        assert!(matches!(
            studio.update_metadata("missing", DraftMetadata::default()),
            Err(AppError::DraftNotFound(_))
        ));
        assert!(matches!(
            studio.set_mute("missing", true).await,
            Err(AppError::DraftNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_during_mute_stays_published() {
        let dir = tempdir().unwrap();
        let Harness {
            studio, transcoder, ..
        } = harness(dir.path());

        let output = record(&studio).await;
        let draft = studio
            .create_draft_from_recording(&output, DraftMetadata::default())
            .await
            .unwrap();
        transcoder.set_delay(Duration::from_secs(5));

        let mute = {
            let studio = studio.clone();
            let id = draft.id.clone();
            tokio::spawn(async move { studio.set_mute(&id, true).await })
        };
        while transcoder.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        let published = studio.publish(&draft.id).await.unwrap();
        assert_eq!(published.publish_status(), PublishStatus::Published);

        let err = mute.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            AppError::Processing(
                ProcessingError::AlreadyPublished { .. } | ProcessingError::PublishInProgress { .. }
            )
        ));

        let stored = studio.draft(&draft.id).unwrap();
        assert_eq!(stored.publish_status(), PublishStatus::Published);
        assert_eq!(stored.publish_attempts(), 1);
        assert!(!stored.mute_audio());
        assert_eq!(stored.current(), output.file_path.as_path());

        assert!(matches!(
            studio.set_mute(&draft.id, true).await,
            Err(AppError::Processing(ProcessingError::AlreadyPublished { .. }))
        ));
    }
}
