//! Audio mute toggle
//!
//! Muting derives an audio-stripped copy of the recording and makes it the
//! draft's current file; unmuting swaps the untouched recording back. A
//! draft owns at most one derived file at any time.

use crate::drafts::{Draft, DraftStore, PublishStatus, StorageError};
use crate::media::{MediaError, MediaTranscoder, StripMode, TranscodeOp};
use crate::utils::fs::remove_file_logged;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Transcode failed: {0}")]
    Transcode(#[source] MediaError),

    /// The draft's current file is derived but its original is gone.
    /// Indicates a bug elsewhere in the pipeline.
    #[error("Invariant violation: draft {draft_id} has a derived current file but no original")]
    MissingOriginal { draft_id: String },

    #[error("Draft {draft_id} is published and can no longer be edited")]
    AlreadyPublished { draft_id: String },

    #[error("Draft {draft_id} is being published")]
    PublishInProgress { draft_id: String },

    #[error("Draft {draft_id} changed while it was being processed")]
    CurrentChanged { draft_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordering contract between the processor and whoever streams the draft's
/// current file elsewhere (the upload coordinator).
///
/// `release` runs before `current` is swapped and must not return while
/// anything is still active against the old file. `adopt` runs after the
/// swap is persisted.
#[async_trait]
pub trait CurrentFileHandoff: Send + Sync {
    async fn release(&self, draft_id: &str);

    async fn adopt(&self, draft_id: &str, current: &Path);
}

/// Handoff for setups with nothing consuming the current file
pub struct NoHandoff;

#[async_trait]
impl CurrentFileHandoff for NoHandoff {
    async fn release(&self, _draft_id: &str) {}

    async fn adopt(&self, _draft_id: &str, _current: &Path) {}
}

/// Owns the original/derived file swap for drafts
pub struct DerivedMediaProcessor {
    derived_dir: PathBuf,
    transcoder: Arc<dyn MediaTranscoder>,
    store: Arc<DraftStore>,
    handoff: Arc<dyn CurrentFileHandoff>,
    /// One lock per draft id; toggles on the same draft queue up
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DerivedMediaProcessor {
    pub fn new(
        derived_dir: PathBuf,
        transcoder: Arc<dyn MediaTranscoder>,
        store: Arc<DraftStore>,
        handoff: Arc<dyn CurrentFileHandoff>,
    ) -> Self {
        Self {
            derived_dir,
            transcoder,
            store,
            handoff,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Mute or unmute a draft.
    ///
    /// Works on the latest stored version of the draft (falling back to
    /// `draft` if it was never saved). Only the file fields are written back,
    /// so publish state and metadata changed during a transcode survive. On
    /// failure the draft is left exactly as it was.
    pub async fn toggle_mute(&self, draft: &Draft, enable: bool) -> Result<Draft, ProcessingError> {
        let lock = self.draft_lock(&draft.id);
        let _guard = lock.lock().await;

        let result = self.toggle_locked(draft, enable).await;

        drop(_guard);
        self.forget_lock(&draft.id, &lock);
        result
    }

    async fn toggle_locked(&self, draft: &Draft, enable: bool) -> Result<Draft, ProcessingError> {
        let stored = self.store.get(&draft.id);
        let persisted = stored.is_some();
        let latest = stored.unwrap_or_else(|| draft.clone());

        Self::check_editable(&latest)?;
        if latest.original().is_none() && self.is_derived(&latest.id, latest.current()) {
            tracing::error!(
                "Draft {} points at derived file {:?} without an original",
                latest.id,
                latest.current()
            );
            return Err(ProcessingError::MissingOriginal {
                draft_id: latest.id.clone(),
            });
        }

        match (enable, latest.mute_audio()) {
            (true, false) => self.mute(latest, persisted).await,
            (false, true) => self.unmute(latest, persisted).await,
            _ => {
                tracing::debug!("Draft {} already has mute={}", latest.id, enable);
                Ok(latest)
            }
        }
    }

    async fn mute(&self, latest: Draft, persisted: bool) -> Result<Draft, ProcessingError> {
        tokio::fs::create_dir_all(&self.derived_dir).await?;
        let derived = self.derived_dir.join(format!(
            "muted_{}_{}.mp4",
            latest.id,
            Uuid::new_v4().simple()
        ));

        tracing::info!("Muting draft {}: {:?} -> {:?}", latest.id, latest.current(), derived);
        if let Err(e) = self.strip_audio(latest.current(), &derived).await {
            remove_file_logged(&derived, "partial derived clip").await;
            return Err(ProcessingError::Transcode(e));
        }

        // The transcode can take a while; the draft may have moved on
        if persisted {
            if let Err(e) = self.recheck(&latest) {
                tracing::info!("Abandoning mute of draft {}: {}", latest.id, e);
                remove_file_logged(&derived, "abandoned derived clip").await;
                return Err(e);
            }
        }

        self.handoff.release(&latest.id).await;

        let swap = {
            let derived = derived.clone();
            self.swap(&latest, persisted, move |d| Ok(d.apply_derived(derived)))
        };
        let (updated, superseded) = match swap {
            Ok(swapped) => swapped,
            Err(e) => {
                remove_file_logged(&derived, "abandoned derived clip").await;
                self.readopt(&latest, persisted).await;
                return Err(e);
            }
        };

        if let Some(previous) = superseded {
            remove_file_logged(&previous, "superseded derived clip").await;
        }
        self.sweep_derived(&updated.id, Some(&derived)).await;
        self.handoff.adopt(&updated.id, updated.current()).await;
        Ok(updated)
    }

    async fn unmute(&self, latest: Draft, persisted: bool) -> Result<Draft, ProcessingError> {
        tracing::info!("Unmuting draft {}", latest.id);

        self.handoff.release(&latest.id).await;

        let draft_id = latest.id.clone();
        let swap = self.swap(&latest, persisted, move |d| {
            d.restore_original()
                .map(Some)
                .ok_or(ProcessingError::MissingOriginal { draft_id })
        });
        let (updated, derived) = match swap {
            Ok((updated, Some(derived))) => (updated, derived),
            Ok((updated, None)) => return Ok(updated),
            Err(e) => {
                self.readopt(&latest, persisted).await;
                return Err(e);
            }
        };

        remove_file_logged(&derived, "derived clip").await;
        self.sweep_derived(&updated.id, None).await;
        self.handoff.adopt(&updated.id, updated.current()).await;
        Ok(updated)
    }

    /// Published drafts are frozen; one being published keeps its file
    fn check_editable(draft: &Draft) -> Result<(), ProcessingError> {
        match draft.publish_status() {
            PublishStatus::Published => Err(ProcessingError::AlreadyPublished {
                draft_id: draft.id.clone(),
            }),
            PublishStatus::Publishing => Err(ProcessingError::PublishInProgress {
                draft_id: draft.id.clone(),
            }),
            PublishStatus::Draft | PublishStatus::Failed => Ok(()),
        }
    }

    /// `stored` must still be editable and still point at `expected`
    fn check_unchanged(stored: &Draft, expected: &Path) -> Result<(), ProcessingError> {
        Self::check_editable(stored)?;
        if stored.current() != expected {
            return Err(ProcessingError::CurrentChanged {
                draft_id: stored.id.clone(),
            });
        }
        Ok(())
    }

    fn recheck(&self, latest: &Draft) -> Result<(), ProcessingError> {
        let stored = self
            .store
            .get(&latest.id)
            .ok_or_else(|| StorageError::NotFound(latest.id.clone()))?;
        Self::check_unchanged(&stored, latest.current())
    }

    /// Apply a file swap to the stored draft, touching nothing but its file
    /// fields. Returns the updated draft and the file the swap retired.
    fn swap<F>(
        &self,
        latest: &Draft,
        persisted: bool,
        apply: F,
    ) -> Result<(Draft, Option<PathBuf>), ProcessingError>
    where
        F: FnOnce(&mut Draft) -> Result<Option<PathBuf>, ProcessingError>,
    {
        if !persisted {
            let mut draft = latest.clone();
            let retired = apply(&mut draft)?;
            return Ok((draft, retired));
        }

        let mut retired = None;
        let updated = self.store.update(&latest.id, |d| {
            Self::check_unchanged(d, latest.current())?;
            retired = apply(d)?;
            Ok::<_, ProcessingError>(())
        })?;
        Ok((updated, retired))
    }

    /// Hand the current file back after an abandoned swap
    async fn readopt(&self, latest: &Draft, persisted: bool) {
        if !persisted {
            self.handoff.adopt(&latest.id, latest.current()).await;
            return;
        }
        match self.store.get(&latest.id) {
            Some(d) if d.publish_status() != PublishStatus::Published => {
                self.handoff.adopt(&d.id, d.current()).await;
            }
            _ => {}
        }
    }

    /// Strip audio, falling back to a re-encode when stream copy cannot do it
    async fn strip_audio(&self, input: &Path, output: &Path) -> Result<(), MediaError> {
        let copy = TranscodeOp::strip_audio(StripMode::StreamCopy);
        match self.transcoder.transcode(input, copy, output).await {
            Err(MediaError::StreamCopyUnsupported(reason)) => {
                tracing::info!("Stream copy unsupported ({}), re-encoding", reason);
                let encode = TranscodeOp::strip_audio(StripMode::ReEncode);
                self.transcoder.transcode(input, encode, output).await
            }
            other => other,
        }
    }

    fn derived_prefix(draft_id: &str) -> String {
        format!("muted_{}_", draft_id)
    }

    fn is_derived(&self, draft_id: &str, path: &Path) -> bool {
        path.parent() == Some(self.derived_dir.as_path())
            && path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with(&Self::derived_prefix(draft_id)))
                .unwrap_or(false)
    }

    /// Delete every derived file of this draft except `keep`
    async fn sweep_derived(&self, draft_id: &str, keep: Option<&Path>) {
        let mut entries = match tokio::fs::read_dir(&self.derived_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Skipping derived sweep of {:?}: {}", self.derived_dir, e);
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if Some(path.as_path()) != keep && self.is_derived(draft_id, &path) {
                remove_file_logged(&path, "stale derived clip").await;
            }
        }
    }

    fn draft_lock(&self, draft_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(draft_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock entry once nobody else is waiting on it
    fn forget_lock(&self, draft_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // Map entry + our handle
        if Arc::strong_count(lock) <= 2 {
            locks.remove(draft_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drafts::DraftMetadata;
    use crate::testing::{FakeTranscoder, RecordingHandoff};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        store: Arc<DraftStore>,
        transcoder: Arc<FakeTranscoder>,
        handoff: Arc<RecordingHandoff>,
        processor: Arc<DerivedMediaProcessor>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(DraftStore::open(dir.path().join("data/drafts.json")).unwrap());
        let transcoder = Arc::new(FakeTranscoder::default());
        let handoff = Arc::new(RecordingHandoff::default());
        let processor = Arc::new(DerivedMediaProcessor::new(
            dir.path().join("derived"),
            transcoder.clone(),
            store.clone(),
            handoff.clone(),
        ));
        Fixture {
            dir,
            store,
            transcoder,
            handoff,
            processor,
        }
    }

    fn saved_draft(f: &Fixture) -> Draft {
        let original = f.dir.path().join("original.mp4");
        std::fs::write(&original, b"video+audio").unwrap();
        let draft = Draft::new(original, DraftMetadata::default());
        f.store.save(&draft).unwrap()
    }

    fn derived_files(f: &Fixture) -> Vec<PathBuf> {
        match std::fs::read_dir(f.dir.path().join("derived")) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_mute_then_unmute_restores_original() {
        let f = fixture();
        let draft = saved_draft(&f);
        let original = draft.current().to_path_buf();

        let muted = f.processor.toggle_mute(&draft, true).await.unwrap();
        assert!(muted.mute_audio());
        assert_eq!(muted.original(), Some(original.as_path()));
        assert!(muted.current().starts_with(f.dir.path().join("derived")));
        assert!(muted.current().exists());
        assert!(original.exists());
        assert_eq!(f.store.get(&draft.id).unwrap().current(), muted.current());

        let unmuted = f.processor.toggle_mute(&muted, false).await.unwrap();
        assert!(!unmuted.mute_audio());
        assert_eq!(unmuted.current(), original.as_path());
        assert_eq!(unmuted.original(), None);
        assert!(!muted.current().exists());
        assert_eq!(std::fs::read(&original).unwrap(), b"video+audio");
        assert!(derived_files(&f).is_empty());
    }

    #[tokio::test]
    async fn test_toggles_are_idempotent() {
        let f = fixture();
        let draft = saved_draft(&f);

        let same = f.processor.toggle_mute(&draft, false).await.unwrap();
        assert_eq!(same.current(), draft.current());

        let muted = f.processor.toggle_mute(&draft, true).await.unwrap();
        let again = f.processor.toggle_mute(&muted, true).await.unwrap();
        assert_eq!(again.current(), muted.current());
        assert_eq!(f.transcoder.calls().len(), 1);
        assert_eq!(derived_files(&f).len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_reencode() {
        let f = fixture();
        f.transcoder.reject_stream_copy();
        let draft = saved_draft(&f);

        let muted = f.processor.toggle_mute(&draft, true).await.unwrap();
        assert!(muted.mute_audio());
        assert_eq!(f.transcoder.calls(), vec![StripMode::StreamCopy, StripMode::ReEncode]);
    }

    #[tokio::test]
    async fn test_transcode_failure_leaves_draft_unchanged() {
        let f = fixture();
        f.transcoder.fail_all();
        let draft = saved_draft(&f);

        let err = f.processor.toggle_mute(&draft, true).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Transcode(_)));
        let stored = f.store.get(&draft.id).unwrap();
        assert_eq!(stored.current(), draft.current());
        assert!(!stored.mute_audio());
        assert!(derived_files(&f).is_empty());
        assert!(f.handoff.events().is_empty());
    }

    #[tokio::test]
    async fn test_derived_current_without_original_faults() {
        let f = fixture();
        let derived_dir = f.dir.path().join("derived");
        std::fs::create_dir_all(&derived_dir).unwrap();

        let orphan = derived_dir.join("muted_orphan_abc.mp4");
        std::fs::write(&orphan, b"video").unwrap();
        let mut draft = Draft::new(orphan.clone(), DraftMetadata::default());
        draft.id = "orphan".to_string();

        let err = f.processor.toggle_mute(&draft, false).await.unwrap_err();
        assert!(matches!(err, ProcessingError::MissingOriginal { .. }));
        assert!(orphan.exists());
    }

    #[tokio::test]
    async fn test_handoff_order() {
        let f = fixture();
        let draft = saved_draft(&f);

        let muted = f.processor.toggle_mute(&draft, true).await.unwrap();
        let events = f.handoff.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], format!("release:{}", draft.id));
        assert_eq!(events[1], format!("adopt:{}:{}", draft.id, muted.current().display()));
    }

    #[tokio::test]
    async fn test_concurrent_toggles_are_serialized() {
        let f = fixture();
        f.transcoder.set_delay(Duration::from_millis(50));
        let draft = saved_draft(&f);

        let a = {
            let processor = f.processor.clone();
            let draft = draft.clone();
            tokio::spawn(async move { processor.toggle_mute(&draft, true).await })
        };
        let b = {
            let processor = f.processor.clone();
            let draft = draft.clone();
            tokio::spawn(async move { processor.toggle_mute(&draft, true).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        // The queued call saw the first result and did nothing
        assert_eq!(a.current(), b.current());
        assert_eq!(f.transcoder.max_in_flight(), 1);
        assert_eq!(f.transcoder.calls().len(), 1);
        assert_eq!(derived_files(&f).len(), 1);
    }

    #[tokio::test]
    async fn test_mute_unmute_cycles_keep_one_derived_file() {
        let f = fixture();
        let mut draft = saved_draft(&f);
        for _ in 0..3 {
            draft = f.processor.toggle_mute(&draft, true).await.unwrap();
            assert_eq!(derived_files(&f).len(), 1);
            draft = f.processor.toggle_mute(&draft, false).await.unwrap();
            assert!(derived_files(&f).is_empty());
        }
        assert!(draft.current().exists());
    }

    fn set_status(f: &Fixture, id: &str, published: bool) {
        f.store
            .update::<StorageError, _>(id, |d| {
                d.begin_publish().unwrap();
                if published {
                    d.mark_published();
                }
                Ok(())
            })
            .unwrap();
    }

    async fn wait_for_transcode(f: &Fixture) {
        while f.transcoder.calls().is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_published_draft_cannot_be_toggled() {
        let f = fixture();
        let draft = saved_draft(&f);
        set_status(&f, &draft.id, true);

        let err = f.processor.toggle_mute(&draft, true).await.unwrap_err();
        assert!(matches!(err, ProcessingError::AlreadyPublished { .. }));
        assert!(f.transcoder.calls().is_empty());
        assert!(f.handoff.events().is_empty());
        assert!(derived_files(&f).is_empty());
        assert_eq!(f.store.get(&draft.id).unwrap().current(), draft.current());
    }

    #[tokio::test]
    async fn test_publishing_draft_cannot_be_toggled() {
        let f = fixture();
        let draft = saved_draft(&f);
        set_status(&f, &draft.id, false);

        let err = f.processor.toggle_mute(&draft, true).await.unwrap_err();
        assert!(matches!(err, ProcessingError::PublishInProgress { .. }));
        assert!(f.transcoder.calls().is_empty());
        assert!(f.handoff.events().is_empty());
        assert_eq!(
            f.store.get(&draft.id).unwrap().publish_status(),
            PublishStatus::Publishing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_during_transcode_wins() {
        let f = fixture();
        f.transcoder.set_delay(Duration::from_secs(5));
        let draft = saved_draft(&f);

        let toggle = {
            let processor = f.processor.clone();
            let draft = draft.clone();
            tokio::spawn(async move { processor.toggle_mute(&draft, true).await })
        };
        wait_for_transcode(&f).await;
        set_status(&f, &draft.id, true);

        let err = toggle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProcessingError::AlreadyPublished { .. }));

        let stored = f.store.get(&draft.id).unwrap();
        assert_eq!(stored.publish_status(), PublishStatus::Published);
        assert_eq!(stored.publish_attempts(), 1);
        assert!(!stored.mute_audio());
        assert_eq!(stored.current(), draft.current());
        assert!(derived_files(&f).is_empty());
        assert!(f.handoff.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_edits_during_transcode_survive() {
        let f = fixture();
        f.transcoder.set_delay(Duration::from_secs(5));
        let draft = saved_draft(&f);

        let toggle = {
            let processor = f.processor.clone();
            let draft = draft.clone();
            tokio::spawn(async move { processor.toggle_mute(&draft, true).await })
        };
        wait_for_transcode(&f).await;
        f.store
            .update::<StorageError, _>(&draft.id, |d| {
                d.title = "Renamed".to_string();
                Ok(())
            })
            .unwrap();

        let muted = toggle.await.unwrap().unwrap();
        assert!(muted.mute_audio());
        assert_eq!(muted.title, "Renamed");
        assert_eq!(f.store.get(&draft.id).unwrap().title, "Renamed");
    }
}
