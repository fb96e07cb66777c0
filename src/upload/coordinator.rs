//! Upload coordinator
//!
//! Keeps one queue entry per draft and guarantees that at most one upload
//! per draft is active at a time. Each draft has a slot mutex held for the
//! whole of an active attempt; `cancel` signals the attempt's token and then
//! waits on the slot, so once it returns nothing is running against the old
//! file.

use super::breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
use super::transport::{AuthContext, RemoteUpload, TransportError, UploadTransport};
use crate::config::UploadSettings;
use crate::processing::CurrentFileHandoff;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Upload timed out")]
    Timeout,

    #[error("Upload server error: {0}")]
    Server(String),

    #[error("Upload not authorized: {0}")]
    Auth(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Upload target {target} unavailable, retry in {retry_after_ms}ms")]
    CircuitOpen { target: String, retry_after_ms: u64 },

    #[error("No upload queued for draft {0}")]
    NotQueued(String),

    #[error("Cannot read upload source: {0}")]
    Io(String),
}

impl UploadError {
    /// Whether backing off and trying again can help
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Timeout | UploadError::Server(_))
    }
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => UploadError::Timeout,
            TransportError::Server(m) => UploadError::Server(m),
            TransportError::Auth(m) => UploadError::Auth(m),
            TransportError::Cancelled => UploadError::Cancelled,
            TransportError::Rejected { status, message } => UploadError::Rejected { status, message },
            TransportError::Io(m) => UploadError::Io(m),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Active,
    Succeeded,
    Failed,
    Cancelled,
}

/// Queue entry for one draft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpload {
    pub draft_id: String,
    pub file_path: PathBuf,
    pub status: UploadStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub remote: Option<RemoteUpload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQueueSnapshot {
    /// Sorted by draft id
    pub uploads: Vec<PendingUpload>,
    pub breaker: Option<BreakerState>,
}

/// Identity of a file's contents as far as upload reuse is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileFingerprint {
    pub async fn of(path: &Path) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

struct Entry {
    upload: PendingUpload,
    /// Bumped on every enqueue; stale attempts don't write back
    generation: u64,
    cancel: Option<CancellationToken>,
}

struct Completed {
    fingerprint: FileFingerprint,
    remote: RemoteUpload,
}

struct Inner {
    settings: UploadSettings,
    transport: Arc<dyn UploadTransport>,
    breaker: Arc<CircuitBreaker>,
    auth: RwLock<AuthContext>,
    entries: Mutex<HashMap<String, Entry>>,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    completed: Mutex<HashMap<String, Completed>>,
    next_generation: Mutex<u64>,
    snapshot_tx: watch::Sender<UploadQueueSnapshot>,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

impl UploadCoordinator {
    pub fn new(
        settings: UploadSettings,
        transport: Arc<dyn UploadTransport>,
        breakers: &BreakerRegistry,
    ) -> Self {
        let breaker = breakers.get(transport.target());
        let (snapshot_tx, _) = watch::channel(UploadQueueSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                breaker,
                auth: RwLock::new(AuthContext::default()),
                entries: Mutex::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                snapshot_tx,
            }),
        }
    }

    pub fn set_auth(&self, auth: AuthContext) {
        *self.inner.auth.write() = auth;
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.inner.breaker.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadQueueSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> UploadQueueSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    pub fn get(&self, draft_id: &str) -> Option<PendingUpload> {
        self.inner
            .entries
            .lock()
            .get(draft_id)
            .map(|e| e.upload.clone())
    }

    /// Queue `file_path` as the draft's upload target.
    ///
    /// An active upload of a previous target is signalled to stop; it cannot
    /// become active again because the entry now belongs to the new target.
    pub fn enqueue(&self, draft_id: &str, file_path: &Path) -> PendingUpload {
        let generation = {
            let mut next = self.inner.next_generation.lock();
            *next += 1;
            *next
        };

        let mut entries = self.inner.entries.lock();
        if let Some(previous) = entries.get(draft_id) {
            if let Some(token) = &previous.cancel {
                tracing::info!(
                    "Replacing active upload of {:?} for draft {}",
                    previous.upload.file_path,
                    draft_id
                );
                token.cancel();
            }
        }

        let upload = PendingUpload {
            draft_id: draft_id.to_string(),
            file_path: file_path.to_path_buf(),
            status: UploadStatus::Pending,
            attempt_count: 0,
            last_error: None,
            remote: None,
        };
        entries.insert(
            draft_id.to_string(),
            Entry {
                upload: upload.clone(),
                generation,
                cancel: None,
            },
        );
        self.publish(&entries);
        tracing::debug!("Queued upload of {:?} for draft {}", file_path, draft_id);
        upload
    }

    /// Stop the draft's upload. Returns once no attempt is running; the file
    /// itself is left alone.
    ///
    /// Returns whether there was anything to cancel.
    pub async fn cancel(&self, draft_id: &str) -> bool {
        let cancelled = {
            let mut entries = self.inner.entries.lock();
            let cancelled = match entries.get_mut(draft_id) {
                Some(entry)
                    if matches!(
                        entry.upload.status,
                        UploadStatus::Pending | UploadStatus::Active
                    ) =>
                {
                    if let Some(token) = entry.cancel.take() {
                        token.cancel();
                    }
                    entry.upload.status = UploadStatus::Cancelled;
                    true
                }
                _ => false,
            };
            if cancelled {
                self.publish(&entries);
            }
            cancelled
        };

        // Wait out any attempt still holding the slot
        let slot = self.slot(draft_id);
        drop(slot.lock().await);

        if cancelled {
            tracing::info!("Cancelled upload for draft {}", draft_id);
        }
        cancelled
    }

    /// Cancel and drop everything known about a draft
    pub async fn forget(&self, draft_id: &str) {
        self.cancel(draft_id).await;
        let mut entries = self.inner.entries.lock();
        entries.remove(draft_id);
        self.inner.completed.lock().remove(draft_id);
        self.inner.slots.lock().remove(draft_id);
        self.publish(&entries);
    }

    /// One upload attempt for the draft's queued file
    pub async fn attempt(&self, draft_id: &str) -> Result<RemoteUpload, UploadError> {
        let slot = self.slot(draft_id);
        let _active = slot.lock().await;

        let (generation, path, token, admission) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .get_mut(draft_id)
                .ok_or_else(|| UploadError::NotQueued(draft_id.to_string()))?;

            match entry.upload.status {
                UploadStatus::Succeeded => {
                    if let Some(remote) = &entry.upload.remote {
                        return Ok(remote.clone());
                    }
                }
                UploadStatus::Cancelled => return Err(UploadError::Cancelled),
                _ => {}
            }

            entry.upload.attempt_count += 1;
            let admission = match self.inner.breaker.try_acquire() {
                Ok(admission) => admission,
                Err(rejected) => {
                    let err = UploadError::CircuitOpen {
                        target: self.inner.breaker.name().to_string(),
                        retry_after_ms: rejected.retry_after.as_millis() as u64,
                    };
                    entry.upload.status = UploadStatus::Failed;
                    entry.upload.last_error = Some(err.to_string());
                    self.publish(&entries);
                    tracing::debug!("Upload for draft {} failed fast: {}", draft_id, err);
                    return Err(err);
                }
            };

            let token = CancellationToken::new();
            entry.cancel = Some(token.clone());
            entry.upload.status = UploadStatus::Active;
            entry.upload.last_error = None;
            let path = entry.upload.file_path.clone();
            let generation = entry.generation;
            self.publish(&entries);
            (generation, path, token, admission)
        };

        tracing::info!("Uploading {:?} for draft {}", path, draft_id);
        let auth = self.inner.auth.read().clone();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(
                self.inner.settings.timeout(),
                self.inner.transport.upload(&path, &auth, &token),
            ) => result.unwrap_or(Err(TransportError::Timeout)),
        };

        match &outcome {
            Ok(_) => self.inner.breaker.record_success(),
            Err(TransportError::Timeout | TransportError::Server(_) | TransportError::Io(_)) => {
                self.inner.breaker.record_failure()
            }
            Err(_) => self.inner.breaker.record_neutral(admission),
        }

        let result = outcome.map_err(UploadError::from);
        if let Ok(remote) = &result {
            if let Ok(fingerprint) = FileFingerprint::of(&path).await {
                self.inner.completed.lock().insert(
                    draft_id.to_string(),
                    Completed {
                        fingerprint,
                        remote: remote.clone(),
                    },
                );
            }
        }

        {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(draft_id) {
                if entry.generation == generation {
                    entry.cancel = None;
                    match &result {
                        Ok(remote) => {
                            entry.upload.status = UploadStatus::Succeeded;
                            entry.upload.remote = Some(remote.clone());
                        }
                        Err(UploadError::Cancelled) => {
                            entry.upload.status = UploadStatus::Cancelled;
                        }
                        Err(e) => {
                            entry.upload.status = UploadStatus::Failed;
                            entry.upload.last_error = Some(e.to_string());
                        }
                    }
                }
            }
            self.publish(&entries);
        }

        match &result {
            Ok(remote) => tracing::info!("Uploaded draft {} to {}", draft_id, remote.url),
            Err(UploadError::Cancelled) => tracing::debug!("Upload for draft {} stopped", draft_id),
            Err(e) => tracing::warn!("Upload attempt for draft {} failed: {}", draft_id, e),
        }
        result
    }

    /// Attempt with exponential backoff until success, a non-retryable error
    /// or the breaker opening
    pub async fn upload_with_retry(&self, draft_id: &str) -> Result<RemoteUpload, UploadError> {
        let mut retry = 0u32;
        loop {
            match self.attempt(draft_id).await {
                Ok(remote) => return Ok(remote),
                Err(e) if e.is_retryable() && self.inner.breaker.state() == BreakerState::Closed => {
                    let delay = self.inner.settings.backoff(retry);
                    tracing::debug!(
                        "Retrying upload for draft {} in {}ms",
                        draft_id,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `upload_with_retry` in the background
    pub fn spawn(&self, draft_id: &str) -> JoinHandle<Result<RemoteUpload, UploadError>> {
        let coordinator = self.clone();
        let draft_id = draft_id.to_string();
        tokio::spawn(async move { coordinator.upload_with_retry(&draft_id).await })
    }

    /// Make sure `path` is uploaded for the draft.
    ///
    /// A previous successful upload is reused while the file is unchanged
    /// (same path, size and mtime). A queued or running upload of the same
    /// path is joined rather than restarted.
    pub async fn ensure_uploaded(
        &self,
        draft_id: &str,
        path: &Path,
    ) -> Result<RemoteUpload, UploadError> {
        let fingerprint = FileFingerprint::of(path)
            .await
            .map_err(|e| UploadError::Io(format!("{}: {}", path.display(), e)))?;

        if let Some(done) = self.inner.completed.lock().get(draft_id) {
            if done.fingerprint == fingerprint {
                tracing::info!("Reusing upload of {:?} for draft {}", path, draft_id);
                return Ok(done.remote.clone());
            }
        }

        let joinable = self.get(draft_id).is_some_and(|u| {
            u.file_path == path
                && matches!(
                    u.status,
                    UploadStatus::Pending | UploadStatus::Active | UploadStatus::Failed
                )
        });
        if !joinable {
            self.enqueue(draft_id, path);
        }
        self.upload_with_retry(draft_id).await
    }

    fn slot(&self, draft_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .slots
            .lock()
            .entry(draft_id.to_string())
            .or_default()
            .clone()
    }

    fn publish(&self, entries: &HashMap<String, Entry>) {
        let mut uploads: Vec<PendingUpload> = entries.values().map(|e| e.upload.clone()).collect();
        uploads.sort_by(|a, b| a.draft_id.cmp(&b.draft_id));
        self.inner.snapshot_tx.send_replace(UploadQueueSnapshot {
            uploads,
            breaker: Some(self.inner.breaker.state()),
        });
    }
}

#[async_trait]
impl CurrentFileHandoff for UploadCoordinator {
    async fn release(&self, draft_id: &str) {
        self.cancel(draft_id).await;
    }

    async fn adopt(&self, draft_id: &str, current: &Path) {
        self.enqueue(draft_id, current);
        // Outcome is logged by the attempt itself
        drop(self.spawn(draft_id));
    }
}
