//! In-memory stand-ins for the external collaborators, for unit tests

use crate::drafts::DraftMetadata;
use crate::media::{
    CropPolicy, JoinedClip, MediaError, MediaTranscoder, SegmentInput, SegmentJoiner, StripMode,
    TranscodeOp,
};
use crate::processing::CurrentFileHandoff;
use crate::publish::{BroadcastError, Broadcaster};
use crate::recorder::{CaptureChannel, RecordingError, RecordingResult};
use crate::upload::{AuthContext, RemoteUpload, TransportError, UploadTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Counts concurrent holders; tracks the peak
#[derive(Default)]
pub(crate) struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Camera that writes each segment's elapsed milliseconds as its content
#[derive(Default)]
pub(crate) struct FakeCamera {
    open: Mutex<Option<(PathBuf, Instant)>>,
    opened: Mutex<Vec<PathBuf>>,
    fail_initialize: AtomicBool,
    initialize_calls: AtomicUsize,
}

impl FakeCamera {
    pub fn opened_paths(&self) -> Vec<PathBuf> {
        self.opened.lock().clone()
    }

    pub fn fail_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureChannel for FakeCamera {
    fn id(&self) -> &str {
        "fake-camera"
    }

    async fn initialize(&self) -> RecordingResult<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(RecordingError::Initialization("no camera".to_string()));
        }
        Ok(())
    }

    async fn open_segment(&self, path: &Path) -> RecordingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b"0")?;
        self.opened.lock().push(path.to_path_buf());
        *self.open.lock() = Some((path.to_path_buf(), Instant::now()));
        Ok(())
    }

    async fn close_segment(&self) -> RecordingResult<()> {
        let Some((path, started)) = self.open.lock().take() else {
            return Err(RecordingError::SegmentWrite("no open segment".to_string()));
        };
        std::fs::write(&path, started.elapsed().as_millis().to_string())?;
        Ok(())
    }
}

/// Joiner that sums the millisecond counts written by `FakeCamera`
#[derive(Default)]
pub(crate) struct FakeJoiner {
    calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl FakeJoiner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SegmentJoiner for FakeJoiner {
    async fn join(
        &self,
        segments: &[SegmentInput],
        _crop: CropPolicy,
        output: &Path,
    ) -> Result<JoinedClip, MediaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(MediaError::UnsupportedFormat("corrupt segment".to_string()));
        }

        let mut total = 0u64;
        for segment in segments {
            let content = std::fs::read_to_string(&segment.file_path)?;
            total += content.trim().parse::<u64>().unwrap_or(0);
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, total.to_string())?;
        Ok(JoinedClip {
            file_path: output.to_path_buf(),
            duration_ms: total,
        })
    }
}

/// Transcoder that copies the input, tagging the output
#[derive(Default)]
pub(crate) struct FakeTranscoder {
    reject_stream_copy: AtomicBool,
    fail_all: AtomicBool,
    calls: Mutex<Vec<StripMode>>,
    delay: Mutex<Option<Duration>>,
    in_flight: Arc<InFlight>,
}

impl FakeTranscoder {
    pub fn reject_stream_copy(&self) {
        self.reject_stream_copy.store(true, Ordering::SeqCst);
    }

    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<StripMode> {
        self.calls.lock().clone()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn max_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTranscoder for FakeTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        op: TranscodeOp,
        output: &Path,
    ) -> Result<(), MediaError> {
        let _busy = self.in_flight.enter();
        let TranscodeOp::StripAudio { mode } = op;
        self.calls.lock().push(mode);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_all.load(Ordering::SeqCst) {
            return Err(MediaError::Ffmpeg("encoder crashed".to_string()));
        }
        if mode == StripMode::StreamCopy && self.reject_stream_copy.load(Ordering::SeqCst) {
            return Err(MediaError::StreamCopyUnsupported("codec not copyable".to_string()));
        }

        let mut content = std::fs::read(input)?;
        content.extend_from_slice(b" [no audio]");
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, content)?;
        Ok(())
    }
}

/// Handoff that records the calls it receives
#[derive(Default)]
pub(crate) struct RecordingHandoff {
    events: Mutex<Vec<String>>,
}

impl RecordingHandoff {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl CurrentFileHandoff for RecordingHandoff {
    async fn release(&self, draft_id: &str) {
        self.events.lock().push(format!("release:{}", draft_id));
    }

    async fn adopt(&self, draft_id: &str, current: &Path) {
        self.events
            .lock()
            .push(format!("adopt:{}:{}", draft_id, current.display()));
    }
}

/// Scriptable upload transport.
///
/// Outcomes come from the script first, then the fallback (success unless
/// `fail_always` was called). While held, calls block until released or
/// cancelled.
pub(crate) struct FakeTransport {
    script: Mutex<VecDeque<Result<RemoteUpload, TransportError>>>,
    fallback: Mutex<Option<TransportError>>,
    paths: Mutex<Vec<PathBuf>>,
    calls_tx: watch::Sender<usize>,
    held: watch::Sender<bool>,
    delay: Mutex<Option<Duration>>,
    in_flight: Arc<InFlight>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            paths: Mutex::new(Vec::new()),
            calls_tx: watch::channel(0).0,
            held: watch::channel(false).0,
            delay: Mutex::new(None),
            in_flight: Arc::default(),
        }
    }
}

impl FakeTransport {
    pub fn script<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = Result<RemoteUpload, TransportError>>,
    {
        self.script.lock().extend(outcomes);
    }

    pub fn fail_always(&self, error: TransportError) {
        *self.fallback.lock() = Some(error);
    }

    pub fn succeed(&self) {
        *self.fallback.lock() = None;
    }

    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        *self.calls_tx.borrow()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.current.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.calls_tx.subscribe();
        let _ = rx.wait_for(|calls| *calls >= n).await;
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl UploadTransport for FakeTransport {
    fn target(&self) -> &str {
        "fake://uploads"
    }

    async fn upload(
        &self,
        file: &Path,
        _auth: &AuthContext,
        cancel: &CancellationToken,
    ) -> Result<RemoteUpload, TransportError> {
        let _busy = self.in_flight.enter();
        self.paths.lock().push(file.to_path_buf());
        self.calls_tx.send_modify(|calls| *calls += 1);

        let mut held = self.held.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = released(&mut held) => {}
        }

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }
        if let Some(error) = self.fallback.lock().clone() {
            return Err(error);
        }
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(RemoteUpload {
            url: format!("https://cdn.test/{}", name),
            sha256: None,
        })
    }
}

async fn released(held: &mut watch::Receiver<bool>) {
    while *held.borrow_and_update() {
        if held.changed().await.is_err() {
            return;
        }
    }
}

/// Broadcaster that records what it was asked to announce
#[derive(Default)]
pub(crate) struct FakeBroadcaster {
    received: Mutex<Vec<(RemoteUpload, DraftMetadata)>>,
    fail_next: Mutex<Option<String>>,
}

impl FakeBroadcaster {
    pub fn received(&self) -> Vec<(RemoteUpload, DraftMetadata)> {
        self.received.lock().clone()
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }
}

#[async_trait]
impl Broadcaster for FakeBroadcaster {
    async fn broadcast(
        &self,
        remote: &RemoteUpload,
        metadata: &DraftMetadata,
    ) -> Result<(), BroadcastError> {
        if let Some(message) = self.fail_next.lock().take() {
            return Err(BroadcastError(message));
        }
        self.received.lock().push((remote.clone(), metadata.clone()));
        Ok(())
    }
}
