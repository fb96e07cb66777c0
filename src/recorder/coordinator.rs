//! Recording controller
//!
//! Drives the capture channel through the recording lifecycle, enforces the
//! duration budget with an auto-stop timer, and joins the segments at stop.

use super::channel::{CaptureChannel, RecordingError, RecordingResult};
use super::state::{RecordingOutput, RecordingSnapshot, RecordingState, Segment};
use crate::config::RecordingSettings;
use crate::media::{SegmentInput, SegmentJoiner};
use crate::utils::fs::remove_file_logged;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Segment currently being written
struct OpenSegment {
    path: PathBuf,
    started_at: Instant,
}

/// Bookkeeping for one recording, from start until stop/cancel completes
struct ActiveSession {
    id: Uuid,
    dir: PathBuf,
    segments: Vec<Segment>,
    open: Option<OpenSegment>,
}

impl ActiveSession {
    fn recorded_ms(&self) -> u64 {
        self.segments.iter().map(|s| s.duration_ms).sum()
    }
}

struct AutoStopTimer {
    generation: u64,
    token: CancellationToken,
}

struct Machine {
    state: RecordingState,
    session: Option<ActiveSession>,
    initialized: bool,
    timer: Option<AutoStopTimer>,
    timer_generation: u64,
    output: Option<RecordingOutput>,
    error: Option<String>,
}

struct Shared {
    settings: RecordingSettings,
    channel: Arc<dyn CaptureChannel>,
    joiner: Arc<dyn SegmentJoiner>,
    machine: Mutex<Machine>,
    snapshot_tx: watch::Sender<RecordingSnapshot>,
}

/// Owns the capture state machine.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct RecordingController {
    shared: Arc<Shared>,
}

impl RecordingController {
    /// Create a new recording controller. The budget is clamped into the
    /// supported range.
    pub fn new(
        settings: RecordingSettings,
        channel: Arc<dyn CaptureChannel>,
        joiner: Arc<dyn SegmentJoiner>,
    ) -> Self {
        let settings = settings.normalized();
        let initial = RecordingSnapshot {
            remaining_ms: settings.max_duration_ms,
            ..Default::default()
        };
        let (snapshot_tx, _) = watch::channel(initial);

        tracing::info!(
            "Recording controller on channel {} (budget {}ms, auto-stop {})",
            channel.id(),
            settings.max_duration_ms,
            settings.auto_stop
        );

        Self {
            shared: Arc::new(Shared {
                settings,
                channel,
                joiner,
                machine: Mutex::new(Machine {
                    state: RecordingState::Idle,
                    session: None,
                    initialized: false,
                    timer: None,
                    timer_generation: 0,
                    output: None,
                    error: None,
                }),
                snapshot_tx,
            }),
        }
    }

    /// Subscribe to state snapshots
    pub fn subscribe(&self) -> watch::Receiver<RecordingSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> RecordingSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Get the current recording state
    pub fn state(&self) -> RecordingState {
        self.shared.snapshot_tx.borrow().state
    }

    /// Start a new recording
    pub async fn start(&self) -> RecordingResult<()> {
        self.shared.start().await
    }

    /// Pause recording, finalizing the current segment
    pub async fn pause(&self) -> RecordingResult<()> {
        self.shared.pause().await
    }

    /// Resume recording into a new segment
    pub async fn resume(&self) -> RecordingResult<()> {
        self.shared.resume().await
    }

    /// Stop recording and join all segments
    pub async fn stop(&self) -> RecordingResult<RecordingOutput> {
        let mut machine = self.shared.machine.lock().await;
        self.shared.stop_locked(&mut machine).await
    }

    /// Discard the current recording
    pub async fn cancel(&self) -> RecordingResult<()> {
        self.shared.cancel().await
    }

    /// Leave a finished state and return to idle
    pub async fn reset(&self) -> RecordingResult<()> {
        let mut machine = self.shared.machine.lock().await;
        match machine.state {
            RecordingState::Completed | RecordingState::Error | RecordingState::Cancelled => {
                machine.state = RecordingState::Idle;
                machine.session = None;
                machine.output = None;
                machine.error = None;
                self.shared.publish(&machine);
                Ok(())
            }
            RecordingState::Idle => Ok(()),
            state => Err(RecordingError::InvalidTransition {
                action: "reset",
                state,
            }),
        }
    }

    /// Recorded duration in milliseconds, including the live segment
    pub async fn duration_ms(&self) -> u64 {
        let machine = self.shared.machine.lock().await;
        self.shared.live_recorded_ms(&machine)
    }

    /// Budget left in milliseconds, accounting for the live segment
    pub async fn remaining_ms(&self) -> u64 {
        let machine = self.shared.machine.lock().await;
        self.shared
            .settings
            .max_duration_ms
            .saturating_sub(self.shared.live_recorded_ms(&machine))
    }
}

impl Shared {
    fn publish(&self, machine: &Machine) {
        let (segments, recorded_ms) = match &machine.session {
            Some(session) => (session.segments.clone(), session.recorded_ms()),
            None => (Vec::new(), 0),
        };
        let snapshot = RecordingSnapshot {
            state: machine.state,
            segments,
            recorded_ms,
            remaining_ms: self.settings.max_duration_ms.saturating_sub(recorded_ms),
            output: machine.output.clone(),
            error: machine.error.clone(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    fn live_recorded_ms(&self, machine: &Machine) -> u64 {
        let Some(session) = &machine.session else {
            return 0;
        };
        let recorded = session.recorded_ms();
        let live = session
            .open
            .as_ref()
            .map(|open| open.started_at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        (recorded + live).min(self.settings.max_duration_ms)
    }

    fn fail(&self, machine: &mut Machine, error: &RecordingError) {
        tracing::error!("Recording failed: {}", error);
        machine.state = RecordingState::Error;
        machine.error = Some(error.to_string());
        self.publish(machine);
    }

    async fn start(self: &Arc<Self>) -> RecordingResult<()> {
        let mut machine = self.machine.lock().await;
        if !machine.state.can_start() {
            return Err(RecordingError::InvalidTransition {
                action: "start",
                state: machine.state,
            });
        }

        machine.output = None;
        machine.error = None;
        machine.session = None;

        if !machine.initialized {
            machine.state = RecordingState::Initializing;
            self.publish(&machine);
            if let Err(e) = self.channel.initialize().await {
                self.fail(&mut machine, &e);
                return Err(e);
            }
            machine.initialized = true;
        }

        let id = Uuid::new_v4();
        let dir = self.settings.segments_dir.join(id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            let e = RecordingError::Io(e);
            self.fail(&mut machine, &e);
            return Err(e);
        }

        tracing::info!("Starting recording session {} in {:?}", id, dir);

        machine.session = Some(ActiveSession {
            id,
            dir,
            segments: Vec::new(),
            open: None,
        });

        if let Err(e) = self.open_segment(&mut machine).await {
            self.fail(&mut machine, &e);
            return Err(e);
        }

        machine.state = RecordingState::Recording;
        self.arm_timer(&mut machine, self.settings.max_duration());
        self.publish(&machine);
        Ok(())
    }

    async fn pause(&self) -> RecordingResult<()> {
        let mut machine = self.machine.lock().await;
        if machine.state != RecordingState::Recording {
            return Err(RecordingError::InvalidTransition {
                action: "pause",
                state: machine.state,
            });
        }

        self.disarm_timer(&mut machine);

        if let Err(e) = self.close_segment(&mut machine).await {
            self.fail(&mut machine, &e);
            return Err(e);
        }

        machine.state = RecordingState::Paused;
        self.publish(&machine);
        tracing::info!(
            "Paused recording, {}ms remaining",
            self.snapshot_tx.borrow().remaining_ms
        );
        Ok(())
    }

    async fn resume(self: &Arc<Self>) -> RecordingResult<()> {
        let mut machine = self.machine.lock().await;
        if machine.state != RecordingState::Paused {
            return Err(RecordingError::InvalidTransition {
                action: "resume",
                state: machine.state,
            });
        }

        let recorded = machine.session.as_ref().map(|s| s.recorded_ms()).unwrap_or(0);
        let remaining = self.settings.max_duration_ms.saturating_sub(recorded);
        if remaining == 0 {
            return Err(RecordingError::BudgetExhausted);
        }

        if let Err(e) = self.open_segment(&mut machine).await {
            self.fail(&mut machine, &e);
            return Err(e);
        }

        machine.state = RecordingState::Recording;
        self.arm_timer(&mut machine, Duration::from_millis(remaining));
        self.publish(&machine);
        tracing::info!("Resumed recording with {}ms remaining", remaining);
        Ok(())
    }

    async fn stop_locked(&self, machine: &mut Machine) -> RecordingResult<RecordingOutput> {
        if !machine.state.is_active() {
            return Err(RecordingError::InvalidTransition {
                action: "stop",
                state: machine.state,
            });
        }

        self.disarm_timer(machine);

        if machine.state == RecordingState::Recording {
            if let Err(e) = self.close_segment(machine).await {
                self.fail(machine, &e);
                return Err(e);
            }
        }

        machine.state = RecordingState::Processing;
        self.publish(machine);

        let (session_id, inputs, segment_dir) = match &machine.session {
            Some(session) => (
                session.id,
                session
                    .segments
                    .iter()
                    .map(|s| SegmentInput {
                        file_path: s.file_path.clone(),
                    })
                    .collect::<Vec<_>>(),
                session.dir.clone(),
            ),
            None => {
                let e = RecordingError::SegmentWrite("no active session".to_string());
                self.fail(machine, &e);
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.settings.clips_dir).await {
            let e = RecordingError::Io(e);
            self.fail(machine, &e);
            return Err(e);
        }
        let output_path = self.settings.clips_dir.join(format!("clip_{}.mp4", session_id));

        tracing::info!("Stopping recording, joining {} segments", inputs.len());

        let joined = match self
            .joiner
            .join(&inputs, self.settings.crop, &output_path)
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                // Segment files stay on disk for diagnostics
                let e = RecordingError::Join(e);
                self.fail(machine, &e);
                return Err(e);
            }
        };

        let output = RecordingOutput {
            file_path: joined.file_path,
            duration_ms: joined.duration_ms,
            segment_count: inputs.len(),
        };

        for input in &inputs {
            remove_file_logged(&input.file_path, "segment").await;
        }
        if let Err(e) = tokio::fs::remove_dir(&segment_dir).await {
            tracing::debug!("Leaving segment directory {:?}: {}", segment_dir, e);
        }

        machine.state = RecordingState::Completed;
        machine.output = Some(output.clone());
        self.publish(machine);

        tracing::info!(
            "Recording stopped. Duration: {}ms in {:?}",
            output.duration_ms,
            output.file_path
        );
        Ok(output)
    }

    async fn cancel(&self) -> RecordingResult<()> {
        let mut machine = self.machine.lock().await;
        if !machine.state.is_active() {
            return Err(RecordingError::InvalidTransition {
                action: "cancel",
                state: machine.state,
            });
        }

        self.disarm_timer(&mut machine);

        if machine.state == RecordingState::Recording {
            if let Err(e) = self.channel.close_segment().await {
                tracing::warn!("Failed to close segment while cancelling: {}", e);
            }
        }

        if let Some(session) = machine.session.take() {
            tracing::info!("Cancelling recording session {}", session.id);
            let open = session.open.as_ref().map(|o| o.path.clone());
            for path in session.segments.iter().map(|s| &s.file_path).chain(open.as_ref()) {
                remove_file_logged(path, "segment").await;
            }
            if let Err(e) = tokio::fs::remove_dir(&session.dir).await {
                tracing::debug!("Leaving segment directory {:?}: {}", session.dir, e);
            }
        }

        machine.state = RecordingState::Cancelled;
        self.publish(&machine);
        machine.state = RecordingState::Idle;
        self.publish(&machine);
        Ok(())
    }

    /// Fired by the auto-stop timer. A no-op if an explicit pause/stop/cancel
    /// disarmed the timer first.
    async fn auto_stop(&self, generation: u64) {
        let mut machine = self.machine.lock().await;
        let armed = machine
            .timer
            .as_ref()
            .map(|t| t.generation == generation && !t.token.is_cancelled())
            .unwrap_or(false);
        if !armed {
            return;
        }

        tracing::info!("Recording budget reached, stopping automatically");
        if let Err(e) = self.stop_locked(&mut machine).await {
            tracing::error!("Auto-stop failed: {}", e);
        }
    }

    fn arm_timer(self: &Arc<Self>, machine: &mut Machine, remaining: Duration) {
        if !self.settings.auto_stop {
            return;
        }

        machine.timer_generation += 1;
        let generation = machine.timer_generation;
        let token = CancellationToken::new();
        machine.timer = Some(AutoStopTimer {
            generation,
            token: token.clone(),
        });

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(remaining) => shared.auto_stop(generation).await,
            }
        });
    }

    fn disarm_timer(&self, machine: &mut Machine) {
        if let Some(timer) = machine.timer.take() {
            timer.token.cancel();
        }
    }

    async fn open_segment(&self, machine: &mut Machine) -> RecordingResult<()> {
        let session = machine
            .session
            .as_mut()
            .ok_or_else(|| RecordingError::SegmentWrite("no active session".to_string()))?;

        let path = session
            .dir
            .join(format!("segment_{}.mp4", session.segments.len()));
        self.channel.open_segment(&path).await?;

        tracing::debug!("Opened segment {:?}", path);
        session.open = Some(OpenSegment {
            path,
            started_at: Instant::now(),
        });
        Ok(())
    }

    async fn close_segment(&self, machine: &mut Machine) -> RecordingResult<()> {
        let budget = self.settings.max_duration_ms;
        let session = machine
            .session
            .as_mut()
            .ok_or_else(|| RecordingError::SegmentWrite("no active session".to_string()))?;
        let Some(open) = session.open.take() else {
            return Ok(());
        };

        self.channel.close_segment().await?;

        let start_offset_ms = session.recorded_ms();
        let elapsed = open.started_at.elapsed().as_millis() as u64;
        let duration_ms = elapsed.min(budget.saturating_sub(start_offset_ms));

        tracing::debug!("Closed segment {:?} ({}ms)", open.path, duration_ms);
        session.segments.push(Segment {
            file_path: open.path,
            start_offset_ms,
            duration_ms,
        });
        Ok(())
    }
}
