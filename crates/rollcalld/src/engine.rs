//! One attendance session, start to finish.
//!
//! The frame loop runs on a dedicated OS thread that owns the camera and
//! the ONNX sessions. Startup is fail-fast: the roster, the models and the
//! camera must all be available before the session goes active. Around the
//! thread, tokio tasks watch the backend and post attendance marks.

use crate::backend::{AttendanceLogger, SessionSource};
use crate::config::Config;
use crate::display::{DisplaySink, Osd};
use crate::poster::spawn_poster;
use crate::store::{EmbeddingStore, Roster, StoreError};
use crate::watcher::spawn_watcher;
use chrono::{FixedOffset, Utc};
use image::RgbImage;
use rollcall_core::analyzer::{AnalyzerError, OnnxFaceAnalyzer};
use rollcall_core::attendance::parse_start_time;
use rollcall_core::liveness::{LivenessError, OnnxLiveness, LIVENESS_MODEL_FILE};
use rollcall_core::session::{ActiveSession, SessionError, SessionState};
use rollcall_core::{
    AttendanceSession, EventSink, FaceAnalyzer, IdentityDirectory, IdentityId, IdentityProfile,
    LivenessClassifier, Pipeline, SessionController, SessionSignal, StopReason,
};
use rollcall_hw::{Camera, CameraError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Consecutive capture errors tolerated before the session stops.
pub const MAX_CAPTURE_FAILURES: u32 = 30;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("face models: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("liveness model: {0}")]
    Liveness(#[from] LivenessError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("frame thread: {0}")]
    Thread(String),
}

type OnnxPipeline = Pipeline<OnnxFaceAnalyzer, OnnxLiveness, HashMap<IdentityId, IdentityProfile>>;

/// Stop requests visible to the frame loop.
pub struct StopSignals {
    quit: watch::Receiver<bool>,
    backend: watch::Receiver<SessionSignal>,
}

impl StopSignals {
    pub fn new(quit: watch::Receiver<bool>, backend: watch::Receiver<SessionSignal>) -> Self {
        Self { quit, backend }
    }

    /// A local quit wins over whatever the backend says.
    pub fn pending(&self) -> Option<StopReason> {
        if *self.quit.borrow() {
            return Some(StopReason::UserQuit);
        }
        match &*self.backend.borrow() {
            SessionSignal::Stop(reason) => Some(reason.clone()),
            SessionSignal::Active => None,
        }
    }
}

/// Run frames through `pipeline` until a stop is requested or capture keeps
/// failing.
pub fn drive<A, L, D, S, F>(
    pipeline: &mut Pipeline<A, L, D>,
    mut next_frame: F,
    signals: &StopSignals,
    sink: &mut S,
    display: &mut DisplaySink,
    offset: FixedOffset,
) -> StopReason
where
    A: FaceAnalyzer,
    L: LivenessClassifier,
    D: IdentityDirectory,
    S: EventSink,
    F: FnMut() -> Result<RgbImage, CameraError>,
{
    let mut osd = Osd::new(Instant::now());
    let mut failures = 0u32;

    loop {
        if let Some(reason) = signals.pending() {
            return reason;
        }

        let frame = match next_frame() {
            Ok(frame) => {
                failures = 0;
                frame
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "frame capture failed");
                if failures >= MAX_CAPTURE_FAILURES {
                    return StopReason::CaptureFailed(e.to_string());
                }
                continue;
            }
        };

        let now = Instant::now();
        osd.tick(now);
        let wall = Utc::now().with_timezone(&offset);

        let report = pipeline.process(&frame, now, wall, sink);
        let lines = osd.lines(
            now,
            report.faces,
            pipeline.session().recognized_count(),
            pipeline.bank().len(),
        );
        if let Err(e) = display.present(&frame, pipeline.tracks(), &lines) {
            tracing::warn!(error = %e, "display update failed");
        }
    }
}

/// Load everything the frame loop needs. Runs on the frame thread.
fn open_session(
    config: &Config,
    roster: &HashSet<IdentityId>,
    session: AttendanceSession,
) -> Result<(OnnxPipeline, Camera), EngineError> {
    let store = EmbeddingStore::open(&config.db_path)?;
    let Roster { bank, profiles } = store.load_roster(roster)?;
    if bank.is_empty() {
        tracing::warn!(
            roster = roster.len(),
            "no enrolled faces for this roster; every face will be Unknown"
        );
    }

    let analyzer = OnnxFaceAnalyzer::load(&config.model_dir)?;
    let liveness_path = config.model_dir.join(LIVENESS_MODEL_FILE);
    let liveness = OnnxLiveness::load(&liveness_path.to_string_lossy(), config.liveness_config())?;

    let camera = Camera::open(&config.camera_device)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let pipeline = Pipeline::new(
        analyzer,
        liveness,
        profiles,
        bank,
        session,
        config.pipeline_config(),
    );
    Ok((pipeline, camera))
}

/// Run the session described by `active` until it stops.
///
/// Returns the stop reason, or an error if the session could not start.
pub async fn run_session<B>(
    config: Config,
    backend: Arc<B>,
    active: ActiveSession,
    quit: watch::Receiver<bool>,
) -> Result<StopReason, EngineError>
where
    B: SessionSource + AttendanceLogger,
{
    let session_id = active.session_id.clone();
    if session_id.trim().is_empty() {
        return Err(SessionError::InvalidSessionId.into());
    }

    let offset = config.local_offset();
    let started_at = active.start_time.as_deref().and_then(|raw| {
        let parsed = parse_start_time(raw, offset);
        if parsed.is_none() {
            tracing::warn!(raw, "unparseable session start time; everyone will be Present");
        }
        parsed
    });
    tracing::info!(
        session = %session_id,
        roster = active.roster.len(),
        start = ?started_at,
        grace_secs = config.grace_period_secs,
        "starting session"
    );

    let roster: HashSet<IdentityId> = active.roster.iter().cloned().collect();
    let session = AttendanceSession::new(session_id.clone(), started_at, config.grace_period());

    let (mut queue, poster) = spawn_poster(backend.clone());
    let (backend_rx, watcher) = spawn_watcher(
        backend.clone(),
        session_id.clone(),
        config.poll_interval(),
        config.max_poll_failures,
    );
    let signals = StopSignals::new(quit, backend_rx);

    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();
    let (done_tx, done_rx) = oneshot::channel::<StopReason>();
    let http_timeout = config.http_timeout();

    std::thread::Builder::new()
        .name("rollcall-frames".into())
        .spawn(move || {
            let (mut pipeline, camera) = match open_session(&config, &roster, session) {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let mut stream = match camera.stream() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            tracing::info!("frame loop started");
            let mut display = DisplaySink::new(config.snapshot_path.clone());
            let reason = drive(
                &mut pipeline,
                || stream.next_frame().map(|f| f.image),
                &signals,
                &mut queue,
                &mut display,
                offset,
            );
            tracing::info!(%reason, "frame loop exiting");

            drop(stream);
            release_then_report((camera, display, queue), done_tx, reason);
        })
        .map_err(|e| EngineError::Thread(e.to_string()))?;

    match ready_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            watcher.abort();
            tracing::error!(session = %session_id, error = %e, "session start aborted");
            return Err(e);
        }
        Err(_) => {
            watcher.abort();
            return Err(EngineError::Thread("frame thread exited during startup".into()));
        }
    }

    let mut controller = SessionController::new();
    controller.activate(&session_id)?;

    let reason = done_rx
        .await
        .unwrap_or_else(|_| StopReason::CaptureFailed("frame thread exited unexpectedly".into()));
    watcher.abort();

    stop_session(&mut controller, backend.as_ref(), reason, poster, http_timeout * 2).await
}

/// Drop everything the frame loop owned, then report why it stopped.
fn release_then_report<R>(resources: R, done: oneshot::Sender<StopReason>, reason: StopReason) {
    drop(resources);
    let _ = done.send(reason);
}

/// Wind down an active session whose frame loop returned `reason`.
///
/// Waits up to `drain_timeout` for queued marks, tells the backend about a
/// local quit (failure is logged, not returned) and returns the controller
/// to idle.
pub async fn stop_session<B: SessionSource>(
    controller: &mut SessionController,
    backend: &B,
    reason: StopReason,
    poster: JoinHandle<usize>,
    drain_timeout: Duration,
) -> Result<StopReason, EngineError> {
    controller.begin_stop(reason)?;
    drain_poster(poster, drain_timeout).await;

    if let SessionState::Stopping { session_id, reason } = controller.current_state() {
        if reason.notifies_backend() {
            match backend.notify_session_stopped(session_id).await {
                Ok(()) => tracing::info!(session = %session_id, "backend notified of stop"),
                Err(e) => tracing::warn!(session = %session_id, error = %e, "stop notification failed"),
            }
        }
    }

    let (session_id, reason) = controller.finish_stop()?;
    tracing::info!(session = %session_id, %reason, "session ended");
    Ok(reason)
}

async fn drain_poster(mut poster: JoinHandle<usize>, limit: Duration) {
    match tokio::time::timeout(limit, &mut poster).await {
        Ok(Ok(delivered)) => tracing::info!(delivered, "attendance poster drained"),
        Ok(Err(e)) => tracing::warn!(error = %e, "attendance poster task failed"),
        Err(_) => {
            poster.abort();
            tracing::warn!("attendance poster still busy; remaining marks dropped");
        }
    }
}
