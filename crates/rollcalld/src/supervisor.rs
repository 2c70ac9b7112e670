//! Outer loop: wait for the backend to open a session, run it, repeat.

use crate::backend::SessionSource;
use crate::engine::EngineError;
use rollcall_core::session::ActiveSession;
use rollcall_core::{BackendReport, StopReason};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing to run yet.
    Wait,
    Run(ActiveSession),
    /// The active session was quit locally; do not restart it.
    Skip,
}

/// Remembers a session the operator quit so it is not immediately rerun
/// while the backend still reports it active.
#[derive(Debug, Default)]
pub struct SkipRule {
    skipped: Option<String>,
}

impl SkipRule {
    /// Choose what to do with one poll result (`None`: backend unreachable).
    pub fn decide(&mut self, report: Option<&BackendReport>) -> Action {
        match report {
            None => Action::Wait,
            Some(BackendReport::Inactive) => {
                self.skipped = None;
                Action::Wait
            }
            Some(BackendReport::ActiveUnidentified) => {
                tracing::warn!("backend reports an active session without a class id; waiting");
                Action::Wait
            }
            Some(BackendReport::Active(active)) => {
                if self.skipped.as_deref() == Some(active.session_id.as_str()) {
                    return Action::Skip;
                }
                self.skipped = None;
                Action::Run(active.clone())
            }
        }
    }

    pub fn finished(&mut self, session_id: &str, reason: &StopReason) {
        if *reason == StopReason::UserQuit {
            self.skipped = Some(session_id.to_string());
        }
    }
}

/// Poll `backend` every `interval` and hand each newly active session to
/// `run`. Returns once `quit` turns true (or its sender goes away).
pub async fn supervise<B, F, Fut>(
    backend: Arc<B>,
    interval: Duration,
    mut quit: watch::Receiver<bool>,
    mut run: F,
) where
    B: SessionSource,
    F: FnMut(ActiveSession) -> Fut,
    Fut: Future<Output = Result<StopReason, EngineError>>,
{
    let mut rule = SkipRule::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = quit.changed() => {
                if changed.is_err() {
                    tracing::info!("quit channel closed; supervisor stopping");
                    return;
                }
            }
            _ = ticker.tick() => {}
        }
        if *quit.borrow() {
            tracing::info!("supervisor stopping");
            return;
        }

        let report = match backend.get_active_session().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read active session");
                None
            }
        };

        match rule.decide(report.as_ref()) {
            Action::Wait => tracing::debug!("waiting for an active session"),
            Action::Skip => tracing::info!("session still active; rerun skipped after local quit"),
            Action::Run(active) => {
                let session_id = active.session_id.clone();
                match run(active).await {
                    Ok(reason) => rule.finished(&session_id, &reason),
                    Err(e) => {
                        tracing::error!(session = %session_id, error = %e, "session could not start");
                    }
                }
            }
        }
    }
}
