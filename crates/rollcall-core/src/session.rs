//! Session lifecycle state machine and backend cross-check rules.
//!
//! The controller is owned by whoever runs the frame loop. The watcher task
//! never touches it directly; it publishes a [`SessionSignal`] through a
//! one-slot mailbox and the frame loop turns a `Stop` signal into the
//! `Active -> Stopping` transition.

use crate::types::IdentityId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("session id is empty")]
    InvalidSessionId,
    #[error("cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: &'static str },
}

/// Why an active session is being stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Local operator asked to quit.
    UserQuit,
    /// Backend reports no active session.
    BackendEnded,
    /// Backend reports a different active session.
    BackendSwitched { active: String },
    /// Backend could not be reached for too many consecutive polls.
    BackendUnreachable,
    /// The camera stopped producing frames.
    CaptureFailed(String),
}

impl StopReason {
    /// Only a locally initiated stop is reported back to the backend.
    pub fn notifies_backend(&self) -> bool {
        matches!(self, StopReason::UserQuit)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::UserQuit => f.write_str("user quit"),
            StopReason::BackendEnded => f.write_str("backend ended session"),
            StopReason::BackendSwitched { active } => {
                write!(f, "backend switched to session {active}")
            }
            StopReason::BackendUnreachable => f.write_str("backend unreachable"),
            StopReason::CaptureFailed(e) => write!(f, "capture failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active { session_id: String },
    Stopping { session_id: String, reason: StopReason },
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Active { .. } => "active",
            SessionState::Stopping { .. } => "stopping",
        }
    }
}

/// Explicit `Idle -> Active -> Stopping -> Idle` state machine.
#[derive(Debug)]
pub struct SessionController {
    state: SessionState,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self { state: SessionState::Idle }
    }

    pub fn current_state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    pub fn activate(&mut self, session_id: &str) -> Result<(), SessionError> {
        if session_id.trim().is_empty() {
            return Err(SessionError::InvalidSessionId);
        }
        match self.state {
            SessionState::Idle => {
                tracing::info!(session = session_id, "session active");
                self.state = SessionState::Active { session_id: session_id.to_string() };
                Ok(())
            }
            _ => Err(self.invalid("activate")),
        }
    }

    pub fn begin_stop(&mut self, reason: StopReason) -> Result<(), SessionError> {
        match &self.state {
            SessionState::Active { session_id } => {
                tracing::info!(session = %session_id, %reason, "session stopping");
                self.state = SessionState::Stopping {
                    session_id: session_id.clone(),
                    reason,
                };
                Ok(())
            }
            _ => Err(self.invalid("stop")),
        }
    }

    /// Complete the stop once resources are released.
    ///
    /// Returns the session id and the reason it stopped.
    pub fn finish_stop(&mut self) -> Result<(String, StopReason), SessionError> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Stopping { session_id, reason } => {
                tracing::info!(session = %session_id, "session idle");
                Ok((session_id, reason))
            }
            other => {
                self.state = other;
                Err(self.invalid("finish stop"))
            }
        }
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition { action, state: self.state.name() }
    }
}

/// One answer from the backend's active-session endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendReport {
    Inactive,
    Active(ActiveSession),
    /// A session is active but the backend did not say which one.
    ActiveUnidentified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: String,
    /// Identities authorized for this session.
    pub roster: Vec<IdentityId>,
    /// Raw start timestamp as reported by the backend.
    pub start_time: Option<String>,
}

/// Latest-value mailbox content written by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    Active,
    Stop(StopReason),
}

/// Decides, poll by poll, whether the local session is still the one the
/// backend considers active.
#[derive(Debug)]
pub struct SessionWatch {
    session_id: String,
    consecutive_failures: u32,
    max_failures: u32,
}

impl SessionWatch {
    /// `max_failures` consecutive unreachable polls end the session; values
    /// below 1 are treated as 1.
    pub fn new(session_id: impl Into<String>, max_failures: u32) -> Self {
        Self {
            session_id: session_id.into(),
            consecutive_failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    /// Feed one poll result; `None` means the backend was unreachable.
    pub fn observe(&mut self, report: Option<&BackendReport>) -> SessionSignal {
        let Some(report) = report else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.max_failures {
                return SessionSignal::Stop(StopReason::BackendUnreachable);
            }
            tracing::warn!(
                failures = self.consecutive_failures,
                max = self.max_failures,
                "session poll failed; retrying next tick"
            );
            return SessionSignal::Active;
        };

        self.consecutive_failures = 0;
        match report {
            BackendReport::Inactive => SessionSignal::Stop(StopReason::BackendEnded),
            BackendReport::Active(active) if active.session_id != self.session_id => {
                SessionSignal::Stop(StopReason::BackendSwitched {
                    active: active.session_id.clone(),
                })
            }
            BackendReport::Active(_) | BackendReport::ActiveUnidentified => SessionSignal::Active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(id: &str) -> BackendReport {
        BackendReport::Active(ActiveSession {
            session_id: id.to_string(),
            roster: vec![],
            start_time: None,
        })
    }

    #[test]
    fn test_full_lifecycle() {
        let mut c = SessionController::new();
        assert_eq!(c.current_state(), &SessionState::Idle);

        c.activate("class-1").unwrap();
        assert!(c.is_active());

        c.begin_stop(StopReason::UserQuit).unwrap();
        assert!(matches!(c.current_state(), SessionState::Stopping { .. }));

        let (id, reason) = c.finish_stop().unwrap();
        assert_eq!(id, "class-1");
        assert_eq!(reason, StopReason::UserQuit);
        assert_eq!(c.current_state(), &SessionState::Idle);
    }

    #[test]
    fn test_activate_rejects_empty_id() {
        let mut c = SessionController::new();
        assert_eq!(c.activate("  "), Err(SessionError::InvalidSessionId));
        assert_eq!(c.current_state(), &SessionState::Idle);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut c = SessionController::new();
        assert!(c.begin_stop(StopReason::BackendEnded).is_err());
        assert!(c.finish_stop().is_err());
        assert_eq!(c.current_state(), &SessionState::Idle);

        c.activate("a").unwrap();
        assert!(c.activate("b").is_err());
        assert!(c.finish_stop().is_err());
        assert!(c.is_active());
    }

    #[test]
    fn test_only_user_quit_notifies_backend() {
        assert!(StopReason::UserQuit.notifies_backend());
        assert!(!StopReason::BackendEnded.notifies_backend());
        assert!(!StopReason::BackendUnreachable.notifies_backend());
        assert!(!StopReason::CaptureFailed("eof".into()).notifies_backend());
    }

    #[test]
    fn test_watch_same_session_stays_active() {
        let mut w = SessionWatch::new("class-1", 3);
        assert_eq!(w.observe(Some(&active("class-1"))), SessionSignal::Active);
    }

    #[test]
    fn test_watch_detects_end_and_switch() {
        let mut w = SessionWatch::new("class-1", 3);
        assert_eq!(
            w.observe(Some(&BackendReport::Inactive)),
            SessionSignal::Stop(StopReason::BackendEnded)
        );
        assert_eq!(
            w.observe(Some(&active("class-2"))),
            SessionSignal::Stop(StopReason::BackendSwitched { active: "class-2".into() })
        );
    }

    #[test]
    fn test_watch_unidentified_session_keeps_running() {
        let mut w = SessionWatch::new("class-1", 2);
        assert_eq!(w.observe(None), SessionSignal::Active);
        assert_eq!(w.observe(Some(&BackendReport::ActiveUnidentified)), SessionSignal::Active);
        // Counts as a successful poll.
        assert_eq!(w.observe(None), SessionSignal::Active);
        assert_eq!(w.observe(Some(&BackendReport::ActiveUnidentified)), SessionSignal::Active);
    }

    #[test]
    fn test_watch_tolerates_isolated_failures() {
        let mut w = SessionWatch::new("class-1", 3);
        assert_eq!(w.observe(None), SessionSignal::Active);
        assert_eq!(w.observe(None), SessionSignal::Active);
        // A good poll resets the counter.
        assert_eq!(w.observe(Some(&active("class-1"))), SessionSignal::Active);
        assert_eq!(w.observe(None), SessionSignal::Active);
        assert_eq!(w.observe(None), SessionSignal::Active);
        assert_eq!(w.observe(None), SessionSignal::Stop(StopReason::BackendUnreachable));
    }

    #[test]
    fn test_watch_single_failure_limit() {
        let mut w = SessionWatch::new("class-1", 0);
        assert_eq!(w.observe(None), SessionSignal::Stop(StopReason::BackendUnreachable));
    }
}
