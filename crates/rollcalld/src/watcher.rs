//! Background cross-check of the running session against the backend.
//!
//! Polls `active-session` on a fixed interval and publishes the latest
//! [`SessionSignal`] through a `watch` channel. The frame loop reads the
//! channel without blocking; the watcher never touches session state.

use crate::backend::SessionSource;
use rollcall_core::{SessionSignal, SessionWatch};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Start watching `session_id`. The task ends after publishing a stop, or
/// once every receiver has been dropped.
pub fn spawn_watcher<B: SessionSource>(
    backend: Arc<B>,
    session_id: String,
    interval: Duration,
    max_failures: u32,
) -> (watch::Receiver<SessionSignal>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(SessionSignal::Active);

    let task = tokio::spawn(async move {
        let mut rule = SessionWatch::new(session_id.clone(), max_failures);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(session = %session_id, "watcher receiver dropped");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let report = match backend.get_active_session().await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!(error = %e, session = %session_id, "active-session poll failed");
                    None
                }
            };

            let signal = rule.observe(report.as_ref());
            if let SessionSignal::Stop(reason) = &signal {
                tracing::info!(session = %session_id, %reason, "watcher requesting stop");
                let _ = tx.send(signal);
                break;
            }
        }
    });

    (rx, task)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{AttendanceLog, AttendanceLogger, BackendError};
    use rollcall_core::session::ActiveSession;
    use rollcall_core::{BackendReport, StopReason};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted poll answers, then keeps answering `fallback`.
    pub(crate) struct ScriptedBackend {
        script: Mutex<VecDeque<Option<BackendReport>>>,
        fallback: Option<BackendReport>,
        pub(crate) polls: AtomicUsize,
        pub(crate) stopped: Mutex<Vec<String>>,
        reject_stop: bool,
    }

    impl ScriptedBackend {
        pub(crate) fn new(script: Vec<Option<BackendReport>>, fallback: Option<BackendReport>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                polls: AtomicUsize::new(0),
                stopped: Mutex::new(Vec::new()),
                reject_stop: false,
            }
        }

        /// Record stop notifications but answer each with an error.
        pub(crate) fn rejecting_stop(mut self) -> Self {
            self.reject_stop = true;
            self
        }
    }

    impl SessionSource for ScriptedBackend {
        async fn get_active_session(&self) -> Result<BackendReport, BackendError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next.unwrap_or_else(|| self.fallback.clone()) {
                Some(report) => Ok(report),
                None => Err(BackendError::Malformed("scripted outage".into())),
            }
        }

        async fn notify_session_stopped(&self, session_id: &str) -> Result<(), BackendError> {
            self.stopped.lock().unwrap().push(session_id.to_string());
            if self.reject_stop {
                return Err(BackendError::Status { status: 503, body: "unavailable".into() });
            }
            Ok(())
        }
    }

    impl AttendanceLogger for ScriptedBackend {
        async fn post_attendance(&self, _log: &AttendanceLog) -> Result<(), BackendError> {
            Ok(())
        }
    }

    pub(crate) fn active(id: &str) -> BackendReport {
        BackendReport::Active(ActiveSession {
            session_id: id.to_string(),
            roster: vec!["S1".to_string()],
            start_time: None,
        })
    }

    const TICK: Duration = Duration::from_millis(5);

    async fn stop_signal(mut rx: watch::Receiver<SessionSignal>) -> StopReason {
        let wait = async {
            loop {
                if let SessionSignal::Stop(reason) = rx.borrow_and_update().clone() {
                    return reason;
                }
                rx.changed().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    #[tokio::test]
    async fn test_backend_ended() {
        let backend = Arc::new(ScriptedBackend::new(
            vec![Some(active("c1")), Some(active("c1"))],
            Some(BackendReport::Inactive),
        ));
        let (rx, task) = spawn_watcher(backend.clone(), "c1".into(), TICK, 3);

        assert_eq!(stop_signal(rx).await, StopReason::BackendEnded);
        task.await.unwrap();
        assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backend_switched() {
        let backend = Arc::new(ScriptedBackend::new(vec![], Some(active("c2"))));
        let (rx, task) = spawn_watcher(backend, "c1".into(), TICK, 3);

        assert_eq!(
            stop_signal(rx).await,
            StopReason::BackendSwitched { active: "c2".into() }
        );
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_outage_is_tolerated() {
        // Two failures, recovery, two failures, then the session ends.
        let backend = Arc::new(ScriptedBackend::new(
            vec![None, None, Some(active("c1")), None, None],
            Some(BackendReport::Inactive),
        ));
        let (rx, task) = spawn_watcher(backend.clone(), "c1".into(), TICK, 3);

        assert_eq!(stop_signal(rx).await, StopReason::BackendEnded);
        task.await.unwrap();
        assert_eq!(backend.polls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_sustained_outage_stops() {
        let backend = Arc::new(ScriptedBackend::new(vec![Some(active("c1"))], None));
        let (rx, task) = spawn_watcher(backend.clone(), "c1".into(), TICK, 3);

        assert_eq!(stop_signal(rx).await, StopReason::BackendUnreachable);
        task.await.unwrap();
        assert_eq!(backend.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_dropping_receiver_ends_task() {
        let backend = Arc::new(ScriptedBackend::new(vec![], Some(active("c1"))));
        let (rx, task) = spawn_watcher(backend, "c1".into(), TICK, 3);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
