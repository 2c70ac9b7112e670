//! Fire-and-forget delivery of attendance marks.
//!
//! The frame loop hands events to [`EventQueue`] without waiting; a tokio
//! task posts them to the backend one at a time. Failed posts are logged
//! and dropped.

use crate::backend::{AttendanceLog, AttendanceLogger};
use rollcall_core::{AttendanceEvent, EventSink, IdentityProfile};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

pub const EVENT_QUEUE_DEPTH: usize = 64;

/// Sending half handed to the frame loop.
pub struct EventQueue {
    tx: mpsc::Sender<AttendanceLog>,
}

impl EventSink for EventQueue {
    fn emit(&mut self, event: AttendanceEvent, profile: Option<IdentityProfile>) {
        let log = AttendanceLog::from_event(&event, profile.as_ref());
        match self.tx.try_send(log) {
            Ok(()) => {}
            Err(TrySendError::Full(log)) => {
                tracing::warn!(student = %log.student.student_id, "event queue full; attendance mark dropped");
            }
            Err(TrySendError::Closed(log)) => {
                tracing::warn!(student = %log.student.student_id, "poster gone; attendance mark dropped");
            }
        }
    }
}

/// Start the poster. The task ends once the queue is dropped and drained,
/// returning how many marks the backend accepted.
pub fn spawn_poster<L: AttendanceLogger>(logger: Arc<L>) -> (EventQueue, JoinHandle<usize>) {
    let (tx, mut rx) = mpsc::channel::<AttendanceLog>(EVENT_QUEUE_DEPTH);

    let task = tokio::spawn(async move {
        let mut delivered = 0usize;
        while let Some(log) = rx.recv().await {
            match logger.post_attendance(&log).await {
                Ok(()) => {
                    delivered += 1;
                    tracing::info!(
                        class = %log.class_id,
                        student = %log.student.student_id,
                        status = %log.status,
                        "attendance posted"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        student = %log.student.student_id,
                        "failed to post attendance"
                    );
                }
            }
        }
        delivered
    });

    (EventQueue { tx }, task)
}
