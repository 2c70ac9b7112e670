//! Present/Late decisions and per-session deduplication.

use crate::types::IdentityId;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub const DEFAULT_GRACE_PERIOD_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Late,
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceStatus::Present => f.write_str("Present"),
            AttendanceStatus::Late => f.write_str("Late"),
        }
    }
}

/// Outbound business event, emitted at most once per identity per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub session_id: String,
    pub identity_id: IdentityId,
    pub status: AttendanceStatus,
    pub timestamp: DateTime<FixedOffset>,
}

/// State for one active attendance session.
#[derive(Debug, Clone)]
pub struct AttendanceSession {
    session_id: String,
    started_at: Option<DateTime<FixedOffset>>,
    grace_period: Duration,
    recognized: HashSet<IdentityId>,
}

impl AttendanceSession {
    pub fn new(
        session_id: impl Into<String>,
        started_at: Option<DateTime<FixedOffset>>,
        grace_period: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            started_at,
            grace_period,
            recognized: HashSet::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> Option<DateTime<FixedOffset>> {
        self.started_at
    }

    /// Late once `now` is strictly past `started_at + grace_period`.
    /// Without a known start time (or a deadline past the calendar's end)
    /// everyone is Present.
    pub fn status_at(&self, now: DateTime<FixedOffset>) -> AttendanceStatus {
        let deadline = self
            .started_at
            .and_then(|start| start.checked_add_signed(self.grace_period));
        match deadline {
            Some(deadline) if now > deadline => AttendanceStatus::Late,
            _ => AttendanceStatus::Present,
        }
    }

    /// Record an accepted identity match.
    ///
    /// Returns the event for the first acceptance of `identity` in this
    /// session and `None` for every later one. This is the only place the
    /// recognized set is written.
    pub fn decide(&mut self, identity: &str, now: DateTime<FixedOffset>) -> Option<AttendanceEvent> {
        if self.recognized.contains(identity) {
            return None;
        }
        let status = self.status_at(now);
        self.recognized.insert(identity.to_string());

        Some(AttendanceEvent {
            session_id: self.session_id.clone(),
            identity_id: identity.to_string(),
            status,
            timestamp: now,
        })
    }

    pub fn is_recognized(&self, identity: &str) -> bool {
        self.recognized.contains(identity)
    }

    pub fn recognized_count(&self) -> usize {
        self.recognized.len()
    }
}

/// Parse a backend-supplied session start time.
///
/// Accepts RFC 3339, RFC 2822 (the HTTP date form), and naive
/// `YYYY-MM-DD[T ]HH:MM:SS[.f]` timestamps; naive values are taken to be in
/// `local`. Returns `None` when nothing matches.
pub fn parse_start_time(raw: &str, local: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&local));
    }
    // "Tue, 15 Nov 1994 08:12:31 GMT"
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&local));
    }

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| local.from_local_datetime(&naive).single())
}
