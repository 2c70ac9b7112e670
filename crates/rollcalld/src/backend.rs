//! HTTP client for the attendance API.
//!
//! Three endpoints under the configured base URL:
//! `GET active-session`, `POST stop-session` and `POST log`.

use chrono::{DateTime, FixedOffset};
use rollcall_core::session::{ActiveSession, BackendReport};
use rollcall_core::{AttendanceEvent, AttendanceStatus, IdentityProfile};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Source of active-session reports. Lets the watcher and supervisor run
/// against a fake in tests.
pub trait SessionSource: Send + Sync + 'static {
    fn get_active_session(&self) -> impl Future<Output = Result<BackendReport, BackendError>> + Send;

    fn notify_session_stopped(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Destination for attendance marks.
pub trait AttendanceLogger: Send + Sync + 'static {
    fn post_attendance(
        &self,
        log: &AttendanceLog,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Body of `POST log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceLog {
    pub class_id: String,
    pub student: StudentRef,
    pub status: AttendanceStatus,
    /// Local calendar date, `YYYY-MM-DD`.
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRef {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
}

impl AttendanceLog {
    pub fn from_event(event: &AttendanceEvent, profile: Option<&IdentityProfile>) -> Self {
        let profile = profile.cloned().unwrap_or_default();
        Self {
            class_id: event.session_id.clone(),
            student: StudentRef {
                student_id: event.identity_id.clone(),
                first_name: profile.first_name,
                last_name: profile.last_name,
            },
            status: event.status,
            date: local_date(event.timestamp),
        }
    }
}

fn local_date(ts: DateTime<FixedOffset>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

#[derive(Serialize)]
struct StopRequest<'a> {
    class_id: &'a str,
}

#[derive(Clone)]
pub struct SessionBackend {
    client: reqwest::Client,
    active_url: String,
    stop_url: String,
    log_url: String,
}

impl SessionBackend {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = api_base.trim_end_matches('/');
        Ok(Self {
            client,
            active_url: format!("{base}/active-session"),
            stop_url: format!("{base}/stop-session"),
            log_url: format!("{base}/log"),
        })
    }
}

impl AttendanceLogger for SessionBackend {
    /// Record one attendance mark. Not retried.
    async fn post_attendance(&self, log: &AttendanceLog) -> Result<(), BackendError> {
        let resp = self.client.post(&self.log_url).json(log).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}

impl SessionSource for SessionBackend {
    async fn get_active_session(&self) -> Result<BackendReport, BackendError> {
        let resp = self.client.get(&self.active_url).send().await?;
        let body: Value = check_status(resp).await?.json().await?;
        parse_active_response(&body)
    }

    async fn notify_session_stopped(&self, session_id: &str) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(&self.stop_url)
            .json(&StopRequest { class_id: session_id })
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status { status, body })
}

/// Interpret an `active-session` body.
///
/// `{"active": false}` is inactive. An active body carries either a full
/// `class` object (`class_id`, `students[].student_id`,
/// `attendance_start_time`) or just a top-level `class_id`; one that names
/// no class is [`BackendReport::ActiveUnidentified`].
pub fn parse_active_response(body: &Value) -> Result<BackendReport, BackendError> {
    if !body.get("active").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(BackendReport::Inactive);
    }

    if let Some(class) = body.get("class").filter(|c| c.is_object()) {
        let Some(session_id) = id_string(class.get("class_id")) else {
            return Ok(BackendReport::ActiveUnidentified);
        };
        let roster = class
            .get("students")
            .and_then(Value::as_array)
            .map(|students| {
                students
                    .iter()
                    .filter_map(|s| id_string(s.get("student_id")))
                    .collect()
            })
            .unwrap_or_default();
        let start_time = class
            .get("attendance_start_time")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string);

        return Ok(BackendReport::Active(ActiveSession {
            session_id,
            roster,
            start_time,
        }));
    }

    match id_string(body.get("class_id")) {
        Some(session_id) => Ok(BackendReport::Active(ActiveSession {
            session_id,
            roster: Vec::new(),
            start_time: None,
        })),
        None => Ok(BackendReport::ActiveUnidentified),
    }
}

/// Ids may arrive as strings or numbers.
fn id_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_inactive() {
        assert_eq!(parse_active_response(&json!({"active": false})).unwrap(), BackendReport::Inactive);
        assert_eq!(parse_active_response(&json!({})).unwrap(), BackendReport::Inactive);
    }

    #[test]
    fn test_parse_full_class() {
        let body = json!({
            "active": true,
            "class": {
                "class_id": "CS101-A",
                "students": [{"student_id": "S1"}, {"student_id": "S2"}, {"name": "no id"}],
                "attendance_start_time": "2025-03-10T08:00:00"
            }
        });
        let BackendReport::Active(active) = parse_active_response(&body).unwrap() else {
            panic!("expected active");
        };
        assert_eq!(active.session_id, "CS101-A");
        assert_eq!(active.roster, vec!["S1".to_string(), "S2".to_string()]);
        assert_eq!(active.start_time.as_deref(), Some("2025-03-10T08:00:00"));
    }

    #[test]
    fn test_parse_bare_class_id() {
        let body = json!({"active": true, "class_id": 42});
        let BackendReport::Active(active) = parse_active_response(&body).unwrap() else {
            panic!("expected active");
        };
        assert_eq!(active.session_id, "42");
        assert!(active.roster.is_empty());
        assert!(active.start_time.is_none());
    }

    #[test]
    fn test_parse_active_without_id_is_unidentified() {
        assert_eq!(
            parse_active_response(&json!({"active": true})).unwrap(),
            BackendReport::ActiveUnidentified
        );
        assert_eq!(
            parse_active_response(&json!({"active": true, "class": {"students": []}})).unwrap(),
            BackendReport::ActiveUnidentified
        );
        assert_eq!(
            parse_active_response(&json!({"active": true, "class_id": ""})).unwrap(),
            BackendReport::ActiveUnidentified
        );
    }

    #[test]
    fn test_attendance_log_payload() {
        let ts = FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 10, 23, 59, 0)
            .unwrap();
        let event = AttendanceEvent {
            session_id: "CS101-A".into(),
            identity_id: "S1".into(),
            status: AttendanceStatus::Late,
            timestamp: ts,
        };
        let profile = IdentityProfile { first_name: "Ana".into(), last_name: "Cruz".into() };

        let body = serde_json::to_value(AttendanceLog::from_event(&event, Some(&profile))).unwrap();
        assert_eq!(
            body,
            json!({
                "class_id": "CS101-A",
                "student": {"student_id": "S1", "first_name": "Ana", "last_name": "Cruz"},
                "status": "Late",
                "date": "2025-03-10"
            })
        );
    }

    #[test]
    fn test_attendance_log_without_profile() {
        let event = AttendanceEvent {
            session_id: "c".into(),
            identity_id: "S9".into(),
            status: AttendanceStatus::Present,
            timestamp: FixedOffset::east_opt(0).unwrap().with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
        };
        let log = AttendanceLog::from_event(&event, None);
        assert_eq!(log.student.first_name, "");
        assert_eq!(log.date, "2025-01-02");
    }

    #[test]
    fn test_endpoint_urls() {
        let backend = SessionBackend::new("http://host:5000/api/attendance/", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.active_url, "http://host:5000/api/attendance/active-session");
        assert_eq!(backend.stop_url, "http://host:5000/api/attendance/stop-session");
        assert_eq!(backend.log_url, "http://host:5000/api/attendance/log");
    }
}
