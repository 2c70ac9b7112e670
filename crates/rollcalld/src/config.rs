use chrono::{Duration as ChronoDuration, FixedOffset, Offset, Utc};
use rollcall_core::liveness::{LivenessConfig, DEFAULT_LIVENESS_THRESHOLD};
use rollcall_core::pipeline::{PipelineConfig, DEFAULT_CROP_PAD_RATIO, DEFAULT_DETECT_EVERY_N};
use rollcall_core::tracker::TrackerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted grace period (one year).
const MAX_GRACE_PERIOD_SECS: i64 = 365 * 24 * 3600;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the attendance API (no trailing slash).
    pub api_base: String,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database holding enrolled embeddings.
    pub db_path: PathBuf,
    /// Seconds between active-session polls.
    pub poll_interval_secs: u64,
    pub http_timeout_secs: u64,
    /// Consecutive failed polls before a running session is stopped.
    pub max_poll_failures: u32,
    /// Cosine distance below which a probe matches.
    pub match_threshold: f32,
    pub liveness_threshold: f32,
    pub liveness_double_check: bool,
    pub detect_every_n: u32,
    pub max_faces: usize,
    pub min_face_size: f32,
    pub iou_match_threshold: f32,
    pub track_timeout_ms: u64,
    pub track_cooldown_ms: u64,
    /// Seconds after the session start before arrivals count as Late.
    pub grace_period_secs: i64,
    /// Offset of local wall-clock time from UTC, in hours.
    pub utc_offset_hours: i32,
    pub crop_pad_ratio: f32,
    /// Write annotated frames here; headless when unset.
    pub snapshot_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.db"));

        Self {
            api_base: std::env::var("ROLLCALL_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:5000/api/attendance".to_string()),
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            db_path,
            poll_interval_secs: env_parse("ROLLCALL_POLL_INTERVAL_SECS", 5),
            http_timeout_secs: env_parse("ROLLCALL_HTTP_TIMEOUT_SECS", 5),
            max_poll_failures: env_parse("ROLLCALL_MAX_POLL_FAILURES", 3),
            match_threshold: env_parse("ROLLCALL_MATCH_THRESHOLD", 0.55),
            liveness_threshold: env_parse("ROLLCALL_LIVENESS_THRESHOLD", DEFAULT_LIVENESS_THRESHOLD),
            liveness_double_check: std::env::var("ROLLCALL_LIVENESS_DOUBLE_CHECK")
                .map(|v| v != "0")
                .unwrap_or(true),
            detect_every_n: env_parse("ROLLCALL_DETECT_EVERY_N", DEFAULT_DETECT_EVERY_N),
            max_faces: env_parse("ROLLCALL_MAX_FACES", 8),
            min_face_size: env_parse("ROLLCALL_MIN_FACE_SIZE", 60.0),
            iou_match_threshold: env_parse("ROLLCALL_IOU_MATCH_THRESHOLD", 0.30),
            track_timeout_ms: env_parse("ROLLCALL_TRACK_TIMEOUT_MS", 1500),
            track_cooldown_ms: env_parse("ROLLCALL_TRACK_COOLDOWN_MS", 750),
            grace_period_secs: env_parse("ROLLCALL_GRACE_PERIOD_SECS", 120),
            utc_offset_hours: env_parse("ROLLCALL_UTC_OFFSET_HOURS", 8),
            crop_pad_ratio: env_parse("ROLLCALL_CROP_PAD_RATIO", DEFAULT_CROP_PAD_RATIO),
            snapshot_path: std::env::var("ROLLCALL_SNAPSHOT_PATH")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn grace_period(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.grace_period_secs.clamp(0, MAX_GRACE_PERIOD_SECS))
    }

    /// Local offset; out-of-range values fall back to UTC.
    pub fn local_offset(&self) -> FixedOffset {
        let seconds = self.utc_offset_hours.checked_mul(3600);
        seconds.and_then(FixedOffset::east_opt).unwrap_or_else(|| {
            tracing::warn!(hours = self.utc_offset_hours, "invalid UTC offset; using UTC");
            Utc.fix()
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            tracker: TrackerConfig {
                iou_match_threshold: self.iou_match_threshold,
                track_timeout: Duration::from_millis(self.track_timeout_ms),
                min_face_size: self.min_face_size,
                max_faces: self.max_faces,
            },
            cooldown: Duration::from_millis(self.track_cooldown_ms),
            match_threshold: self.match_threshold,
            crop_pad_ratio: self.crop_pad_ratio,
            detect_every_n: self.detect_every_n.max(1),
        }
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            threshold: self.liveness_threshold,
            double_check: self.liveness_double_check,
            heuristics: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("ROLLCALL_TEST_PARSE_GARBAGE", "not-a-number");
        assert_eq!(env_parse("ROLLCALL_TEST_PARSE_GARBAGE", 7u64), 7);
        std::env::set_var("ROLLCALL_TEST_PARSE_OK", " 12 ");
        assert_eq!(env_parse("ROLLCALL_TEST_PARSE_OK", 7u64), 12);
        assert_eq!(env_parse("ROLLCALL_TEST_PARSE_UNSET", 0.5f32), 0.5);
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::from_env();
        config.utc_offset_hours = 8;
        config.track_cooldown_ms = 750;
        config.detect_every_n = 0;
        config.grace_period_secs = 120;

        assert_eq!(config.local_offset().local_minus_utc(), 8 * 3600);
        assert_eq!(config.grace_period(), ChronoDuration::seconds(120));

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.cooldown, Duration::from_millis(750));
        assert_eq!(pipeline.detect_every_n, 1);

        config.utc_offset_hours = 99;
        assert_eq!(config.local_offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_extreme_values_do_not_panic() {
        let mut config = Config::from_env();
        config.utc_offset_hours = i32::MAX;
        assert_eq!(config.local_offset().local_minus_utc(), 0);
        config.utc_offset_hours = i32::MIN;
        assert_eq!(config.local_offset().local_minus_utc(), 0);

        config.grace_period_secs = i64::MAX;
        assert_eq!(config.grace_period(), ChronoDuration::seconds(MAX_GRACE_PERIOD_SECS));
        config.grace_period_secs = -5;
        assert_eq!(config.grace_period(), ChronoDuration::zero());
    }
}
