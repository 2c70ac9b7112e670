//! Greedy IoU multi-face tracker.
//!
//! Associates each frame's detections with the tracks from previous frames
//! by bounding-box overlap. Tracks carry the cached outcome of their last
//! liveness/identity evaluation so the frame loop can keep rendering a
//! label between evaluations.

use crate::attendance::AttendanceStatus;
use crate::types::{BoundingBox, Detection, IdentityId, TrackId};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const DEFAULT_IOU_MATCH_THRESHOLD: f32 = 0.30;
pub const DEFAULT_TRACK_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_MIN_FACE_SIZE: f32 = 60.0;
pub const DEFAULT_MAX_FACES: usize = 8;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue an existing track.
    pub iou_match_threshold: f32,
    /// Tracks unseen for longer than this are dropped.
    pub track_timeout: Duration,
    /// Detections narrower or shorter than this (pixels) are ignored.
    pub min_face_size: f32,
    /// Only the largest `max_faces` detections per frame are tracked.
    pub max_faces: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_match_threshold: DEFAULT_IOU_MATCH_THRESHOLD,
            track_timeout: DEFAULT_TRACK_TIMEOUT,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            max_faces: DEFAULT_MAX_FACES,
        }
    }
}

/// Color tag used when drawing a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackColor {
    Pending,
    Spoof,
    Unknown,
    Present,
    Late,
}

impl TrackColor {
    pub fn rgb(self) -> [u8; 3] {
        match self {
            TrackColor::Pending => [200, 200, 200],
            TrackColor::Spoof => [255, 0, 0],
            TrackColor::Unknown => [200, 200, 0],
            TrackColor::Present => [60, 200, 40],
            TrackColor::Late => [255, 255, 0],
        }
    }
}

/// Cached result of the last evaluation of a track.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Not evaluated yet.
    Pending,
    /// Failed the liveness check.
    Spoof,
    /// Live, but no enrolled identity within the match threshold.
    Unknown,
    Recognized {
        identity: IdentityId,
        name: String,
        status: AttendanceStatus,
    },
}

impl Verdict {
    pub fn label(&self) -> String {
        match self {
            Verdict::Pending => "…".to_string(),
            Verdict::Spoof => "Spoof".to_string(),
            Verdict::Unknown => "Unknown".to_string(),
            Verdict::Recognized { name, status, .. } => format!("{name} ({status})"),
        }
    }

    pub fn color(&self) -> TrackColor {
        match self {
            Verdict::Pending => TrackColor::Pending,
            Verdict::Spoof => TrackColor::Spoof,
            Verdict::Unknown => TrackColor::Unknown,
            Verdict::Recognized { status: AttendanceStatus::Present, .. } => TrackColor::Present,
            Verdict::Recognized { status: AttendanceStatus::Late, .. } => TrackColor::Late,
        }
    }

    pub fn matched_identity(&self) -> Option<&str> {
        match self {
            Verdict::Recognized { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

/// A face hypothesis maintained across frames.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub bbox: BoundingBox,
    pub last_seen: Instant,
    /// `None` until the first evaluation.
    pub last_eval: Option<Instant>,
    pub verdict: Verdict,
}

/// A detection paired with the track it was assigned to this frame.
#[derive(Debug, Clone)]
pub struct Association {
    pub track_id: TrackId,
    pub detection: Detection,
}

pub struct Tracker {
    config: TrackerConfig,
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Feed one frame's detections.
    ///
    /// Filters and caps the detections, greedily pairs them with existing
    /// tracks, spawns tracks for the leftovers, then evicts stale tracks.
    /// Returns every kept detection with its track id, largest face first.
    pub fn update(&mut self, detections: Vec<Detection>, now: Instant) -> Vec<Association> {
        let detections = self.select(detections);

        let mut unmatched: Vec<bool> = vec![true; detections.len()];
        let mut assigned: Vec<Option<TrackId>> = vec![None; detections.len()];

        // BTreeMap iteration is ascending by id, so older tracks pick first.
        for (&id, track) in self.tracks.iter_mut() {
            let mut best_iou = 0.0f32;
            let mut best_idx: Option<usize> = None;

            for (i, det) in detections.iter().enumerate() {
                if !unmatched[i] {
                    continue;
                }
                let iou = track.bbox.iou(&det.bbox);
                if iou > best_iou {
                    best_iou = iou;
                    best_idx = Some(i);
                }
            }

            if let Some(i) = best_idx {
                if best_iou >= self.config.iou_match_threshold {
                    unmatched[i] = false;
                    assigned[i] = Some(id);
                    track.bbox = detections[i].bbox;
                    track.last_seen = now;
                }
            }
        }

        for (i, det) in detections.iter().enumerate() {
            if !unmatched[i] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(
                id,
                Track {
                    id,
                    bbox: det.bbox,
                    last_seen: now,
                    last_eval: None,
                    verdict: Verdict::Pending,
                },
            );
            assigned[i] = Some(id);
            tracing::debug!(track = id, "track created");
        }

        self.evict(now);

        detections
            .into_iter()
            .zip(assigned)
            .filter_map(|(detection, track_id)| {
                let track_id = track_id?;
                self.tracks
                    .contains_key(&track_id)
                    .then_some(Association { track_id, detection })
            })
            .collect()
    }

    /// Drop size-filtered detections and keep the `max_faces` largest.
    fn select(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let min = self.config.min_face_size;
        let mut kept: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.bbox.width() >= min && d.bbox.height() >= min)
            .collect();

        // Stable sort keeps detector order among equal areas.
        kept.sort_by(|a, b| {
            b.bbox
                .area()
                .partial_cmp(&a.bbox.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        kept.truncate(self.config.max_faces);
        kept
    }

    fn evict(&mut self, now: Instant) {
        let timeout = self.config.track_timeout;
        let before = self.tracks.len();
        self.tracks
            .retain(|_, t| now.saturating_duration_since(t.last_seen) <= timeout);
        let dropped = before - self.tracks.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = self.tracks.len(), "stale tracks evicted");
        }
    }

    /// Store a fresh evaluation result on a live track.
    ///
    /// Returns `false` if the track no longer exists.
    pub fn record_verdict(&mut self, id: TrackId, verdict: Verdict, now: Instant) -> bool {
        match self.tracks.get_mut(&id) {
            Some(track) => {
                track.verdict = verdict;
                track.last_eval = Some(now);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn tracks(&self) -> &BTreeMap<TrackId, Track> {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
