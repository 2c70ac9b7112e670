//! Per-frame attendance pipeline.
//!
//! One call to [`Pipeline::process`] runs, in order: detection (or reuse of
//! the previous detections), association, eviction, cooldown-gated
//! liveness + identity evaluation, and the attendance decision. Rendering
//! happens afterwards from [`Pipeline::tracks`].

use crate::attendance::{AttendanceEvent, AttendanceSession};
use crate::gate::{EvaluationGate, DEFAULT_TRACK_COOLDOWN};
use crate::liveness::LivenessScore;
use crate::matcher::{EmbeddingBank, Matcher, NearestNeighborMatcher, DEFAULT_MATCH_THRESHOLD};
use crate::tracker::{Track, Tracker, TrackerConfig, Verdict};
use crate::types::{Detection, IdentityId, IdentityProfile, TrackId};
use chrono::{DateTime, FixedOffset};
use image::{imageops, RgbImage};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::time::{Duration, Instant};

pub const DEFAULT_DETECT_EVERY_N: u32 = 2;
pub const DEFAULT_CROP_PAD_RATIO: f32 = 0.10;

/// Produces detections (box + embedding) for a frame.
pub trait FaceAnalyzer {
    type Error: Display;

    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, Self::Error>;
}

/// Decides whether a face crop shows a live person.
pub trait LivenessClassifier {
    type Error: Display;

    fn check(&mut self, face: &RgbImage) -> Result<LivenessScore, Self::Error>;
}

/// Resolves identities to display names.
pub trait IdentityDirectory {
    fn lookup(&self, identity: &str) -> Option<IdentityProfile>;
}

impl IdentityDirectory for HashMap<IdentityId, IdentityProfile> {
    fn lookup(&self, identity: &str) -> Option<IdentityProfile> {
        self.get(identity).cloned()
    }
}

/// Receives attendance events. Must not block.
pub trait EventSink {
    fn emit(&mut self, event: AttendanceEvent, profile: Option<IdentityProfile>);
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tracker: TrackerConfig,
    pub cooldown: Duration,
    pub match_threshold: f32,
    /// Extra margin around a face box when cropping for liveness.
    pub crop_pad_ratio: f32,
    /// Run the detector on every Nth frame and reuse its output in between.
    pub detect_every_n: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            cooldown: DEFAULT_TRACK_COOLDOWN,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            crop_pad_ratio: DEFAULT_CROP_PAD_RATIO,
            detect_every_n: DEFAULT_DETECT_EVERY_N,
        }
    }
}

/// What happened during one frame.
#[derive(Debug, Default)]
pub struct FrameReport {
    /// Faces kept after size filtering and the per-frame cap.
    pub faces: usize,
    /// Tracks that went through liveness + matching.
    pub evaluated: usize,
    pub events: Vec<AttendanceEvent>,
}

pub struct Pipeline<A, L, D> {
    analyzer: A,
    liveness: L,
    directory: D,
    tracker: Tracker,
    gate: EvaluationGate,
    matcher: NearestNeighborMatcher,
    bank: EmbeddingBank,
    session: AttendanceSession,
    config: PipelineConfig,
    frame_index: u64,
    last_detections: Option<Vec<Detection>>,
}

impl<A, L, D> Pipeline<A, L, D>
where
    A: FaceAnalyzer,
    L: LivenessClassifier,
    D: IdentityDirectory,
{
    pub fn new(
        analyzer: A,
        liveness: L,
        directory: D,
        bank: EmbeddingBank,
        session: AttendanceSession,
        config: PipelineConfig,
    ) -> Self {
        Self {
            analyzer,
            liveness,
            directory,
            tracker: Tracker::new(config.tracker.clone()),
            gate: EvaluationGate::new(config.cooldown),
            matcher: NearestNeighborMatcher,
            bank,
            session,
            config,
            frame_index: 0,
            last_detections: None,
        }
    }

    /// Process one frame.
    ///
    /// `now` drives tracking and cooldowns; `wall` is the local wall-clock
    /// time used for the Present/Late rule and event timestamps.
    pub fn process<S: EventSink>(
        &mut self,
        frame: &RgbImage,
        now: Instant,
        wall: DateTime<FixedOffset>,
        sink: &mut S,
    ) -> FrameReport {
        self.frame_index += 1;
        let detections = self.detections_for(frame);

        let associations = self.tracker.update(detections, now);
        let mut report = FrameReport {
            faces: associations.len(),
            ..FrameReport::default()
        };

        for assoc in associations {
            let due = self
                .tracker
                .get(assoc.track_id)
                .is_some_and(|t| self.gate.should_evaluate(t, now));
            if !due {
                continue;
            }

            let Some(verdict) = self.evaluate(frame, &assoc.detection, wall, sink, &mut report)
            else {
                continue;
            };
            tracing::debug!(track = assoc.track_id, label = %verdict.label(), "track evaluated");
            self.tracker.record_verdict(assoc.track_id, verdict, now);
            report.evaluated += 1;
        }

        report
    }

    fn detections_for(&mut self, frame: &RgbImage) -> Vec<Detection> {
        let every = u64::from(self.config.detect_every_n.max(1));
        if let Some(cached) = &self.last_detections {
            if self.frame_index % every != 0 {
                return cached.clone();
            }
        }

        let fresh = match self.analyzer.analyze(frame) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, frame = self.frame_index, "face analysis failed; no detections this frame");
                Vec::new()
            }
        };
        self.last_detections = Some(fresh.clone());
        fresh
    }

    /// Liveness, then identity, then the attendance decision.
    ///
    /// Returns `None` when the face crop is empty and the track should keep
    /// its previous verdict.
    fn evaluate<S: EventSink>(
        &mut self,
        frame: &RgbImage,
        detection: &Detection,
        wall: DateTime<FixedOffset>,
        sink: &mut S,
        report: &mut FrameReport,
    ) -> Option<Verdict> {
        let rect = detection
            .bbox
            .square_crop(self.config.crop_pad_ratio, frame.width(), frame.height())?;
        let crop = imageops::crop_imm(frame, rect.x, rect.y, rect.width, rect.height).to_image();

        let live = match self.liveness.check(&crop) {
            Ok(score) => score.is_live,
            Err(e) => {
                tracing::warn!(error = %e, "liveness check failed; treating face as spoof");
                false
            }
        };
        if !live {
            return Some(Verdict::Spoof);
        }

        let Some(embedding) = detection.embedding.as_ref() else {
            return Some(Verdict::Unknown);
        };
        let Some(found) = self
            .matcher
            .best_match(embedding, &self.bank, self.config.match_threshold)
        else {
            return Some(Verdict::Unknown);
        };

        let profile = self.directory.lookup(&found.identity);
        let name = profile
            .as_ref()
            .map(|p| p.display_name(&found.identity))
            .unwrap_or_else(|| found.identity.clone());
        let status = self.session.status_at(wall);

        if let Some(event) = self.session.decide(&found.identity, wall) {
            tracing::info!(
                identity = %event.identity_id,
                name = %name,
                status = %event.status,
                distance = found.distance,
                "attendance marked"
            );
            sink.emit(event.clone(), profile);
            report.events.push(event);
        }

        Some(Verdict::Recognized {
            identity: found.identity,
            name,
            status,
        })
    }

    pub fn tracks(&self) -> &BTreeMap<TrackId, Track> {
        self.tracker.tracks()
    }

    pub fn session(&self) -> &AttendanceSession {
        &self.session
    }

    pub fn bank(&self) -> &EmbeddingBank {
        &self.bank
    }
}
