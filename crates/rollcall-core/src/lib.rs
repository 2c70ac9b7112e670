//! rollcall-core: face tracking and attendance decisions.
//!
//! Tracks faces across frames, gates liveness and identity evaluation per
//! track, matches ArcFace embeddings against the session roster and decides
//! Present/Late once per identity. SCRFD, ArcFace and the anti-spoofing
//! classifier run on ONNX Runtime.

pub mod alignment;
pub mod analyzer;
pub mod attendance;
pub mod detector;
pub mod embedder;
pub mod gate;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod session;
pub mod tracker;
pub mod types;

pub use attendance::{AttendanceEvent, AttendanceSession, AttendanceStatus};
pub use matcher::{EmbeddingBank, Matcher, NearestNeighborMatcher};
pub use pipeline::{EventSink, FaceAnalyzer, IdentityDirectory, LivenessClassifier, Pipeline};
pub use session::{BackendReport, SessionController, SessionSignal, SessionWatch, StopReason};
pub use tracker::{Track, Tracker, Verdict};
pub use types::{
    BoundingBox, Detection, Embedding, IdentityId, IdentityProfile, TrackId, EMBEDDING_DIM,
};
