//! SCRFD + ArcFace bundled behind [`FaceAnalyzer`].

use crate::detector::{DetectorError, ScrfdDetector};
use crate::embedder::{ArcFaceEmbedder, EmbedderError};
use crate::pipeline::FaceAnalyzer;
use crate::types::Detection;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const EMBEDDER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

pub struct OnnxFaceAnalyzer {
    detector: ScrfdDetector,
    embedder: ArcFaceEmbedder,
}

impl OnnxFaceAnalyzer {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = ScrfdDetector::load(&model_dir.join(DETECTOR_MODEL_FILE).to_string_lossy())?;
        let embedder =
            ArcFaceEmbedder::load(&model_dir.join(EMBEDDER_MODEL_FILE).to_string_lossy())?;
        Ok(Self { detector, embedder })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    type Error = AnalyzerError;

    /// Detect faces and embed each one. A face whose embedding fails is
    /// still returned, without an embedding, so it can be tracked.
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, AnalyzerError> {
        let faces = self.detector.detect(frame)?;

        Ok(faces
            .into_iter()
            .map(|face| {
                let embedding = match self.embedder.embed(frame, &face.landmarks) {
                    Ok(e) => Some(e),
                    Err(e) => {
                        tracing::debug!(error = %e, score = face.score, "embedding failed for face");
                        None
                    }
                };
                Detection {
                    bbox: face.bbox,
                    score: face.score,
                    landmarks: Some(face.landmarks),
                    embedding,
                }
            })
            .collect())
    }
}
