//! Passive anti-spoofing on a single face crop.
//!
//! An ONNX binary classifier yields P(real); borderline scores must also
//! pass cheap image heuristics (sharpness, saturation, glare, margin) that
//! catch common screen-replay and print attacks.

use crate::pipeline::LivenessClassifier;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LIVENESS_INPUT_SIZE: u32 = 256;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Scores this far above the threshold skip the heuristics.
const CONFIDENT_MARGIN: f32 = 0.15;
/// Crops are resized to this square before the heuristics; the thresholds
/// below are calibrated at this size.
const HEURISTIC_SIZE: u32 = 128;
const MIN_SHARPNESS: f32 = 140.0;
const MAX_MEAN_SATURATION: f32 = 150.0;
const GLARE_LEVEL: f32 = 180.0;
const MIN_DECISION_MARGIN: f32 = 0.30;

pub const LIVENESS_MODEL_FILE: &str = "anti_spoof.onnx";
pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.80;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face crop")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessScore {
    pub is_live: bool,
    /// Classifier probability that the face is real, in [0, 1].
    pub p_real: f32,
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Minimum P(real) to accept a face as live.
    pub threshold: f32,
    /// Average two forward passes.
    pub double_check: bool,
    /// Apply image heuristics to non-confident accepts.
    pub heuristics: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_LIVENESS_THRESHOLD,
            double_check: true,
            heuristics: true,
        }
    }
}

pub struct OnnxLiveness {
    session: Session,
    config: LivenessConfig,
}

impl OnnxLiveness {
    pub fn load(model_path: &str, config: LivenessConfig) -> Result<Self, LivenessError> {
        if !Path::new(model_path).exists() {
            return Err(LivenessError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            threshold = config.threshold,
            double_check = config.double_check,
            "loaded liveness model"
        );

        Ok(Self { session, config })
    }

    fn forward(&mut self, input: &Array4<f32>) -> Result<f32, LivenessError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LivenessError::InferenceFailed(format!("logits: {e}")))?;
        prob_real(logits)
    }
}

impl LivenessClassifier for OnnxLiveness {
    type Error = LivenessError;

    fn check(&mut self, face: &RgbImage) -> Result<LivenessScore, LivenessError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(LivenessError::EmptyCrop);
        }
        let input = preprocess(face);

        let mut p_real = self.forward(&input)?;
        if self.config.double_check {
            p_real = 0.5 * (p_real + self.forward(&input)?);
        }

        let score = decide(face, p_real, &self.config);
        tracing::debug!(p_real, is_live = score.is_live, "liveness checked");
        Ok(score)
    }
}

/// Combine the model score with the heuristics per `config`.
fn decide(face: &RgbImage, p_real: f32, config: &LivenessConfig) -> LivenessScore {
    let mut is_live = p_real >= config.threshold;
    if is_live && config.heuristics && p_real < config.threshold + CONFIDENT_MARGIN {
        let small = imageops::resize(face, HEURISTIC_SIZE, HEURISTIC_SIZE, FilterType::Triangle);
        is_live = heuristics_pass(&small, p_real);
    }
    LivenessScore { is_live, p_real }
}

/// One logit -> sigmoid; two logits -> softmax over [spoof, real].
fn prob_real(logits: &[f32]) -> Result<f32, LivenessError> {
    match logits {
        [logit] => Ok(1.0 / (1.0 + (-logit).exp())),
        [spoof, real] => {
            let max = spoof.max(*real);
            let (es, er) = ((spoof - max).exp(), (real - max).exp());
            Ok(er / (es + er))
        }
        other => Err(LivenessError::InferenceFailed(format!(
            "expected 1 or 2 logits, got {}",
            other.len()
        ))),
    }
}

/// Resize to 256x256 and apply ImageNet normalization.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(face, LIVENESS_INPUT_SIZE, LIVENESS_INPUT_SIZE, FilterType::Triangle);
    let size = LIVENESS_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor
}

fn heuristics_pass(face: &RgbImage, p_real: f32) -> bool {
    let sharp = laplacian_variance(face);
    let saturation = mean_saturation(face);
    let [mean_r, mean_g, _] = mean_rgb(face);
    let margin = (2.0 * p_real - 1.0).abs();

    let texture_ok = sharp >= MIN_SHARPNESS;
    let saturation_ok = saturation < MAX_MEAN_SATURATION;
    let color_ok = !(mean_g > GLARE_LEVEL && mean_r > GLARE_LEVEL);
    let margin_ok = margin >= MIN_DECISION_MARGIN;

    tracing::debug!(sharp, saturation, margin, texture_ok, saturation_ok, color_ok, "liveness heuristics");
    texture_ok && saturation_ok && color_ok && margin_ok
}

fn luma(p: &image::Rgb<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

/// Variance of the 4-neighbour Laplacian over the grayscale crop.
fn laplacian_variance(face: &RgbImage) -> f32 {
    let (w, h) = face.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let gray: Vec<f32> = face.pixels().map(luma).collect();
    let at = |x: u32, y: u32| gray[(y * w + x) as usize];

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap as f64;
            sum_sq += (lap as f64) * (lap as f64);
            n += 1;
        }
    }
    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean) as f32
}

/// Mean HSV saturation on a 0–255 scale.
fn mean_saturation(face: &RgbImage) -> f32 {
    let count = (face.width() * face.height()).max(1) as f32;
    let total: f32 = face
        .pixels()
        .map(|p| {
            let max = p[0].max(p[1]).max(p[2]) as f32;
            let min = p[0].min(p[1]).min(p[2]) as f32;
            if max > 0.0 {
                (max - min) / max * 255.0
            } else {
                0.0
            }
        })
        .sum();
    total / count
}

fn mean_rgb(face: &RgbImage) -> [f32; 3] {
    let count = (face.width() * face.height()).max(1) as f32;
    let mut acc = [0.0f32; 3];
    for p in face.pixels() {
        for c in 0..3 {
            acc[c] += p[c] as f32;
        }
    }
    acc.map(|v| v / count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checkerboard(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            let v = if (x + y) % 2 == 0 { 40 } else { 120 };
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_prob_real_heads() {
        assert!((prob_real(&[0.0]).unwrap() - 0.5).abs() < 1e-6);
        assert!(prob_real(&[8.0]).unwrap() > 0.99);
        assert!((prob_real(&[1.0, 1.0]).unwrap() - 0.5).abs() < 1e-6);
        assert!(prob_real(&[-4.0, 4.0]).unwrap() > 0.99);
        assert!(prob_real(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_flat_crop_is_blurry() {
        let flat = RgbImage::from_pixel(32, 32, Rgb([100, 100, 100]));
        assert!(laplacian_variance(&flat) < 1e-3);
        assert!(laplacian_variance(&checkerboard(32)) > MIN_SHARPNESS);
    }

    #[test]
    fn test_saturation_gray_vs_pure_red() {
        let gray = RgbImage::from_pixel(4, 4, Rgb([90, 90, 90]));
        let red = RgbImage::from_pixel(4, 4, Rgb([200, 0, 0]));
        assert_eq!(mean_saturation(&gray), 0.0);
        assert!((mean_saturation(&red) - 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_confident_score_skips_heuristics() {
        let flat = RgbImage::from_pixel(32, 32, Rgb([100, 100, 100]));
        let score = decide(&flat, 0.99, &LivenessConfig::default());
        assert!(score.is_live);
    }

    #[test]
    fn test_borderline_blurry_crop_is_spoof() {
        let flat = RgbImage::from_pixel(32, 32, Rgb([100, 100, 100]));
        let score = decide(&flat, 0.85, &LivenessConfig::default());
        assert!(!score.is_live);
    }

    #[test]
    fn test_borderline_textured_crop_is_live() {
        let score = decide(&checkerboard(128), 0.85, &LivenessConfig::default());
        assert!(score.is_live);
    }

    #[test]
    fn test_heuristics_judge_the_downscaled_crop() {
        // Pixel-level texture passes at full size but averages out at 128x128.
        let fine = checkerboard(512);
        assert!(heuristics_pass(&fine, 0.85));
        let score = decide(&fine, 0.85, &LivenessConfig::default());
        assert!(!score.is_live);
    }

    #[test]
    fn test_below_threshold_is_spoof() {
        let score = decide(&checkerboard(32), 0.5, &LivenessConfig::default());
        assert!(!score.is_live);
        assert!((score.p_real - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_imagenet_normalization() {
        let face = RgbImage::from_pixel(10, 10, Rgb([255, 255, 255]));
        let tensor = preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 256, 256]);
        let expected = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((tensor[[0, 0, 100, 100]] - expected).abs() < 1e-4);
    }
}
