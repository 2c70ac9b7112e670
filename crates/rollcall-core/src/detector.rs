//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB frame to 640x640, decodes the three anchor-free
//! stride heads (boxes + five landmarks) and applies NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Raw SCRFD output for one face, in frame coordinates.
#[derive(Debug, Clone)]
pub struct FaceBox {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: [(f32, f32); 5],
}

/// Maps letterboxed model coordinates back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32)
            .min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).min(SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).min(SCRFD_INPUT_SIZE);
        Self {
            scale,
            pad_x: (SCRFD_INPUT_SIZE - new_w) / 2,
            pad_y: (SCRFD_INPUT_SIZE - new_h) / 2,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

pub struct ScrfdDetector {
    session: Session,
    /// Output slots per stride as (score, bbox, kps).
    heads: [(usize, usize, usize); 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let heads = head_layout(&names);

        tracing::info!(path = model_path, outputs = ?names, ?heads, "loaded SCRFD model");
        Ok(Self { session, heads })
    }

    /// Detect faces, highest score first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.heads[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data.to_vec())
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let boxes = extract(bbox_idx, "boxes")?;
            let kps = extract(kps_idx, "landmarks")?;

            candidates.extend(decode_stride(&scores, &boxes, &kps, stride, &letterbox));
        }

        Ok(non_max_suppression(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resolve output slots by name ("score_8", "bbox_16", ...) or fall back to
/// the standard export order: scores, then boxes, then landmarks.
fn head_layout(names: &[String]) -> [(usize, usize, usize); 3] {
    let slot = |kind: &str, stride: u32| names.iter().position(|n| *n == format!("{kind}_{stride}"));

    let mut named = [(0, 0, 0); 3];
    for (i, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (slot("score", stride), slot("bbox", stride), slot("kps", stride)) {
            (Some(s), Some(b), Some(k)) => named[i] = (s, b, k),
            _ => return [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
        }
    }
    named
}

/// Letterbox into a normalized 1x3x640x640 RGB tensor; padding maps to 0.0.
fn preprocess(frame: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(frame.width(), frame.height());
    let new_w = SCRFD_INPUT_SIZE - 2 * letterbox.pad_x;
    let new_h = SCRFD_INPUT_SIZE - 2 * letterbox.pad_y;
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.pad_x) as usize;
        let ty = (y + letterbox.pad_y) as usize;
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: u32,
    letterbox: &Letterbox,
) -> Vec<FaceBox> {
    let grid = (SCRFD_INPUT_SIZE / stride) as usize;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > SCRFD_SCORE_THRESHOLD)
        .filter_map(|i| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let d = boxes.get(i * 4..i * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = letterbox.to_frame(ax + d[2] * step, ay + d[3] * step);

            let k = kps.get(i * 10..i * 10 + 10)?;
            let landmarks: [(f32, f32); 5] = std::array::from_fn(|p| {
                letterbox.to_frame(ax + k[p * 2] * step, ay + k[p * 2 + 1] * step)
            });

            Some(FaceBox {
                bbox: BoundingBox::new(x1, y1, x2, y2),
                score: scores[i],
                landmarks,
            })
        })
        .collect()
}

fn non_max_suppression(mut faces: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    faces.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<FaceBox> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| k.bbox.iou(&face.bbox) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> FaceBox {
        FaceBox {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            score,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_nms_suppresses_overlap_keeps_best() {
        let kept = non_max_suppression(
            vec![
                face(5.0, 5.0, 105.0, 105.0, 0.8),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
                face(200.0, 200.0, 250.0, 250.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox::fit(640, 480);
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        let (x, y) = lb.to_frame(100.0, 80.0 + 50.0);
        assert!((x - 100.0).abs() < 1e-4);
        assert!((y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_head_layout_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(head_layout(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_head_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(head_layout(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_single_anchor() {
        // Stride 32 grid is 20x20; anchor 0 sits at the origin cell.
        let lb = Letterbox { scale: 1.0, pad_x: 0, pad_y: 0 };
        let anchors = 20 * 20 * 2;
        let mut scores = vec![0.0; anchors];
        scores[0] = 0.95;
        let mut boxes = vec![0.0; anchors * 4];
        boxes[..4].copy_from_slice(&[0.0, 0.0, 2.0, 3.0]);
        let kps = vec![1.0; anchors * 10];

        let faces = decode_stride(&scores, &boxes, &kps, 32, &lb);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox, BoundingBox::new(0.0, 0.0, 64.0, 96.0));
        assert_eq!(faces[0].landmarks[0], (32.0, 32.0));
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = RgbImage::from_pixel(64, 32, image::Rgb([255, 255, 255]));
        let (tensor, lb) = preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.pad_y, 160);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!(tensor[[0, 0, 320, 320]] > 0.9);
    }
}
