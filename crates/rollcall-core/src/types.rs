use serde::{Deserialize, Serialize};

/// Stable identifier of an enrolled person (the student id on the backend).
pub type IdentityId = String;

/// Tracker-assigned id, unique for the lifetime of one tracker.
pub type TrackId = u64;

/// Length of an ArcFace embedding.
pub const EMBEDDING_DIM: usize = 512;

/// Axis-aligned face box in frame pixel coordinates, corner form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Integer pixel rectangle, always inside the frame it was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Area in square pixels; zero for inverted boxes.
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection-over-Union in [0, 1]. Degenerate boxes score 0.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Square crop around the box center with side `max(w, h) * (1 + pad_ratio)`,
    /// clipped to a `frame_w` x `frame_h` frame.
    ///
    /// A degenerate box yields the whole frame. Returns `None` when the clipped
    /// region is empty (box entirely outside the frame, or an empty frame).
    pub fn square_crop(&self, pad_ratio: f32, frame_w: u32, frame_h: u32) -> Option<CropRect> {
        if frame_w == 0 || frame_h == 0 {
            return None;
        }
        let (w, h) = (self.width(), self.height());
        if w <= 0.0 || h <= 0.0 {
            return Some(CropRect { x: 0, y: 0, width: frame_w, height: frame_h });
        }

        let cx = (self.x1 + self.x2) / 2.0;
        let cy = (self.y1 + self.y2) / 2.0;
        let side = w.max(h) * (1.0 + pad_ratio);

        let x1 = (cx - side / 2.0).round().max(0.0);
        let y1 = (cy - side / 2.0).round().max(0.0);
        let x2 = (cx + side / 2.0).round().min(frame_w as f32);
        let y2 = (cy + side / 2.0).round().min(frame_h as f32);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(CropRect {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        })
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Unit-length copy, or `None` for a zero (or non-finite) vector.
    pub fn normalized(&self) -> Option<Embedding> {
        let norm = self.norm();
        if norm > 0.0 && norm.is_finite() {
            Some(Embedding {
                values: self.values.iter().map(|v| v / norm).collect(),
            })
        } else {
            None
        }
    }

    /// Cosine distance `1 - cos(a, b)` in [0, 2]. Lower = more similar.
    ///
    /// Computes the full cosine so that unnormalized inputs are still correct.
    /// A zero vector, or one of a different length, is maximally distant.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 2.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            1.0 - dot / denom
        } else {
            2.0
        }
    }
}

/// One face from the detector for a single frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
    pub embedding: Option<Embedding>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, embedding: Option<Embedding>) -> Self {
        Self {
            bbox,
            score: 1.0,
            landmarks: None,
            embedding,
        }
    }
}

/// Display data for an enrolled person.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub first_name: String,
    pub last_name: String,
}

impl IdentityProfile {
    /// "First Last", or `fallback` when both names are blank.
    pub fn display_name(&self, fallback: &str) -> String {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let full = full.trim();
        if full.is_empty() {
            fallback.to_string()
        } else {
            full.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_shifted_quarter() {
        // Overlap 75x100 = 7500, union 10000+10000-7500 = 12500
        let a = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let b = BoundingBox::new(25.0, 0.0, 125.0, 100.0);
        assert!((a.iou(&b) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_iou_degenerate() {
        let a = BoundingBox::new(10.0, 10.0, 10.0, 10.0);
        let b = BoundingBox::new(0.0, 0.0, 20.0, 20.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_square_crop_pads_and_squares() {
        let bbox = BoundingBox::new(100.0, 100.0, 200.0, 180.0);
        let crop = bbox.square_crop(0.1, 640, 480).unwrap();
        assert_eq!(crop.width, crop.height);
        assert_eq!(crop.width, 110);
        assert_eq!((crop.x, crop.y), (95, 85));
    }

    #[test]
    fn test_square_crop_clips_to_frame() {
        let bbox = BoundingBox::new(-20.0, -20.0, 60.0, 60.0);
        let crop = bbox.square_crop(0.1, 640, 480).unwrap();
        assert_eq!((crop.x, crop.y), (0, 0));
        assert!(crop.x + crop.width <= 640);
        assert!(crop.y + crop.height <= 480);
    }

    #[test]
    fn test_square_crop_degenerate_uses_whole_frame() {
        let bbox = BoundingBox::new(50.0, 50.0, 40.0, 60.0);
        let crop = bbox.square_crop(0.1, 640, 480).unwrap();
        assert_eq!(crop, CropRect { x: 0, y: 0, width: 640, height: 480 });
    }

    #[test]
    fn test_square_crop_outside_frame() {
        let bbox = BoundingBox::new(700.0, 500.0, 800.0, 600.0);
        assert!(bbox.square_crop(0.1, 640, 480).is_none());
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding::new(vec![3.0, 4.0]);
        let n = e.normalized().unwrap();
        assert!((n.norm() - 1.0).abs() < 1e-6);
        assert!((n.values[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector() {
        assert!(Embedding::new(vec![0.0, 0.0]).normalized().is_none());
    }

    #[test]
    fn test_cosine_distance() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        let c = Embedding::new(vec![-1.0, 0.0]);
        assert!(a.cosine_distance(&a).abs() < 1e-6);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
        assert!((a.cosine_distance(&c) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.cosine_distance(&b), 2.0);
    }

    #[test]
    fn test_cosine_distance_length_mismatch() {
        let short = Embedding::new(vec![1.0]);
        let long = Embedding::new(vec![1.0, 5.0, 5.0]);
        assert_eq!(short.cosine_distance(&long), 2.0);
        assert_eq!(long.cosine_distance(&short), 2.0);
    }

    #[test]
    fn test_display_name_fallback() {
        let p = IdentityProfile { first_name: " Ana ".into(), last_name: "Cruz".into() };
        assert_eq!(p.display_name("S1"), "Ana Cruz");
        assert_eq!(IdentityProfile::default().display_name("S1"), "S1");
    }
}
