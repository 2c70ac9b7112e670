//! Frame presentation: on-screen stats and the optional snapshot writer.

use image::{ImageFormat, Rgb, RgbImage};
use rollcall_core::{Track, TrackId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Write a snapshot every this many frames.
pub const SNAPSHOT_EVERY_N: u64 = 15;
const BOX_THICKNESS: u32 = 2;

/// Session timer and smoothed frame rate.
#[derive(Debug)]
pub struct Osd {
    started: Instant,
    last_frame: Option<Instant>,
    fps: f32,
}

impl Osd {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_frame: None,
            fps: 0.0,
        }
    }

    /// Record a frame at `now`; returns the updated FPS estimate.
    pub fn tick(&mut self, now: Instant) -> f32 {
        if let Some(prev) = self.last_frame {
            let dt = now.saturating_duration_since(prev).as_secs_f32();
            if dt > 0.0 {
                self.fps = 0.9 * self.fps + 0.1 * (1.0 / dt);
            }
        }
        self.last_frame = Some(now);
        self.fps
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn lines(&self, now: Instant, faces: usize, recognized: usize, roster: usize) -> [String; 3] {
        [
            format!("Timer {}", format_mmss(self.elapsed(now))),
            format!("FPS {:.1}", self.fps),
            format!("Faces {faces}  Recognized {recognized}/{roster}"),
        ]
    }
}

/// Minutes and seconds, zero-padded; minutes keep growing past 59.
pub fn format_mmss(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("snapshot write failed: {0}")]
    Write(#[from] image::ImageError),
}

/// Where annotated frames go.
pub enum DisplaySink {
    /// Log the stats at debug level and draw nothing.
    Headless,
    /// Draw track boxes and periodically overwrite a JPEG on disk.
    Snapshot { path: PathBuf, frames: u64 },
}

impl DisplaySink {
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        match snapshot_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "snapshot display enabled");
                DisplaySink::Snapshot { path, frames: 0 }
            }
            None => DisplaySink::Headless,
        }
    }

    pub fn present(
        &mut self,
        frame: &RgbImage,
        tracks: &BTreeMap<TrackId, Track>,
        osd: &[String],
    ) -> Result<(), DisplayError> {
        match self {
            DisplaySink::Headless => {
                tracing::debug!(osd = ?osd, tracks = tracks.len(), "frame");
                Ok(())
            }
            DisplaySink::Snapshot { path, frames } => {
                *frames += 1;
                if *frames % SNAPSHOT_EVERY_N != 1 {
                    return Ok(());
                }
                let mut canvas = frame.clone();
                for track in tracks.values() {
                    draw_box(&mut canvas, track, Rgb(track.verdict.color().rgb()));
                }
                canvas.save_with_format(&*path, ImageFormat::Jpeg)?;
                tracing::debug!(osd = ?osd, labels = ?labels(tracks), "snapshot written");
                Ok(())
            }
        }
    }
}

impl Drop for DisplaySink {
    fn drop(&mut self) {
        if let DisplaySink::Snapshot { path, frames } = self {
            tracing::debug!(path = %path.display(), frames = *frames, "snapshot display released");
        }
    }
}

fn labels(tracks: &BTreeMap<TrackId, Track>) -> Vec<String> {
    tracks.values().map(|t| t.verdict.label()).collect()
}

/// Outline `track`'s box, clipped to the canvas.
fn draw_box(canvas: &mut RgbImage, track: &Track, color: Rgb<u8>) {
    let (w, h) = canvas.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let clamp_x = |v: f32| (v.max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
    let (x1, y1) = (clamp_x(track.bbox.x1), clamp_y(track.bbox.y1));
    let (x2, y2) = (clamp_x(track.bbox.x2), clamp_y(track.bbox.y2));
    if x2 <= x1 || y2 <= y1 {
        return;
    }

    for t in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            canvas.put_pixel(x, (y1 + t).min(y2), color);
            canvas.put_pixel(x, y2.saturating_sub(t).max(y1), color);
        }
        for y in y1..=y2 {
            canvas.put_pixel((x1 + t).min(x2), y, color);
            canvas.put_pixel(x2.saturating_sub(t).max(x1), y, color);
        }
    }
}
