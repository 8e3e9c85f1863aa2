use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;
use tracing::debug;

use crate::photo::Photo;

pub static MIN_DIMENSION_PX: Lazy<u32> = Lazy::new(|| env_u32("COMPLIANCE_MIN_DIMENSION", 240));

pub static MAX_PHOTO_BYTES: Lazy<u64> = Lazy::new(|| {
    env::var("COMPLIANCE_MAX_PHOTO_BYTES")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(15 * 1024 * 1024)
});

pub static MIN_SHARPNESS: Lazy<f64> = Lazy::new(|| {
    env::var("COMPLIANCE_MIN_SHARPNESS")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
        .unwrap_or(100.0)
});

pub static MAX_SUBJECT_RATIO: Lazy<f64> = Lazy::new(|| {
    env::var("COMPLIANCE_MAX_SUBJECT_RATIO")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v > 0.0 && *v <= 1.0)
        .unwrap_or(0.45)
});

pub static SUBJECT_MIN_BOX_PX: Lazy<u32> = Lazy::new(|| env_u32("COMPLIANCE_SUBJECT_MIN_BOX", 64));

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TooSmall,
    Empty,
    TooLarge,
    Blurry,
    SubjectDetected,
    Unreadable,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::TooSmall => "too_small",
            RejectReason::Empty => "empty",
            RejectReason::TooLarge => "too_large",
            RejectReason::Blurry => "blurry",
            RejectReason::SubjectDetected => "subject_detected",
            RejectReason::Unreadable => "unreadable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceResult {
    Accepted,
    Rejected(RejectReason),
}

impl ComplianceResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ComplianceResult::Accepted)
    }
}

#[derive(Debug, Error)]
#[error("subject detector failed: {0}")]
pub struct DetectError(pub String);

#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn min_side(&self) -> u32 {
        self.width.min(self.height)
    }
}

/// Detects people in a frame. The policy is deliberately conservative:
/// false positives are preferred over letting a disqualifying photo through.
pub trait SubjectDetector: Send + Sync {
    fn detect(&self, photo: &Photo) -> Result<Vec<BoundingBox>, DetectError>;
}

/// Grid-based skin-tone region detector. Splits the frame into cells, marks
/// a cell when most of its pixels fall in the skin-tone band, and reports
/// the bounding box of the marked cells.
pub struct SkinToneDetector {
    grid: u32,
}

impl Default for SkinToneDetector {
    fn default() -> Self {
        Self { grid: 16 }
    }
}

fn is_skin_tone(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    r > 95 && g > 40 && b > 20 && r > g && r > b && (max - min) > 15
}

impl SubjectDetector for SkinToneDetector {
    fn detect(&self, photo: &Photo) -> Result<Vec<BoundingBox>, DetectError> {
        if !photo.buffer_consistent() {
            return Err(DetectError("pixel buffer does not match dimensions".into()));
        }
        let cols = self.grid.min(photo.width);
        let rows = self.grid.min(photo.height);
        let cell_w = (photo.width / cols).max(1);
        let cell_h = (photo.height / rows).max(1);

        let mut min_cx = u32::MAX;
        let mut min_cy = u32::MAX;
        let mut max_cx = 0u32;
        let mut max_cy = 0u32;
        let mut any = false;

        for cy in 0..rows {
            for cx in 0..cols {
                let x0 = cx * cell_w;
                let y0 = cy * cell_h;
                if x0 >= photo.width || y0 >= photo.height {
                    continue;
                }
                // Integer division leaves a remainder strip when dimensions
                // are not grid-divisible; the last row/column cells absorb
                // it so every pixel gets scanned.
                let x1 = if cx + 1 == cols {
                    photo.width
                } else {
                    (x0 + cell_w).min(photo.width)
                };
                let y1 = if cy + 1 == rows {
                    photo.height
                } else {
                    (y0 + cell_h).min(photo.height)
                };
                let mut skin = 0u64;
                let mut total = 0u64;
                for y in y0..y1 {
                    for x in x0..x1 {
                        let (r, g, b) = photo.rgb_at(x, y);
                        if is_skin_tone(r, g, b) {
                            skin += 1;
                        }
                        total += 1;
                    }
                }
                if total > 0 && skin * 10 >= total * 6 {
                    any = true;
                    min_cx = min_cx.min(x0);
                    min_cy = min_cy.min(y0);
                    max_cx = max_cx.max(x1);
                    max_cy = max_cy.max(y1);
                }
            }
        }

        if !any {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox {
            x: min_cx,
            y: min_cy,
            width: max_cx - min_cx,
            height: max_cy - min_cy,
        }])
    }
}

/// Variance of a discrete 4-neighbour Laplacian over the luma channel.
/// Flat or defocused frames score near zero.
pub fn sharpness_score(photo: &Photo) -> f64 {
    if photo.width < 3 || photo.height < 3 || !photo.buffer_consistent() {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;
    for y in 1..photo.height - 1 {
        for x in 1..photo.width - 1 {
            let c = photo.luma_at(x, y) as i64;
            let lap = 4 * c
                - photo.luma_at(x - 1, y) as i64
                - photo.luma_at(x + 1, y) as i64
                - photo.luma_at(x, y - 1) as i64
                - photo.luma_at(x, y + 1) as i64;
            let v = lap as f64;
            sum += v;
            sum_sq += v * v;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    let mean = sum / count as f64;
    (sum_sq / count as f64) - mean * mean
}

/// Validate a photo for listing use. Checks run in a fixed order and the
/// first failure wins. Detector errors surface as `unreadable`, never as a
/// propagated error.
pub fn evaluate(photo: &Photo, detector: &dyn SubjectDetector) -> ComplianceResult {
    if photo.width.min(photo.height) < *MIN_DIMENSION_PX {
        return ComplianceResult::Rejected(RejectReason::TooSmall);
    }
    if photo.byte_len == 0 || photo.pixels.is_empty() {
        return ComplianceResult::Rejected(RejectReason::Empty);
    }
    if photo.byte_len > *MAX_PHOTO_BYTES {
        return ComplianceResult::Rejected(RejectReason::TooLarge);
    }
    if !photo.buffer_consistent() {
        return ComplianceResult::Rejected(RejectReason::Unreadable);
    }
    let sharpness = sharpness_score(photo);
    if sharpness < *MIN_SHARPNESS {
        debug!(
            target = "magpie.compliance",
            photo = %photo.filename,
            sharpness,
            "sharpness below threshold"
        );
        return ComplianceResult::Rejected(RejectReason::Blurry);
    }
    match detector.detect(photo) {
        Ok(boxes) => {
            let frame_area = photo.width as u64 * photo.height as u64;
            for bx in boxes {
                let ratio = bx.area() as f64 / frame_area.max(1) as f64;
                if bx.min_side() >= *SUBJECT_MIN_BOX_PX && ratio > *MAX_SUBJECT_RATIO {
                    return ComplianceResult::Rejected(RejectReason::SubjectDetected);
                }
            }
            ComplianceResult::Accepted
        }
        Err(err) => {
            debug!(
                target = "magpie.compliance",
                photo = %photo.filename,
                error = %err,
                "subject detector error"
            );
            ComplianceResult::Rejected(RejectReason::Unreadable)
        }
    }
}
