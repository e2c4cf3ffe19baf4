//! Detections produced by the edge device's object detector.
//!
//! The detector itself is external; the hub only ever sees its output.

use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Rect};

/// Bounding box in pixel units, top-left origin.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Integer rectangle covered by the box. Coordinates truncate toward
    /// zero, the way the detector's pixel boxes are drawn.
    pub fn rect(&self) -> Rect {
        Rect::new(
            Point::new(self.x as i64, self.y as i64),
            Point::new((self.x + self.width) as i64, (self.y + self.height) as i64),
        )
    }
}

/// One detected object in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub category: String,
    pub score: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, category: impl Into<String>, score: f32) -> Self {
        Self {
            bbox,
            category: category.into(),
            score,
        }
    }

    pub fn rect(&self) -> Rect {
        self.bbox.rect()
    }

    /// Overlay label, e.g. `person (0.87)`.
    pub fn label(&self) -> String {
        format!("{} ({:.2})", self.category, self.score)
    }

    pub fn invades(&self, zone: &Rect) -> bool {
        self.rect().intersects(zone)
    }
}

/// Score threshold and category allowlist applied before the breach test.
#[derive(Clone, Debug, Default)]
pub struct DetectionFilter {
    score_threshold: f32,
    allowlist: Vec<String>,
}

impl DetectionFilter {
    /// An empty allowlist admits every category.
    pub fn new(score_threshold: f32, allowlist: &[String]) -> Self {
        Self {
            score_threshold,
            allowlist: allowlist.iter().map(|c| c.to_lowercase()).collect(),
        }
    }

    pub fn admits(&self, detection: &Detection) -> bool {
        if detection.score < self.score_threshold {
            return false;
        }
        self.allowlist.is_empty()
            || self
                .allowlist
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&detection.category))
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let before = detections.len();
        let kept: Vec<Detection> = detections.into_iter().filter(|d| self.admits(d)).collect();
        if kept.len() != before {
            log::debug!(
                "detection filter dropped {} of {} detections",
                before - kept.len(),
                before
            );
        }
        kept
    }
}
