//! Inbound frame messages.
//!
//! The wire form is the JSON body posted by edge devices:
//!
//! ```text
//! { "frame": "<base64 jpeg>",
//!   "detections": [ { "bbox": {"x":..,"y":..,"width":..,"height":..},
//!                     "category": "person", "score": 0.87 } ],
//!   "timestamp": "October18/2026 14:03:05",
//!   "fps": 24.0 }
//! ```
//!
//! Everything is validated here so the recorder only ever sees typed values.

use base64::Engine;
use image::RgbImage;
use serde::Deserialize;

use crate::detect::{BoundingBox, Detection};
use crate::error::DecodeError;
use crate::timestamp::{parse_timestamp, Timestamp};

#[derive(Debug, Deserialize)]
struct WireMessage {
    frame: String,
    #[serde(default)]
    detections: Vec<WireDetection>,
    timestamp: String,
    #[serde(default)]
    fps: Option<f64>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    bbox: BoundingBox,
    category: String,
    score: f32,
}

/// One decoded unit of work from an edge device.
pub struct FrameMessage {
    pub frame: RgbImage,
    pub detections: Vec<Detection>,
    pub timestamp: Timestamp,
    pub fps: Option<f64>,
}

impl FrameMessage {
    pub fn from_json(body: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireMessage = serde_json::from_slice(body)?;
        Self::from_wire(wire)
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    fn from_wire(wire: WireMessage) -> Result<Self, DecodeError> {
        let timestamp = parse_timestamp(&wire.timestamp)?;
        let detections = wire
            .detections
            .into_iter()
            .enumerate()
            .map(|(index, det)| validate_detection(index, det))
            .collect::<Result<Vec<_>, _>>()?;

        let bytes = decode_payload(&wire.frame)?;
        let frame = image::load_from_memory(&bytes)?.to_rgb8();

        let fps = wire.fps.filter(|fps| fps.is_finite() && *fps > 0.0);
        let message = Self {
            frame,
            detections,
            timestamp,
            fps,
        };
        if let (Some(declared_w), Some(declared_h)) = (wire.width, wire.height) {
            message.ensure_size(declared_w, declared_h)?;
        }
        Ok(message)
    }

    /// Rejects a frame whose decoded size is not `width` x `height`.
    pub fn ensure_size(&self, width: u32, height: u32) -> Result<(), DecodeError> {
        if self.width() != width || self.height() != height {
            return Err(DecodeError::Dimensions {
                expected_w: width,
                expected_h: height,
                actual_w: self.width(),
                actual_h: self.height(),
            });
        }
        Ok(())
    }
}

fn decode_payload(frame: &str) -> Result<Vec<u8>, DecodeError> {
    // Tolerate data URLs from browser-based producers.
    let payload = match frame.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => frame,
    };
    Ok(base64::engine::general_purpose::STANDARD.decode(payload.trim())?)
}

fn validate_detection(index: usize, det: WireDetection) -> Result<Detection, DecodeError> {
    let reject = |reason: &str| DecodeError::Detection {
        index,
        reason: reason.to_string(),
    };
    let bbox = det.bbox;
    let coords = [bbox.x, bbox.y, bbox.width, bbox.height];
    if coords.iter().any(|v| !v.is_finite()) {
        return Err(reject("bbox has non-finite coordinates"));
    }
    if coords.iter().any(|v| *v < 0.0) {
        return Err(reject("bbox has negative coordinates"));
    }
    if !det.score.is_finite() || !(0.0..=1.0).contains(&det.score) {
        return Err(reject("score must be within [0, 1]"));
    }
    let category = det.category.trim();
    if category.is_empty() {
        return Err(reject("category is empty"));
    }
    Ok(Detection::new(bbox, category, det.score))
}
