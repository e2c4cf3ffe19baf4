//! Frame overlays for the live preview and recorded clips.
//!
//! `Annotator::annotate` is a pure transform: it copies the input frame and
//! draws detection boxes with labels, the monitored zone, a timestamp line,
//! an optional FPS readout and a recording indicator dot. It performs no I/O
//! and cannot fail; anything that would fall outside the frame is clipped.
//!
//! Text is rendered with the bundled DejaVu Sans Mono face through
//! `imageproc`.

use std::sync::OnceLock;

use ab_glyph::{FontRef, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect as PixelRect;

use crate::detect::Detection;
use crate::geometry::Rect;
use crate::timestamp::{format_timestamp, Timestamp};

pub const DETECTION_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const INVADING_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const ZONE_IDLE_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
pub const ZONE_BREACH_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const RECORDING_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const IDLE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Glyph height in pixels per 240 rows of frame height.
const TEXT_PX_PER_UNIT: f32 = 12.0;

static FONT_DATA: &[u8] = include_bytes!("../../assets/DejaVuSansMono.ttf");
static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();

/// The overlay face, or `None` when the bundled font fails to parse (text is
/// then skipped and the geometric overlays are still drawn).
fn overlay_font() -> Option<&'static FontRef<'static>> {
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_DATA) {
        Ok(font) => Some(font),
        Err(e) => {
            log::warn!("overlay font unavailable, text disabled: {}", e);
            None
        }
    })
    .as_ref()
}

/// Per-frame status drawn alongside detections.
#[derive(Clone, Debug)]
pub struct Overlay<'a> {
    pub feed_label: &'a str,
    pub timestamp: &'a Timestamp,
    pub recording: bool,
    pub fps: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct Annotator {
    zone: Rect,
    thickness: u32,
}

impl Annotator {
    pub fn new(zone: Rect) -> Self {
        Self { zone, thickness: 2 }
    }

    pub fn zone(&self) -> &Rect {
        &self.zone
    }

    pub fn annotate(
        &self,
        frame: &RgbImage,
        detections: &[Detection],
        overlay: &Overlay<'_>,
    ) -> RgbImage {
        let mut out = frame.clone();
        let unit = scale_unit(&out);
        let text_scale = PxScale::from(TEXT_PX_PER_UNIT * unit as f32);
        let mut breach = false;

        for det in detections {
            let rect = det.rect();
            let invading = det.invades(&self.zone);
            breach |= invading;
            let color = if invading {
                INVADING_COLOR
            } else {
                DETECTION_COLOR
            };
            draw_rect(&mut out, &rect, color, self.thickness);
            draw_label(
                &mut out,
                &det.label(),
                rect.start.x + 7,
                rect.start.y + 7,
                text_scale,
                color,
            );
        }

        let zone_color = if breach {
            ZONE_BREACH_COLOR
        } else {
            ZONE_IDLE_COLOR
        };
        draw_rect(&mut out, &self.zone, zone_color, self.thickness);

        let header = if overlay.feed_label.is_empty() {
            format_timestamp(overlay.timestamp)
        } else {
            format!(
                "{} - {}",
                overlay.feed_label.to_uppercase(),
                format_timestamp(overlay.timestamp)
            )
        };
        let margin = 7 * unit as i64;
        draw_label(&mut out, &header, margin, margin, text_scale, TEXT_COLOR);

        if let Some(fps) = overlay.fps {
            let text = format!("FPS: {}", fps.round() as i64);
            if let Some(font) = overlay_font() {
                let (w, h) = text_size(text_scale, font, &text);
                let x = out.width() as i64 - w as i64 - margin;
                let y = out.height() as i64 - h as i64 - margin;
                draw_label(&mut out, &text, x, y, text_scale, TEXT_COLOR);
            }
        }

        let radius = 4 * unit as i64;
        let indicator = if overlay.recording {
            RECORDING_COLOR
        } else {
            IDLE_COLOR
        };
        let cx = out.width() as i64 - margin - radius;
        draw_filled_circle_mut(
            &mut out,
            (to_i32(cx), to_i32(margin + radius)),
            to_i32(radius),
            indicator,
        );

        out
    }
}

/// Encodes an RGB frame as baseline JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode_image(frame)?;
    Ok(buf)
}

fn scale_unit(img: &RgbImage) -> u32 {
    (img.height() / 240).max(1)
}

fn to_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Outlines an inclusive zone rectangle, `thickness` pixels wide inward.
fn draw_rect(img: &mut RgbImage, rect: &Rect, color: Rgb<u8>, thickness: u32) {
    for t in 0..thickness as i64 {
        let (x0, y0) = (rect.start.x + t, rect.start.y + t);
        let (x1, y1) = (rect.end.x - t, rect.end.y - t);
        if x0 > x1 || y0 > y1 {
            break;
        }
        let width = (x1 - x0 + 1).min(u32::MAX as i64) as u32;
        let height = (y1 - y0 + 1).min(u32::MAX as i64) as u32;
        let px = PixelRect::at(to_i32(x0), to_i32(y0)).of_size(width, height);
        draw_hollow_rect_mut(img, px, color);
    }
}

fn draw_label(img: &mut RgbImage, text: &str, x: i64, y: i64, scale: PxScale, color: Rgb<u8>) {
    if let Some(font) = overlay_font() {
        draw_text_mut(img, color, to_i32(x), to_i32(y), scale, font, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::geometry::Point;
    use chrono::NaiveDate;

    fn ts() -> Timestamp {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .and_then(|d| d.and_hms_opt(14, 3, 5))
            .unwrap()
    }

    fn zone() -> Rect {
        Rect::new(Point::new(100, 60), Point::new(160, 120))
    }

    fn det(x: f64, y: f64) -> Detection {
        Detection::new(
            BoundingBox {
                x,
                y,
                width: 20.0,
                height: 20.0,
            },
            "person",
            0.9,
        )
    }

    fn overlay(ts: &Timestamp, recording: bool) -> Overlay<'_> {
        Overlay {
            feed_label: "pi1",
            timestamp: ts,
            recording,
            fps: Some(24.0),
        }
    }

    #[test]
    fn input_frame_is_not_modified() {
        let frame = RgbImage::new(160, 120);
        let t = ts();
        let out = Annotator::new(zone()).annotate(&frame, &[det(10.0, 10.0)], &overlay(&t, false));
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
        assert_ne!(out, frame);
        assert_eq!(out.dimensions(), frame.dimensions());
    }

    #[test]
    fn zone_color_reflects_invasion() {
        let frame = RgbImage::new(160, 120);
        let t = ts();
        let annotator = Annotator::new(zone());

        let idle = annotator.annotate(&frame, &[det(10.0, 80.0)], &overlay(&t, false));
        assert_eq!(*idle.get_pixel(100, 100), ZONE_IDLE_COLOR);

        let breached = annotator.annotate(&frame, &[det(90.0, 80.0)], &overlay(&t, true));
        assert_eq!(*breached.get_pixel(100, 100), ZONE_BREACH_COLOR);
        // invading box edge uses the invasion color
        assert_eq!(*breached.get_pixel(90, 90), INVADING_COLOR);
    }

    #[test]
    fn no_detections_still_draws_zone_and_indicator() {
        let frame = RgbImage::new(160, 120);
        let t = ts();
        let annotator = Annotator::new(zone());
        let idle = annotator.annotate(&frame, &[], &overlay(&t, false));
        assert_eq!(*idle.get_pixel(100, 90), ZONE_IDLE_COLOR);
        // indicator centre: width - margin - radius, margin + radius
        assert_eq!(*idle.get_pixel(160 - 7 - 4, 7 + 4), IDLE_COLOR);

        let recording = annotator.annotate(&frame, &[], &overlay(&t, true));
        assert_eq!(*recording.get_pixel(160 - 7 - 4, 7 + 4), RECORDING_COLOR);
    }

    #[test]
    fn boxes_partially_outside_frame_are_clipped() {
        let frame = RgbImage::new(64, 48);
        let t = ts();
        let out = Annotator::new(Rect::new(Point::new(0, 0), Point::new(63, 47))).annotate(
            &frame,
            &[det(50.0, 40.0)],
            &overlay(&t, false),
        );
        assert_eq!(out.dimensions(), (64, 48));
    }

    #[test]
    fn bundled_font_renders_labels() {
        assert!(overlay_font().is_some());
        let frame = RgbImage::new(320, 240);
        let t = ts();
        let out = Annotator::new(Rect::new(Point::new(300, 220), Point::new(319, 239)))
            .annotate(&frame, &[], &overlay(&t, false));
        // header text lands in the top-left corner
        let header_pixels = (0..120)
            .flat_map(|x| (0..30).map(move |y| (x, y)))
            .filter(|&(x, y)| *out.get_pixel(x, y) != Rgb([0, 0, 0]))
            .count();
        assert!(header_pixels > 0);
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let frame = RgbImage::from_pixel(16, 16, Rgb([10, 20, 30]));
        let jpeg = encode_jpeg(&frame, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
