//! Breach-triggered event recorder.
//!
//! One `EventRecorder` owns one feed's `RecordingSession`. It is a two-state
//! machine (`Idle`, `Recording`) advanced once per inbound frame:
//!
//! - a frame with any detection intersecting the zone is a breach frame; the
//!   first one starts a session and fixes its output descriptor, every one is
//!   appended to the buffer and refreshes `last_breach_time`;
//! - a clean frame arriving `max_detection_delay` seconds or more after the
//!   last breach closes the session;
//! - a buffer reaching `max_clip * fps` frames is rolled over: the clip is
//!   closed and a fresh descriptor starts at the rollover frame while the
//!   session stays open.
//!
//! Closing hands the buffer out as a `FinalizedClip` when it holds at least
//! `min_clip * fps` frames, otherwise the buffer is discarded. Writing the
//! clip is the caller's job so frame ingestion never waits on encoding.
//!
//! The recorder is not internally synchronized; callers serialize frames per
//! feed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;

use crate::annotate::{encode_jpeg, Annotator, Overlay};
use crate::detect::Detection;
use crate::geometry::Rect;
use crate::timestamp::{clip_stem, day_bucket, hour_bucket, seconds_between, Timestamp};

/// JPEG-encoded annotated frame, shared between the clip buffer and the
/// live preview.
pub type JpegFrame = Arc<[u8]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
}

/// Timing policy for one recorder.
#[derive(Clone, Debug)]
pub struct RecorderSettings {
    /// Nominal capture rate used to convert durations into frame counts.
    pub fps: f64,
    pub min_clip_secs: f64,
    pub max_clip_secs: f64,
    pub max_detection_delay_secs: f64,
    pub jpeg_quality: u8,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            fps: 24.0,
            min_clip_secs: 1.0,
            max_clip_secs: 3.0,
            max_detection_delay_secs: 2.0,
            jpeg_quality: 85,
        }
    }
}

impl RecorderSettings {
    pub fn min_frames(&self) -> f64 {
        self.fps * self.min_clip_secs
    }

    pub fn max_frames(&self) -> f64 {
        self.fps * self.max_clip_secs
    }
}

/// Where a feed's clips land on disk.
#[derive(Clone, Debug)]
pub struct ClipLayout {
    pub events_root: PathBuf,
    /// Device id used both as a folder and as a file name prefix.
    pub namespace: Option<String>,
    pub extension: String,
}

impl ClipLayout {
    pub fn new(events_root: impl Into<PathBuf>, namespace: Option<String>, extension: &str) -> Self {
        Self {
            events_root: events_root.into(),
            namespace,
            extension: extension.to_string(),
        }
    }

    /// Folder holding this layout's day buckets.
    pub fn archive_root(&self) -> PathBuf {
        match &self.namespace {
            Some(device) => self.events_root.join(device),
            None => self.events_root.clone(),
        }
    }
}

/// Output location of one clip, fixed when its session starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputDescriptor {
    pub file_name: String,
    pub day: String,
    pub hour: String,
    pub path: PathBuf,
    pub started_at: String,
}

impl OutputDescriptor {
    pub fn new(layout: &ClipLayout, ts: &Timestamp) -> Self {
        let stem = clip_stem(ts);
        let file_name = match &layout.namespace {
            Some(device) => format!("{device}_{stem}"),
            None => stem,
        };
        let day = day_bucket(ts);
        let hour = hour_bucket(ts);
        let path = layout
            .archive_root()
            .join(&day)
            .join(&hour)
            .join(format!("{}.{}", file_name, layout.extension));
        Self {
            file_name,
            day,
            hour,
            path,
            started_at: crate::timestamp::format_timestamp(ts),
        }
    }

    /// Path relative to the events root, as served by the video endpoint.
    pub fn relative_path(&self, events_root: &Path) -> PathBuf {
        self.path
            .strip_prefix(events_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.path.clone())
    }
}

/// A closed session ready for the clip writer.
#[derive(Clone, Debug)]
pub struct FinalizedClip {
    pub feed_id: String,
    pub descriptor: OutputDescriptor,
    pub frames: Vec<JpegFrame>,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl FinalizedClip {
    pub fn duration_secs(&self) -> f64 {
        self.frames.len() as f64 / self.fps
    }
}

#[derive(Clone, Debug)]
pub enum Finalization {
    Saved(FinalizedClip),
    Discarded { frames: usize },
}

/// Mutable recording state for one feed.
#[derive(Debug, Default)]
pub struct RecordingSession {
    active: bool,
    buffer: Vec<JpegFrame>,
    last_breach_time: Option<Timestamp>,
    output: Option<OutputDescriptor>,
    frame_size: (u32, u32),
}

impl RecordingSession {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_breach_time(&self) -> Option<&Timestamp> {
        self.last_breach_time.as_ref()
    }

    pub fn output(&self) -> Option<&OutputDescriptor> {
        self.output.as_ref()
    }

    fn reset(&mut self) {
        self.active = false;
        self.buffer.clear();
        self.last_breach_time = None;
        self.output = None;
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RecorderStats {
    pub frames_processed: u64,
    pub events_saved: u64,
    pub events_discarded: u64,
    pub rollovers: u64,
}

/// Result of advancing the recorder by one frame.
#[derive(Debug)]
pub struct FrameOutcome {
    pub annotated: JpegFrame,
    pub breach: bool,
    pub state: RecorderState,
    pub finalized: Option<Finalization>,
}

pub struct EventRecorder {
    feed_id: String,
    annotator: Annotator,
    settings: RecorderSettings,
    layout: ClipLayout,
    session: RecordingSession,
    stats: RecorderStats,
}

impl EventRecorder {
    pub fn new(
        feed_id: impl Into<String>,
        zone: Rect,
        settings: RecorderSettings,
        layout: ClipLayout,
    ) -> Self {
        Self {
            feed_id: feed_id.into(),
            annotator: Annotator::new(zone),
            settings,
            layout,
            session: RecordingSession::default(),
            stats: RecorderStats::default(),
        }
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    pub fn state(&self) -> RecorderState {
        if self.session.active {
            RecorderState::Recording
        } else {
            RecorderState::Idle
        }
    }

    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    pub fn layout(&self) -> &ClipLayout {
        &self.layout
    }

    /// Any detection intersecting the zone (boundary contact included).
    pub fn is_breach(&self, detections: &[Detection]) -> bool {
        let zone = self.annotator.zone();
        detections.iter().any(|det| det.invades(zone))
    }

    /// Advances the state machine by one frame.
    ///
    /// Only JPEG encoding of the annotated frame can fail, and it fails
    /// before any session state is touched.
    pub fn process_frame(
        &mut self,
        frame: &RgbImage,
        detections: &[Detection],
        timestamp: Timestamp,
        fps_hint: Option<f64>,
    ) -> Result<FrameOutcome, image::ImageError> {
        let breach = self.is_breach(detections);
        let overlay = Overlay {
            feed_label: &self.feed_id,
            timestamp: &timestamp,
            recording: self.session.active || breach,
            fps: fps_hint,
        };
        let annotated = self.annotator.annotate(frame, detections, &overlay);
        let jpeg: JpegFrame = encode_jpeg(&annotated, self.settings.jpeg_quality)?.into();

        self.stats.frames_processed += 1;
        let finalized = if breach {
            self.on_breach_frame(jpeg.clone(), timestamp, annotated.dimensions())
        } else {
            self.on_clean_frame(timestamp)
        };

        Ok(FrameOutcome {
            annotated: jpeg,
            breach,
            state: self.state(),
            finalized,
        })
    }

    /// Closes any open session, e.g. at shutdown.
    pub fn flush(&mut self) -> Option<Finalization> {
        if !self.session.active {
            return None;
        }
        let out = self.finalize();
        self.session.reset();
        out
    }

    fn on_breach_frame(
        &mut self,
        frame: JpegFrame,
        timestamp: Timestamp,
        frame_size: (u32, u32),
    ) -> Option<Finalization> {
        if !self.session.active {
            let descriptor = OutputDescriptor::new(&self.layout, &timestamp);
            log::info!(
                "[{}] security breach detected - starting recording: {}",
                self.feed_id,
                descriptor.file_name
            );
            self.session.active = true;
            self.session.output = Some(descriptor);
        }
        if let Some(prev) = self.session.last_breach_time {
            if timestamp < prev {
                log::debug!(
                    "[{}] breach timestamp moved backward by {:.1}s",
                    self.feed_id,
                    seconds_between(&prev, &timestamp)
                );
            }
        }
        self.session.last_breach_time = Some(timestamp);
        if self.session.buffer.is_empty() {
            self.session.frame_size = frame_size;
        }
        self.session.buffer.push(frame);

        if self.rollover_due() {
            return self.rollover(timestamp);
        }
        None
    }

    fn on_clean_frame(&mut self, timestamp: Timestamp) -> Option<Finalization> {
        if !self.session.active {
            return None;
        }
        let last_breach = self.session.last_breach_time?;
        if seconds_between(&timestamp, &last_breach) >= self.settings.max_detection_delay_secs {
            let out = self.finalize();
            self.session.reset();
            return out;
        }
        if self.rollover_due() {
            return self.rollover(timestamp);
        }
        None
    }

    fn rollover_due(&self) -> bool {
        self.session.buffer.len() as f64 >= self.settings.max_frames()
    }

    fn rollover(&mut self, timestamp: Timestamp) -> Option<Finalization> {
        log::info!(
            "[{}] max recording duration reached ({} frames) - rolling over",
            self.feed_id,
            self.session.buffer.len()
        );
        let out = self.finalize();
        self.stats.rollovers += 1;
        self.session.output = Some(OutputDescriptor::new(&self.layout, &timestamp));
        out
    }

    /// Takes the buffer and descriptor out of the session. The caller decides
    /// whether the session itself stays open.
    fn finalize(&mut self) -> Option<Finalization> {
        let frames = std::mem::take(&mut self.session.buffer);
        let descriptor = self.session.output.take();
        if frames.is_empty() {
            return None;
        }
        let count = frames.len();
        if (count as f64) < self.settings.min_frames() {
            log::info!(
                "[{}] recording too short ({} frames) - discarding",
                self.feed_id,
                count
            );
            self.stats.events_discarded += 1;
            return Some(Finalization::Discarded { frames: count });
        }
        let Some(descriptor) = descriptor else {
            log::warn!(
                "[{}] session closed without an output descriptor - discarding {} frames",
                self.feed_id,
                count
            );
            self.stats.events_discarded += 1;
            return Some(Finalization::Discarded { frames: count });
        };
        self.stats.events_saved += 1;
        let (width, height) = self.session.frame_size;
        Some(Finalization::Saved(FinalizedClip {
            feed_id: self.feed_id.clone(),
            descriptor,
            frames,
            fps: self.settings.fps,
            width,
            height,
        }))
    }
}
