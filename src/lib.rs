//! Safe-zone event hub
//!
//! Receives annotated-detection frame messages from edge cameras, decides
//! whether a monitored rectangle was breached, records breach episodes as
//! video clips under a day/hour archive, keeps that archive under a capacity
//! budget and lists it for the HTTP surface.
//!
//! # Pipeline
//!
//! ```text
//! POST /process_frame ─▶ message::FrameMessage ─▶ detect::DetectionFilter
//!        ─▶ recorder::EventRecorder (annotate, breach test, buffer)
//!        ─▶ clip::ClipSink (off-thread) ─▶ storage::StorageSupervisor
//! GET /events ─▶ catalog::list_events
//! ```
//!
//! # Module Structure
//!
//! - `geometry`: inclusive rectangle intersection
//! - `annotate`: detection boxes, zone, timestamp and status overlays
//! - `recorder`: the per-feed Idle/Recording state machine
//! - `clip`: MJPEG AVI muxing plus optional H.264 transcode
//! - `storage`: oldest-day-first archive pruning
//! - `catalog`: read-only archive listing
//! - `hub`, `api`, `config`: daemon wiring

pub mod annotate;
pub mod api;
pub mod catalog;
pub mod clip;
pub mod config;
pub mod detect;
pub mod error;
pub mod geometry;
pub mod hub;
pub mod message;
pub mod recorder;
pub mod storage;
pub mod timestamp;

pub use annotate::{encode_jpeg, Annotator, Overlay};
pub use catalog::{list_events, ClipEntry, DayEntry, EventCatalog, HourEntry};
pub use clip::{ClipSink, ClipWriter, TranscodeSettings};
pub use config::HubConfig;
pub use detect::{BoundingBox, Detection, DetectionFilter};
pub use error::{ConfigError, DecodeError, IngestError, StorageError, WriteError};
pub use geometry::{rectangles_intersect, Point, Rect};
pub use hub::{FeedStatus, Hub, HubStatus};
pub use message::FrameMessage;
pub use recorder::{
    ClipLayout, EventRecorder, Finalization, FinalizedClip, FrameOutcome, OutputDescriptor,
    RecorderSettings, RecorderState, RecordingSession,
};
pub use storage::{folder_size_bytes, ArchiveLayout, StorageSupervisor, SupervisionReport};
pub use timestamp::{parse_timestamp, Timestamp};
