use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clip::{ClipSink, ClipWriter, TranscodeSettings};
use crate::detect::DetectionFilter;
use crate::error::ConfigError;
use crate::geometry::{Point, Rect};
use crate::recorder::{ClipLayout, RecorderSettings};
use crate::storage::ArchiveLayout;

const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_EVENTS_ROOT: &str = "/tmp/events";
const DEFAULT_CAPACITY_GB: f64 = 3.0;
const DEFAULT_EVENT_CHECK_INTERVAL: u32 = 12;
const DEFAULT_FRAME_WIDTH: u32 = 1280;
const DEFAULT_FRAME_HEIGHT: u32 = 720;
const DEFAULT_TARGET_FPS: f64 = 24.0;
const DEFAULT_STREAM_FPS: f64 = 30.0;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_ZONE: [i64; 4] = [880, 360, 1280, 720];
const DEFAULT_MIN_CLIP_SECS: f64 = 1.0;
const DEFAULT_MAX_CLIP_SECS: f64 = 3.0;
const DEFAULT_MAX_DETECTION_DELAY_SECS: f64 = 2.0;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.3;
const DEFAULT_ALLOWLIST: &[&str] = &["person", "dog"];
const DEFAULT_DEVICE: &str = "pi1";
const DEFAULT_FFMPEG: &str = "ffmpeg";

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    api: Option<ApiConfigFile>,
    events: Option<EventsConfigFile>,
    frame: Option<FrameConfigFile>,
    zone: Option<ZoneConfigFile>,
    recording: Option<RecordingConfigFile>,
    detection: Option<DetectionConfigFile>,
    devices: Option<DevicesConfigFile>,
    transcode: Option<TranscodeConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    root: Option<PathBuf>,
    capacity_gb: Option<f64>,
    check_interval: Option<u32>,
    namespace_by_device: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct FrameConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<f64>,
    stream_fps: Option<f64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct ZoneConfigFile {
    start: Option<[i64; 2]>,
    end: Option<[i64; 2]>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    min_clip_secs: Option<f64>,
    max_clip_secs: Option<f64>,
    max_detection_delay_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    score_threshold: Option<f32>,
    allowlist: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct DevicesConfigFile {
    ids: Option<Vec<String>>,
    default: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TranscodeConfigFile {
    enabled: Option<bool>,
    program: Option<String>,
    preset: Option<String>,
    crf: Option<u8>,
    timeout_secs: Option<u64>,
}

/// Validated hub configuration. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub api_addr: String,
    pub events_root: PathBuf,
    pub capacity_gb: f64,
    /// Saved events between supervision runs.
    pub event_check_interval: u32,
    pub namespace_by_device: bool,
    pub frame: FrameSettings,
    pub zone: Rect,
    pub recording: RecordingSettings,
    pub detection: DetectionSettings,
    pub devices: Vec<String>,
    pub default_device: String,
    pub transcode: TranscodeConfig,
}

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: f64,
    pub stream_fps: f64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub min_clip_secs: f64,
    pub max_clip_secs: f64,
    pub max_detection_delay_secs: f64,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub score_threshold: f32,
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub enabled: bool,
    pub program: String,
    pub preset: String,
    pub crf: u8,
    pub timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_file(HubConfigFile::default())
    }
}

impl HubConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("SAFEZONE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads a specific file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HubConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let events = file.events.unwrap_or_default();
        let frame = file.frame.unwrap_or_default();
        let frame = FrameSettings {
            width: frame.width.unwrap_or(DEFAULT_FRAME_WIDTH),
            height: frame.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
            target_fps: frame.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            stream_fps: frame.stream_fps.unwrap_or(DEFAULT_STREAM_FPS),
            jpeg_quality: frame.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let zone = file.zone.unwrap_or_default();
        let [x1, y1, x2, y2] = DEFAULT_ZONE;
        let start = zone.start.unwrap_or([x1, y1]);
        let end = zone.end.unwrap_or([x2, y2]);
        let zone = Rect::new(Point::new(start[0], start[1]), Point::new(end[0], end[1]));

        let recording = file.recording.unwrap_or_default();
        let recording = RecordingSettings {
            min_clip_secs: recording.min_clip_secs.unwrap_or(DEFAULT_MIN_CLIP_SECS),
            max_clip_secs: recording.max_clip_secs.unwrap_or(DEFAULT_MAX_CLIP_SECS),
            max_detection_delay_secs: recording
                .max_detection_delay_secs
                .unwrap_or(DEFAULT_MAX_DETECTION_DELAY_SECS),
        };

        let detection = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            score_threshold: detection.score_threshold.unwrap_or(DEFAULT_SCORE_THRESHOLD),
            allowlist: detection
                .allowlist
                .unwrap_or_else(|| DEFAULT_ALLOWLIST.iter().map(|c| c.to_string()).collect()),
        };

        let devices = file.devices.unwrap_or_default();
        let ids = devices
            .ids
            .unwrap_or_else(|| vec![DEFAULT_DEVICE.to_string()]);
        let default_device = devices
            .default
            .or_else(|| ids.first().cloned())
            .unwrap_or_else(|| DEFAULT_DEVICE.to_string());

        let transcode = file.transcode.unwrap_or_default();
        let defaults = TranscodeSettings::default();
        let transcode = TranscodeConfig {
            enabled: transcode.enabled.unwrap_or(true),
            program: transcode
                .program
                .unwrap_or_else(|| DEFAULT_FFMPEG.to_string()),
            preset: transcode.preset.unwrap_or(defaults.preset),
            crf: transcode.crf.unwrap_or(defaults.crf),
            timeout_secs: transcode
                .timeout_secs
                .unwrap_or(defaults.timeout.as_secs()),
        };

        Self {
            api_addr,
            events_root: events
                .root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EVENTS_ROOT)),
            capacity_gb: events.capacity_gb.unwrap_or(DEFAULT_CAPACITY_GB),
            event_check_interval: events
                .check_interval
                .unwrap_or(DEFAULT_EVENT_CHECK_INTERVAL),
            namespace_by_device: events.namespace_by_device.unwrap_or(true),
            frame,
            zone,
            recording,
            detection,
            devices: ids,
            default_device,
            transcode,
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("SAFEZONE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr.trim().to_string();
            }
        }
        if let Ok(root) = std::env::var("SAFEZONE_EVENTS_ROOT") {
            if !root.trim().is_empty() {
                self.events_root = PathBuf::from(root.trim());
            }
        }
        if let Ok(capacity) = std::env::var("SAFEZONE_CAPACITY_GB") {
            self.capacity_gb = capacity.trim().parse().map_err(|_| ConfigError::Env {
                key: "SAFEZONE_CAPACITY_GB",
                reason: "must be a number of gigabytes".to_string(),
            })?;
        }
        if let Ok(devices) = std::env::var("SAFEZONE_DEVICES") {
            let parsed = split_csv(&devices);
            if !parsed.is_empty() {
                if !parsed.contains(&self.default_device) {
                    self.default_device = parsed[0].clone();
                }
                self.devices = parsed;
            }
        }
        if let Ok(zone) = std::env::var("SAFEZONE_ZONE") {
            self.zone = parse_zone(&zone)?;
        }
        if let Ok(allowlist) = std::env::var("SAFEZONE_ALLOWLIST") {
            self.detection.allowlist = split_csv(&allowlist);
        }
        if let Ok(threshold) = std::env::var("SAFEZONE_SCORE_THRESHOLD") {
            self.detection.score_threshold =
                threshold.trim().parse().map_err(|_| ConfigError::Env {
                    key: "SAFEZONE_SCORE_THRESHOLD",
                    reason: "must be a number between 0 and 1".to_string(),
                })?;
        }
        if let Ok(transcode) = std::env::var("SAFEZONE_TRANSCODE") {
            self.transcode.enabled = parse_bool(&transcode).ok_or(ConfigError::Env {
                key: "SAFEZONE_TRANSCODE",
                reason: "must be true or false".to_string(),
            })?;
        }
        if let Ok(program) = std::env::var("SAFEZONE_FFMPEG") {
            if !program.trim().is_empty() {
                self.transcode.program = program.trim().to_string();
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let (w, h) = (self.frame.width as i64, self.frame.height as i64);
        let zone = &self.zone;

        if self.frame.width == 0 || self.frame.height == 0 {
            return invalid("frame width and height must be greater than zero".into());
        }
        if zone.start.x >= zone.end.x || zone.start.y >= zone.end.y {
            return invalid(format!(
                "zone start ({}, {}) must be above and left of end ({}, {})",
                zone.start.x, zone.start.y, zone.end.x, zone.end.y
            ));
        }
        if zone.start.x < 0 || zone.start.y < 0 || zone.end.x > w || zone.end.y > h {
            return invalid(format!("zone must lie within the {}x{} frame", w, h));
        }
        if !(self.frame.target_fps > 0.0) || !(self.frame.stream_fps > 0.0) {
            return invalid("fps values must be greater than zero".into());
        }
        if self.frame.jpeg_quality == 0 || self.frame.jpeg_quality > 100 {
            return invalid("jpeg_quality must be within 1..=100".into());
        }
        let rec = &self.recording;
        if !(rec.min_clip_secs > 0.0) {
            return invalid("min_clip_secs must be greater than zero".into());
        }
        if rec.min_clip_secs >= rec.max_clip_secs {
            return invalid(format!(
                "min_clip_secs ({}) must be less than max_clip_secs ({})",
                rec.min_clip_secs, rec.max_clip_secs
            ));
        }
        if !(rec.max_detection_delay_secs > 0.0) {
            return invalid("max_detection_delay_secs must be greater than zero".into());
        }
        if !(0.0..=1.0).contains(&self.detection.score_threshold) {
            return invalid("score_threshold must be within [0, 1]".into());
        }
        if !(self.capacity_gb > 0.0) {
            return invalid("capacity_gb must be greater than zero".into());
        }
        if self.event_check_interval == 0 {
            return invalid("event check interval must be greater than zero".into());
        }
        if self.transcode.enabled && self.transcode.timeout_secs == 0 {
            return invalid("transcode timeout_secs must be greater than zero".into());
        }
        if self.devices.is_empty() {
            return invalid("at least one device id is required".into());
        }
        for id in &self.devices {
            validate_device_id(id)?;
        }
        if !self.devices.contains(&self.default_device) {
            return invalid(format!(
                "default device '{}' is not among the configured devices",
                self.default_device
            ));
        }
        Ok(())
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            fps: self.frame.target_fps,
            min_clip_secs: self.recording.min_clip_secs,
            max_clip_secs: self.recording.max_clip_secs,
            max_detection_delay_secs: self.recording.max_detection_delay_secs,
            jpeg_quality: self.frame.jpeg_quality,
        }
    }

    pub fn detection_filter(&self) -> DetectionFilter {
        DetectionFilter::new(self.detection.score_threshold, &self.detection.allowlist)
    }

    pub fn clip_writer(&self) -> ClipWriter {
        if self.transcode.enabled {
            ClipWriter::with_transcode(TranscodeSettings {
                program: self.transcode.program.clone(),
                preset: self.transcode.preset.clone(),
                crf: self.transcode.crf,
                timeout: Duration::from_secs(self.transcode.timeout_secs),
            })
        } else {
            ClipWriter::mjpeg()
        }
    }

    pub fn clip_layout(&self, device: &str) -> ClipLayout {
        let namespace = self.namespace_by_device.then(|| device.to_string());
        ClipLayout::new(
            self.events_root.clone(),
            namespace,
            self.clip_writer().extension(),
        )
    }

    pub fn archive_layout(&self) -> ArchiveLayout {
        if self.namespace_by_device {
            ArchiveLayout::PerDevice
        } else {
            ArchiveLayout::Flat
        }
    }
}

/// Device ids become path segments and url components.
pub fn validate_device_id(id: &str) -> Result<(), ConfigError> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::Invalid(format!(
            "device id '{}' must be non-empty and use only [A-Za-z0-9_-]",
            id
        )));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<HubConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse_zone(value: &str) -> Result<Rect, ConfigError> {
    let parts: Result<Vec<i64>, _> = value.split(',').map(|p| p.trim().parse()).collect();
    match parts.as_deref() {
        Ok([x1, y1, x2, y2]) => Ok(Rect::new(Point::new(*x1, *y1), Point::new(*x2, *y2))),
        _ => Err(ConfigError::Env {
            key: "SAFEZONE_ZONE",
            reason: "expected four integers x1,y1,x2,y2".to_string(),
        }),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
