//! Read-only listing of the clip archive: `<root>/<day>/<hour>/<clip>`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::clip::is_temp_path;

pub const CLIP_EXTENSIONS: &[&str] = &["mp4", "avi"];

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EventCatalog {
    pub days: Vec<DayEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DayEntry {
    pub date: String,
    pub hours: Vec<HourEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HourEntry {
    pub time: String,
    pub videos: Vec<ClipEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClipEntry {
    pub filename: String,
    pub display_name: String,
    /// Forward-slash path relative to the catalog base, usable in `/video/`.
    pub path: String,
    pub size: u64,
    pub size_mb: f64,
    pub modified: String,
}

impl EventCatalog {
    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn total_clips(&self) -> usize {
        self.days
            .iter()
            .flat_map(|d| d.hours.iter())
            .map(|h| h.videos.len())
            .sum()
    }
}

/// Lists clips under `root` with paths relative to `root`.
pub fn list_events(root: &Path) -> EventCatalog {
    list_events_relative_to(root, root)
}

/// Lists clips under `root` with paths relative to `base`, which must be
/// `root` or one of its ancestors.
pub fn list_events_relative_to(root: &Path, base: &Path) -> EventCatalog {
    let mut catalog = EventCatalog::default();
    for day_dir in sorted_dirs(root) {
        let mut day = DayEntry {
            date: file_name(&day_dir),
            hours: Vec::new(),
        };
        for hour_dir in sorted_dirs(&day_dir) {
            let videos: Vec<ClipEntry> = sorted_files(&hour_dir)
                .into_iter()
                .filter_map(|path| clip_entry(&path, base))
                .collect();
            if !videos.is_empty() {
                day.hours.push(HourEntry {
                    time: file_name(&hour_dir),
                    videos,
                });
            }
        }
        if !day.hours.is_empty() {
            catalog.days.push(day);
        }
    }
    catalog
}

/// `pi1_October18_14hr_03min05sec.mp4` -> `03min05sec`.
pub fn display_name(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    stem.rsplit('_').next().unwrap_or(stem).to_string()
}

pub fn is_clip_file(path: &Path) -> bool {
    if is_temp_path(path) {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CLIP_EXTENSIONS.iter().any(|c| c.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn clip_entry(path: &Path, base: &Path) -> Option<ClipEntry> {
    if !is_clip_file(path) {
        return None;
    }
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            log::debug!("catalog: skipping {}: {}", path.display(), err);
            return None;
        }
    };
    let filename = file_name(path);
    let rel = path.strip_prefix(base).ok()?;
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let size = meta.len();
    Some(ClipEntry {
        display_name: display_name(&filename),
        filename,
        path: rel,
        size,
        size_mb: ((size as f64 / (1024.0 * 1024.0)) * 100.0).round() / 100.0,
        modified: format_modified(meta.modified().ok()),
    })
}

fn format_modified(time: Option<SystemTime>) -> String {
    match time {
        Some(time) => DateTime::<Local>::from(time)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => String::new(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sorted_entries(path: &Path, want_dir: bool) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| {
            e.file_type()
                .map(|t| if want_dir { t.is_dir() } else { t.is_file() })
                .unwrap_or(false)
        })
        .map(|e| e.path())
        .collect();
    out.sort();
    out
}

fn sorted_dirs(path: &Path) -> Vec<PathBuf> {
    sorted_entries(path, true)
}

fn sorted_files(path: &Path) -> Vec<PathBuf> {
    sorted_entries(path, false)
}
