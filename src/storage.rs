//! Capacity supervision for the events archive.
//!
//! Day-bucket folders are the unit of eviction. With a per-device layout the
//! candidates are `<root>/<device>/<day>`; otherwise `<root>/<day>`. The
//! folder with the smallest day name goes first, so bucket naming decides
//! what "oldest" means.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::Serialize;

use crate::error::StorageError;

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveLayout {
    /// `<root>/<day>/...`
    Flat,
    /// `<root>/<device>/<day>/...`
    PerDevice,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SupervisionReport {
    pub initial_bytes: u64,
    pub final_bytes: u64,
    pub deleted: Vec<PathBuf>,
    /// Still over capacity with nothing left to delete.
    pub exhausted: bool,
}

pub struct StorageSupervisor {
    events_root: PathBuf,
    capacity_bytes: u64,
    layout: ArchiveLayout,
    running: AtomicBool,
}

impl StorageSupervisor {
    pub fn new(events_root: impl Into<PathBuf>, capacity_gb: f64, layout: ArchiveLayout) -> Self {
        Self {
            events_root: events_root.into(),
            capacity_bytes: (capacity_gb * BYTES_PER_GB) as u64,
            layout,
            running: AtomicBool::new(false),
        }
    }

    pub fn events_root(&self) -> &Path {
        &self.events_root
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn usage_bytes(&self) -> Result<u64, StorageError> {
        folder_size_bytes(&self.events_root)
    }

    /// Deletes oldest day folders until usage fits the capacity.
    pub fn supervise(&self) -> Result<SupervisionReport, StorageError> {
        let mut report = SupervisionReport::default();
        if !self.events_root.exists() {
            return Ok(report);
        }
        let mut used = folder_size_bytes(&self.events_root)?;
        report.initial_bytes = used;
        log::info!(
            "STORAGE: '{}' size: {:.4} GB",
            self.events_root.display(),
            used as f64 / BYTES_PER_GB
        );

        while used > self.capacity_bytes {
            let Some(oldest) = self.oldest_folder()? else {
                log::warn!(
                    "STORAGE: '{}' over capacity ({:.4} GB) with no folders left to delete",
                    self.events_root.display(),
                    used as f64 / BYTES_PER_GB
                );
                report.exhausted = true;
                break;
            };
            let freed = delete_folder(&oldest)?;
            used = used.saturating_sub(freed);
            report.deleted.push(oldest);
        }
        report.final_bytes = used;
        Ok(report)
    }

    /// Runs `supervise` on a background thread unless a run is already in
    /// flight, in which case the trigger is dropped.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("STORAGE: supervision already running, skipping trigger");
            return None;
        }
        let supervisor = Arc::clone(self);
        Some(std::thread::spawn(move || {
            if let Err(err) = supervisor.supervise() {
                log::error!("STORAGE: supervision failed: {}", err);
            }
            supervisor.running.store(false, Ordering::Release);
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn oldest_folder(&self) -> Result<Option<PathBuf>, StorageError> {
        let parents = match self.layout {
            ArchiveLayout::Flat => vec![self.events_root.clone()],
            ArchiveLayout::PerDevice => subfolders(&self.events_root)?,
        };
        let mut candidates = Vec::new();
        for parent in parents {
            candidates.extend(subfolders(&parent)?);
        }
        Ok(candidates
            .into_iter()
            .min_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b))))
    }
}

/// Recursive size of regular files under `path`. Entries that vanish during
/// the walk are skipped; a missing `path` measures zero.
pub fn folder_size_bytes(path: &Path) -> Result<u64, StorageError> {
    let measure_err = |source| StorageError::Measure {
        path: path.to_path_buf(),
        source,
    };
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(measure_err(err)),
    };
    if meta.is_file() {
        return Ok(meta.len());
    }
    if !meta.is_dir() {
        return Ok(0);
    }
    let mut total = 0u64;
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(measure_err(err)),
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(measure_err(err)),
        };
        total += folder_size_bytes(&entry.path())?;
    }
    Ok(total)
}

fn subfolders(path: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StorageError::Measure {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn delete_folder(path: &Path) -> Result<u64, StorageError> {
    let size = folder_size_bytes(path)?;
    fs::remove_dir_all(path).map_err(|source| StorageError::Delete {
        path: path.to_path_buf(),
        source,
    })?;
    log::warn!(
        "STORAGE: '{}' deleted (-{:.4} GB)",
        path.display(),
        size as f64 / BYTES_PER_GB
    );
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, len: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![7u8; len]).unwrap();
    }

    fn capacity_gb(bytes: u64) -> f64 {
        bytes as f64 / BYTES_PER_GB
    }

    #[test]
    fn measures_recursively() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a/b/c.bin"), 100);
        write(&dir.path().join("a/d.bin"), 50);
        write(&dir.path().join("e.bin"), 1);
        assert_eq!(folder_size_bytes(dir.path()).unwrap(), 151);
        assert_eq!(folder_size_bytes(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn deletes_smallest_day_folders_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("October01/10hr/a.avi"), 1000);
        write(&root.join("October02/10hr/b.avi"), 1000);
        write(&root.join("October03/10hr/c.avi"), 1000);

        let sup = StorageSupervisor::new(root, capacity_gb(2000), ArchiveLayout::Flat);
        let report = sup.supervise().unwrap();
        assert_eq!(report.initial_bytes, 3000);
        assert_eq!(report.deleted, vec![root.join("October01")]);
        assert!(report.final_bytes <= sup.capacity_bytes());
        assert!(!root.join("October01").exists());
        assert!(root.join("October02").exists());
        assert!(root.join("October03").exists());
    }

    #[test]
    fn under_capacity_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("October01/10hr/a.avi"), 10);
        let sup = StorageSupervisor::new(dir.path(), 1.0, ArchiveLayout::Flat);
        let report = sup.supervise().unwrap();
        assert!(report.deleted.is_empty());
        assert!(!report.exhausted);
    }

    #[test]
    fn stops_when_only_loose_files_remain() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("huge.bin"), 5000);
        write(&dir.path().join("October01/10hr/a.avi"), 10);
        let sup = StorageSupervisor::new(dir.path(), capacity_gb(100), ArchiveLayout::Flat);
        let report = sup.supervise().unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert!(report.exhausted);
        assert!(dir.path().join("huge.bin").exists());
    }

    #[test]
    fn per_device_layout_evicts_oldest_day_across_devices() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("pi1/October05/10hr/a.avi"), 1000);
        write(&root.join("pi2/October02/10hr/b.avi"), 1000);
        write(&root.join("pi2/October07/10hr/c.avi"), 1000);

        let sup = StorageSupervisor::new(root, capacity_gb(1500), ArchiveLayout::PerDevice);
        let report = sup.supervise().unwrap();
        assert_eq!(
            report.deleted,
            vec![root.join("pi2/October02"), root.join("pi1/October05")]
        );
        assert!(root.join("pi1").exists());
        assert!(root.join("pi2/October07").exists());
    }

    #[test]
    fn missing_root_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sup = StorageSupervisor::new(dir.path().join("nope"), 1.0, ArchiveLayout::Flat);
        let report = sup.supervise().unwrap();
        assert_eq!(report.initial_bytes, 0);
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn spawn_runs_in_background() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("October01/10hr/a.avi"), 1000);
        let sup = Arc::new(StorageSupervisor::new(dir.path(), 0.0, ArchiveLayout::Flat));
        let handle = sup.spawn().expect("first trigger runs");
        handle.join().unwrap();
        assert!(!sup.is_running());
        assert!(!dir.path().join("October01").exists());
    }
}
