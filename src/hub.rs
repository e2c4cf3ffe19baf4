//! Multi-feed orchestration.
//!
//! The hub owns one `EventRecorder` per configured device. Frames for a feed
//! are serialized through that feed's mutex; feeds never share recorder
//! state. Finalized clips are written on their own thread so ingestion never
//! waits on encoding, and every `event_check_interval` saved clips a storage
//! supervision run is triggered from that write path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::catalog::{list_events, list_events_relative_to, DayEntry};
use crate::clip::ClipSink;
use crate::config::HubConfig;
use crate::detect::DetectionFilter;
use crate::error::IngestError;
use crate::message::FrameMessage;
use crate::recorder::{EventRecorder, FinalizedClip, Finalization, JpegFrame, RecorderState};
use crate::storage::{folder_size_bytes, StorageSupervisor, BYTES_PER_GB};

/// Device key used in the events listing when clips are not namespaced.
pub const DEFAULT_NAMESPACE: &str = "default";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct FeedCounters {
    frames_received: u64,
    frames_dropped: u64,
    write_failures: u64,
    last_frame_time: Option<f64>,
}

/// One device's recorder plus what the api needs to report on it.
pub struct Feed {
    id: String,
    recorder: Mutex<EventRecorder>,
    counters: Mutex<FeedCounters>,
    latest: Mutex<Option<JpegFrame>>,
    started: Instant,
}

impl Feed {
    fn new(id: &str, recorder: EventRecorder) -> Self {
        Self {
            id: id.to_string(),
            recorder: Mutex::new(recorder),
            counters: Mutex::new(FeedCounters::default()),
            latest: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Most recent annotated frame, JPEG encoded.
    pub fn latest_frame(&self) -> Option<JpegFrame> {
        lock(&self.latest).clone()
    }

    pub fn status(&self) -> FeedStatus {
        let (stats, state, buffer) = {
            let recorder = lock(&self.recorder);
            (
                recorder.stats(),
                recorder.state(),
                recorder.session().buffer_len(),
            )
        };
        let counters = lock(&self.counters);
        FeedStatus {
            device_id: self.id.clone(),
            frames_received: counters.frames_received,
            frames_dropped: counters.frames_dropped,
            events_saved: stats.events_saved,
            events_discarded: stats.events_discarded,
            write_failures: counters.write_failures,
            current_buffer_size: buffer,
            recording: state == RecorderState::Recording,
            uptime_seconds: self.started.elapsed().as_secs(),
            last_frame_time: counters.last_frame_time,
            has_current_frame: lock(&self.latest).is_some(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FeedStatus {
    pub device_id: String,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub events_saved: u64,
    pub events_discarded: u64,
    pub write_failures: u64,
    pub current_buffer_size: usize,
    pub recording: bool,
    pub uptime_seconds: u64,
    /// Unix seconds when the last frame was received.
    pub last_frame_time: Option<f64>,
    pub has_current_frame: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub feed: FeedStatus,
    pub storage_used_gb: f64,
    pub storage_capacity_gb: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct HubStatus {
    pub feeds: Vec<FeedStatus>,
    pub storage_used_gb: f64,
    pub storage_capacity_gb: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EventsListing {
    pub events_by_device: BTreeMap<String, Vec<DayEntry>>,
    pub total_events: usize,
    pub storage_used_gb: f64,
}

/// Result of one accepted frame message.
#[derive(Clone, Debug, Serialize)]
pub struct FrameReport {
    pub device_id: String,
    pub breach: bool,
    pub state: RecorderState,
    pub buffer_size: usize,
}

pub struct Hub {
    config: Arc<HubConfig>,
    filter: DetectionFilter,
    writer: Arc<dyn ClipSink>,
    supervisor: Arc<StorageSupervisor>,
    feeds: BTreeMap<String, Arc<Feed>>,
    saved_clips: Arc<AtomicU64>,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Builds a hub writing clips with the configured `ClipWriter`.
    pub fn new(config: HubConfig) -> Self {
        let writer: Arc<dyn ClipSink> = Arc::new(config.clip_writer());
        Self::with_sink(config, writer)
    }

    /// Builds a hub around an explicit clip sink and runs the startup
    /// supervision pass.
    pub fn with_sink(config: HubConfig, writer: Arc<dyn ClipSink>) -> Self {
        let supervisor = Arc::new(StorageSupervisor::new(
            config.events_root.clone(),
            config.capacity_gb,
            config.archive_layout(),
        ));
        let mut feeds = BTreeMap::new();
        for device in &config.devices {
            let mut layout = config.clip_layout(device);
            layout.extension = writer.extension().to_string();
            let recorder =
                EventRecorder::new(device.clone(), config.zone, config.recorder_settings(), layout);
            feeds.insert(device.clone(), Arc::new(Feed::new(device, recorder)));
        }
        log::info!(
            "hub ready: {} feed(s) [{}], events root {}",
            feeds.len(),
            config.devices.join(", "),
            config.events_root.display()
        );
        if let Err(err) = supervisor.supervise() {
            log::error!("STORAGE: startup supervision failed: {}", err);
        }
        Self {
            filter: config.detection_filter(),
            config: Arc::new(config),
            writer,
            supervisor,
            feeds,
            saved_clips: Arc::new(AtomicU64::new(0)),
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<StorageSupervisor> {
        &self.supervisor
    }

    pub fn feed(&self, device: &str) -> Option<&Arc<Feed>> {
        self.feeds.get(device)
    }

    pub fn default_feed(&self) -> Option<&Arc<Feed>> {
        self.feeds.get(&self.config.default_device)
    }

    pub fn feeds(&self) -> impl Iterator<Item = &Arc<Feed>> {
        self.feeds.values()
    }

    /// Decodes a JSON frame message and routes it to `device`.
    ///
    /// Errors are counted against the feed and returned for the response;
    /// the recorder stays advanceable regardless.
    pub fn handle_message(&self, device: &str, body: &[u8]) -> Result<FrameReport, IngestError> {
        let feed = self
            .feeds
            .get(device)
            .ok_or_else(|| IngestError::UnknownDevice(device.to_string()))?;
        {
            let mut counters = lock(&feed.counters);
            counters.frames_received += 1;
            counters.last_frame_time = Some(unix_now());
        }
        let message = match FrameMessage::from_json(body) {
            Ok(message) => message,
            Err(err) => {
                lock(&feed.counters).frames_dropped += 1;
                log::warn!("[{}] dropping frame message: {}", device, err);
                return Err(err.into());
            }
        };
        self.process(feed, message)
    }

    /// Routes an already decoded message. Counts it as received.
    pub fn handle_frame(
        &self,
        device: &str,
        message: FrameMessage,
    ) -> Result<FrameReport, IngestError> {
        let feed = self
            .feeds
            .get(device)
            .ok_or_else(|| IngestError::UnknownDevice(device.to_string()))?;
        {
            let mut counters = lock(&feed.counters);
            counters.frames_received += 1;
            counters.last_frame_time = Some(unix_now());
        }
        self.process(feed, message)
    }

    fn process(&self, feed: &Arc<Feed>, message: FrameMessage) -> Result<FrameReport, IngestError> {
        // the zone is validated against the configured frame size
        if let Err(err) = message.ensure_size(self.config.frame.width, self.config.frame.height) {
            lock(&feed.counters).frames_dropped += 1;
            log::warn!("[{}] dropping frame: {}", feed.id, err);
            return Err(err.into());
        }
        let detections = self.filter.apply(message.detections);
        let (outcome, buffer_size) = {
            let mut recorder = lock(&feed.recorder);
            let outcome = recorder
                .process_frame(&message.frame, &detections, message.timestamp, message.fps)
                .map_err(|err| {
                    lock(&feed.counters).frames_dropped += 1;
                    log::warn!("[{}] dropping frame: {}", feed.id, err);
                    err
                })?;
            (outcome, recorder.session().buffer_len())
        };
        *lock(&feed.latest) = Some(outcome.annotated.clone());

        if let Some(Finalization::Saved(clip)) = outcome.finalized {
            self.dispatch_write(feed, clip);
        }
        Ok(FrameReport {
            device_id: feed.id.clone(),
            breach: outcome.breach,
            state: outcome.state,
            buffer_size,
        })
    }

    fn dispatch_write(&self, feed: &Arc<Feed>, clip: FinalizedClip) {
        let writer = Arc::clone(&self.writer);
        let feed = Arc::clone(feed);
        let supervisor = Arc::clone(&self.supervisor);
        let saved_clips = Arc::clone(&self.saved_clips);
        let interval = u64::from(self.config.event_check_interval.max(1));
        let handle = std::thread::spawn(move || {
            if write_clip(writer.as_ref(), &feed, &clip) {
                let saved = saved_clips.fetch_add(1, Ordering::AcqRel) + 1;
                if saved % interval == 0 {
                    supervisor.spawn();
                }
            }
        });
        let mut pending = lock(&self.pending_writes);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Blocks until every dispatched clip write has finished.
    pub fn wait_for_writes(&self) {
        let handles: Vec<_> = lock(&self.pending_writes).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("clip writer thread panicked");
            }
        }
    }

    /// Flushes every open session, writing qualifying buffers synchronously,
    /// then waits for outstanding writes.
    pub fn shutdown(&self) {
        for feed in self.feeds.values() {
            let finalized = lock(&feed.recorder).flush();
            match finalized {
                Some(Finalization::Saved(clip)) => {
                    log::info!("[{}] flushing open recording on shutdown", feed.id);
                    write_clip(self.writer.as_ref(), feed, &clip);
                }
                Some(Finalization::Discarded { frames }) => {
                    log::info!(
                        "[{}] discarded {} buffered frames on shutdown",
                        feed.id,
                        frames
                    );
                }
                None => {}
            }
        }
        self.wait_for_writes();
    }

    pub fn storage_used_gb(&self) -> f64 {
        match folder_size_bytes(&self.config.events_root) {
            Ok(bytes) => bytes as f64 / BYTES_PER_GB,
            Err(err) => {
                log::warn!("STORAGE: {}", err);
                0.0
            }
        }
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            feeds: self.feeds.values().map(|f| f.status()).collect(),
            storage_used_gb: self.storage_used_gb(),
            storage_capacity_gb: self.config.capacity_gb,
        }
    }

    pub fn device_status(&self, device: &str) -> Option<DeviceStatus> {
        let feed = self.feeds.get(device)?;
        Some(DeviceStatus {
            feed: feed.status(),
            storage_used_gb: self.storage_used_gb(),
            storage_capacity_gb: self.config.capacity_gb,
        })
    }

    pub fn events(&self) -> EventsListing {
        let root = &self.config.events_root;
        let mut events_by_device = BTreeMap::new();
        if self.config.namespace_by_device {
            for device in self.feeds.keys() {
                let catalog = list_events_relative_to(&root.join(device), root);
                events_by_device.insert(device.clone(), catalog.days);
            }
        } else {
            events_by_device.insert(DEFAULT_NAMESPACE.to_string(), list_events(root).days);
        }
        let total_events = events_by_device
            .values()
            .flat_map(|days| days.iter())
            .flat_map(|day| day.hours.iter())
            .map(|hour| hour.videos.len())
            .sum();
        EventsListing {
            events_by_device,
            total_events,
            storage_used_gb: self.storage_used_gb(),
        }
    }
}

fn write_clip(writer: &dyn ClipSink, feed: &Feed, clip: &FinalizedClip) -> bool {
    match writer.write_clip(clip) {
        Ok(path) => {
            log::info!(
                "[{}] clip saved: {} ({:.1}s, {} frames)",
                feed.id,
                path.display(),
                clip.duration_secs(),
                clip.frames.len()
            );
            true
        }
        Err(err) => {
            lock(&feed.counters).write_failures += 1;
            log::error!(
                "[{}] failed to write clip {}: {}",
                feed.id,
                clip.descriptor.path.display(),
                err
            );
            false
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
