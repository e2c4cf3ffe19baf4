use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use image::RgbImage;

use safezone_hub::clip::{probe, ClipSink, ClipWriter};
use safezone_hub::storage::BYTES_PER_GB;
use safezone_hub::{
    folder_size_bytes, list_events, ArchiveLayout, BoundingBox, ClipLayout, Detection,
    EventRecorder, Finalization, FrameMessage, Hub, HubConfig, Point, RecorderSettings,
    RecorderState, Rect, StorageSupervisor, Timestamp,
};

const FPS: f64 = 24.0;

fn zone() -> Rect {
    Rect::new(Point::new(100, 60), Point::new(160, 120))
}

fn start() -> Timestamp {
    NaiveDate::from_ymd_opt(2026, 10, 18)
        .and_then(|d| d.and_hms_opt(14, 3, 0))
        .expect("valid timestamp")
}

/// Frame `index` of a 24 fps capture, at one-second timestamp resolution.
fn ts_at(index: usize) -> Timestamp {
    start() + Duration::seconds((index as f64 / FPS).floor() as i64)
}

fn invader() -> Vec<Detection> {
    vec![Detection::new(
        BoundingBox {
            x: 110.0,
            y: 70.0,
            width: 20.0,
            height: 20.0,
        },
        "person",
        0.9,
    )]
}

fn recorder(root: &Path) -> EventRecorder {
    EventRecorder::new(
        "pi1",
        zone(),
        RecorderSettings::default(),
        ClipLayout::new(root, None, "avi"),
    )
}

/// Feeds `breach_frames` invading frames then five seconds of clean frames,
/// writing every saved clip. Returns the paths written.
fn run_episode(rec: &mut EventRecorder, breach_frames: usize) -> Vec<std::path::PathBuf> {
    let writer = ClipWriter::mjpeg();
    let frame = RgbImage::new(160, 120);
    let clean_frames = 5 * FPS as usize;
    let mut written = Vec::new();
    for i in 0..breach_frames + clean_frames {
        let detections = if i < breach_frames { invader() } else { Vec::new() };
        let outcome = rec
            .process_frame(&frame, &detections, ts_at(i), Some(FPS))
            .expect("process frame");
        if let Some(Finalization::Saved(clip)) = outcome.finalized {
            written.push(writer.write_clip(&clip).expect("write clip"));
        }
    }
    written
}

#[test]
fn thirty_breach_frames_produce_one_thirty_frame_clip() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path());

    let written = run_episode(&mut rec, 30);

    assert_eq!(written.len(), 1);
    let info = probe(&std::fs::read(&written[0]).unwrap()).expect("avi header");
    assert_eq!(info.total_frames, 30);
    assert_eq!((info.width, info.height), (160, 120));
    assert!((info.duration_secs() - 30.0 / FPS).abs() < 1e-6);
    assert_eq!(
        written[0],
        dir.path().join("October18/14hr/October18_14hr_03min00sec.avi")
    );
    assert_eq!(rec.state(), RecorderState::Idle);
    assert_eq!(rec.stats().events_saved, 1);
    assert_eq!(rec.session().buffer_len(), 0);

    let catalog = list_events(dir.path());
    assert_eq!(catalog.total_clips(), 1);
    assert_eq!(catalog.days[0].hours[0].videos[0].display_name, "03min00sec");
}

#[test]
fn five_breach_frames_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path());

    let written = run_episode(&mut rec, 5);

    assert!(written.is_empty());
    assert_eq!(rec.state(), RecorderState::Idle);
    assert_eq!(rec.session().buffer_len(), 0);
    assert_eq!(rec.stats().events_saved, 0);
    assert_eq!(rec.stats().events_discarded, 1);
    assert_eq!(folder_size_bytes(dir.path()).unwrap(), 0);
}

#[test]
fn continuous_breach_rolls_over_at_max_duration() {
    let dir = tempfile::tempdir().unwrap();
    let mut rec = recorder(dir.path());

    // 7 seconds of breach: two full 72-frame clips and a 24-frame tail
    let written = run_episode(&mut rec, 168);

    assert_eq!(written.len(), 3);
    let frames: Vec<u32> = written
        .iter()
        .map(|p| probe(&std::fs::read(p).unwrap()).unwrap().total_frames)
        .collect();
    assert_eq!(frames, vec![72, 72, 24]);
    assert_eq!(rec.stats().rollovers, 2);
    // each rollover starts a new descriptor at the rollover frame
    assert!(written[1].ends_with("October18_14hr_03min02sec.avi"));
    assert!(written[2].ends_with("October18_14hr_03min05sec.avi"));
}

#[test]
fn hub_writes_clips_off_thread_and_counts_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = HubConfig::default();
    cfg.events_root = dir.path().to_path_buf();
    cfg.transcode.enabled = false;
    cfg.frame.width = 160;
    cfg.frame.height = 120;
    cfg.zone = zone();
    let hub = Hub::with_sink(cfg, Arc::new(ClipWriter::mjpeg()));

    for i in 0..30 + 5 * FPS as usize {
        let detections = if i < 30 { invader() } else { Vec::new() };
        let message = FrameMessage {
            frame: RgbImage::new(160, 120),
            detections,
            timestamp: ts_at(i),
            fps: None,
        };
        hub.handle_frame("pi1", message).expect("frame accepted");
    }
    hub.wait_for_writes();

    let status = hub.device_status("pi1").unwrap();
    assert_eq!(status.feed.events_saved, 1);
    assert_eq!(status.feed.write_failures, 0);
    assert!(!status.feed.recording);
    let events = hub.events();
    assert_eq!(events.total_events, 1);
    let clip = &events.events_by_device["pi1"][0].hours[0].videos[0];
    assert_eq!(clip.filename, "pi1_October18_14hr_03min00sec.avi");
    assert_eq!(clip.path, "pi1/October18/14hr/pi1_October18_14hr_03min00sec.avi");
}

#[test]
fn repeated_supervision_converges_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    for day in ["October10", "October11", "October12", "October13"] {
        let hour = root.join(day).join("08hr");
        std::fs::create_dir_all(&hour).unwrap();
        std::fs::write(hour.join(format!("{day}_08hr_00min00sec.avi")), vec![1u8; 4096]).unwrap();
    }
    let capacity_gb = 9000.0 / BYTES_PER_GB;
    let supervisor = StorageSupervisor::new(root, capacity_gb, ArchiveLayout::Flat);

    let first = supervisor.supervise().unwrap();
    assert_eq!(
        first.deleted,
        vec![root.join("October10"), root.join("October11")]
    );
    assert!(folder_size_bytes(root).unwrap() <= supervisor.capacity_bytes());

    let second = supervisor.supervise().unwrap();
    assert!(second.deleted.is_empty());
    let remaining: Vec<String> = list_events(root)
        .days
        .into_iter()
        .map(|d| d.date)
        .collect();
    assert_eq!(remaining, vec!["October12", "October13"]);
}
