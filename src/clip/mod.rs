//! Clip persistence.
//!
//! `ClipWriter` muxes a finalized buffer into an MJPEG AVI and, when a
//! transcoder is configured, re-encodes it to H.264 MP4 with an external
//! `ffmpeg` process. Clip duration is `frames / fps` by construction.
//!
//! A writer must not be invoked concurrently for the same output path.

pub mod avi;

use std::fs::{self, File};
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::WriteError;
use crate::recorder::FinalizedClip;

pub use avi::{probe, write_mjpeg_avi, AviInfo};

/// Anything that can turn a finalized clip into a file.
pub trait ClipSink: Send + Sync {
    /// Writes the clip to `clip.descriptor.path` and returns the final path.
    fn write_clip(&self, clip: &FinalizedClip) -> Result<PathBuf, WriteError>;

    /// File extension of produced clips, without the dot.
    fn extension(&self) -> &str;
}

const TRANSCODE_POLL: Duration = Duration::from_millis(50);

/// External H.264 re-encode step.
#[derive(Clone, Debug)]
pub struct TranscodeSettings {
    pub program: String,
    pub preset: String,
    pub crf: u8,
    /// The encoder is killed once it runs longer than this.
    pub timeout: Duration,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            preset: "fast".to_string(),
            crf: 23,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClipWriter {
    transcode: Option<TranscodeSettings>,
}

impl ClipWriter {
    /// Writes MJPEG AVI clips only.
    pub fn mjpeg() -> Self {
        Self { transcode: None }
    }

    pub fn with_transcode(settings: TranscodeSettings) -> Self {
        Self {
            transcode: Some(settings),
        }
    }

    fn write_avi(&self, clip: &FinalizedClip, path: &Path) -> Result<(), WriteError> {
        for (index, frame) in clip.frames.iter().enumerate() {
            if !frame.starts_with(&[0xFF, 0xD8]) {
                return Err(WriteError::Frame { index });
            }
        }
        let file = File::create(path).map_err(|e| WriteError::io(path, e))?;
        let mut out = BufWriter::new(file);
        write_mjpeg_avi(&mut out, &clip.frames, clip.width, clip.height, clip.fps)
            .map_err(|e| WriteError::io(path, e))?;
        let file = out
            .into_inner()
            .map_err(|e| WriteError::io(path, e.into_error()))?;
        file.sync_all().map_err(|e| WriteError::io(path, e))?;
        Ok(())
    }
}

impl ClipSink for ClipWriter {
    fn write_clip(&self, clip: &FinalizedClip) -> Result<PathBuf, WriteError> {
        if clip.frames.is_empty() {
            return Err(WriteError::Empty);
        }
        let path = clip.descriptor.path.clone();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| WriteError::io(parent, e))?;
        }

        log::warn!(
            "[{}] EVENT: {:.0} seconds {}",
            clip.feed_id,
            clip.duration_secs().floor(),
            path.display()
        );

        let tmp_path = temp_path(&path);
        self.write_avi(clip, &tmp_path)?;

        match &self.transcode {
            None => {
                fs::rename(&tmp_path, &path).map_err(|e| WriteError::io(&path, e))?;
            }
            Some(settings) => {
                if let Err(err) = transcode(settings, &tmp_path, &path) {
                    log::error!("[{}] transcode to H.264 failed: {}", clip.feed_id, err);
                    // never a half-written final file; the intermediate stays
                    // reachable as a plain MJPEG clip
                    if path.exists() {
                        let _ = fs::remove_file(&path);
                    }
                    let fallback = fallback_path(&path);
                    match fs::rename(&tmp_path, &fallback) {
                        Ok(()) => log::warn!(
                            "[{}] kept MJPEG clip {}",
                            clip.feed_id,
                            fallback.display()
                        ),
                        Err(e) => log::error!(
                            "[{}] could not keep MJPEG clip {}: {}",
                            clip.feed_id,
                            tmp_path.display(),
                            e
                        ),
                    }
                    return Err(err);
                }
                fs::remove_file(&tmp_path).map_err(|e| WriteError::io(&tmp_path, e))?;
                log::info!("[{}] clip saved as H.264: {}", clip.feed_id, path.display());
            }
        }
        Ok(path)
    }

    fn extension(&self) -> &str {
        if self.transcode.is_some() {
            "mp4"
        } else {
            "avi"
        }
    }
}

/// Intermediate file next to the final clip; the catalog skips these.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp.avi");
    PathBuf::from(name)
}

/// Where the MJPEG intermediate is kept when the transcode fails.
pub fn fallback_path(path: &Path) -> PathBuf {
    path.with_extension("avi")
}

pub fn is_temp_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".tmp.avi"))
        .unwrap_or(false)
}

fn transcode(settings: &TranscodeSettings, input: &Path, output: &Path) -> Result<(), WriteError> {
    let failed = |status: String, stderr: String| WriteError::Transcode {
        program: settings.program.clone(),
        status,
        stderr,
    };
    let mut child = Command::new(&settings.program)
        .arg("-y")
        .args(["-loglevel", "error"])
        .arg("-i")
        .arg(input)
        .args(["-c:v", "libx264", "-preset", &settings.preset])
        .args(["-crf", &settings.crf.to_string()])
        .args(["-pix_fmt", "yuv420p", "-movflags", "+faststart"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| failed("spawn failed".to_string(), e.to_string()))?;

    // stderr is drained off-thread; a full pipe would stall the encoder
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).trim().to_string()
        })
    });
    let collect_stderr = |reader: Option<std::thread::JoinHandle<String>>| {
        reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };

    let deadline = Instant::now() + settings.timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                collect_stderr(stderr_reader);
                return Ok(());
            }
            Ok(Some(status)) => {
                return Err(failed(status.to_string(), collect_stderr(stderr_reader)));
            }
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(failed(
                    format!("timed out after {:?}", settings.timeout),
                    collect_stderr(stderr_reader),
                ));
            }
            Ok(None) => std::thread::sleep(TRANSCODE_POLL),
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(failed("wait failed".to_string(), err.to_string()));
            }
        }
    }
}
