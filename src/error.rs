//! Error taxonomy for the hub.
//!
//! Per-message failures (`DecodeError`, `WriteError`, `StorageError`) are
//! contained by the component that raised them and only ever logged.
//! `ConfigError` is the one fatal class: it stops the daemon at startup.

use std::path::PathBuf;

/// A frame message could not be turned into a typed `FrameMessage`.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("frame payload is not a decodable image: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid timestamp '{value}': expected <Month><Day>/<Year> <HH:MM:SS>")]
    Timestamp { value: String },

    #[error("invalid detection #{index}: {reason}")]
    Detection { index: usize, reason: String },

    #[error("frame is {actual_w}x{actual_h}, expected {expected_w}x{expected_h}")]
    Dimensions {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

/// A finalized clip could not be persisted.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("clip has no frames")]
    Empty,

    #[error("clip io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("clip frame #{index} is not a baseline jpeg")]
    Frame { index: usize },

    #[error("transcoder '{program}' failed ({status}): {stderr}")]
    Transcode {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Startup configuration is unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid value for {key}: {reason}")]
    Env { key: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Walking or pruning the events archive failed.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to measure {path}: {source}")]
    Measure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to delete {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A frame message was rejected by the hub before or during processing.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("annotated frame encoding failed: {0}")]
    Annotate(#[from] image::ImageError),
}

impl WriteError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
