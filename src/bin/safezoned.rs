//! safezoned - safe-zone event hub daemon
//!
//! This daemon:
//! 1. Loads and validates `HubConfig` (fatal on error)
//! 2. Prunes the events archive once before accepting frames
//! 3. Serves the hub api: frame ingestion, live preview, status, events, clips
//! 4. On Ctrl-C stops the api and flushes open recordings

use anyhow::Result;
use std::sync::{mpsc, Arc};

use safezone_hub::{
    api::{ApiConfig, ApiServer},
    Hub, HubConfig,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = HubConfig::load()?;
    log::info!(
        "safezoned {} starting: zone ({}, {})-({}, {}), clips {}-{}s, capacity {:.1} GB",
        env!("CARGO_PKG_VERSION"),
        config.zone.start.x,
        config.zone.start.y,
        config.zone.end.x,
        config.zone.end.y,
        config.recording.min_clip_secs,
        config.recording.max_clip_secs,
        config.capacity_gb
    );
    if !config.transcode.enabled {
        log::warn!("H.264 transcode disabled; clips are stored as MJPEG AVI");
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        stream_fps: config.frame.stream_fps,
    };
    let hub = Arc::new(Hub::new(config));
    let api_handle = ApiServer::new(api_config, hub.clone()).spawn()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("safezoned waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping api...");
    api_handle.stop()?;
    hub.shutdown();
    log::info!("safezoned stopped");

    Ok(())
}
