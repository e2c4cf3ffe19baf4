//! safezone_events - operator tool for the clip archive

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use safezone_hub::catalog::{list_events, list_events_relative_to};
use safezone_hub::clip::probe;
use safezone_hub::config::validate_device_id;
use safezone_hub::{folder_size_bytes, ArchiveLayout, StorageSupervisor};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Root of the events archive.
    #[arg(long, env = "SAFEZONE_EVENTS_ROOT", default_value = "/tmp/events")]
    events_root: PathBuf,
    /// Archive is namespaced as <root>/<device>/<day>/...
    #[arg(long, global = true)]
    per_device: bool,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto, global = true)]
    ui: ui::UiMode,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the event catalog as JSON.
    List {
        /// Only list one device (implies --per-device).
        #[arg(long)]
        device: Option<String>,
        /// Pretty-print the JSON.
        #[arg(long)]
        pretty: bool,
    },
    /// Delete oldest day folders until the archive fits the capacity.
    Supervise {
        #[arg(long, env = "SAFEZONE_CAPACITY_GB", default_value_t = 3.0)]
        capacity_gb: f64,
    },
    /// Print the measured archive size.
    Usage,
    /// Print frame count, size and rate of an MJPEG AVI clip.
    Probe { path: PathBuf },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(
        args.ui,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal(),
    );

    match args.command {
        Command::List { device, pretty } => {
            let listing = {
                let _stage = ui.stage("Scan archive");
                catalog_json(&args.events_root, args.per_device, device.as_deref())?
            };
            let out = if pretty {
                serde_json::to_string_pretty(&listing)?
            } else {
                serde_json::to_string(&listing)?
            };
            println!("{out}");
        }
        Command::Supervise { capacity_gb } => {
            if !(capacity_gb > 0.0) {
                return Err(anyhow!("--capacity-gb must be greater than zero"));
            }
            let layout = if args.per_device {
                ArchiveLayout::PerDevice
            } else {
                ArchiveLayout::Flat
            };
            let supervisor = StorageSupervisor::new(&args.events_root, capacity_gb, layout);
            let report = {
                let _stage = ui.stage("Supervise storage");
                supervisor.supervise()?
            };
            for path in &report.deleted {
                eprintln!("deleted {}", path.display());
            }
            println!(
                "{} -> {} (capacity {})",
                ui::format_gb(report.initial_bytes),
                ui::format_gb(report.final_bytes),
                ui::format_gb(supervisor.capacity_bytes())
            );
            if report.exhausted {
                return Err(anyhow!(
                    "archive still over capacity with no day folders left to delete"
                ));
            }
        }
        Command::Usage => {
            let bytes = folder_size_bytes(&args.events_root)?;
            println!("{} {}", ui::format_gb(bytes), args.events_root.display());
        }
        Command::Probe { path } => {
            let bytes = std::fs::read(&path)
                .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
            let info = probe(&bytes)
                .ok_or_else(|| anyhow!("{} is not an MJPEG AVI clip", path.display()))?;
            println!(
                "{} frames, {}x{}, {:.2} fps, {:.2}s",
                info.total_frames,
                info.width,
                info.height,
                info.fps,
                info.duration_secs()
            );
        }
    }
    Ok(())
}

fn catalog_json(root: &Path, per_device: bool, device: Option<&str>) -> Result<serde_json::Value> {
    let mut by_device = BTreeMap::new();
    if let Some(device) = device {
        validate_device_id(device)?;
        let catalog = list_events_relative_to(&root.join(device), root);
        by_device.insert(device.to_string(), catalog.days);
        return Ok(serde_json::to_value(by_device)?);
    }
    if !per_device {
        return Ok(serde_json::to_value(list_events(root))?);
    }
    for entry in std::fs::read_dir(root)
        .map_err(|e| anyhow!("failed to read {}: {}", root.display(), e))?
        .flatten()
    {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        by_device.insert(name, list_events_relative_to(&entry.path(), root).days);
    }
    Ok(serde_json::to_value(by_device)?)
}
