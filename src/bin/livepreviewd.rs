//! livepreviewd - live preview daemon
//!
//! This daemon:
//! 1. Polls the control store for the camera's live flag
//! 2. When live, opens the serial link and runs the L/A/X handshake
//! 3. Converts each YVYU frame and publishes it as a BMP for the UI
//! 4. Returns to idle when the flag clears or the link drops

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use live_preview::{
    LivePreviewConfig, OutputWriter, SerialOpener, ServiceLoop, Shutdown, SqliteControlStore,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream live preview frames from a serial camera into a BMP file"
)]
struct Args {
    /// Path to a JSON or TOML config file.
    #[arg(long, env = "LIVE_PREVIEW_CONFIG")]
    config: Option<PathBuf>,

    /// Serial device of the camera.
    #[arg(long)]
    device: Option<String>,

    /// Path to the control database holding the live flag.
    #[arg(long)]
    db_path: Option<String>,

    /// Camera row id in the control database.
    #[arg(long)]
    camera_id: Option<i64>,

    /// Destination BMP path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Stop each session after publishing this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = LivePreviewConfig::load_from(args.config.as_deref())?;
    if let Some(device) = args.device {
        cfg.serial.path = device;
    }
    if let Some(db_path) = args.db_path {
        cfg.db_path = db_path;
    }
    if let Some(camera_id) = args.camera_id {
        cfg.camera_id = camera_id;
    }
    if let Some(output) = args.output {
        cfg.output_path = output;
    }
    cfg.max_frames = args.max_frames;

    let shutdown = Shutdown::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || handler_shutdown.request())
        .expect("error setting Ctrl-C handler");

    let oracle = SqliteControlStore::open(&cfg.db_path, cfg.camera_id)
        .context("control store is required at startup")?;
    let opener = SerialOpener::new(cfg.serial.clone(), cfg.read_policy()?, shutdown.clone());
    let writer = OutputWriter::new(cfg.output_path.clone());

    log::info!(
        "live service starting for {} (camera id {}, db {})",
        cfg.serial.path,
        cfg.camera_id,
        cfg.db_path
    );

    let mut service = ServiceLoop::new(opener, oracle, writer, cfg.service_options(), shutdown);
    service.run()
}
