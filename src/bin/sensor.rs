//! Edge sensor - watches a lot entrance and reports enter/exit deltas
//!
//! Registers with the server (or reuses `sensor.device_key`), then runs one
//! capture session until `q`, Ctrl+C, end of stream or the first error.
//!
//! Usage:
//!   occupancy-sensor --config config/dev.toml
//!   ffmpeg -i cam.mp4 -f rawvideo -pix_fmt bgr24 -s 640x480 - | occupancy-sensor --source -

use anyhow::Context;
use clap::Parser;
use lot_occupancy::domain::frame::VideoMode;
use lot_occupancy::infra::Config;
use lot_occupancy::io::capture::{CaptureError, RawStreamCapture};
use lot_occupancy::io::display::{DisplayDevice, NullDisplay, RawFileDisplay};
use lot_occupancy::io::keyboard::spawn_key_watcher;
use lot_occupancy::io::SensorClient;
use lot_occupancy::services::{FrameDiffDetector, Session, SessionCommand, SessionError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Parking lot entrance sensor
#[derive(Parser, Debug)]
#[command(name = "occupancy-sensor", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override capture source (raw BGR24 file, or - for stdin)
    #[arg(short, long)]
    source: Option<String>,

    /// Do not read session commands from the terminal
    #[arg(long)]
    no_keyboard: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("occupancy-sensor starting");

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());
    let source = args.source.as_deref().unwrap_or(config.capture_source()).to_string();

    info!(
        config_file = %config.config_file(),
        server_url = %config.server_url(),
        lot_id = ?config.sensor_lot().map(|l| l.as_str()),
        source = %source,
        width = %config.capture_width(),
        height = %config.capture_height(),
        display_sink = ?config.display_sink(),
        display_mode = ?config.display_mode(),
        "config_loaded"
    );

    let client = SensorClient::new(&config).context("failed to build HTTP client")?;
    let key = match config.sensor_device_key() {
        Some(key) => {
            info!(device_key = %key, "device_key_reused");
            key
        }
        None => client.register(config.sensor_lot()).await.context("registration failed")?,
    };

    let mut detector = FrameDiffDetector::from_config(&config);
    let capture = RawStreamCapture::open(&source, config.capture_width(), config.capture_height())?;
    let display: Box<dyn DisplayDevice> = match config.display_sink() {
        Some(path) => Box::new(RawFileDisplay::new(path)),
        None => Box::new(NullDisplay::new()),
    };
    let session = Session::new(
        Box::new(capture),
        display,
        VideoMode::bgr24(config.capture_width(), config.capture_height()),
        config.display_mode(),
    );

    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let keyboard_stop = Arc::new(AtomicBool::new(false));
    let keyboard = (!args.no_keyboard)
        .then(|| spawn_key_watcher(command_tx.clone(), keyboard_stop.clone()));

    // Handle shutdown on Ctrl+C (when the terminal is not in raw mode)
    let signal_tx = command_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = signal_tx.send(SessionCommand::Quit);
    });

    let result = session.run(&mut detector, &client, key, &mut command_rx).await;

    keyboard_stop.store(true, Ordering::Relaxed);
    if let Some(handle) = keyboard {
        if tokio::task::spawn_blocking(move || handle.join()).await.is_err() {
            warn!("keyboard_watcher_join_failed");
        }
    }

    match result {
        Ok(_) => {}
        Err(SessionError::Capture(CaptureError::EndOfStream(frames))) => {
            info!(frames = %frames, "capture_stream_ended");
        }
        Err(e) => {
            info!("occupancy-sensor stopped on error");
            return Err(e.into());
        }
    }

    info!("occupancy-sensor shutdown complete");
    Ok(())
}
