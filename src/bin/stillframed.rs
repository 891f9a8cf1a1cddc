//! stillframed - serve polled JPEG stills from RTSP / MJPEG cameras.
//!
//! This daemon:
//! 1. Loads the stream list and tunables
//! 2. Serves the stills API
//! 3. Starts a camera session on first request and reaps it when unused

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use stillframe::{
    api::{ApiConfig, ApiServer},
    ingest::DefaultTransport,
    StillframeConfig, StreamHub,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve polled JPEG stills from camera streams")]
struct Args {
    /// JSON config file (stream list, capture tunables, api settings).
    #[arg(long, env = "STILLFRAME_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file and STILLFRAME_API_ADDR.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = StillframeConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api.addr = addr;
    }
    log::info!(
        "stillframed {} configured with {} streams",
        env!("CARGO_PKG_VERSION"),
        config.streams.len()
    );

    let hub = Arc::new(StreamHub::new(
        config.streams.clone(),
        config.tunables.clone(),
        Arc::new(DefaultTransport),
    ));
    let reaper = hub.spawn_reaper()?;
    let api_config = ApiConfig::from_settings(&config.api);
    let api_handle = ApiServer::new(api_config, Arc::clone(&hub)).spawn()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("stillframed waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    reaper.stop()?;
    hub.shutdown();

    Ok(())
}
