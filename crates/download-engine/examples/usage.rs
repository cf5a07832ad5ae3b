use std::path::PathBuf;

use download_engine::{DownloadOptions, prelude::*};
use futures_util::StreamExt;
use reqwest::Url;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // Configure logs via RUST_LOG if provided, else use a sensible default.
    if std::env::var_os("RUST_LOG").is_none() {
        // Show info logs globally and debug logs for this crate
        unsafe {
            std::env::set_var("RUST_LOG", "info,download_engine=debug");
        }
    }

    let filter = EnvFilter::from_default_env();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let downloader = Downloader::new();

    let url = Url::parse("https://ash-speed.hetzner.com/100MB.bin")?;
    let destination: PathBuf = "example-download.bin".into();

    // Start the download
    let handle = downloader.download(url, DownloadOptions::to_path(&destination))?;

    // Subscribe to formatted progress
    let mut progress_stream = downloader.formatted_progress();
    tokio::spawn(async move {
        while let Some(progress) = progress_stream.next().await {
            info!(progress = %progress, "progress");
        }
    });

    // Subscribe to lifecycle transitions
    let mut state_stream = downloader.state();
    tokio::spawn(async move {
        while let Some(phase) = state_stream.next().await {
            info!(phase = ?phase, "state");
        }
    });

    // Resolves as soon as the HEAD probe has run
    info!(total_bytes = downloader.file_size().await?, "probed");

    // Await the result (the handle implements Future)
    match handle.await {
        Ok(result) => {
            info!(path = %result.path.display(), "download completed");
        }
        Err(err) => {
            error!(error = %err, "download failed");
        }
    }

    downloader.dispose();

    Ok(())
    // To exercise pause/resume against a range-capable server:
    // downloader.pause();                  // the first handle fails with Paused
    // let handle = downloader.resume()?;   // replacement handle
    // To cancel: downloader.cancel();
}
