//! Resumable, range-based HTTP file downloads with live progress,
//! pause/resume, and cancellation.
//!
//! One [Downloader] is one session: the engine probes the resource, splits
//! it into sequential byte ranges when the server supports them, streams
//! each range to disk, and publishes progress and lifecycle transitions on
//! replay-latest channels.

mod control;
mod download;
mod engine;
mod error;
mod fetch;
mod phase;
mod planner;
mod progress;
mod request;

pub use crate::{
    download::{DownloadHandle, DownloadId, DownloadResult},
    engine::{Downloader, DownloaderBuilder},
    error::DownloadError,
    phase::Phase,
    progress::format_size,
    request::{
        DEFAULT_MAX_CHUNKS, DEFAULT_MAX_RETRIES, DownloadOptions, DownloadOptionsBuilder,
        PathProvider, SystemPaths,
    },
};

pub mod prelude {
    pub use crate::{
        DownloadError, DownloadHandle, DownloadId, DownloadOptions, DownloadResult, Downloader,
        Phase,
    };
}
