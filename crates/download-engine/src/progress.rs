use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

pub(crate) const KB: u64 = 1024;
pub(crate) const MB: u64 = KB * 1024;
pub(crate) const GB: u64 = MB * 1024;
pub(crate) const TB: u64 = GB * 1024;

/// Replay-latest broadcast of transfer progress.
///
/// Two channels: the per-segment byte delta and a human-readable
/// `"<done>/<total>"` string. The cumulative counter lives here as well,
/// since it doubles as the resume offset for the engine.
#[derive(Debug)]
pub(crate) struct ProgressPublisher {
    downloaded: AtomicU64,
    total: AtomicU64,
    delta: watch::Sender<u64>,
    formatted: watch::Sender<String>,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        let (delta, _) = watch::channel(0);
        let (formatted, _) = watch::channel(format!("{}/{}", format_size(0), format_size(0)));
        Self {
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
            delta,
            formatted,
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Rewind the cumulative counter to the durable prefix after a pause,
    /// so re-fetched bytes are not counted twice.
    pub fn rewind_to(&self, downloaded: u64) {
        self.downloaded.store(downloaded, Ordering::Relaxed);
    }

    /// Record one streamed segment, emitting on both channels.
    pub fn record(&self, len: u64) {
        let done = self.downloaded.fetch_add(len, Ordering::Relaxed) + len;
        let total = self.total.load(Ordering::Relaxed);
        let _ = self.delta.send(len);
        let _ = self.formatted.send(format!(
            "{}/{}",
            format_size(done as i64),
            format_size(total as i64)
        ));
    }

    pub fn subscribe_delta(&self) -> watch::Receiver<u64> {
        self.delta.subscribe()
    }

    pub fn subscribe_formatted(&self) -> watch::Receiver<String> {
        self.formatted.subscribe()
    }
}

/// Render a byte count with binary (1024-based) units.
///
/// Integer-valued results carry no decimal, fractional results one decimal
/// digit. Zero renders as `"0 B"`; negative inputs are reflected positive.
pub fn format_size(bytes: i64) -> String {
    let magnitude = bytes.unsigned_abs();
    if magnitude == 0 {
        return "0 B".to_string();
    }
    let (divisor, unit) = [(TB, "TB"), (GB, "GB"), (MB, "MB"), (KB, "KB"), (1, "B")]
        .into_iter()
        .find(|(divisor, _)| magnitude >= *divisor)
        .unwrap_or((1, "B"));
    let value = magnitude as f64 / divisor as f64;
    if value.fract() == 0.0 {
        format!("{} {}", value as u64, unit)
    } else {
        format!("{:.1} {}", value, unit)
    }
}
