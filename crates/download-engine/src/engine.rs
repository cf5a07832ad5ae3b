use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use futures_core::Stream;
use parking_lot::Mutex;
use reqwest::{Client, Url, header::HeaderMap};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::control::{ControlSignal, ControlToken};
use crate::download::{DownloadHandle, DownloadId, DownloadResult};
use crate::error::DownloadError;
use crate::fetch::{self, Transfer};
use crate::phase::{Phase, StatePublisher};
use crate::planner;
use crate::progress::ProgressPublisher;
use crate::request::{DownloadOptions, PathProvider, SystemPaths, derive_file_name};

pub(crate) struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn next_delay(&self, attempt: u64) -> Duration {
        let factor = 2f64.powi(attempt.min(i32::MAX as u64) as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

static BACKOFF_STRATEGY: ExponentialBackoff = ExponentialBackoff {
    base_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(10),
};

/// Monotonic source of session ids; unique within the process.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type ResultSender = oneshot::Sender<Result<DownloadResult, DownloadError>>;
type ResultReceiver = oneshot::Receiver<Result<DownloadResult, DownloadError>>;

/// Mutable per-session record. The transfer task is the only writer while
/// a transfer is live; control methods take short snapshots.
#[derive(Debug)]
struct Session {
    url: Url,
    destination: PathBuf,
    headers: HeaderMap,
    total_bytes: u64,
    can_buffer: bool,
    max_chunks: u64,
    bytes_per_chunk: u64,
    /// 1-based index of the next chunk to fetch.
    current_chunk: u64,
    max_retries: u64,
    /// Bytes durably appended to the destination; the resume offset.
    written_bytes: u64,
    just_resumed: bool,
}

struct Inner {
    id: DownloadId,
    client: Client,
    paths: Arc<dyn PathProvider>,
    control: ControlToken,
    state: StatePublisher,
    progress: ProgressPublisher,
    session: Mutex<Option<Session>>,
    /// Sender half of the live terminal handle.
    result_slot: Mutex<Option<ResultSender>>,
    /// Receiver created on pause, handed out by `resume()`.
    parked_handle: Mutex<Option<ResultReceiver>>,
    /// Cancels the current transfer attempt without cancelling the session.
    attempt: Mutex<CancellationToken>,
    result: watch::Sender<Option<DownloadResult>>,
    file_size: watch::Sender<Option<u64>>,
    can_pause: watch::Sender<bool>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// A single resumable download session.
///
/// One value is one session: construct it, call [Downloader::download],
/// observe the progress and state channels, and steer the transfer with
/// [Downloader::pause], [Downloader::resume], and [Downloader::cancel].
/// [Downloader::dispose] releases the background result observer.
pub struct Downloader {
    inner: Arc<Inner>,
}

impl Default for Downloader {
    fn default() -> Self {
        Downloader::new()
    }
}

impl Downloader {
    /// Fresh session with a default HTTP client and system paths.
    pub fn new() -> Self {
        Self::assemble(Client::new(), Arc::new(SystemPaths))
    }

    pub fn builder() -> DownloaderBuilder {
        DownloaderBuilder::new()
    }

    fn assemble(client: Client, paths: Arc<dyn PathProvider>) -> Self {
        let (result, _) = watch::channel(None);
        let (file_size, _) = watch::channel(None);
        let (can_pause, _) = watch::channel(false);
        let control = ControlToken::new();
        let attempt = Mutex::new(control.attempt_token());
        let inner = Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            client,
            paths,
            control,
            state: StatePublisher::new(),
            progress: ProgressPublisher::new(),
            session: Mutex::new(None),
            result_slot: Mutex::new(None),
            parked_handle: Mutex::new(None),
            attempt,
            result,
            file_size,
            can_pause,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        spawn_result_observer(Arc::clone(&inner));
        Downloader { inner }
    }

    /// Start the transfer. Returns the terminal handle resolving to the
    /// completed file, or failing with a lifecycle error.
    pub fn download(
        &self,
        url: Url,
        options: DownloadOptions,
    ) -> Result<DownloadHandle, DownloadError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DownloadError::Disposed);
        }
        let phase = self.inner.state.phase();
        if phase != Phase::Idle {
            return Err(DownloadError::IllegalState {
                action: "download",
                phase,
            });
        }

        let destination = match options.path() {
            Some(path) => path.to_path_buf(),
            None => {
                let name = derive_file_name(&url, options.file_name())?;
                self.inner
                    .paths
                    .documents_dir()
                    .join("cacheDirectory")
                    .join(name)
            }
        };

        debug!(url = %url, destination = %destination.display(), "starting download");

        *self.inner.session.lock() = Some(Session {
            url,
            destination,
            headers: options.headers().clone(),
            total_bytes: 0,
            can_buffer: false,
            max_chunks: options.max_chunks(),
            bytes_per_chunk: 0,
            current_chunk: 1,
            max_retries: options.retry_count(),
            written_bytes: 0,
            just_resumed: false,
        });

        let (sender, receiver) = oneshot::channel();
        *self.inner.result_slot.lock() = Some(sender);

        self.inner.state.transition(Phase::Downloading);
        self.spawn_transfer(false);
        Ok(DownloadHandle::new(self.inner.id, receiver))
    }

    /// Pause a range-capable transfer.
    ///
    /// The live terminal handle fails with [DownloadError::Paused] and
    /// [Downloader::resume] hands out its replacement. When the server did
    /// not advertise ranges this is a no-op apart from an operator note.
    pub fn pause(&self) {
        let can_buffer = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.can_buffer)
            .unwrap_or(false);
        if !can_buffer {
            info!("server does not accept ranges; pause is unavailable for this session");
            return;
        }
        if self.inner.state.phase() != Phase::Downloading {
            return;
        }
        if !self.inner.state.transition(Phase::Paused) {
            return;
        }
        self.inner.control.pause();
        self.inner.attempt.lock().cancel();

        let (sender, receiver) = oneshot::channel();
        let previous = self.inner.result_slot.lock().replace(sender);
        *self.inner.parked_handle.lock() = Some(receiver);
        if let Some(previous) = previous {
            let _ = previous.send(Err(DownloadError::Paused));
        }
        debug!(id = self.inner.id, "paused");
    }

    /// Re-enter a paused transfer from the durable byte prefix. Returns the
    /// replacement terminal handle.
    pub fn resume(&self) -> Result<DownloadHandle, DownloadError> {
        let phase = self.inner.state.phase();
        if self.inner.control.last() == ControlSignal::Cancel || phase != Phase::Paused {
            return Err(DownloadError::IllegalState {
                action: "resume",
                phase,
            });
        }
        let receiver = self
            .inner
            .parked_handle
            .lock()
            .take()
            .ok_or(DownloadError::IllegalState {
                action: "resume",
                phase,
            })?;
        {
            let mut session = self.inner.session.lock();
            if let Some(session) = session.as_mut() {
                session.just_resumed = true;
                self.inner.progress.rewind_to(session.written_bytes);
            }
        }
        self.inner.control.resume();
        self.inner.state.transition(Phase::Downloading);
        self.spawn_transfer(true);
        debug!(id = self.inner.id, "resumed");
        Ok(DownloadHandle::new(self.inner.id, receiver))
    }

    /// Cancel the session. Idempotent; `Cancelled` is terminal.
    pub fn cancel(&self) {
        cancel_session(&self.inner);
    }

    /// Release the control token, publishers, and result observer. Safe to
    /// call more than once; a still-unresolved handle reports
    /// [DownloadError::Disposed].
    pub fn dispose(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        debug!(id = self.inner.id, "disposing session");
        self.inner.shutdown.cancel();
        self.inner.control.cancel();
        self.inner.tracker.close();
        self.inner.parked_handle.lock().take();
        self.inner.result_slot.lock().take();
    }

    /// Resolves once metadata is known.
    pub async fn file_size(&self) -> Result<u64, DownloadError> {
        let mut receiver = self.inner.file_size.subscribe();
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(DownloadError::Disposed),
            size = receiver.wait_for(|size| size.is_some()) => {
                let size = size.map_err(|_| DownloadError::Disposed)?;
                (*size).ok_or(DownloadError::Disposed)
            }
        }
    }

    /// Session identifier.
    pub fn id(&self) -> DownloadId {
        self.inner.id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.inner.state.phase()
    }

    /// Replay-latest watch on lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<Phase> {
        self.inner.state.subscribe()
    }

    /// Lifecycle transitions as a stream.
    pub fn state(&self) -> impl Stream<Item = Phase> + use<> {
        WatchStream::new(self.inner.state.subscribe())
    }

    /// Replay-latest watch on per-segment byte deltas.
    pub fn subscribe_progress(&self) -> watch::Receiver<u64> {
        self.inner.progress.subscribe_delta()
    }

    /// Per-segment byte deltas as a stream.
    pub fn progress(&self) -> impl Stream<Item = u64> + use<> {
        WatchStream::new(self.inner.progress.subscribe_delta())
    }

    /// `"<done>/<total>"` strings as a stream.
    pub fn formatted_progress(&self) -> impl Stream<Item = String> + use<> {
        WatchStream::new(self.inner.progress.subscribe_formatted())
    }

    /// Cumulative bytes streamed so far.
    pub fn downloaded_bytes(&self) -> u64 {
        self.inner.progress.downloaded()
    }

    /// Last published file reference, if any chunk has been appended.
    pub fn downloaded_file(&self) -> Option<DownloadResult> {
        self.inner.result.borrow().clone()
    }

    /// Mirrors the server's range capability once the probe has run.
    pub fn can_pause(&self) -> watch::Receiver<bool> {
        self.inner.can_pause.subscribe()
    }

    fn spawn_transfer(&self, resuming: bool) {
        let attempt = self.inner.control.attempt_token();
        *self.inner.attempt.lock() = attempt.clone();
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            if let Err(error) = run_transfer(&inner, &attempt, resuming).await {
                fail_session(&inner, error);
            }
        });
    }
}

/// Builder for [Downloader] allowing a custom HTTP client or path provider.
pub struct DownloaderBuilder {
    client: Option<Client>,
    paths: Option<Arc<dyn PathProvider>>,
}

impl Default for DownloaderBuilder {
    fn default() -> Self {
        DownloaderBuilder::new()
    }
}

impl DownloaderBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            paths: None,
        }
    }

    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn paths(mut self, paths: Arc<dyn PathProvider>) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn build(self) -> anyhow::Result<Downloader> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .build()
                .context("failed to construct the HTTP client")?,
        };
        let paths = self.paths.unwrap_or_else(|| Arc::new(SystemPaths));
        Ok(Downloader::assemble(client, paths))
    }
}

/// Watches the result channel and, once a complete result is published
/// while the session is still live, resolves the terminal handle and emits
/// `Completed`.
fn spawn_result_observer(inner: Arc<Inner>) {
    let mut result_rx = inner.result.subscribe();
    let tracker = inner.tracker.clone();
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                changed = result_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let result = result_rx.borrow_and_update().clone();
            let Some(result) = result else { continue };
            if !result.is_complete {
                continue;
            }
            if matches!(inner.state.phase(), Phase::Cancelled | Phase::Paused) {
                continue;
            }
            inner.state.transition(Phase::Completed);
            if let Some(sender) = inner.result_slot.lock().take() {
                let _ = sender.send(Ok(result));
            }
            debug!(id = inner.id, "completed");
            break;
        }
    });
}

fn cancel_session(inner: &Inner) {
    if !inner.control.cancel() {
        return;
    }
    inner.state.transition(Phase::Cancelled);
    inner.parked_handle.lock().take();
    if let Some(sender) = inner.result_slot.lock().take() {
        let _ = sender.send(Err(DownloadError::Cancelled));
    }
    debug!(id = inner.id, "cancelled");
}

/// Engine-boundary error handler: control-flow signals are consumed, real
/// faults end the session as `Cancelled` and fail the terminal handle.
fn fail_session(inner: &Inner, error: DownloadError) {
    if matches!(error, DownloadError::Paused | DownloadError::Cancelled) {
        debug!(id = inner.id, %error, "transfer unwound");
        return;
    }
    warn!(id = inner.id, %error, "download failed");
    inner.control.cancel();
    inner.state.transition(Phase::Cancelled);
    inner.parked_handle.lock().take();
    if let Some(sender) = inner.result_slot.lock().take() {
        let _ = sender.send(Err(error));
    }
}

async fn run_transfer(
    inner: &Arc<Inner>,
    attempt: &CancellationToken,
    resuming: bool,
) -> Result<(), DownloadError> {
    let phase_rx = inner.state.subscribe();

    if !resuming {
        let (url, headers, caller_cap) = {
            let session = inner.session.lock();
            let session = session.as_ref().ok_or(DownloadError::Disposed)?;
            (
                session.url.clone(),
                session.headers.clone(),
                session.max_chunks,
            )
        };
        let transfer = Transfer {
            client: &inner.client,
            url: &url,
            headers: &headers,
            attempt,
            phase: &phase_rx,
            progress: &inner.progress,
        };
        let info = fetch::probe(&transfer).await?;
        debug!(
            total_bytes = info.total_bytes,
            can_buffer = info.can_buffer,
            "metadata probed"
        );

        let planned = if info.can_buffer {
            planner::plan_chunks(info.total_bytes, caller_cap)
        } else {
            0
        };

        {
            let mut session = inner.session.lock();
            let session = session.as_mut().ok_or(DownloadError::Disposed)?;
            session.total_bytes = info.total_bytes;
            session.can_buffer = info.can_buffer;
            if planned > 0 {
                session.max_chunks = planned;
                session.bytes_per_chunk = info.total_bytes / planned;
            }
        }
        inner.progress.set_total(info.total_bytes);
        let _ = inner.file_size.send(Some(info.total_bytes));
        let _ = inner.can_pause.send(info.can_buffer);

        if info.can_buffer && planned == 0 {
            info!(id = inner.id, "probed an empty resource; cancelling");
            cancel_session(inner);
            return Ok(());
        }
    }

    let can_buffer = inner
        .session
        .lock()
        .as_ref()
        .map(|session| session.can_buffer)
        .unwrap_or(false);
    if can_buffer {
        run_chunk_loop(inner, attempt, &phase_rx).await
    } else {
        run_single_shot(inner, attempt, &phase_rx).await
    }
}

async fn run_chunk_loop(
    inner: &Arc<Inner>,
    attempt: &CancellationToken,
    phase_rx: &watch::Receiver<Phase>,
) -> Result<(), DownloadError> {
    let mut tries: u64 = 1;
    let mut last_error: Option<DownloadError> = None;

    loop {
        let (url, headers, destination, chunk, start, end) = {
            let session = inner.session.lock();
            let session = session.as_ref().ok_or(DownloadError::Disposed)?;
            if session.current_chunk > session.max_chunks || tries == session.max_retries {
                break;
            }
            let (start, end) = planner::chunk_range(
                session.current_chunk,
                session.max_chunks,
                session.bytes_per_chunk,
                session.total_bytes,
            );
            // The first chunk after a resume restarts one past the last
            // durable byte instead of at its nominal range start.
            let start = if session.just_resumed {
                session.written_bytes
            } else {
                start
            };
            (
                session.url.clone(),
                session.headers.clone(),
                session.destination.clone(),
                session.current_chunk,
                start,
                end,
            )
        };

        let transfer = Transfer {
            client: &inner.client,
            url: &url,
            headers: &headers,
            attempt,
            phase: phase_rx,
            progress: &inner.progress,
        };
        let bytes = match fetch::fetch_range(&transfer, start, end).await {
            Ok(bytes) => bytes,
            Err(error) if error.is_retryable() => {
                warn!(chunk, %error, "chunk fetch failed; retrying");
                last_error = Some(error);
                tries += 1;
                let max_retries = inner
                    .session
                    .lock()
                    .as_ref()
                    .map(|session| session.max_retries)
                    .unwrap_or(0);
                if tries != max_retries {
                    tokio::time::sleep(BACKOFF_STRATEGY.next_delay(tries)).await;
                }
                continue;
            }
            Err(error) => return Err(error),
        };

        if attempt.is_cancelled() || inner.state.phase() != Phase::Downloading {
            break;
        }

        if bytes.is_empty() {
            tries += 1;
            continue;
        }

        append_chunk(&destination, chunk, &bytes).await?;

        let is_complete = {
            let mut session = inner.session.lock();
            let session = session.as_mut().ok_or(DownloadError::Disposed)?;
            session.current_chunk += 1;
            session.just_resumed = false;
            session.written_bytes += bytes.len() as u64;
            session.current_chunk > session.max_chunks
        };
        tries = 0;
        last_error = None;
        debug!(chunk, bytes = bytes.len(), "chunk appended");

        let _ = inner.result.send(Some(DownloadResult {
            path: destination,
            id: inner.id,
            is_complete,
        }));
    }

    if attempt.is_cancelled() || inner.state.phase() != Phase::Downloading {
        return Ok(());
    }

    let (all_done, destination) = {
        let session = inner.session.lock();
        let session = session.as_ref().ok_or(DownloadError::Disposed)?;
        (
            session.current_chunk > session.max_chunks,
            session.destination.clone(),
        )
    };
    if all_done {
        // Published once more on completion for late observers.
        let _ = inner.result.send(Some(DownloadResult {
            path: destination,
            id: inner.id,
            is_complete: true,
        }));
        Ok(())
    } else {
        let last_error = last_error.unwrap_or_else(|| {
            DownloadError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "empty chunk body",
            ))
        });
        Err(DownloadError::RetriesExhausted {
            last_error: Box::new(last_error),
        })
    }
}

async fn run_single_shot(
    inner: &Arc<Inner>,
    attempt: &CancellationToken,
    phase_rx: &watch::Receiver<Phase>,
) -> Result<(), DownloadError> {
    let (url, headers, destination) = {
        let session = inner.session.lock();
        let session = session.as_ref().ok_or(DownloadError::Disposed)?;
        (
            session.url.clone(),
            session.headers.clone(),
            session.destination.clone(),
        )
    };

    let transfer = Transfer {
        client: &inner.client,
        url: &url,
        headers: &headers,
        attempt,
        phase: phase_rx,
        progress: &inner.progress,
    };
    let bytes = fetch::fetch_single(&transfer).await?;

    if attempt.is_cancelled() || inner.state.phase() != Phase::Downloading {
        return Ok(());
    }

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }
    // An earlier artifact at the target path is replaced wholesale.
    if fs::try_exists(&destination).await? {
        fs::remove_file(&destination).await?;
    }
    let mut file = File::create(&destination).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;

    {
        let mut session = inner.session.lock();
        if let Some(session) = session.as_mut() {
            session.written_bytes = bytes.len() as u64;
        }
    }
    let _ = inner.result.send(Some(DownloadResult {
        path: destination,
        id: inner.id,
        is_complete: true,
    }));
    Ok(())
}

async fn append_chunk(destination: &Path, chunk: u64, bytes: &[u8]) -> Result<(), DownloadError> {
    if chunk == 1 {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut open = OpenOptions::new();
    if chunk == 1 {
        open.write(true).create(true).truncate(true);
    } else {
        open.append(true);
    }
    let mut file = open.open(destination).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}
