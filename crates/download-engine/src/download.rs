use crate::error::DownloadError;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Opaque identifier for a download session; monotonically increasing u64.
pub type DownloadId = u64;

/// File reference published after each durable chunk append, and once more
/// with `is_complete` set when the transfer finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub id: DownloadId,
    pub is_complete: bool,
}

/// One-shot terminal handle for a transfer.
///
/// Resolves to the completed file or fails with a lifecycle error. Pausing
/// a session fails the live handle with [DownloadError::Paused]; the
/// replacement is handed out by `resume()`.
pub struct DownloadHandle {
    id: DownloadId,
    result: oneshot::Receiver<Result<DownloadResult, DownloadError>>,
}

impl DownloadHandle {
    pub(crate) fn new(
        id: DownloadId,
        result: oneshot::Receiver<Result<DownloadResult, DownloadError>>,
    ) -> Self {
        DownloadHandle { id, result }
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }
}

impl std::future::Future for DownloadHandle {
    type Output = Result<DownloadResult, DownloadError>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::pin::Pin;
        use std::task::Poll;

        match Pin::new(&mut self.result).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DownloadError::Disposed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
