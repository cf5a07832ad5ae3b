use thiserror::Error;
use tracing::instrument;

use crate::phase::Phase;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Metadata probe failed: {0}")]
    Metadata(String),
    #[error("File name could not be determined from the URL")]
    FileNameIndeterminate,
    #[error("Download was paused")]
    Paused,
    #[error("Download was cancelled")]
    Cancelled,
    #[error("Cannot {action} while the session is {phase:?}")]
    IllegalState { action: &'static str, phase: Phase },
    #[error("Retry limit exceeded: {last_error}")]
    RetriesExhausted { last_error: Box<DownloadError> },
    #[error("Session has been disposed")]
    Disposed,
}

impl DownloadError {
    /// Classify whether a failed chunk fetch should be retried.
    ///
    /// Returns true for transient reqwest errors (timeout, connect, request) and HTTP 5xx.
    /// If the HTTP status is unavailable, the error is treated as retryable by default.
    /// Returns false for the control-flow variants, Io, and other non-transient kinds.
    #[instrument(level = "trace", skip(self))]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(network_err) => {
                network_err.is_timeout()
                    || network_err.is_connect()
                    || network_err.is_request()
                    || network_err
                        .status()
                        .map(|status_code| status_code.is_server_error())
                        .unwrap_or(true)
            }
            _ => false,
        }
    }
}
