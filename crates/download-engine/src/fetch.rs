use reqwest::{Client, Method, Response, Url, header};
use reqwest::header::HeaderMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{error::DownloadError, phase::Phase, progress::ProgressPublisher};

/// Metadata derived from the HEAD probe.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteInfo {
    pub total_bytes: u64,
    /// True iff the server advertised `Accept-Ranges: bytes`.
    pub can_buffer: bool,
}

/// Borrowed view of everything one HTTP attempt needs.
pub(crate) struct Transfer<'a> {
    pub client: &'a Client,
    pub url: &'a Url,
    pub headers: &'a HeaderMap,
    pub attempt: &'a CancellationToken,
    pub phase: &'a watch::Receiver<Phase>,
    pub progress: &'a ProgressPublisher,
}

/// Probe the resource with a HEAD request.
///
/// `content-length` defaults to 0 when absent or unparsable; range support
/// requires `accept-ranges` to equal `"bytes"` exactly.
pub(crate) async fn probe(transfer: &Transfer<'_>) -> Result<RemoteInfo, DownloadError> {
    let request = transfer
        .client
        .request(Method::HEAD, transfer.url.as_ref())
        .headers(transfer.headers.clone())
        .send();

    let response = tokio::select! {
        response = request => response
            .and_then(Response::error_for_status)
            .map_err(|e| DownloadError::Metadata(e.to_string()))?,
        _ = transfer.attempt.cancelled() => return Err(DownloadError::Cancelled),
    };

    let headers = response.headers();
    let total_bytes = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let can_buffer = headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "bytes")
        .unwrap_or(false);

    Ok(RemoteInfo {
        total_bytes,
        can_buffer,
    })
}

/// Fetch one inclusive byte range, streaming segments into memory.
///
/// Each segment is appended to the returned buffer and its length emitted
/// on the progress channels. Segments arriving after a pause or cancel are
/// dropped and the stream is released; the engine discards the partial
/// buffer by checking the phase before writing.
pub(crate) async fn fetch_range(
    transfer: &Transfer<'_>,
    start: u64,
    end: u64,
) -> Result<Vec<u8>, DownloadError> {
    let request = transfer
        .client
        .request(Method::GET, transfer.url.as_ref())
        .headers(transfer.headers.clone())
        .header(header::RANGE, format!("bytes={start}-{end}"))
        .send();

    let response = tokio::select! {
        response = request => response?.error_for_status()?,
        _ = transfer.attempt.cancelled() => return Ok(Vec::new()),
    };

    read_body(response, transfer).await
}

/// Unranged GET for servers without range support; the whole body is
/// accumulated in memory with the same drop semantics as [fetch_range].
pub(crate) async fn fetch_single(transfer: &Transfer<'_>) -> Result<Vec<u8>, DownloadError> {
    let request = transfer
        .client
        .request(Method::GET, transfer.url.as_ref())
        .headers(transfer.headers.clone())
        .send();

    let response = tokio::select! {
        response = request => response?.error_for_status()?,
        _ = transfer.attempt.cancelled() => return Ok(Vec::new()),
    };

    read_body(response, transfer).await
}

async fn read_body(
    mut response: Response,
    transfer: &Transfer<'_>,
) -> Result<Vec<u8>, DownloadError> {
    let mut buffer = Vec::new();
    loop {
        let segment = tokio::select! {
            segment = response.chunk() => segment?,
            _ = transfer.attempt.cancelled() => return Ok(buffer),
        };
        let Some(segment) = segment else {
            return Ok(buffer);
        };
        if interrupted(*transfer.phase.borrow()) {
            return Ok(buffer);
        }
        transfer.progress.record(segment.len() as u64);
        buffer.extend_from_slice(&segment);
    }
}

fn interrupted(phase: Phase) -> bool {
    matches!(phase, Phase::Paused | Phase::Cancelled)
}
