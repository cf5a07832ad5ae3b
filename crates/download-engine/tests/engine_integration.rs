use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use download_engine::{
    DownloadError, DownloadOptions, Downloader, PathProvider, Phase,
};
use reqwest::Url;
use tempfile::TempDir;
use wiremock::http::Method;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const MB: u64 = 1024 * 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn url(server: &MockServer, path: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), path)).unwrap()
}

/// Serves slices of a fixed body according to the request's Range header,
/// or the whole body for unranged requests. Optionally delays the first
/// request at or past a byte offset, which gives tests a deterministic
/// window to pause or cancel mid-transfer.
struct RangeResponder {
    content: Vec<u8>,
    slow_from: Option<u64>,
    slowed: AtomicBool,
}

impl RangeResponder {
    fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            slow_from: None,
            slowed: AtomicBool::new(false),
        }
    }

    fn slow_from(mut self, offset: u64) -> Self {
        self.slow_from = Some(offset);
        self
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok());
        match range {
            Some(range) => {
                let raw = range.trim_start_matches("bytes=");
                let (start, end) = raw.split_once('-').expect("inclusive range");
                let start: u64 = start.parse().unwrap();
                let end: u64 = end.parse::<u64>().unwrap().min(self.content.len() as u64 - 1);
                let body = self.content[start as usize..=end as usize].to_vec();
                let mut template = ResponseTemplate::new(206).set_body_bytes(body);
                if let Some(slow_from) = self.slow_from {
                    if start >= slow_from && !self.slowed.swap(true, Ordering::SeqCst) {
                        template = template.set_delay(Duration::from_secs(10));
                    }
                }
                template
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.content.clone()),
        }
    }
}

async fn mount_head(server: &MockServer, content: &[u8], ranges: bool) {
    let mut template = ResponseTemplate::new(200).set_body_bytes(content.to_vec());
    if ranges {
        template = template.insert_header("accept-ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .respond_with(template)
        .mount(server)
        .await;
}

async fn ranged_gets(server: &MockServer) -> Vec<Option<String>> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.method == Method::GET)
        .map(|request| {
            request
                .headers
                .get("range")
                .and_then(|value| value.to_str().ok())
                .map(String::from)
        })
        .collect()
}

#[tokio::test]
async fn completes_a_single_chunk_download() {
    let server = MockServer::start().await;
    let content = pattern(1024);
    mount_head(&server, &content, true).await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(content.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("small.bin");
    let downloader = Downloader::new();
    let handle = downloader
        .download(url(&server, "/small.bin"), DownloadOptions::to_path(&dest))
        .unwrap();

    assert_eq!(downloader.file_size().await.unwrap(), 1024);

    let result = handle.await.unwrap();
    assert!(result.is_complete);
    assert_eq!(result.path, dest);
    assert_eq!(downloader.phase(), Phase::Completed);
    assert_eq!(std::fs::read(&dest).unwrap(), content);
    assert_eq!(downloader.downloaded_bytes(), 1024);
    assert!(*downloader.can_pause().borrow());

    // A 1 KiB resource plans as one chunk spanning the whole length.
    let gets = ranged_gets(&server).await;
    assert_eq!(gets, vec![Some("bytes=0-1024".to_string())]);
}

#[tokio::test]
async fn splits_a_five_megabyte_resource_into_three_ranges() {
    let server = MockServer::start().await;
    let total = 5 * MB;
    let content = pattern(total as usize);
    mount_head(&server, &content, true).await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(content.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("five.bin");
    let downloader = Downloader::new();
    let handle = downloader
        .download(url(&server, "/five.bin"), DownloadOptions::to_path(&dest))
        .unwrap();

    let result = handle.await.unwrap();
    assert!(result.is_complete);

    let bpc = total / 3;
    let gets = ranged_gets(&server).await;
    assert_eq!(
        gets,
        vec![
            Some(format!("bytes=0-{bpc}")),
            Some(format!("bytes={}-{}", bpc + 1, 2 * bpc)),
            Some(format!("bytes={}-{}", 2 * bpc + 1, total)),
        ]
    );

    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len() as u64, total);
    assert_eq!(written, content);
    assert_eq!(downloader.downloaded_bytes(), total);
}

#[tokio::test]
async fn single_shot_replaces_an_existing_file_when_ranges_are_unsupported() {
    let server = MockServer::start().await;
    let content = pattern(100 * 1024);
    mount_head(&server, &content, false).await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(content.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("single.bin");
    std::fs::write(&dest, b"stale artifact").unwrap();

    let downloader = Downloader::new();
    let handle = downloader
        .download(url(&server, "/single.bin"), DownloadOptions::to_path(&dest))
        .unwrap();

    let result = handle.await.unwrap();
    assert!(result.is_complete);
    assert_eq!(downloader.phase(), Phase::Completed);
    assert_eq!(std::fs::read(&dest).unwrap(), content);
    assert!(!*downloader.can_pause().borrow());

    let gets = ranged_gets(&server).await;
    assert_eq!(gets, vec![None]);
}

#[tokio::test]
async fn pause_fails_the_handle_and_resume_completes_the_file() {
    let server = MockServer::start().await;
    let total = 5 * MB;
    let bpc = total / 3;
    let content = pattern(total as usize);
    mount_head(&server, &content, true).await;
    // The third range is slow the first time it is requested, leaving a
    // wide window to pause while it is in flight.
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(content.clone()).slow_from(2 * bpc + 1))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("resumed.bin");
    let downloader = Downloader::new();
    let handle = downloader
        .download(url(&server, "/resumed.bin"), DownloadOptions::to_path(&dest))
        .unwrap();

    // Wait until both fast chunks are streamed and appended.
    let mut delta = downloader.subscribe_progress();
    while downloader.downloaded_bytes() < 2 * bpc + 1 {
        delta.changed().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    downloader.pause();
    assert_eq!(downloader.phase(), Phase::Paused);
    assert!(matches!(handle.await, Err(DownloadError::Paused)));

    // No progress while paused.
    let frozen = downloader.downloaded_bytes();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(downloader.downloaded_bytes(), frozen);

    let resumed = downloader.resume().unwrap();
    let result = resumed.await.unwrap();
    assert!(result.is_complete);
    assert_eq!(downloader.phase(), Phase::Completed);

    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len() as u64, total);
    assert_eq!(written, content);

    // Two fast chunks, the interrupted third, and its post-resume retry
    // starting one past the durable prefix.
    let gets = ranged_gets(&server).await;
    assert_eq!(gets.len(), 4);
    assert_eq!(
        gets[3],
        Some(format!("bytes={}-{}", 2 * bpc + 1, total))
    );
}

#[tokio::test]
async fn cancel_mid_stream_fails_the_handle_and_is_idempotent() {
    let server = MockServer::start().await;
    let content = pattern(1024);
    mount_head(&server, &content, true).await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(content.clone()).slow_from(0))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("cancelled.bin");
    let downloader = Downloader::new();
    let handle = downloader
        .download(url(&server, "/cancelled.bin"), DownloadOptions::to_path(&dest))
        .unwrap();

    // Metadata is known once the probe has run; the GET is now in flight.
    assert_eq!(downloader.file_size().await.unwrap(), 1024);
    downloader.cancel();

    assert!(matches!(handle.await, Err(DownloadError::Cancelled)));
    assert_eq!(downloader.phase(), Phase::Cancelled);
    assert!(!dest.exists());
    assert_eq!(downloader.downloaded_bytes(), 0);

    downloader.cancel();
    assert_eq!(downloader.phase(), Phase::Cancelled);

    // The session is terminal; a new transfer cannot be started on it.
    assert!(matches!(
        downloader.download(url(&server, "/cancelled.bin"), DownloadOptions::to_path(&dest)),
        Err(DownloadError::IllegalState { .. })
    ));
}

#[tokio::test]
async fn resume_while_idle_is_illegal_and_issues_no_traffic() {
    let server = MockServer::start().await;
    let downloader = Downloader::new();

    assert!(matches!(
        downloader.resume(),
        Err(DownloadError::IllegalState { .. })
    ));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn an_empty_resource_cancels_the_session() {
    let server = MockServer::start().await;
    mount_head(&server, &[], true).await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::new();
    let handle = downloader
        .download(
            url(&server, "/empty.bin"),
            DownloadOptions::to_path(dir.path().join("empty.bin")),
        )
        .unwrap();

    assert!(matches!(handle.await, Err(DownloadError::Cancelled)));
    assert_eq!(downloader.phase(), Phase::Cancelled);
    assert!(ranged_gets(&server).await.is_empty());
}

#[tokio::test]
async fn a_server_fault_is_retried_before_the_chunk_succeeds() {
    let server = MockServer::start().await;
    let content = pattern(1024);
    mount_head(&server, &content, true).await;
    // First GET fails with a 500; the mock then expires and the range
    // responder takes over.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(content.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("retried.bin");
    let downloader = Downloader::new();
    let handle = downloader
        .download(url(&server, "/retried.bin"), DownloadOptions::to_path(&dest))
        .unwrap();

    let result = handle.await.unwrap();
    assert!(result.is_complete);
    assert_eq!(std::fs::read(&dest).unwrap(), content);
    assert_eq!(ranged_gets(&server).await.len(), 2);
}

#[tokio::test]
async fn file_name_is_derived_or_rejected() {
    let downloader = Downloader::new();
    let bare = Url::parse("https://example.com/").unwrap();
    assert!(matches!(
        downloader.download(bare, DownloadOptions::default()),
        Err(DownloadError::FileNameIndeterminate)
    ));
}

struct TempPaths(PathBuf);

impl PathProvider for TempPaths {
    fn documents_dir(&self) -> PathBuf {
        self.0.clone()
    }
}

#[tokio::test]
async fn derived_destinations_land_in_the_cache_directory() {
    let server = MockServer::start().await;
    let content = pattern(2048);
    mount_head(&server, &content, true).await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(content.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloader = Downloader::builder()
        .paths(Arc::new(TempPaths(dir.path().to_path_buf())))
        .build()
        .unwrap();

    let handle = downloader
        .download(url(&server, "/files/report.pdf"), DownloadOptions::default())
        .unwrap();
    let result = handle.await.unwrap();

    let expected = dir.path().join("cacheDirectory").join("report.pdf");
    assert_eq!(result.path, expected);
    assert_eq!(std::fs::read(&expected).unwrap(), content);
}

#[tokio::test]
async fn dispose_is_idempotent_and_blocks_new_transfers() {
    let server = MockServer::start().await;
    let downloader = Downloader::new();
    downloader.dispose();
    downloader.dispose();

    let dir = TempDir::new().unwrap();
    assert!(matches!(
        downloader.download(
            url(&server, "/late.bin"),
            DownloadOptions::to_path(dir.path().join("late.bin")),
        ),
        Err(DownloadError::Disposed)
    ));
}
