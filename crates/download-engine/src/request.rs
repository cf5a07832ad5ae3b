use crate::error::DownloadError;
use derive_builder::Builder;
use reqwest::{
    Url,
    header::{HeaderMap, IntoHeaderName},
};
use std::path::{Path, PathBuf};

/// Default cap on the number of chunks the planner may select.
pub const DEFAULT_MAX_CHUNKS: u64 = 300;
/// Default retry bound per chunk.
pub const DEFAULT_MAX_RETRIES: u64 = 3;

/// Supplies the base directory for downloads without an explicit
/// destination; files land under `<documents>/cacheDirectory/<file_name>`.
pub trait PathProvider: Send + Sync {
    fn documents_dir(&self) -> PathBuf;
}

/// Default provider backed by the platform documents directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPaths;

impl PathProvider for SystemPaths {
    fn documents_dir(&self) -> PathBuf {
        dirs::document_dir().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Per-download configuration for destination, chunking, retries, and headers.
///
/// Behavior
/// - `path`: explicit destination; when absent the file is placed under the
///   path provider's cache directory.
/// - `file_name`: explicit name; when absent it is derived from the URL.
/// - `max_chunks`: upper bound handed to the chunk planner (default 300).
/// - `retry_count`: per-chunk retry bound (default 3).
/// - `headers`: extra HTTP headers applied to the probe and every GET.
#[derive(Debug, Builder, Clone)]
#[builder(pattern = "owned")]
#[builder(build_fn(validate = "Self::validate"))]
pub struct DownloadOptions {
    #[builder(default, setter(into, strip_option))]
    path: Option<PathBuf>,
    #[builder(default, setter(into, strip_option))]
    file_name: Option<String>,
    #[builder(default = "DEFAULT_MAX_CHUNKS")]
    max_chunks: u64,
    #[builder(default = "DEFAULT_MAX_RETRIES")]
    retry_count: u64,
    #[builder(field(ty = "HeaderMap"), setter(custom))]
    headers: HeaderMap,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            path: None,
            file_name: None,
            max_chunks: DEFAULT_MAX_CHUNKS,
            retry_count: DEFAULT_MAX_RETRIES,
            headers: HeaderMap::new(),
        }
    }
}

impl DownloadOptions {
    pub fn builder() -> DownloadOptionsBuilder {
        DownloadOptionsBuilder::default()
    }

    /// Options targeting an explicit destination path.
    pub fn to_path(destination: impl Into<PathBuf>) -> Self {
        DownloadOptions {
            path: Some(destination.into()),
            ..Default::default()
        }
    }

    /// Explicit destination path, when supplied.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Explicit file name override, when supplied.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Upper bound handed to the chunk planner.
    pub fn max_chunks(&self) -> u64 {
        self.max_chunks
    }

    /// Per-chunk retry bound.
    pub fn retry_count(&self) -> u64 {
        self.retry_count
    }

    /// Additional headers applied to both the HEAD probe and every GET.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl DownloadOptionsBuilder {
    /// Add an HTTP header (e.g., Authorization).
    ///
    /// Note: value must be a valid header value; invalid values cause a panic during build.
    pub fn header(mut self, header: impl IntoHeaderName, value: impl AsRef<str>) -> Self {
        self.headers.insert(header, value.as_ref().parse().unwrap());
        self
    }

    /// Convenience for setting the User-Agent header.
    pub fn user_agent(self, user_agent: impl AsRef<str>) -> Self {
        self.header(reqwest::header::USER_AGENT, user_agent)
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_chunks == Some(0) {
            return Err("max_chunks must be greater than 0".to_string());
        }
        if self.retry_count == Some(0) {
            return Err("retry_count must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Stored file name: the explicit override when non-empty, else the URL
/// path segment after the last `/`.
pub(crate) fn derive_file_name(
    url: &Url,
    explicit: Option<&str>,
) -> Result<String, DownloadError> {
    if let Some(name) = explicit {
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }
    let derived = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    if derived.is_empty() {
        return Err(DownloadError::FileNameIndeterminate);
    }
    Ok(derived.to_string())
}
