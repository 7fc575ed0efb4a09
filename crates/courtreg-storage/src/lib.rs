//! Dataset registry client, resumable resource downloads, and archive unpacking for courtreg.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use reqwest::header::RANGE;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "courtreg-storage";

pub const DEFAULT_REGISTRY_URL: &str = "https://data.gov.ua";

/// Resource formats the importer knows how to consume.
pub const SUPPORTED_FORMATS: [&str; 2] = ["csv", "zip"];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable identity of a remote resource, used to name its partial download.
pub fn url_fingerprint(url: &str) -> String {
    sha256_hex(url.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetResource {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl DatasetResource {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.url.as_deref())
            .unwrap_or("<unnamed resource>")
    }

    pub fn normalized_format(&self) -> String {
        self.format
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED_FORMATS.contains(&self.normalized_format().as_str())
    }

    pub fn is_zip(&self) -> bool {
        self.normalized_format() == "zip"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetMetadata {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub resources: Vec<DatasetResource>,
}

impl DatasetMetadata {
    pub fn supported_resources(&self) -> Vec<DatasetResource> {
        self.resources
            .iter()
            .filter(|r| r.is_supported())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct PackageShowResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<DatasetMetadata>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid registry url: {0}")]
    Url(String),
    #[error("registry returned http status {status}")]
    HttpStatus { status: u16 },
    #[error("registry reported an unsuccessful response")]
    Unsuccessful,
    #[error("registry payload could not be parsed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Parses a `package_show` payload into dataset metadata.
pub fn parse_package_show(body: &[u8]) -> Result<DatasetMetadata, RegistryError> {
    let response: PackageShowResponse = serde_json::from_slice(body)?;
    match response {
        PackageShowResponse {
            success: true,
            result: Some(metadata),
        } => Ok(metadata),
        _ => Err(RegistryError::Unsuccessful),
    }
}

/// Read-only client for the open-data registry API.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: base_url.into(),
        })
    }

    pub fn package_show_url(&self, dataset_id: &str) -> Result<Url, RegistryError> {
        let endpoint = format!(
            "{}/api/3/action/package_show",
            self.base_url.trim_end_matches('/')
        );
        Url::parse_with_params(&endpoint, &[("id", dataset_id)])
            .map_err(|e| RegistryError::Url(e.to_string()))
    }

    pub async fn fetch_dataset(&self, dataset_id: &str) -> Result<DatasetMetadata, RegistryError> {
        let url = self.package_show_url(dataset_id)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::HttpStatus {
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        parse_package_show(&body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("resource has no url")]
    MissingUrl,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("download limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::MissingUrl | FetchError::Io { .. } | FetchError::LimiterClosed => {
                RetryDisposition::NonRetryable
            }
        }
    }

    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FetchError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    /// Length of the partial file the transfer continued from.
    pub resumed_from: u64,
    /// The completed file was already present and nothing was transferred.
    pub reused: bool,
}

#[derive(Debug)]
pub struct DownloadReport {
    pub name: String,
    pub is_zip: bool,
    pub result: Result<DownloadOutcome, String>,
}

/// Target file name for a resource url: its last path segment.
pub fn file_name_for_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default().trim();
    if name.is_empty() {
        format!("{}.bin", &url_fingerprint(url)[..16])
    } else {
        name.to_string()
    }
}

pub fn part_path_for(target: &Path, url: &str) -> PathBuf {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}.part", url_fingerprint(url)))
}

/// Bounded-parallel downloader that resumes interrupted transfers.
#[derive(Debug)]
pub struct ResourceDownloader {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl ResourceDownloader {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// Downloads `resource` into `dest_dir`, retrying transient failures.
    ///
    /// A completed file from an earlier run is revalidated against the server
    /// and only kept when the remote length still matches.
    pub async fn download(
        &self,
        resource: &DatasetResource,
        dest_dir: &Path,
    ) -> Result<DownloadOutcome, FetchError> {
        let url = resource.url.as_deref().ok_or(FetchError::MissingUrl)?;
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| FetchError::io(format!("creating {}", dest_dir.display()), e))?;
        let target = dest_dir.join(file_name_for_url(url));
        let part = part_path_for(&target, url);

        let span = info_span!("http_fetch", name = resource.display_name(), url);
        let mut attempt = 0usize;
        loop {
            match self.transfer(url, &target, &part).instrument(span.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(url, attempt, error = %err, ?delay, "download attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn transfer(
        &self,
        url: &str,
        target: &Path,
        part: &Path,
    ) -> Result<DownloadOutcome, FetchError> {
        let partial = file_len(part).await;
        // An interrupted transfer takes precedence over a completed file.
        let completed = if partial == 0 { file_len(target).await } else { 0 };
        let existing = partial.max(completed);

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let mut response = request.send().await?;
        let status = response.status();

        let unchanged = (status == StatusCode::RANGE_NOT_SATISFIABLE
            || (status == StatusCode::OK && response.content_length() == Some(existing)))
            && existing > 0;
        if unchanged {
            if completed > 0 {
                debug!(url, bytes = completed, "remote unchanged, keeping completed file");
                return Ok(DownloadOutcome {
                    path: target.to_path_buf(),
                    bytes: completed,
                    resumed_from: 0,
                    reused: true,
                });
            }
            return finish_part(part, target, existing, existing).await;
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let resume = status == StatusCode::PARTIAL_CONTENT && existing > 0;
        if resume && completed > 0 {
            fs::copy(target, part).await.map_err(|e| {
                FetchError::io(
                    format!("copying {} -> {}", target.display(), part.display()),
                    e,
                )
            })?;
        }
        let mut options = fs::OpenOptions::new();
        if resume {
            options.append(true);
        } else {
            options.create(true).write(true).truncate(true);
        }
        let mut file = options
            .open(part)
            .await
            .map_err(|e| FetchError::io(format!("opening {}", part.display()), e))?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(format!("writing {}", part.display()), e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| FetchError::io(format!("flushing {}", part.display()), e))?;
        drop(file);

        let resumed_from = if resume { existing } else { 0 };
        finish_part(part, target, resumed_from + written, resumed_from).await
    }

    /// Downloads every resource concurrently (bounded by the configured limit).
    /// ZIP archives go to `archive_dir`, everything else to `csv_dir`.
    pub async fn download_all(
        &self,
        resources: &[DatasetResource],
        archive_dir: &Path,
        csv_dir: &Path,
    ) -> Vec<DownloadReport> {
        let jobs = resources.iter().filter(|r| r.url.is_some()).map(|resource| async move {
            let dest = if resource.is_zip() { archive_dir } else { csv_dir };
            let result = self
                .download(resource, dest)
                .await
                .map_err(|err| err.to_string());
            match &result {
                Ok(outcome) => info!(
                    name = resource.display_name(),
                    path = %outcome.path.display(),
                    bytes = outcome.bytes,
                    reused = outcome.reused,
                    "resource downloaded"
                ),
                Err(error) => warn!(name = resource.display_name(), %error, "resource download failed"),
            }
            DownloadReport {
                name: resource.display_name().to_string(),
                is_zip: resource.is_zip(),
                result,
            }
        });
        join_all(jobs).await
    }
}

async fn file_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn finish_part(
    part: &Path,
    target: &Path,
    bytes: u64,
    resumed_from: u64,
) -> Result<DownloadOutcome, FetchError> {
    fs::rename(part, target).await.map_err(|e| {
        FetchError::io(
            format!("renaming {} -> {}", part.display(), target.display()),
            e,
        )
    })?;
    Ok(DownloadOutcome {
        path: target.to_path_buf(),
        bytes,
        resumed_from,
        reused: false,
    })
}

/// Extracts `zip_path` into `output_dir` and returns the extracted CSV files.
///
/// A file that is not a valid archive yields an empty list.
pub fn unpack_zip(zip_path: &Path, output_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let file = File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = match zip::ZipArchive::new(file) {
        Ok(archive) => archive,
        Err(err) => {
            warn!(path = %zip_path.display(), error = %err, "not a valid ZIP archive");
            return Ok(Vec::new());
        }
    };

    let mut csv_files = Vec::new();
    for idx in 0..archive.len() {
        let mut entry = archive
            .by_index(idx)
            .with_context(|| format!("reading entry {idx} of {}", zip_path.display()))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(path = %zip_path.display(), entry = entry.name(), "skipping entry outside archive root");
            continue;
        };
        let out_path = output_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .with_context(|| format!("creating {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("creating {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("extracting {}", out_path.display()))?;

        let is_csv = out_path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv {
            csv_files.push(out_path);
        }
    }
    Ok(csv_files)
}
