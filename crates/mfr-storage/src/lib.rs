//! Remote storage adapters (object store + file share), retrying REST client and
//! copy-then-delete archiving for MFR.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use mfr_core::{LocalFile, RemoteEntry};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod blob;
mod fileshare;

pub use blob::BlobStorage;
pub use fileshare::FileShareStorage;

pub const CRATE_NAME: &str = "mfr-storage";

/// Azure storage REST version sent on every request.
pub const AZURE_API_VERSION: &str = "2021-08-06";

/// File extensions the pipeline knows how to load.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = [".csv", ".xls", ".xlsx"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{operation} request to {url} failed: {source}")]
    Transfer {
        operation: &'static str,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{operation} returned http status {status} for {url}")]
    HttpStatus {
        operation: &'static str,
        status: u16,
        url: String,
    },
    #[error("remote entry not found: {url}")]
    NotFound { url: String },
    #[error("writing local file {}: {source}", path.display())]
    LocalWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid storage endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("unexpected listing response from {url}: {reason}")]
    Listing { url: String, reason: String },
    #[error("archiving {source_path} to {destination} failed: copy status {status}")]
    Archive {
        source_path: String,
        destination: String,
        status: String,
    },
    #[error("archiving {source_path} to {destination} timed out after {waited:?}")]
    ArchiveTimeout {
        source_path: String,
        destination: String,
        waited: Duration,
    },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

impl StorageError {
    /// True for the copy-then-delete failures that leave the source in place.
    pub fn is_archive_failure(&self) -> bool {
        matches!(
            self,
            StorageError::Archive { .. } | StorageError::ArchiveTimeout { .. }
        )
    }
}

/// Capability shared by every remote storage backend the pipeline reads from.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short human label, e.g. `blob:qvh`.
    fn label(&self) -> String;

    /// Entries under `source`, oldest first; ties keep listing order.
    async fn list(&self, source: &str) -> Result<Vec<RemoteEntry>, StorageError>;

    async fn download(
        &self,
        entry: &RemoteEntry,
        destination_dir: &Path,
    ) -> Result<LocalFile, StorageError>;

    /// Copy `entry` into `archive_dir` and delete the original only if the copy succeeded.
    async fn archive(&self, entry: &RemoteEntry, archive_dir: &str) -> Result<(), StorageError>;
}

pub fn has_supported_extension(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Stable ascending sort on last-modified time.
pub fn sort_by_modified(entries: &mut [RemoteEntry]) {
    entries.sort_by_key(|e| e.last_modified);
}

/// Keep loadable files not matching any exclusion substring, oldest first.
pub fn select_candidates(entries: Vec<RemoteEntry>, exclude: &[String]) -> Vec<RemoteEntry> {
    let mut selected = entries
        .into_iter()
        .filter(|e| has_supported_extension(&e.name))
        .filter(|e| !exclude.iter().any(|pattern| e.path.contains(pattern.as_str())))
        .collect::<Vec<_>>();
    sort_by_modified(&mut selected);
    selected
}

/// Destination path for `name` inside `archive_dir`; only the file name survives.
pub fn archive_destination(archive_dir: &str, name: &str) -> String {
    let dir = archive_dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write downloaded bytes under `destination_dir/name` via temp-file rename.
pub async fn write_local_file(
    destination_dir: &Path,
    name: &str,
    bytes: &[u8],
) -> Result<LocalFile, StorageError> {
    let local_write = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StorageError::LocalWrite { path, source }
    };

    fs::create_dir_all(destination_dir)
        .await
        .map_err(local_write(destination_dir))?;

    let path = destination_dir.join(name);
    let temp_path = destination_dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(local_write(&temp_path))?;
    file.write_all(bytes).await.map_err(local_write(&temp_path))?;
    file.flush().await.map_err(local_write(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, &path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::LocalWrite { path, source: err });
    }

    Ok(LocalFile {
        path,
        byte_size: bytes.len() as u64,
        sha256: sha256_hex(bytes),
    })
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("mfr/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Strip the query string (SAS signature) before a URL reaches logs or errors.
pub fn redact_url(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

/// Blocking-in-sequence REST client with retry on transient failures.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl RestClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, StorageError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(StorageError::Client)?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Send the request built by `build`, retrying 5xx/429 and connect/timeout errors.
    ///
    /// Returns the first successful response; 404 maps to [`StorageError::NotFound`].
    pub async fn send<F>(
        &self,
        operation: &'static str,
        url: &Url,
        build: F,
    ) -> Result<reqwest::Response, StorageError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let redacted = redact_url(url);
        let mut attempt = 0usize;

        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(StorageError::NotFound { url: redacted });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(operation, url = %redacted, %status, attempt, "retrying storage request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StorageError::HttpStatus {
                        operation,
                        status: status.as_u16(),
                        url: redacted,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(operation, url = %redacted, error = %err, attempt, "retrying storage request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StorageError::Transfer {
                        operation,
                        url: redacted,
                        source: err.without_url(),
                    });
                }
            }
        }
    }

    pub async fn get_bytes(&self, operation: &'static str, url: &Url) -> Result<Vec<u8>, StorageError> {
        let resp = self
            .send(operation, url, |c| {
                c.get(url.clone()).header("x-ms-version", AZURE_API_VERSION)
            })
            .await?;
        let bytes = resp.bytes().await.map_err(|source| StorageError::Transfer {
            operation,
            url: redact_url(url),
            source: source.without_url(),
        })?;
        Ok(bytes.to_vec())
    }
}

/// Account-level endpoint plus SAS token used to address containers and shares.
#[derive(Debug, Clone)]
pub struct AzureEndpoint {
    base: Url,
    sas_token: String,
}

impl AzureEndpoint {
    pub fn new(endpoint: &str, sas_token: &str) -> Result<Self, StorageError> {
        let base = Url::parse(endpoint).map_err(|e| StorageError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(StorageError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "endpoint cannot carry a path".to_string(),
            });
        }
        Ok(Self {
            base,
            sas_token: sas_token.trim_start_matches('?').to_string(),
        })
    }

    /// `base/<root>/<path segments>` with the SAS token and `params` in the query.
    pub fn url(&self, root: &str, path: &str, params: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.push(root);
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }
        url.set_query(if self.sas_token.is_empty() {
            None
        } else {
            Some(&self.sas_token)
        });
        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

impl CopyStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => CopyStatus::Pending,
            "success" => CopyStatus::Success,
            "aborted" => CopyStatus::Aborted,
            _ => CopyStatus::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CopyStatus::Pending => "pending",
            CopyStatus::Success => "success",
            CopyStatus::Aborted => "aborted",
            CopyStatus::Failed => "failed",
        }
    }

    fn from_header(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        headers
            .get("x-ms-copy-status")
            .and_then(|v| v.to_str().ok())
            .map(CopyStatus::parse)
    }

    /// Status of a copy request; a missing header means the copy completed synchronously.
    pub fn from_copy_response(headers: &reqwest::header::HeaderMap) -> Self {
        Self::from_header(headers).unwrap_or(CopyStatus::Success)
    }

    /// Status read back from the destination's properties. A destination
    /// without copy metadata was not produced by a copy.
    pub fn from_properties(headers: &reqwest::header::HeaderMap) -> Self {
        Self::from_header(headers).unwrap_or(CopyStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CopyPollPolicy {
    pub backoff: BackoffPolicy,
    pub timeout: Duration,
}

impl Default for CopyPollPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(10),
            },
            timeout: Duration::from_secs(300),
        }
    }
}

/// Server-side copy primitives; both backends expose the same three calls.
#[async_trait]
pub trait RemoteCopy: Send + Sync {
    async fn start_copy(
        &self,
        source_path: &str,
        destination_path: &str,
    ) -> Result<CopyStatus, StorageError>;

    async fn copy_status(&self, destination_path: &str) -> Result<CopyStatus, StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// Move `source_path` to `destination_path` by copy, poll, then delete.
///
/// The source is deleted only after the copy reports success. A failed, aborted
/// or timed-out copy leaves the source in place and returns an archive error.
pub async fn move_via_copy<C>(
    ops: &C,
    source_path: &str,
    destination_path: &str,
    policy: &CopyPollPolicy,
) -> Result<(), StorageError>
where
    C: RemoteCopy + ?Sized,
{
    let started = Instant::now();
    let mut status = ops.start_copy(source_path, destination_path).await?;
    let mut attempt = 0usize;

    while status == CopyStatus::Pending {
        let waited = started.elapsed();
        if waited >= policy.timeout {
            warn!(source_path, destination_path, ?waited, "copy still pending; leaving source in place");
            return Err(StorageError::ArchiveTimeout {
                source_path: source_path.to_string(),
                destination: destination_path.to_string(),
                waited,
            });
        }
        let delay = policy
            .backoff
            .delay_for_attempt(attempt)
            .min(policy.timeout.saturating_sub(waited));
        tokio::time::sleep(delay).await;
        status = ops.copy_status(destination_path).await?;
        attempt += 1;
    }

    if status != CopyStatus::Success {
        return Err(StorageError::Archive {
            source_path: source_path.to_string(),
            destination: destination_path.to_string(),
            status: status.as_str().to_string(),
        });
    }

    ops.delete(source_path).await?;
    info!(source_path, destination_path, "archived remote entry");
    Ok(())
}
