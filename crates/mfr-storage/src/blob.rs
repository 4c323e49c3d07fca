//! Azure Blob Storage adapter over the REST API with SAS authentication.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mfr_core::{LocalFile, RemoteEntry};
use serde::Deserialize;
use tracing::{debug, info_span, Instrument};

use crate::{
    archive_destination, move_via_copy, redact_url, sort_by_modified, write_local_file,
    AzureEndpoint, CopyPollPolicy, CopyStatus, RemoteCopy, RestClient, StorageAdapter,
    StorageError, AZURE_API_VERSION,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobEnumeration {
    #[serde(default)]
    blobs: Option<BlobList>,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobList {
    #[serde(rename = "$value", default)]
    items: Vec<BlobListItem>,
}

#[derive(Debug, Deserialize)]
enum BlobListItem {
    Blob(BlobItem),
    BlobPrefix(serde::de::IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Last-Modified")]
    last_modified: String,
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
}

pub(crate) fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// One page of a container listing plus the continuation marker.
fn parse_blob_page(xml: &str, url: &str) -> Result<(Vec<RemoteEntry>, Option<String>), StorageError> {
    let page: BlobEnumeration = quick_xml::de::from_str(xml).map_err(|e| StorageError::Listing {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let mut entries = Vec::new();
    for item in page.blobs.map(|b| b.items).unwrap_or_default() {
        let BlobListItem::Blob(blob) = item else {
            continue;
        };
        let last_modified =
            parse_http_date(&blob.properties.last_modified).ok_or_else(|| StorageError::Listing {
                url: url.to_string(),
                reason: format!(
                    "blob {} has unparseable Last-Modified {:?}",
                    blob.name, blob.properties.last_modified
                ),
            })?;
        entries.push(RemoteEntry::new(
            blob.name,
            last_modified,
            blob.properties.content_length,
        ));
    }

    let marker = page.next_marker.filter(|m| !m.trim().is_empty());
    Ok((entries, marker))
}

/// One container in a blob storage account.
#[derive(Debug, Clone)]
pub struct BlobStorage {
    http: Arc<RestClient>,
    endpoint: AzureEndpoint,
    container: String,
    copy_policy: CopyPollPolicy,
}

impl BlobStorage {
    pub fn new(
        http: Arc<RestClient>,
        endpoint: AzureEndpoint,
        container: impl Into<String>,
        copy_policy: CopyPollPolicy,
    ) -> Self {
        Self {
            http,
            endpoint,
            container: container.into(),
            copy_policy,
        }
    }

    fn blob_url(&self, path: &str) -> reqwest::Url {
        self.endpoint.url(&self.container, path, &[])
    }
}

#[async_trait]
impl StorageAdapter for BlobStorage {
    fn label(&self) -> String {
        format!("blob:{}", self.container)
    }

    async fn list(&self, source: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        let prefix = source.trim_start_matches('/');
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut params = vec![("restype", "container"), ("comp", "list")];
            if !prefix.is_empty() {
                params.push(("prefix", prefix));
            }
            if let Some(m) = marker.as_deref() {
                params.push(("marker", m));
            }
            let url = self.endpoint.url(&self.container, "", &params);
            let body = self.http.get_bytes("list blobs", &url).await?;
            let text = String::from_utf8_lossy(&body);
            let (page, next) = parse_blob_page(&text, &redact_url(&url))?;
            debug!(container = %self.container, count = page.len(), "listed blob page");
            entries.extend(page);
            match next {
                Some(m) => marker = Some(m),
                None => break,
            }
        }

        sort_by_modified(&mut entries);
        Ok(entries)
    }

    async fn download(
        &self,
        entry: &RemoteEntry,
        destination_dir: &Path,
    ) -> Result<LocalFile, StorageError> {
        let url = self.blob_url(&entry.path);
        let span = info_span!("blob_download", container = %self.container, path = %entry.path);
        async {
            let bytes = self.http.get_bytes("download blob", &url).await?;
            write_local_file(destination_dir, &entry.name, &bytes).await
        }
        .instrument(span)
        .await
    }

    async fn archive(&self, entry: &RemoteEntry, archive_dir: &str) -> Result<(), StorageError> {
        let destination = archive_destination(archive_dir, &entry.name);
        move_via_copy(self, &entry.path, &destination, &self.copy_policy).await
    }
}

#[async_trait]
impl RemoteCopy for BlobStorage {
    async fn start_copy(
        &self,
        source_path: &str,
        destination_path: &str,
    ) -> Result<CopyStatus, StorageError> {
        let source = self.blob_url(source_path);
        let destination = self.blob_url(destination_path);
        let resp = self
            .http
            .send("copy blob", &destination, |c| {
                c.put(destination.clone())
                    .header("x-ms-version", AZURE_API_VERSION)
                    .header("x-ms-copy-source", source.as_str())
                    .body(Vec::<u8>::new())
            })
            .await?;
        Ok(CopyStatus::from_copy_response(resp.headers()))
    }

    async fn copy_status(&self, destination_path: &str) -> Result<CopyStatus, StorageError> {
        let url = self.blob_url(destination_path);
        let resp = self
            .http
            .send("blob properties", &url, |c| {
                c.head(url.clone()).header("x-ms-version", AZURE_API_VERSION)
            })
            .await?;
        Ok(CopyStatus::from_properties(resp.headers()))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let url = self.blob_url(path);
        self.http
            .send("delete blob", &url, |c| {
                c.delete(url.clone()).header("x-ms-version", AZURE_API_VERSION)
            })
            .await?;
        Ok(())
    }
}
