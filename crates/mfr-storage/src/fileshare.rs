//! Azure Files share adapter over the REST API with SAS authentication.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mfr_core::{LocalFile, RemoteEntry};
use serde::Deserialize;
use tracing::{debug, info_span, Instrument};

use crate::blob::parse_http_date;
use crate::{
    archive_destination, move_via_copy, redact_url, sort_by_modified, write_local_file,
    AzureEndpoint, CopyPollPolicy, CopyStatus, RemoteCopy, RestClient, StorageAdapter,
    StorageError, AZURE_API_VERSION,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DirectoryEnumeration {
    #[serde(default)]
    entries: Option<ShareEntries>,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShareEntries {
    #[serde(rename = "$value", default)]
    items: Vec<ShareEntry>,
}

#[derive(Debug, Deserialize)]
enum ShareEntry {
    File(ShareFile),
    Directory(serde::de::IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShareFile {
    name: String,
    #[serde(default)]
    properties: Option<ShareFileProperties>,
}

#[derive(Debug, Deserialize, Default)]
struct ShareFileProperties {
    #[serde(rename = "Content-Length", default)]
    content_length: Option<u64>,
    #[serde(rename = "Last-Modified", default)]
    last_modified: Option<String>,
}

/// A listed file before its timestamp is known.
#[derive(Debug, Clone, PartialEq)]
struct ListedFile {
    name: String,
    size: Option<u64>,
    last_modified: Option<String>,
}

fn parse_directory_page(
    xml: &str,
    url: &str,
) -> Result<(Vec<ListedFile>, Option<String>), StorageError> {
    let page: DirectoryEnumeration =
        quick_xml::de::from_str(xml).map_err(|e| StorageError::Listing {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let files = page
        .entries
        .map(|e| e.items)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| match item {
            ShareEntry::File(file) => {
                let props = file.properties.unwrap_or_default();
                Some(ListedFile {
                    name: file.name,
                    size: props.content_length,
                    last_modified: props.last_modified,
                })
            }
            ShareEntry::Directory(_) => None,
        })
        .collect();

    let marker = page.next_marker.filter(|m| !m.trim().is_empty());
    Ok((files, marker))
}

fn join_path(directory: &str, name: &str) -> String {
    let dir = directory.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// One share in a file storage account.
#[derive(Debug, Clone)]
pub struct FileShareStorage {
    http: Arc<RestClient>,
    endpoint: AzureEndpoint,
    share: String,
    copy_policy: CopyPollPolicy,
}

impl FileShareStorage {
    pub fn new(
        http: Arc<RestClient>,
        endpoint: AzureEndpoint,
        share: impl Into<String>,
        copy_policy: CopyPollPolicy,
    ) -> Self {
        Self {
            http,
            endpoint,
            share: share.into(),
            copy_policy,
        }
    }

    fn file_url(&self, path: &str) -> reqwest::Url {
        self.endpoint.url(&self.share, path, &[])
    }

    /// Last-Modified from the file's properties when the listing omitted it.
    async fn last_modified_of(&self, path: &str) -> Result<String, StorageError> {
        let url = self.file_url(path);
        let resp = self
            .http
            .send("file properties", &url, |c| {
                c.head(url.clone()).header("x-ms-version", AZURE_API_VERSION)
            })
            .await?;
        resp.headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::Listing {
                url: redact_url(&url),
                reason: "file properties carry no Last-Modified header".to_string(),
            })
    }
}

#[async_trait]
impl StorageAdapter for FileShareStorage {
    fn label(&self) -> String {
        format!("fileshare:{}", self.share)
    }

    async fn list(&self, source: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut params = vec![
                ("restype", "directory"),
                ("comp", "list"),
                ("include", "Timestamps"),
            ];
            if let Some(m) = marker.as_deref() {
                params.push(("marker", m));
            }
            let url = self.endpoint.url(&self.share, source, &params);
            let body = self.http.get_bytes("list directory", &url).await?;
            let text = String::from_utf8_lossy(&body);
            let redacted = redact_url(&url);
            let (files, next) = parse_directory_page(&text, &redacted)?;
            debug!(share = %self.share, directory = source, count = files.len(), "listed directory page");

            for file in files {
                let path = join_path(source, &file.name);
                let raw_modified = match file.last_modified {
                    Some(raw) => raw,
                    None => self.last_modified_of(&path).await?,
                };
                let last_modified =
                    parse_http_date(&raw_modified).ok_or_else(|| StorageError::Listing {
                        url: redacted.clone(),
                        reason: format!("file {path} has unparseable Last-Modified {raw_modified:?}"),
                    })?;
                entries.push(RemoteEntry::new(path, last_modified, file.size));
            }

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
        let url = self.file_url(&entry.path);
        let span = info_span!("file_download", share = %self.share, path = %entry.path);
        async {
            let bytes = self.http.get_bytes("download file", &url).await?;
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
impl RemoteCopy for FileShareStorage {
    async fn start_copy(
        &self,
        source_path: &str,
        destination_path: &str,
    ) -> Result<CopyStatus, StorageError> {
        let source = self.file_url(source_path);
        let destination = self.file_url(destination_path);
        let resp = self
            .http
            .send("copy file", &destination, |c| {
                c.put(destination.clone())
                    .header("x-ms-version", AZURE_API_VERSION)
                    .header("x-ms-copy-source", source.as_str())
                    .body(Vec::<u8>::new())
            })
            .await?;
        Ok(CopyStatus::from_copy_response(resp.headers()))
    }

    async fn copy_status(&self, destination_path: &str) -> Result<CopyStatus, StorageError> {
        let url = self.file_url(destination_path);
        let resp = self
            .http
            .send("file properties", &url, |c| {
                c.head(url.clone()).header("x-ms-version", AZURE_API_VERSION)
            })
            .await?;
        Ok(CopyStatus::from_properties(resp.headers()))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let url = self.file_url(path);
        self.http
            .send("delete file", &url, |c| {
                c.delete(url.clone()).header("x-ms-version", AZURE_API_VERSION)
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffPolicy, HttpClientConfig};
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.file.core.windows.net/" ShareName="qvh" DirectoryPath="Uploads/IQPR">
  <Entries>
    <File>
      <Name>b.csv</Name>
      <Properties>
        <Content-Length>10</Content-Length>
        <Last-Modified>Mon, 01 Apr 2024 09:02:00 GMT</Last-Modified>
      </Properties>
    </File>
    <Directory>
      <Name>Processed</Name>
      <Properties />
    </Directory>
    <File>
      <Name>a.csv</Name>
      <Properties>
        <Content-Length>12</Content-Length>
      </Properties>
    </File>
  </Entries>
  <NextMarker />
</EnumerationResults>"#;

    fn storage(server: &MockServer) -> FileShareStorage {
        let http = RestClient::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        })
        .unwrap();
        FileShareStorage::new(
            Arc::new(http),
            AzureEndpoint::new(&server.uri(), "sv=1&sig=test").unwrap(),
            "qvh",
            CopyPollPolicy {
                backoff: BackoffPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
                timeout: Duration::from_secs(2),
            },
        )
    }

    #[test]
    fn listing_skips_directories() {
        let (files, marker) = parse_directory_page(LISTING, "test").unwrap();
        let names = files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["b.csv", "a.csv"]);
        assert!(files[1].last_modified.is_none());
        assert!(marker.is_none());
    }

    #[tokio::test]
    async fn list_fills_missing_timestamps_and_sorts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/qvh/Uploads/IQPR"))
            .and(query_param("restype", "directory"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/qvh/Uploads/IQPR/a.csv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("last-modified", "Mon, 01 Apr 2024 09:01:00 GMT"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let entries = storage(&server).list("Uploads/IQPR").await.unwrap();
        let paths = entries.iter().map(|e| e.path.as_str()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["Uploads/IQPR/a.csv", "Uploads/IQPR/b.csv"]);
        assert_eq!(entries[0].size, Some(12));
    }

    #[tokio::test]
    async fn archive_moves_into_processed_directory() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/qvh/Uploads/IQPR/Processed/a.csv"))
            .respond_with(ResponseTemplate::new(202).insert_header("x-ms-copy-status", "success"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/qvh/Uploads/IQPR/a.csv"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let entry = RemoteEntry::new("Uploads/IQPR/a.csv", chrono::Utc::now(), None);
        storage(&server)
            .archive(&entry, "Uploads/IQPR/Processed")
            .await
            .unwrap();
    }
}
