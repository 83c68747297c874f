//! Catch-all direct HTTP handler.
//!
//! Accepts every absolute HTTP/HTTPS URL, which is why the factory places it
//! last. Filenames come from `Content-Disposition` when the server sends
//! one, falling back to the last URL path segment.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use tokio_util::sync::CancellationToken;

use modvault_core::content_id::url_hash;
use modvault_core::paths::racer_partial_path;
use modvault_core::{
    DownloadError, DownloadResult, ProgressHandle, ProviderMetadata, sanitize_filename,
};

use crate::fetch::{
    StreamSpec, error_for_status, filename_from_disposition, filename_from_url, send_cancellable,
    stream_to_file,
};
use crate::handler::ProviderHandler;

/// Provider key of the catch-all handler.
pub const PROVIDER_KEY: &str = "direct";

/// Handler for plain HTTP/HTTPS downloads.
pub struct DirectHttpHandler {
    client: reqwest::Client,
    timeout: Duration,
}

impl DirectHttpHandler {
    /// Create the handler over the shared client.
    #[must_use]
    pub const fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// HEAD the URL and pick a filename, falling back to the URL path.
    async fn resolve_filename(&self, url: &str, cancel: &CancellationToken) -> Option<String> {
        let head = send_cancellable(self.client.head(url), cancel, self.timeout.as_secs()).await;
        if let Ok(response) = head {
            if response.status().is_success() {
                let from_header = response
                    .headers()
                    .get(header::CONTENT_DISPOSITION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(filename_from_disposition);
                if let Some(name) = from_header {
                    return Some(sanitize_filename(&name));
                }
            }
        }
        filename_from_url(url).map(|n| sanitize_filename(&n))
    }
}

#[async_trait]
impl ProviderHandler for DirectHttpHandler {
    fn provider_key(&self) -> &'static str {
        PROVIDER_KEY
    }

    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| {
            matches!(u.scheme(), "http" | "https") && u.host_str().is_some()
        })
    }

    async fn resolve_filenames(&self, url: &str, cancel: &CancellationToken) -> Vec<String> {
        self.resolve_filename(url, cancel).await.into_iter().collect()
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: Option<&ProgressHandle>,
        _target_filenames: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult, DownloadError> {
        if !self.can_handle(url) {
            return Err(DownloadError::invalid_url(url));
        }

        let filename = self
            .resolve_filename(url, cancel)
            .await
            .unwrap_or_else(|| "download".to_string());
        let final_path = dest_dir.join(&filename);

        if final_path.is_file() {
            let size = tokio::fs::metadata(&final_path).await.map(|m| m.len()).unwrap_or(0);
            if let Some(progress) = progress {
                progress.skip(final_path.clone(), size);
            }
            return Ok(DownloadResult::skipped(final_path));
        }

        let response =
            send_cancellable(self.client.get(url), cancel, self.timeout.as_secs()).await?;
        if let Some(err) = error_for_status(&response, url, PROVIDER_KEY) {
            return Err(err);
        }

        if let Some(progress) = progress {
            let host = url::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();
            progress.start(format!("Downloading from {host}"));
        }

        let temp = racer_partial_path(dest_dir, &url_hash(url)?, "http");
        let downloaded = stream_to_file(
            response,
            StreamSpec {
                dest: &temp,
                progress,
                cancel,
                max_bytes_per_sec: 0,
                expected_size: None,
            },
        )
        .await?;

        tokio::fs::rename(&temp, &final_path).await?;
        tracing::info!(
            target: "modvault.download",
            url,
            bytes = downloaded,
            path = %final_path.display(),
            "direct download complete"
        );
        if let Some(progress) = progress {
            progress.complete(final_path.clone());
        }
        Ok(DownloadResult::succeeded(
            "Downloaded from direct link",
            final_path,
        ))
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderMetadata, DownloadError> {
        let response =
            send_cancellable(self.client.head(url), cancel, self.timeout.as_secs()).await?;
        if let Some(err) = error_for_status(&response, url, PROVIDER_KEY) {
            return Err(err);
        }

        let header_text = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let filename = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .or_else(|| filename_from_url(url))
            .unwrap_or_default();

        Ok(ProviderMetadata::new(PROVIDER_KEY)
            .with("contentLength", response.content_length().unwrap_or(0))
            .with("lastModified", header_text(header::LAST_MODIFIED))
            .with("etag", header_text(header::ETAG))
            .with("fileName", filename)
            .with("url", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modvault_core::DownloadProgress;

    fn handler() -> DirectHttpHandler {
        DirectHttpHandler::new(
            crate::handler::default_client(Duration::from_secs(10)),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_can_handle_absolute_http_only() {
        let h = handler();
        assert!(h.can_handle("https://example.com/mod.zip"));
        assert!(h.can_handle("http://example.com/"));
        assert!(!h.can_handle("ftp://example.com/mod.zip"));
        assert!(!h.can_handle("/relative/path"));
        assert!(!h.can_handle("file:///etc/passwd"));
    }

    #[tokio::test]
    async fn test_download_streams_body_to_named_file() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![0xab_u8; 10_000];
        let _m = server
            .mock("GET", "/files/archive.zip")
            .with_status(200)
            .with_header("content-type", "application/zip")
            .with_body(body.clone())
            .create_async()
            .await;
        let _head = server
            .mock("HEAD", "/files/archive.zip")
            .with_status(200)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/files/archive.zip", server.url());
        let cancel = CancellationToken::new();
        let handle = ProgressHandle::new(DownloadProgress::new("m", &url));

        let result = handler()
            .download(&url, dir.path(), Some(&handle), None, &cancel)
            .await
            .unwrap();

        assert!(result.success);
        let path = result.file_path.unwrap();
        assert_eq!(path.file_name().unwrap(), "archive.zip");
        assert_eq!(std::fs::read(&path).unwrap(), body);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.bytes_downloaded, 10_000);
    }

    #[tokio::test]
    async fn test_download_respects_content_disposition() {
        let mut server = mockito::Server::new_async().await;
        let _head = server
            .mock("HEAD", "/dl")
            .with_status(200)
            .with_header("content-disposition", "attachment; filename=\"named.7z\"")
            .create_async()
            .await;
        let _get = server
            .mock("GET", "/dl")
            .with_status(200)
            .with_body(b"data")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/dl", server.url());
        let result = handler()
            .download(&url, dir.path(), None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.file_path.unwrap().file_name().unwrap(), "named.7z");
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped() {
        let mut server = mockito::Server::new_async().await;
        let _head = server.mock("HEAD", "/f.zip").with_status(200).create_async().await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.zip"), b"already here").unwrap();

        let url = format!("{}/f.zip", server.url());
        let handle = ProgressHandle::new(DownloadProgress::new("m", &url));
        let result = handler()
            .download(&url, dir.path(), Some(&handle), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.was_skipped);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, modvault_core::DownloadStatus::Skipped);
        assert_eq!(snapshot.bytes_downloaded, 12);
    }

    #[tokio::test]
    async fn test_404_maps_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _head = server.mock("HEAD", "/gone.zip").with_status(404).create_async().await;
        let _get = server.mock("GET", "/gone.zip").with_status(404).create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/gone.zip", server.url());
        let err = handler()
            .download(&url, dir.path(), None, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fetch_metadata_whitelist_fields() {
        let mut server = mockito::Server::new_async().await;
        let _head = server
            .mock("HEAD", "/meta.zip")
            .with_status(200)
            .with_header("etag", "\"abc123\"")
            .with_header("last-modified", "Wed, 01 May 2024 10:00:00 GMT")
            .with_header("content-length", "2048")
            .create_async()
            .await;

        let url = format!("{}/meta.zip", server.url());
        let meta = handler()
            .fetch_metadata(&url, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(meta.provider(), "direct");
        assert_eq!(meta.get("etag").unwrap().as_text(), Some("\"abc123\""));
        assert!(meta.get("contentLength").unwrap().as_integer().is_some());
        assert_eq!(meta.get("fileName").unwrap().as_text(), Some("meta.zip"));
    }
}
