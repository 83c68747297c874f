//! JS-gated site handler (MediaFire).
//!
//! The site hides its download links behind JavaScript challenges that an
//! HTTP client cannot solve. Pretending to succeed would produce corrupt
//! archives, so this handler recognizes the URLs and fails honestly with a
//! remediation message instead of issuing any network request.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use modvault_core::{DownloadError, DownloadResult, ProgressHandle, ProviderMetadata};

use crate::handler::ProviderHandler;

/// Provider key of the JS-gated handler.
pub const PROVIDER_KEY: &str = "mediafire";

/// Handler that declines JS-gated downloads with an explanation.
pub struct MediafireHandler;

impl MediafireHandler {
    /// Create the handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn explanation(url: &str) -> String {
        format!(
            "MediaFire downloads require a browser to pass the site's JavaScript check.\n\
             Please download the file manually from {url} and place it in the destination folder.\n\
             Details: automated MediaFire fetches are not supported"
        )
    }
}

impl Default for MediafireHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderHandler for MediafireHandler {
    fn provider_key(&self) -> &'static str {
        PROVIDER_KEY
    }

    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| {
            matches!(u.scheme(), "http" | "https")
                && u.host_str()
                    .is_some_and(|h| h.to_ascii_lowercase().contains("mediafire.com"))
        })
    }

    async fn resolve_filenames(&self, _url: &str, _cancel: &CancellationToken) -> Vec<String> {
        Vec::new()
    }

    async fn download(
        &self,
        url: &str,
        _dest_dir: &Path,
        progress: Option<&ProgressHandle>,
        _target_filenames: Option<&[String]>,
        _cancel: &CancellationToken,
    ) -> Result<DownloadResult, DownloadError> {
        let message = Self::explanation(url);
        if let Some(progress) = progress {
            progress.fail(message.clone());
        }
        Ok(DownloadResult::failed(message))
    }

    async fn fetch_metadata(
        &self,
        _url: &str,
        _cancel: &CancellationToken,
    ) -> Result<ProviderMetadata, DownloadError> {
        Ok(ProviderMetadata::new(PROVIDER_KEY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modvault_core::{DownloadProgress, DownloadStatus};

    #[test]
    fn test_can_handle() {
        let h = MediafireHandler::new();
        assert!(h.can_handle("https://www.mediafire.com/file/abc/mod.zip/file"));
        assert!(!h.can_handle("https://example.com/file/abc"));
    }

    #[tokio::test]
    async fn test_download_fails_with_explanation() {
        let h = MediafireHandler::new();
        let url = "https://www.mediafire.com/file/abc/mod.zip/file";
        let handle = ProgressHandle::new(DownloadProgress::new("m", url));
        let result = h
            .download(
                url,
                Path::new("/tmp"),
                Some(&handle),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.message.contains("manually"));
        assert!(result.message.contains(url));
        assert_eq!(handle.snapshot().status, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn test_metadata_is_provider_only() {
        let meta = MediafireHandler::new()
            .fetch_metadata("https://www.mediafire.com/file/abc", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(meta.provider(), "mediafire");
        assert_eq!(meta.len(), 1);
    }
}
