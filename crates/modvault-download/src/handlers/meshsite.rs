//! Forum-storage handler (Deadlystream).
//!
//! The site fronts its file storage with an Invision-style download page:
//! a session cookie, a CSRF key scraped from the page, and sometimes a
//! confirmation page where the real link must be re-extracted. The cookie
//! jar lives in this handler's own HTTP client and is touched only from its
//! methods. Transfers are capped at 7 MB/s to stay under the site's abuse
//! radar.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header;
use tokio_util::sync::CancellationToken;

use modvault_core::content_id::url_hash;
use modvault_core::paths::racer_partial_path;
use modvault_core::{
    DownloadError, DownloadResult, ProgressHandle, ProviderMetadata, sanitize_filename,
};

use crate::fetch::{
    StreamSpec, error_for_status, filename_from_disposition, filename_from_url, is_html_response,
    send_cancellable, stream_to_file,
};
use crate::handler::ProviderHandler;

/// Provider key of the forum-storage handler.
pub const PROVIDER_KEY: &str = "deadlystream";

/// Bandwidth cap for this provider.
const MAX_RATE: u64 = 7 * 1024 * 1024;

static CSRF_JS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"csrfKey:\s*["']([^"']+)["']"#).expect("csrf js regex"));
static CSRF_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"csrfKey=([^&"'<>\s]+)"#).expect("csrf link regex"));

/// Candidate patterns for a confirmed download link inside an HTML
/// confirmation page, tried in order.
static CONFIRM_LINKS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r#"data-action=["']download["'][^>]*href=["']([^"']+)["']"#)
            .expect("confirm regex 1"),
        Regex::new(r#"href=["']([^"']*do=download[^"']*)["']"#).expect("confirm regex 2"),
        Regex::new(r#"<form[^>]+action=["']([^"']+)["']"#).expect("confirm regex 3"),
    ]
});

static META_FILE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"data-fileid=["'](\d+)["']"#).expect("fileid regex"));
static META_CHANGELOG_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"data-changelogid=["'](\d+)["']"#).expect("changelog regex"));
static META_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""softwareVersion"\s*:\s*"([^"]+)""#).expect("version regex"));
static META_UPDATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""dateModified"\s*:\s*"(\d{4}-\d{2}-\d{2})"#).expect("updated regex"));
static META_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""contentSize"\s*:\s*"?(\d+)"#).expect("size regex"));

/// Handler for the forum-storage provider.
pub struct DeadlystreamHandler {
    /// Owns the session cookie jar; never shared with other handlers.
    client: reqwest::Client,
    timeout: Duration,
}

impl DeadlystreamHandler {
    /// Create the handler with a fresh cookie jar.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .user_agent(concat!("modvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to create HTTP client");
        Self { client, timeout }
    }

    /// Extract a CSRF key from page HTML: JS literal first, link form second.
    fn extract_csrf_key(html: &str) -> Option<String> {
        CSRF_JS
            .captures(html)
            .or_else(|| CSRF_LINK.captures(html))
            .map(|c| c[1].to_string())
    }

    /// Extract a confirmed download link from an HTML confirmation page.
    fn extract_confirmed_link(html: &str) -> Option<String> {
        CONFIRM_LINKS
            .iter()
            .find_map(|re| re.captures(html))
            .map(|c| c[1].replace("&amp;", "&"))
    }

    /// Fetch the file page and build the `?do=download&csrfKey=…` URL.
    async fn resolve_download_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DownloadError> {
        let response = send_cancellable(self.client.get(url), cancel, self.timeout.as_secs()).await?;
        if let Some(err) = error_for_status(&response, url, PROVIDER_KEY) {
            return Err(err);
        }
        let html = response
            .text()
            .await
            .map_err(|e| DownloadError::unexpected(e.to_string()))?;
        let key = Self::extract_csrf_key(&html).ok_or_else(|| {
            DownloadError::content_mismatch("file page carried no csrfKey")
        })?;

        let mut download_url =
            url::Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        download_url
            .query_pairs_mut()
            .clear()
            .append_pair("do", "download")
            .append_pair("csrfKey", &key);
        Ok(download_url.to_string())
    }

    /// Ask the server for the filename without transferring the body.
    async fn probe_filename(&self, download_url: &str, cancel: &CancellationToken) -> Option<String> {
        // HEAD first; some IPS installs reject it, so fall back to a GET
        // whose body is dropped unread.
        for method in [reqwest::Method::HEAD, reqwest::Method::GET] {
            let request = self.client.request(method, download_url);
            if let Ok(response) = send_cancellable(request, cancel, self.timeout.as_secs()).await {
                if !response.status().is_success() {
                    continue;
                }
                let name = response
                    .headers()
                    .get(header::CONTENT_DISPOSITION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(filename_from_disposition);
                if let Some(name) = name {
                    return Some(sanitize_filename(&name));
                }
            }
        }
        None
    }
}

#[async_trait]
impl ProviderHandler for DeadlystreamHandler {
    fn provider_key(&self) -> &'static str {
        PROVIDER_KEY
    }

    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| {
            matches!(u.scheme(), "http" | "https")
                && u.host_str()
                    .is_some_and(|h| h.to_ascii_lowercase().contains("deadlystream.com"))
        })
    }

    async fn resolve_filenames(&self, url: &str, cancel: &CancellationToken) -> Vec<String> {
        let Ok(download_url) = self.resolve_download_url(url, cancel).await else {
            return Vec::new();
        };
        self.probe_filename(&download_url, cancel)
            .await
            .into_iter()
            .collect()
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: Option<&ProgressHandle>,
        _target_filenames: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult, DownloadError> {
        let download_url = self.resolve_download_url(url, cancel).await?;

        if let Some(progress) = progress {
            progress.start("Downloading from Deadly Stream");
        }

        let mut response =
            send_cancellable(self.client.get(&download_url), cancel, self.timeout.as_secs())
                .await?;
        if let Some(err) = error_for_status(&response, &download_url, PROVIDER_KEY) {
            return Err(err);
        }

        // A binary was expected; an HTML body means a confirmation page, so
        // re-extract the confirmed link and follow it once.
        if is_html_response(&response) {
            let html = response
                .text()
                .await
                .map_err(|e| DownloadError::unexpected(e.to_string()))?;
            let confirmed = Self::extract_confirmed_link(&html).ok_or_else(|| {
                DownloadError::content_mismatch(
                    "expected a file download, received an HTML page with no download link",
                )
            })?;
            let confirmed = resolve_relative(&download_url, &confirmed)?;
            response =
                send_cancellable(self.client.get(&confirmed), cancel, self.timeout.as_secs())
                    .await?;
            if let Some(err) = error_for_status(&response, &confirmed, PROVIDER_KEY) {
                return Err(err);
            }
            if is_html_response(&response) {
                return Err(DownloadError::content_mismatch(
                    "confirmed download link still returned HTML",
                ));
            }
        }

        let filename = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .or_else(|| filename_from_url(url))
            .map(|n| sanitize_filename(&n))
            .unwrap_or_else(|| "download".to_string());
        let final_path = dest_dir.join(&filename);

        if final_path.is_file() {
            let size = tokio::fs::metadata(&final_path).await.map(|m| m.len()).unwrap_or(0);
            if let Some(progress) = progress {
                progress.skip(final_path.clone(), size);
            }
            return Ok(DownloadResult::skipped(final_path));
        }

        let temp = racer_partial_path(dest_dir, &url_hash(url)?, "http");
        let downloaded = stream_to_file(
            response,
            StreamSpec {
                dest: &temp,
                progress,
                cancel,
                max_bytes_per_sec: MAX_RATE,
                expected_size: None,
            },
        )
        .await?;

        tokio::fs::rename(&temp, &final_path).await?;
        tracing::info!(
            target: "modvault.download",
            url,
            bytes = downloaded,
            "forum-storage download complete"
        );
        if let Some(progress) = progress {
            progress.complete(final_path.clone());
        }
        Ok(DownloadResult::succeeded(
            "Downloaded from Deadly Stream",
            final_path,
        ))
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderMetadata, DownloadError> {
        let response = send_cancellable(self.client.get(url), cancel, self.timeout.as_secs()).await?;
        if let Some(err) = error_for_status(&response, url, PROVIDER_KEY) {
            return Err(err);
        }
        let html = response
            .text()
            .await
            .map_err(|e| DownloadError::unexpected(e.to_string()))?;

        let capture = |re: &Regex| re.captures(&html).map(|c| c[1].to_string());
        let file_page_id = url::Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()?
                    .filter(|s| !s.is_empty())
                    .nth(2)
                    .map(|seg| {
                        seg.chars()
                            .take_while(char::is_ascii_digit)
                            .collect::<String>()
                    })
            })
            .unwrap_or_default();

        Ok(ProviderMetadata::new(PROVIDER_KEY)
            .with("filePageId", file_page_id)
            .with("changelogId", capture(&META_CHANGELOG_ID).unwrap_or_default())
            .with("fileId", capture(&META_FILE_ID).unwrap_or_default())
            .with("version", capture(&META_VERSION).unwrap_or_default())
            .with("updated", capture(&META_UPDATED).unwrap_or_default())
            .with(
                "size",
                capture(&META_SIZE).and_then(|s| s.parse::<i64>().ok()).unwrap_or(0),
            ))
    }
}

/// Resolve a possibly relative link against its page URL.
fn resolve_relative(base: &str, link: &str) -> Result<String, DownloadError> {
    let base = url::Url::parse(base).map_err(|_| DownloadError::invalid_url(base))?;
    base.join(link)
        .map(|u| u.to_string())
        .map_err(|_| DownloadError::invalid_url(link))
}
