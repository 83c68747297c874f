//! Mod-index API handler (Nexus Mods).
//!
//! Talks to the JSON API rather than scraping pages. Only files in the
//! main, update and miscellaneous categories are eligible; optional files
//! and archived versions are not installable artifacts. A single 429 is
//! retried once after honoring `Retry-After`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use modvault_core::content_id::url_hash;
use modvault_core::paths::racer_partial_path;
use modvault_core::{
    DownloadError, DownloadResult, ProgressHandle, ProviderMetadata, sanitize_filename,
};

use crate::fetch::{StreamSpec, error_for_status, send_cancellable, stream_to_file};
use crate::handler::ProviderHandler;
use crate::handlers::matches_targets;

/// Provider key of the mod-index handler.
pub const PROVIDER_KEY: &str = "nexus";

const DEFAULT_API_BASE: &str = "https://api.nexusmods.com";

/// File categories that are actually installable artifacts.
const ALLOWED_CATEGORIES: [&str; 3] = ["MAIN", "UPDATE", "MISCELLANEOUS"];

#[derive(Debug, Deserialize)]
struct FileList {
    files: Vec<ModFile>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModFile {
    file_id: u64,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    category_name: Option<String>,
    #[serde(default)]
    size_in_bytes: Option<u64>,
    #[serde(default)]
    uploaded_timestamp: u64,
    #[serde(default)]
    md5: Option<String>,
}

impl ModFile {
    fn is_installable(&self) -> bool {
        self.category_name
            .as_deref()
            .is_some_and(|c| ALLOWED_CATEGORIES.iter().any(|a| a.eq_ignore_ascii_case(c)))
    }
}

#[derive(Debug, Deserialize)]
struct DownloadLink {
    #[serde(rename = "URI")]
    uri: String,
}

/// Handler for the mod-index API.
pub struct NexusHandler {
    client: reqwest::Client,
    api_key: Option<String>,
    timeout: Duration,
    api_base: String,
}

impl NexusHandler {
    /// Create the handler; without an API key only metadata endpoints work.
    #[must_use]
    pub fn new(client: reqwest::Client, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            timeout,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Point the handler at a different API origin (test seam).
    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Extract `(game, mod_id)` from a mod page URL.
    fn parse_mod_url(url: &str) -> Result<(String, u64), DownloadError> {
        let parsed = url::Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let segments: Vec<String> = parsed
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        if let [game, mods, id, ..] = segments.as_slice() {
            if mods == "mods" {
                let digits: String = id.chars().take_while(char::is_ascii_digit).collect();
                if let Ok(mod_id) = digits.parse() {
                    return Ok((game.to_ascii_lowercase(), mod_id));
                }
            }
        }
        Err(DownloadError::invalid_url(url))
    }

    /// GET a JSON endpoint, retrying exactly once on 429.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<T, DownloadError> {
        let mut retried = false;
        loop {
            let mut request = self.client.get(endpoint);
            if let Some(key) = &self.api_key {
                request = request.header("apikey", key);
            }
            let response = send_cancellable(request, cancel, self.timeout.as_secs()).await?;
            match error_for_status(&response, endpoint, PROVIDER_KEY) {
                None => {
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| DownloadError::unexpected(e.to_string()));
                }
                Some(DownloadError::RateLimited { retry_after_secs }) if !retried => {
                    retried = true;
                    let wait = retry_after_secs;
                    tracing::warn!(
                        target: "modvault.download",
                        endpoint,
                        wait,
                        "mod index rate limited, retrying once"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        () = tokio::time::sleep(Duration::from_secs(wait)) => {}
                    }
                }
                Some(err) => return Err(err),
            }
        }
    }

    async fn list_files(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, u64, Vec<ModFile>), DownloadError> {
        let (game, mod_id) = Self::parse_mod_url(url)?;
        let endpoint = format!("{}/v1/games/{game}/mods/{mod_id}/files.json", self.api_base);
        let list: FileList = self.get_json(&endpoint, cancel).await?;
        let files = list.files.into_iter().filter(ModFile::is_installable).collect();
        Ok((game, mod_id, files))
    }

    async fn download_link(
        &self,
        game: &str,
        mod_id: u64,
        file_id: u64,
        cancel: &CancellationToken,
    ) -> Result<String, DownloadError> {
        let endpoint = format!(
            "{}/v1/games/{game}/mods/{mod_id}/files/{file_id}/download_link.json",
            self.api_base
        );
        let links: Vec<DownloadLink> = self.get_json(&endpoint, cancel).await?;
        links
            .into_iter()
            .next()
            .map(|l| l.uri)
            .ok_or_else(|| DownloadError::not_found(endpoint))
    }
}

#[async_trait]
impl ProviderHandler for NexusHandler {
    fn provider_key(&self) -> &'static str {
        PROVIDER_KEY
    }

    fn can_handle(&self, url: &str) -> bool {
        url::Url::parse(url).is_ok_and(|u| {
            matches!(u.scheme(), "http" | "https")
                && u.host_str()
                    .is_some_and(|h| h.to_ascii_lowercase().contains("nexusmods.com"))
        })
    }

    async fn resolve_filenames(&self, url: &str, cancel: &CancellationToken) -> Vec<String> {
        match self.list_files(url, cancel).await {
            Ok((_, _, files)) => files.into_iter().map(|f| f.file_name).collect(),
            Err(e) => {
                tracing::debug!(target: "modvault.download", url, error = %e, "filename resolution failed");
                Vec::new()
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: Option<&ProgressHandle>,
        target_filenames: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult, DownloadError> {
        if self.api_key.is_none() {
            return Err(DownloadError::auth_required(PROVIDER_KEY));
        }

        let (game, mod_id, files) = self.list_files(url, cancel).await?;
        let selected: Vec<ModFile> = files
            .into_iter()
            .filter(|f| matches_targets(&f.file_name, target_filenames))
            .collect();
        if selected.is_empty() {
            return Err(DownloadError::not_found(url));
        }

        let total: u64 = selected.iter().filter_map(|f| f.size_in_bytes).sum();
        let mut downloaded_total: u64 = 0;
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut any_transferred = false;

        for file in &selected {
            let filename = sanitize_filename(&file.file_name);
            let final_path = dest_dir.join(&filename);
            if final_path.is_file() {
                downloaded_total += file.size_in_bytes.unwrap_or(0);
                paths.push(final_path);
                continue;
            }

            if let Some(progress) = progress {
                progress.start(format!("Downloading {filename} from Nexus Mods"));
            }

            let link = self.download_link(&game, mod_id, file.file_id, cancel).await?;
            let response =
                send_cancellable(self.client.get(&link), cancel, self.timeout.as_secs()).await?;
            if let Some(err) = error_for_status(&response, &link, PROVIDER_KEY) {
                return Err(err);
            }

            let temp = racer_partial_path(dest_dir, &url_hash(&link)?, "http");
            let base = downloaded_total;
            let counting = progress.map(|p| (p, base, total));
            // Stream without the shared helper's progress so multi-file byte
            // counters accumulate across files.
            let written = stream_to_file(
                response,
                StreamSpec {
                    dest: &temp,
                    progress: None,
                    cancel,
                    max_bytes_per_sec: 0,
                    expected_size: file.size_in_bytes,
                },
            )
            .await?;
            if let Some((p, base, total)) = counting {
                p.bytes(base + written, total);
            }

            tokio::fs::rename(&temp, &final_path).await?;
            downloaded_total += written;
            any_transferred = true;
            paths.push(final_path);
        }

        let first = paths.first().cloned().unwrap_or_default();
        if !any_transferred {
            if let Some(progress) = progress {
                progress.skip(first.clone(), downloaded_total);
            }
            return Ok(DownloadResult::skipped(first));
        }
        if let Some(progress) = progress {
            progress.complete(first.clone());
        }
        Ok(DownloadResult::succeeded(
            format!("Downloaded {} file(s) from Nexus Mods", paths.len()),
            first,
        ))
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderMetadata, DownloadError> {
        let (_, _, files) = self.list_files(url, cancel).await?;
        let primary = files
            .iter()
            .find(|f| f.category_name.as_deref().is_some_and(|c| c.eq_ignore_ascii_case("MAIN")))
            .or_else(|| files.first())
            .ok_or_else(|| DownloadError::not_found(url))?;

        Ok(ProviderMetadata::new(PROVIDER_KEY)
            .with("fileId", primary.file_id)
            .with("fileName", primary.file_name.clone())
            .with("size", primary.size_in_bytes.unwrap_or(0))
            .with("uploadedTimestamp", primary.uploaded_timestamp)
            .with("md5Hash", primary.md5.clone().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(api_base: &str, api_key: Option<&str>) -> NexusHandler {
        NexusHandler::new(
            crate::handler::default_client(Duration::from_secs(10)),
            api_key.map(str::to_string),
            Duration::from_secs(10),
        )
        .with_api_base(api_base)
    }

    fn files_json() -> &'static str {
        r#"{"files":[
            {"file_id":11,"file_name":"core-1.0.zip","category_name":"MAIN","size_in_bytes":4096,"uploaded_timestamp":1700000000},
            {"file_id":12,"file_name":"patch-1.1.zip","category_name":"UPDATE","size_in_bytes":1024,"uploaded_timestamp":1700000500},
            {"file_id":13,"file_name":"wallpapers.zip","category_name":"OPTIONAL","size_in_bytes":8192,"uploaded_timestamp":1700001000},
            {"file_id":14,"file_name":"old-0.9.zip","category_name":"OLD_VERSION","size_in_bytes":2048,"uploaded_timestamp":1600000000}
        ]}"#
    }

    #[test]
    fn test_can_handle_host_match() {
        let h = handler("http://unused", None);
        assert!(h.can_handle("https://www.nexusmods.com/kotor/mods/1577"));
        assert!(!h.can_handle("https://example.com/kotor/mods/1577"));
    }

    #[test]
    fn test_parse_mod_url() {
        let (game, id) =
            NexusHandler::parse_mod_url("https://www.nexusmods.com/Kotor/mods/1577?tab=files")
                .unwrap();
        assert_eq!(game, "kotor");
        assert_eq!(id, 1577);
        assert!(NexusHandler::parse_mod_url("https://www.nexusmods.com/kotor").is_err());
    }

    #[tokio::test]
    async fn test_resolve_filenames_filters_categories() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/games/kotor/mods/1577/files.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(files_json())
            .create_async()
            .await;

        let names = handler(&server.url(), None)
            .resolve_filenames(
                "https://www.nexusmods.com/kotor/mods/1577",
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(names, vec!["core-1.0.zip", "patch-1.1.zip"]);
    }

    #[tokio::test]
    async fn test_download_requires_api_key() {
        let err = handler("http://unused", None)
            .download(
                "https://www.nexusmods.com/kotor/mods/1577",
                Path::new("/tmp"),
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::AuthRequired { .. }));
    }

    #[tokio::test]
    async fn test_download_full_flow_with_glob_filter() {
        let mut server = mockito::Server::new_async().await;
        let _files = server
            .mock("GET", "/v1/games/kotor/mods/1577/files.json")
            .with_status(200)
            .with_body(files_json())
            .create_async()
            .await;
        let link = format!(r#"[{{"URI":"{}/cdn/core-1.0.zip"}}]"#, server.url());
        let _link = server
            .mock("GET", "/v1/games/kotor/mods/1577/files/11/download_link.json")
            .with_status(200)
            .with_body(link)
            .create_async()
            .await;
        let _cdn = server
            .mock("GET", "/cdn/core-1.0.zip")
            .with_status(200)
            .with_body(vec![5_u8; 4096])
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let targets = vec!["core-*.zip".to_string()];
        let result = handler(&server.url(), Some("key"))
            .download(
                "https://www.nexusmods.com/kotor/mods/1577",
                dir.path(),
                None,
                Some(&targets),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        let path = result.file_path.unwrap();
        assert_eq!(path.file_name().unwrap(), "core-1.0.zip");
        assert_eq!(std::fs::metadata(path).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_once_then_fails() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/games/kotor/mods/1/files.json")
            .with_status(429)
            .with_header("retry-after", "0")
            .expect(2)
            .create_async()
            .await;

        let names = handler(&server.url(), Some("key"))
            .resolve_filenames(
                "https://www.nexusmods.com/kotor/mods/1",
                &CancellationToken::new(),
            )
            .await;
        // resolve_filenames swallows errors into an empty list, but the mock
        // proves the retry happened exactly once.
        assert!(names.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_metadata_prefers_main_category() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/games/kotor/mods/1577/files.json")
            .with_status(200)
            .with_body(files_json())
            .create_async()
            .await;

        let meta = handler(&server.url(), None)
            .fetch_metadata(
                "https://www.nexusmods.com/kotor/mods/1577",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(meta.provider(), "nexus");
        assert_eq!(meta.get("fileId").unwrap().as_integer(), Some(11));
        assert_eq!(meta.get("fileName").unwrap().as_text(), Some("core-1.0.zip"));
        assert_eq!(meta.get("size").unwrap().as_integer(), Some(4096));
        assert_eq!(meta.get("md5Hash").unwrap().as_text(), Some(""));
    }
}
