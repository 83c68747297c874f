//! Provider handler contract and factory.
//!
//! A handler owns everything specific to one download provider: URL
//! recognition, filename resolution, metadata extraction and the fetch
//! itself. The factory assembles the full ordered set; the catch-all
//! direct-HTTP handler is always last because it accepts every absolute
//! HTTP/HTTPS URL.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use modvault_core::{DownloadError, DownloadResult, ProgressHandle, ProviderMetadata};

use crate::handlers::anoncloud::MegaHandler;
use crate::handlers::direct::DirectHttpHandler;
use crate::handlers::jsgated::MediafireHandler;
use crate::handlers::meshsite::DeadlystreamHandler;
use crate::handlers::modindex::NexusHandler;
use crate::manager::DownloadManager;

/// Default HTTP timeout. Large archives on slow connections take a while.
pub const DEFAULT_TIMEOUT: Duration = modvault_core::config::DEFAULT_HTTP_TIMEOUT;

/// Capability set of a download provider.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// Stable short key identifying the provider ("nexus", "direct", ...).
    fn provider_key(&self) -> &'static str;

    /// Whether this handler recognizes the URL.
    fn can_handle(&self, url: &str) -> bool;

    /// Resolve the filenames this URL would produce. Returns an empty list
    /// when resolution fails; resolution failures are never fatal.
    async fn resolve_filenames(&self, url: &str, cancel: &CancellationToken) -> Vec<String>;

    /// Fetch the content into `dest_dir`.
    ///
    /// `target_filenames` restricts multi-file providers to matching names
    /// (glob patterns with `*` and `?`). Implementations report through
    /// `progress` and honor `cancel` at every network wait.
    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        progress: Option<&ProgressHandle>,
        target_filenames: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult, DownloadError>;

    /// Fetch the provider metadata used for content identification,
    /// normalized to the provider's whitelisted fields.
    async fn fetch_metadata(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProviderMetadata, DownloadError>;
}

/// Builds the ordered handler set.
pub struct HandlerFactory;

impl HandlerFactory {
    /// Create the full handler list.
    ///
    /// `http_client` is shared by the HTTP-based handlers; when `None` a
    /// client with `timeout` is built. `api_key` enables the mod-index API
    /// handler's authenticated endpoints.
    #[must_use]
    pub fn create(
        http_client: Option<reqwest::Client>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Vec<Arc<dyn ProviderHandler>> {
        let client = http_client.unwrap_or_else(|| default_client(timeout));
        vec![
            Arc::new(NexusHandler::new(client.clone(), api_key, timeout)),
            // Owns its cookie jar, so it builds its own client.
            Arc::new(DeadlystreamHandler::new(timeout)),
            Arc::new(MegaHandler::new(client.clone(), timeout)),
            Arc::new(MediafireHandler::new()),
            // Catch-all: must stay last.
            Arc::new(DirectHttpHandler::new(client, timeout)),
        ]
    }

    /// Create the handler list from a [`modvault_core::CacheConfig`].
    #[must_use]
    pub fn from_config(config: &modvault_core::CacheConfig) -> Vec<Arc<dyn ProviderHandler>> {
        Self::create(None, config.modindex_api_key.clone(), config.http_timeout)
    }

    /// Create a [`DownloadManager`] over the full handler set.
    #[must_use]
    pub fn create_download_manager(
        http_client: Option<reqwest::Client>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> DownloadManager {
        DownloadManager::new(Self::create(http_client, api_key, timeout))
    }
}

/// Shared client used by every HTTP-based handler.
pub(crate) fn default_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("modvault/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to create HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_all_is_last() {
        let handlers = HandlerFactory::create(None, None, Duration::from_secs(5));
        let last = handlers.last().unwrap();
        assert_eq!(last.provider_key(), "direct");
        assert!(last.can_handle("https://anything.example.org/file.zip"));
        assert!(last.can_handle("http://other.example.net/a"));
    }

    #[test]
    fn test_specific_handlers_precede_catch_all() {
        let handlers = HandlerFactory::create(None, None, Duration::from_secs(5));
        let url = "https://www.nexusmods.com/kotor/mods/1577";
        let first_match = handlers.iter().find(|h| h.can_handle(url)).unwrap();
        assert_eq!(first_match.provider_key(), "nexus");
    }

    #[test]
    fn test_no_handler_accepts_non_http() {
        let handlers = HandlerFactory::create(None, None, Duration::from_secs(5));
        assert!(handlers.iter().all(|h| !h.can_handle("ftp://example.com/f")));
        assert!(handlers.iter().all(|h| !h.can_handle("not a url")));
    }
}
