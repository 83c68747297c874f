//! Runtime configuration.
//!
//! Read once at startup. Only three environment inputs exist: the app-data
//! root override, the optional mod-index API key, and an HTTP timeout
//! override; nothing else in the core consults the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::paths::CachePaths;

/// App-data root override.
pub const ENV_DATA_DIR: &str = "MODVAULT_DATA_DIR";
/// Mod-index API key.
pub const ENV_MODINDEX_API_KEY: &str = "MODVAULT_MODINDEX_API_KEY";
/// HTTP timeout override, in seconds.
pub const ENV_HTTP_TIMEOUT_SECS: &str = "MODVAULT_HTTP_TIMEOUT_SECS";

/// Default HTTP timeout: three hours, sized for large archives on slow
/// connections.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(180 * 60);

/// Core engine configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// App-data root; the cache lives under `<root>/ModVault/Cache`.
    pub data_dir: Option<PathBuf>,
    /// API key for the mod-index provider.
    pub modindex_api_key: Option<String>,
    /// Timeout applied to handler HTTP requests.
    pub http_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            modindex_api_key: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl CacheConfig {
    /// Read the configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup(ENV_DATA_DIR).map(PathBuf::from);
        let modindex_api_key = lookup(ENV_MODINDEX_API_KEY).filter(|k| !k.trim().is_empty());
        let http_timeout = lookup(ENV_HTTP_TIMEOUT_SECS)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(DEFAULT_HTTP_TIMEOUT, Duration::from_secs);
        Self {
            data_dir,
            modindex_api_key,
            http_timeout,
        }
    }

    /// Override the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    /// Override the mod-index API key.
    #[must_use]
    pub fn with_modindex_api_key(mut self, key: Option<String>) -> Self {
        self.modindex_api_key = key;
        self
    }

    /// Override the HTTP timeout.
    #[must_use]
    pub const fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Resolve the cache paths this configuration implies.
    #[must_use]
    pub fn cache_paths(&self) -> CachePaths {
        match &self.data_dir {
            Some(dir) => CachePaths::new(dir.join(crate::paths::APP_NAME).join("Cache")),
            None => CachePaths::from_app_data(),
        }
    }
}
