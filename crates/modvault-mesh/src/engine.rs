//! Mesh engine capability surface.
//!
//! The core never links the distribution engine directly. Everything it
//! needs is expressed as two traits: an engine that can be configured and
//! asked for sessions, and a session that can be started, observed and
//! stopped. A linked engine gets a wrapper implementing these traits; when
//! none is present the [`NullMeshEngine`] stands in and every capability
//! reports unavailability. Dispatch is explicit and dynamic, never
//! reflective.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use modvault_core::DownloadError;

use crate::descriptor::Descriptor;

/// Construction-time settings for the engine.
#[derive(Clone, Debug)]
pub struct MeshEngineSettings {
    /// TCP/UDP listen port.
    pub listen_port: u16,
    /// Upload cap in bytes per second, 0 for unbounded.
    pub max_upload_bytes_per_sec: u64,
    /// Whether to request NAT port mappings.
    pub nat_traversal: bool,
    /// Maximum peer connections.
    pub max_connections: u32,
    /// Accept plain connections alongside encrypted ones.
    pub allow_plain_encryption: bool,
    /// Disk cache budget in bytes.
    pub disk_cache_bytes: u64,
}

impl Default for MeshEngineSettings {
    fn default() -> Self {
        Self {
            listen_port: 0,
            max_upload_bytes_per_sec: 0,
            nat_traversal: true,
            max_connections: 200,
            allow_plain_encryption: true,
            disk_cache_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Observable state of a distribution session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Verifying local data against the descriptor.
    Hashing,
    /// Transferring pieces from peers.
    Downloading,
    /// Complete and serving peers.
    Sharing,
    /// Stopped by request.
    Stopped,
    /// Failed irrecoverably.
    Error,
}

/// Transfer statistics of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes served to peers.
    pub uploaded_bytes: u64,
    /// Bytes fetched from peers.
    pub downloaded_bytes: u64,
    /// Currently connected peers.
    pub connected_peers: u32,
}

/// One registered distribution session.
#[async_trait]
pub trait MeshSession: Send + Sync {
    /// Begin or resume transfers.
    async fn start(&self) -> Result<(), DownloadError>;

    /// Stop transfers and release the session's resources.
    async fn stop(&self) -> Result<(), DownloadError>;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// Completion fraction in `[0, 1]`.
    fn progress(&self) -> f64;

    /// Whether all pieces are present locally.
    fn is_complete(&self) -> bool;

    /// Current transfer statistics.
    fn stats(&self) -> SessionStats;
}

/// The embedded distribution engine, as far as the core is concerned.
#[async_trait]
pub trait MeshEngine: Send + Sync {
    /// Whether a real engine is behind this handle.
    fn is_available(&self) -> bool;

    /// Register the auxiliary node-discovery service used to find peers.
    async fn register_node_discovery(&self) -> Result<(), DownloadError>;

    /// Create a session for `descriptor` rooted at `work_dir`.
    async fn create_session(
        &self,
        descriptor: &Descriptor,
        work_dir: &Path,
    ) -> Result<Arc<dyn MeshSession>, DownloadError>;

    /// Number of active NAT port mappings.
    fn active_port_mappings(&self) -> usize;

    /// Dispose the engine. Must be safe to call more than once.
    async fn shutdown(&self) -> Result<(), DownloadError>;
}

/// Stand-in used when no distribution engine is linked.
///
/// Selected at construction time; every session-producing call reports
/// [`DownloadError::EngineUnavailable`], which the optimizer treats as "use
/// the traditional path".
#[derive(Debug, Default)]
pub struct NullMeshEngine;

impl NullMeshEngine {
    /// Create the null engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MeshEngine for NullMeshEngine {
    fn is_available(&self) -> bool {
        false
    }

    async fn register_node_discovery(&self) -> Result<(), DownloadError> {
        Err(DownloadError::EngineUnavailable)
    }

    async fn create_session(
        &self,
        _descriptor: &Descriptor,
        _work_dir: &Path,
    ) -> Result<Arc<dyn MeshSession>, DownloadError> {
        Err(DownloadError::EngineUnavailable)
    }

    fn active_port_mappings(&self) -> usize {
        0
    }

    async fn shutdown(&self) -> Result<(), DownloadError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_engine_reports_unavailable() {
        let engine = NullMeshEngine::new();
        assert!(!engine.is_available());
        assert_eq!(engine.active_port_mappings(), 0);
        assert!(matches!(
            engine.register_node_discovery().await,
            Err(DownloadError::EngineUnavailable)
        ));
        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();
    }

    #[test]
    fn test_default_settings() {
        let settings = MeshEngineSettings::default();
        assert!(settings.nat_traversal);
        assert!(settings.allow_plain_encryption);
        assert!(settings.max_connections > 0);
    }
}
