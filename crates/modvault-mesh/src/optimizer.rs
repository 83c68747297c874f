//! The cache optimizer: hybrid download races and shared-resource lifecycle.
//!
//! # Architecture
//!
//! - **Race**: with a cached descriptor on disk, a distributed fetch and the
//!   caller's traditional fetch run concurrently against distinct temp
//!   files; the first success wins and the loser is cancelled and drained.
//! - **Re-share**: every successful download is registered with the engine
//!   in the background so other installations can fetch it from us.
//! - **Monitor**: a 5-minute sweep retires dead sessions and refreshes the
//!   NAT status every 30 minutes.
//!
//! Any unexpected error inside a distributed attempt degrades silently to
//! the traditional path; the optimizer never makes a download fail that the
//! provider could have served.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, timeout};
use tokio_util::sync::CancellationToken;

use modvault_core::content_id::url_hash;
use modvault_core::integrity::{compute_integrity_data, verify_integrity};
use modvault_core::paths::racer_partial_path;
use modvault_core::{
    CachePaths, ContentId, DownloadError, DownloadResult, DownloadSource, ProgressHandle,
    ProviderMetadata, ResourceMetadata, compute_content_id,
};

use crate::descriptor::{DEFAULT_TRACKERS, Descriptor, DistributionBuilder};
use crate::engine::{MeshEngine, MeshSession, NullMeshEngine, SessionState};
use crate::locks::{Blocklist, ContentKeyGuard, ContentKeyLocks};
use crate::netport::select_listen_port;

/// Distributed fetch poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Hard ceiling on one distributed fetch.
const MESH_FETCH_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
/// Delay between engine start and the first NAT mapping inspection.
const NAT_CHECK_DELAY: Duration = Duration::from_secs(10);
/// Interval between NAT status refreshes.
const NAT_RECHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Sharing monitor wake cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How long a newly registered share may stay in `Hashing`.
const REGISTRATION_WAIT: Duration = Duration::from_secs(45);
/// Grace period for a cancelled race loser to drain.
const LOSER_DRAIN: Duration = Duration::from_secs(5);

/// Construction-time configuration.
#[derive(Clone, Debug)]
pub struct CacheOptimizerConfig {
    /// Cache root resolver.
    pub cache_paths: CachePaths,
    /// Trackers attached to locally built descriptors.
    pub trackers: Vec<String>,
}

impl Default for CacheOptimizerConfig {
    fn default() -> Self {
        Self {
            cache_paths: CachePaths::from_app_data(),
            trackers: DEFAULT_TRACKERS.map(str::to_string).to_vec(),
        }
    }
}

/// Aggregate statistics over the active shared resources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkCacheStats {
    /// Number of registered sharing sessions.
    pub active_shares: usize,
    /// Bytes served to peers across all sessions.
    pub total_upload_bytes: u64,
    /// Connected peers across all sessions.
    pub connected_sources: u32,
}

/// Hybrid-download front door and shared-resource registry.
pub struct CacheOptimizer {
    engine: Arc<dyn MeshEngine>,
    paths: CachePaths,
    trackers: Vec<String>,
    /// Registered sharing sessions keyed by content id.
    active_sessions: Mutex<HashMap<ContentId, Arc<dyn MeshSession>>>,
    locks: ContentKeyLocks,
    blocklist: Blocklist,
    /// Memo of URL-derived hashes; single lock, contention is negligible.
    url_hashes: std::sync::Mutex<HashMap<String, ContentId>>,
    listen_port: std::sync::Mutex<Option<u16>>,
    nat_successful: AtomicBool,
    nat_checked_at: std::sync::Mutex<Option<Instant>>,
    init_lock: Mutex<()>,
    initialized: AtomicBool,
    monitor_started: AtomicBool,
    shutdown_token: CancellationToken,
}

impl CacheOptimizer {
    /// Create an optimizer with no linked engine; every optimized path
    /// degrades to the traditional fetch.
    #[must_use]
    pub fn new(config: CacheOptimizerConfig) -> Self {
        Self::with_engine(Arc::new(NullMeshEngine::new()), config)
    }

    /// Create an optimizer over an explicit engine implementation.
    #[must_use]
    pub fn with_engine(engine: Arc<dyn MeshEngine>, config: CacheOptimizerConfig) -> Self {
        let blocklist = Blocklist::load(&config.cache_paths);
        Self {
            engine,
            paths: config.cache_paths,
            trackers: config.trackers,
            active_sessions: Mutex::new(HashMap::new()),
            locks: ContentKeyLocks::new(),
            blocklist,
            url_hashes: std::sync::Mutex::new(HashMap::new()),
            listen_port: std::sync::Mutex::new(None),
            nat_successful: AtomicBool::new(false),
            nat_checked_at: std::sync::Mutex::new(None),
            init_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            monitor_started: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        }
    }

    // ------------------------------------------------------------------
    // Identification and integrity entry points
    // ------------------------------------------------------------------

    /// Derive the deterministic content id for a metadata snapshot.
    pub fn compute_content_id_from_metadata(
        &self,
        metadata: &ProviderMetadata,
        primary_url: &str,
    ) -> Result<ContentId, DownloadError> {
        compute_content_id(metadata, primary_url)
    }

    /// Hash a file for ingest: whole-file SHA-256, piece length and the hex
    /// piece-hash stream.
    pub async fn compute_file_integrity_data(
        &self,
        path: &Path,
    ) -> Result<(String, u32, String), DownloadError> {
        let path = path.to_path_buf();
        let data = tokio::task::spawn_blocking(move || compute_integrity_data(&path, None))
            .await
            .map_err(|e| DownloadError::unexpected(e.to_string()))??;
        Ok((data.content_hash_sha256, data.piece_length, data.piece_hashes))
    }

    /// Verify a file against its recorded metadata.
    pub async fn verify_content_integrity(&self, path: &Path, meta: &ResourceMetadata) -> bool {
        let path = path.to_path_buf();
        let meta = meta.clone();
        let verdict =
            tokio::task::spawn_blocking(move || verify_integrity(&path, &meta)).await;
        match verdict {
            Ok(Ok(())) => true,
            Ok(Err(violation)) => {
                tracing::warn!(target: "modvault.mesh", %violation, "integrity verification failed");
                false
            }
            Err(join_error) => {
                tracing::error!(target: "modvault.mesh", %join_error, "integrity task failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Locks and blocklist
    // ------------------------------------------------------------------

    /// Serialize fetches of one content id across the process.
    pub async fn acquire_content_key_lock(&self, content_id: &ContentId) -> ContentKeyGuard {
        self.locks.acquire(content_id).await
    }

    /// Add a content id to the compliance blocklist.
    pub fn block_content_id(
        &self,
        content_id: &ContentId,
        reason: Option<&str>,
    ) -> std::io::Result<()> {
        self.blocklist.block(content_id, reason)
    }

    /// Whether a content id is blocklisted.
    #[must_use]
    pub fn is_content_id_blocked(&self, content_id: &ContentId) -> bool {
        self.blocklist.is_blocked(content_id)
    }

    /// Number of blocklisted ids.
    #[must_use]
    pub fn get_blocked_count(&self) -> usize {
        self.blocklist.blocked_count()
    }

    // ------------------------------------------------------------------
    // Hybrid download
    // ------------------------------------------------------------------

    /// Download `url`, racing the mesh against the caller's traditional
    /// fetch when a cached descriptor exists.
    ///
    /// `traditional` may be invoked a second time if both racers fail. The
    /// returned result's `download_source` records which path produced the
    /// bytes.
    #[allow(clippy::too_many_lines)]
    pub async fn try_optimized_download<F, Fut>(
        self: &Arc<Self>,
        url: &str,
        dest_dir: &Path,
        traditional: F,
        progress: Option<&ProgressHandle>,
        cancel: &CancellationToken,
        content_id: Option<ContentId>,
    ) -> DownloadResult
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DownloadResult>,
    {
        let hash = match content_id {
            Some(id) => id,
            None => match self.cached_url_hash(url) {
                Ok(hash) => hash,
                Err(e) => return DownloadResult::failed(e.failure_report(url)),
            },
        };

        // At most one fetch per content id in flight per process.
        let _key_guard = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return DownloadResult::failed(DownloadError::Cancelled.failure_report(url));
            }
            guard = self.locks.acquire(&hash) => guard,
        };

        // Blocklisted content never touches the mesh; the provider fetch is
        // still allowed.
        if self.blocklist.is_blocked(&hash) {
            tracing::info!(target: "modvault.mesh", content_id = %hash, "blocklisted, mesh skipped");
            return traditional().await;
        }

        if !self.ensure_initialized().await {
            let result = traditional().await;
            if result.success && !result.was_skipped {
                self.spawn_reshare(&hash, result.file_path.clone());
            }
            return result;
        }

        let descriptor_path = self.paths.descriptor_path(&hash);
        if !descriptor_path.is_file() {
            let result = traditional().await;
            if result.success && !result.was_skipped {
                self.spawn_reshare(&hash, result.file_path.clone());
            }
            return result;
        }

        self.run_race(url, dest_dir, &hash, &descriptor_path, traditional, progress, cancel)
            .await
    }

    /// Race the distributed fetch against the traditional one.
    async fn run_race<F, Fut>(
        self: &Arc<Self>,
        url: &str,
        dest_dir: &Path,
        hash: &ContentId,
        descriptor_path: &Path,
        traditional: F,
        progress: Option<&ProgressHandle>,
        cancel: &CancellationToken,
    ) -> DownloadResult
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DownloadResult>,
    {
        let mesh_cancel = cancel.child_token();
        let mesh_fut =
            self.distributed_fetch(hash, descriptor_path, dest_dir, progress, &mesh_cancel);
        tokio::pin!(mesh_fut);
        let trad_fut = traditional();
        tokio::pin!(trad_fut);

        let mut mesh_done = false;
        let mut trad_result: Option<DownloadResult> = None;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    mesh_cancel.cancel();
                    if !mesh_done {
                        let _ = timeout(LOSER_DRAIN, &mut mesh_fut).await;
                    }
                    return DownloadResult::failed(
                        DownloadError::Cancelled.failure_report(url),
                    );
                }

                mesh_res = &mut mesh_fut, if !mesh_done => {
                    mesh_done = true;
                    if let Some(result) = mesh_res.filter(|r| r.success) {
                        // The traditional racer may have finished in the same
                        // instant; a single no-wait poll detects that.
                        let trad_succeeded = match &trad_result {
                            Some(r) => r.success,
                            None => match timeout(Duration::ZERO, &mut trad_fut).await {
                                Ok(r) => {
                                    let success = r.success;
                                    trad_result = Some(r);
                                    success
                                }
                                Err(_) => false,
                            },
                        };
                        let result = result.with_source(label_winner(true, trad_succeeded));
                        self.spawn_reshare(hash, result.file_path.clone());
                        return result;
                    }
                    // Distributed attempt failed silently; if the traditional
                    // racer already failed too, retry it once.
                    if trad_result.is_some() {
                        return traditional().await;
                    }
                }

                trad = &mut trad_fut, if trad_result.is_none() => {
                    if trad.success {
                        mesh_cancel.cancel();
                        if !mesh_done {
                            let _ = timeout(LOSER_DRAIN, &mut mesh_fut).await;
                        }
                        if !trad.was_skipped {
                            self.spawn_reshare(hash, trad.file_path.clone());
                        }
                        return trad.with_source(label_winner(false, true));
                    }
                    trad_result = Some(trad);
                    if mesh_done {
                        return traditional().await;
                    }
                }
            }
        }
    }

    /// Fetch through the mesh engine into a work directory, verify, and
    /// promote into the destination.
    ///
    /// Every failure is reported as `None`: the caller falls back to the
    /// traditional racer without surfacing mesh internals.
    async fn distributed_fetch(
        &self,
        hash: &ContentId,
        descriptor_path: &Path,
        dest_dir: &Path,
        progress: Option<&ProgressHandle>,
        cancel: &CancellationToken,
    ) -> Option<DownloadResult> {
        let descriptor = {
            let path = descriptor_path.to_path_buf();
            match tokio::task::spawn_blocking(move || Descriptor::load(&path)).await {
                Ok(Ok(descriptor)) => descriptor,
                Ok(Err(e)) => {
                    tracing::debug!(target: "modvault.mesh", error = %e, "descriptor unreadable");
                    return None;
                }
                Err(_) => return None,
            }
        };

        let work_dir = mesh_work_dir(dest_dir, hash);
        tokio::fs::create_dir_all(&work_dir).await.ok()?;

        let session = self.engine.create_session(&descriptor, &work_dir).await.ok()?;
        session.start().await.ok()?;
        tracing::debug!(
            target: "modvault.mesh",
            content_id = %hash,
            info_hash = %descriptor.info_hash(),
            "distributed fetch started"
        );

        let deadline = Instant::now() + MESH_FETCH_TIMEOUT;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = session.stop().await;
                    cleanup_prefixed(&work_dir, &descriptor.name).await;
                    return None;
                }
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let state = session.state();
            if let Some(progress) = progress {
                let percent = (session.progress() * 100.0).floor();
                progress.update(|p| p.progress_percentage = percent);
            }

            match state {
                SessionState::Sharing => break,
                SessionState::Error => {
                    let _ = session.stop().await;
                    cleanup_prefixed(&work_dir, &descriptor.name).await;
                    return None;
                }
                SessionState::Stopped => {
                    cleanup_prefixed(&work_dir, &descriptor.name).await;
                    return None;
                }
                _ if session.is_complete() => break,
                _ => {}
            }

            if Instant::now() >= deadline {
                tracing::warn!(target: "modvault.mesh", content_id = %hash, "distributed fetch timed out");
                let _ = session.stop().await;
                cleanup_prefixed(&work_dir, &descriptor.name).await;
                return None;
            }
        }

        let _ = session.stop().await;

        let fetched = work_dir.join(&descriptor.name);
        if !self.verify_against_sidecar(hash, &fetched).await {
            let _ = tokio::fs::remove_file(&fetched).await;
            return None;
        }

        let final_path = dest_dir.join(&descriptor.name);
        if let Err(e) = rename_or_copy(&fetched, &final_path).await {
            tracing::debug!(target: "modvault.mesh", error = %e, "mesh promotion failed");
            return None;
        }

        if let Some(progress) = progress {
            progress.complete(final_path.clone());
        }
        Some(
            DownloadResult::succeeded("Downloaded via optimized cache", final_path)
                .with_source(DownloadSource::Optimized),
        )
    }

    /// Verification gate before a mesh-fetched file may be promoted.
    ///
    /// Absent sidecar metadata the file passes; a present record must match.
    async fn verify_against_sidecar(&self, hash: &ContentId, fetched: &Path) -> bool {
        let sidecar = self.paths.resource_metadata_path(hash);
        let meta = {
            let path = sidecar.clone();
            match tokio::task::spawn_blocking(move || ResourceMetadata::load(&path)).await {
                Ok(Ok(meta)) => meta,
                _ => return fetched.is_file(),
            }
        };
        self.verify_content_integrity(fetched, &meta).await
    }

    // ------------------------------------------------------------------
    // Re-sharing
    // ------------------------------------------------------------------

    /// Register a completed download for background re-sharing.
    fn spawn_reshare(self: &Arc<Self>, hash: &ContentId, file_path: Option<PathBuf>) {
        let Some(file_path) = file_path else { return };
        if !self.engine.is_available() || self.blocklist.is_blocked(hash) {
            return;
        }
        let this = Arc::clone(self);
        let hash = hash.clone();
        tokio::spawn(async move {
            if let Err(e) = this.reshare(&hash, &file_path).await {
                tracing::debug!(
                    target: "modvault.mesh",
                    content_id = %hash,
                    error = %e,
                    "background re-share failed"
                );
            }
        });
    }

    /// Ensure a descriptor exists for the file and register a sharing
    /// session keyed by its content id.
    async fn reshare(self: &Arc<Self>, hash: &ContentId, file_path: &Path) -> Result<(), DownloadError> {
        if self.blocklist.is_blocked(hash) {
            return Err(DownloadError::compliance(hash.as_str()));
        }
        if self.active_sessions.lock().await.contains_key(hash) {
            return Ok(());
        }

        let descriptor_path = self.paths.descriptor_path(hash);
        let descriptor = if descriptor_path.is_file() {
            let path = descriptor_path.clone();
            tokio::task::spawn_blocking(move || Descriptor::load(&path))
                .await
                .map_err(|e| DownloadError::unexpected(e.to_string()))??
        } else {
            // Build descriptor and metadata sidecar together so a cached
            // file always has both records or neither.
            let file = file_path.to_path_buf();
            let trackers = self.trackers.clone();
            let sidecar = self.paths.resource_metadata_path(hash);
            let hash_for_meta = hash.clone();
            tokio::task::spawn_blocking(move || {
                let payload = DistributionBuilder::build(&file, Some(&trackers), None, false)?;
                payload.descriptor.save(&descriptor_path)?;
                payload.resource_metadata(hash_for_meta).save(&sidecar)?;
                Ok::<Descriptor, DownloadError>(payload.descriptor)
            })
            .await
            .map_err(|e| DownloadError::unexpected(e.to_string()))??
        };

        let work_dir = file_path.parent().unwrap_or_else(|| Path::new("."));
        let session = self.engine.create_session(&descriptor, work_dir).await?;
        session.start().await?;

        // Give the engine a bounded window to check existing data before we
        // consider the share registered.
        let registered_at = Instant::now();
        loop {
            match session.state() {
                SessionState::Sharing | SessionState::Downloading => break,
                SessionState::Error | SessionState::Stopped => {
                    let _ = session.stop().await;
                    return Err(DownloadError::unexpected("session died during registration"));
                }
                SessionState::Hashing => {}
            }
            if registered_at.elapsed() >= REGISTRATION_WAIT {
                tracing::debug!(target: "modvault.mesh", content_id = %hash, "registration wait elapsed");
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        self.active_sessions.lock().await.insert(hash.clone(), session);
        self.ensure_monitor();
        tracing::info!(target: "modvault.mesh", content_id = %hash, "re-sharing registered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Engine lifecycle
    // ------------------------------------------------------------------

    /// Bring the engine up once: port, node discovery, NAT check, monitor.
    ///
    /// Returns whether the optimized path is usable.
    async fn ensure_initialized(self: &Arc<Self>) -> bool {
        if !self.engine.is_available() {
            return false;
        }
        if self.initialized.load(Ordering::Acquire) {
            return true;
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return true;
        }

        if let Err(e) = self.paths.ensure_dirs() {
            tracing::error!(target: "modvault.mesh", error = %e, "cache directories unavailable");
            return false;
        }
        let port = match select_listen_port(&self.paths).await {
            Ok(port) => port,
            Err(e) => {
                tracing::error!(target: "modvault.mesh", error = %e, "no listen port available");
                return false;
            }
        };
        *self.listen_port.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(port);

        if let Err(e) = self.engine.register_node_discovery().await {
            tracing::warn!(target: "modvault.mesh", error = %e, "node discovery unavailable");
        }

        // First NAT inspection runs a little after engine start; mappings
        // take a moment to establish.
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = this.shutdown_token.cancelled() => {}
                () = tokio::time::sleep(NAT_CHECK_DELAY) => this.refresh_nat_status(),
            }
        });

        self.ensure_monitor();
        self.initialized.store(true, Ordering::Release);
        tracing::info!(target: "modvault.mesh", port, "mesh adapter initialized");
        true
    }

    fn refresh_nat_status(&self) {
        let mappings = self.engine.active_port_mappings();
        let ok = mappings > 0;
        self.nat_successful.store(ok, Ordering::Release);
        *self
            .nat_checked_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());
        if ok {
            tracing::debug!(target: "modvault.mesh", mappings, "NAT traversal verified");
        } else {
            let port = self
                .listen_port
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .unwrap_or(0);
            tracing::warn!(
                target: "modvault.mesh",
                port,
                "no active NAT mapping; inbound peers may not reach this node"
            );
        }
    }

    /// Whether the last NAT inspection found an active mapping.
    #[must_use]
    pub fn nat_successful(&self) -> bool {
        self.nat_successful.load(Ordering::Acquire)
    }

    /// Start the sharing monitor once.
    fn ensure_monitor(self: &Arc<Self>) {
        if self
            .monitor_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = this.shutdown_token.cancelled() => break,
                    () = tokio::time::sleep(MONITOR_INTERVAL) => {}
                }
                this.run_maintenance_sweep().await;

                let due = this
                    .nat_checked_at
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .is_none_or(|at| at.elapsed() >= NAT_RECHECK_INTERVAL);
                if due {
                    this.refresh_nat_status();
                }
            }
        });
    }

    /// Drop dead sessions and apply the retirement policy.
    ///
    /// Public as a diagnostics seam; the monitor calls it on its own cadence.
    pub async fn run_maintenance_sweep(&self) {
        let mut retired: Vec<(ContentId, Arc<dyn MeshSession>)> = Vec::new();
        {
            let mut sessions = self.active_sessions.lock().await;
            sessions.retain(|id, session| {
                let state = session.state();
                let dead = matches!(state, SessionState::Error | SessionState::Stopped);
                let keep = !dead && !should_retire(session.as_ref());
                if !keep {
                    retired.push((id.clone(), Arc::clone(session)));
                }
                keep
            });
        }
        for (id, session) in retired {
            let _ = session.stop().await;
            tracing::debug!(target: "modvault.mesh", content_id = %id, "session retired");
        }
    }

    /// Aggregate statistics over the active shares.
    pub async fn get_network_cache_stats(&self) -> NetworkCacheStats {
        let sessions = self.active_sessions.lock().await;
        let mut stats = NetworkCacheStats {
            active_shares: sessions.len(),
            ..Default::default()
        };
        for session in sessions.values() {
            let s = session.stats();
            stats.total_upload_bytes += s.uploaded_bytes;
            stats.connected_sources += s.connected_peers;
        }
        stats
    }

    /// Stop everything: monitor, sessions, engine.
    ///
    /// Safe to call from an exit hook and safe to call twice; all errors are
    /// absorbed.
    pub async fn graceful_shutdown(&self) {
        self.shutdown_token.cancel();
        let drained: Vec<(ContentId, Arc<dyn MeshSession>)> = {
            let mut sessions = self.active_sessions.lock().await;
            sessions.drain().collect()
        };
        for (id, session) in drained {
            if let Err(e) = session.stop().await {
                tracing::debug!(target: "modvault.mesh", content_id = %id, error = %e, "session stop failed");
            }
        }
        if let Err(e) = self.engine.shutdown().await {
            tracing::debug!(target: "modvault.mesh", error = %e, "engine shutdown failed");
        }
        tracing::info!(target: "modvault.mesh", "mesh adapter shut down");
    }

    // ------------------------------------------------------------------
    // Diagnostics seams
    // ------------------------------------------------------------------

    /// Insert a synthetic session (diagnostics and tests).
    pub async fn insert_synthetic_session(&self, id: ContentId, session: Arc<dyn MeshSession>) {
        self.active_sessions.lock().await.insert(id, session);
    }

    /// Remove a synthetic session (diagnostics and tests).
    pub async fn remove_synthetic_session(&self, id: &ContentId) -> bool {
        self.active_sessions.lock().await.remove(id).is_some()
    }

    /// Number of registered sessions.
    pub async fn active_session_count(&self) -> usize {
        self.active_sessions.lock().await.len()
    }

    fn cached_url_hash(&self, url: &str) -> Result<ContentId, DownloadError> {
        let mut cache = self
            .url_hashes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(hash) = cache.get(url) {
            return Ok(hash.clone());
        }
        let hash = url_hash(url)?;
        cache.insert(url.to_string(), hash.clone());
        Ok(hash)
    }
}

/// Label the winning result.
///
/// A distributed win is `Hybrid` when the traditional racer had also
/// finished successfully by decision time, otherwise `Optimized`; a
/// traditional win is always `Traditional`.
const fn label_winner(mesh_won: bool, traditional_succeeded: bool) -> DownloadSource {
    if mesh_won {
        if traditional_succeeded {
            DownloadSource::Hybrid
        } else {
            DownloadSource::Optimized
        }
    } else {
        DownloadSource::Traditional
    }
}

/// Idle/ratio retirement hook. The current policy keeps sessions
/// indefinitely; the monitor re-evaluates on every sweep.
fn should_retire(_session: &dyn MeshSession) -> bool {
    false
}

/// Work directory for the distributed racer, distinct from the traditional
/// racer's partial file.
fn mesh_work_dir(dest_dir: &Path, hash: &ContentId) -> PathBuf {
    let mut path = racer_partial_path(dest_dir, hash, "mesh");
    path.set_extension("d");
    path
}

/// Best-effort cleanup of files sharing the expected name prefix.
async fn cleanup_prefixed(work_dir: &Path, name_prefix: &str) {
    let Ok(mut entries) = tokio::fs::read_dir(work_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(name_prefix) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

/// Atomic rename with a copy-and-delete fallback for cross-device moves.
async fn rename_or_copy(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}
