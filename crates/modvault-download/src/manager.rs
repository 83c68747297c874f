//! Download orchestration.
//!
//! The manager fans a batch of URLs out to the handler set, first match
//! wins. Rate-limited providers share one process-wide semaphore so a batch
//! of forum-storage downloads cannot hammer the site; everything else runs
//! unbounded. No failure mode escapes: handler errors and even panics are
//! converted into failed results with the cause recorded in the progress
//! record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use modvault_core::{DownloadError, DownloadProgress, DownloadResult, ProgressHandle};

use crate::handler::ProviderHandler;

/// Concurrency cap shared by all rate-limited providers.
const RATE_LIMITED_CONCURRENCY: usize = 5;

/// One URL to fetch, with its observable progress record.
pub struct DownloadRequest {
    /// The URL to download.
    pub url: String,
    /// Progress handle observed by the caller.
    pub progress: Arc<ProgressHandle>,
}

impl DownloadRequest {
    /// Create a request with a fresh progress record.
    pub fn new(mod_name: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            progress: Arc::new(ProgressHandle::new(DownloadProgress::new(mod_name, &url))),
            url,
        }
    }
}

/// External observer of progress snapshots.
pub trait ProgressSink: Send + Sync {
    /// Called with each published snapshot; must not block.
    fn on_progress(&self, snapshot: &DownloadProgress);
}

/// Dispatches downloads across the handler set.
pub struct DownloadManager {
    handlers: Vec<Arc<dyn ProviderHandler>>,
    /// Provider keys that share the rate-limit gate.
    rate_limited: HashSet<String>,
    rate_gate: Arc<Semaphore>,
}

impl DownloadManager {
    /// Create a manager over an ordered handler list.
    ///
    /// By default only the forum-storage provider is rate limited.
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn ProviderHandler>>) -> Self {
        Self {
            handlers,
            rate_limited: HashSet::from([crate::handlers::meshsite::PROVIDER_KEY.to_string()]),
            rate_gate: Arc::new(Semaphore::new(RATE_LIMITED_CONCURRENCY)),
        }
    }

    /// Override the rate-limited provider set and its concurrency.
    #[must_use]
    pub fn with_rate_limit(mut self, providers: HashSet<String>, concurrency: usize) -> Self {
        self.rate_limited = providers;
        self.rate_gate = Arc::new(Semaphore::new(concurrency));
        self
    }

    /// The handler that would serve this URL, if any.
    #[must_use]
    pub fn handler_for(&self, url: &str) -> Option<&Arc<dyn ProviderHandler>> {
        self.handlers.iter().find(|h| h.can_handle(url))
    }

    /// Download every request concurrently into `dest_dir`.
    ///
    /// Results are returned in request order. Cancelling `cancel` aborts all
    /// in-flight transfers.
    pub async fn download_all(
        &self,
        requests: Vec<DownloadRequest>,
        dest_dir: &Path,
        sink: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Vec<DownloadResult> {
        let progresses: Vec<Arc<ProgressHandle>> =
            requests.iter().map(|r| Arc::clone(&r.progress)).collect();

        // Forward live snapshots to the external sink while downloads run.
        let forwarder_stop = CancellationToken::new();
        if let Some(sink) = &sink {
            for progress in &progresses {
                let mut rx = progress.subscribe();
                let sink = Arc::clone(sink);
                let stop = forwarder_stop.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            () = stop.cancelled() => break,
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                                let snapshot = rx.borrow_and_update().clone();
                                sink.on_progress(&snapshot);
                            }
                        }
                    }
                });
            }
        }

        let mut tasks = Vec::with_capacity(requests.len());
        for request in requests {
            let handlers = self.handlers.clone();
            let rate_limited = self.rate_limited.clone();
            let rate_gate = Arc::clone(&self.rate_gate);
            let dest: PathBuf = dest_dir.to_path_buf();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                run_one(&handlers, &rate_limited, rate_gate, request, &dest, &cancel).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (task, progress) in tasks.into_iter().zip(&progresses) {
            let result = match task.await {
                Ok(result) => result,
                // A panicking handler must not take the batch down.
                Err(join_error) => {
                    let message = format!("handler task failed: {join_error}");
                    tracing::error!(target: "modvault.download", %message, "contained handler panic");
                    progress.fail(&message);
                    DownloadResult::failed(message)
                }
            };
            results.push(result);
        }

        // Flush the terminal snapshots before tearing the forwarders down.
        forwarder_stop.cancel();
        if let Some(sink) = &sink {
            for progress in &progresses {
                sink.on_progress(&progress.snapshot());
            }
        }

        results
    }
}

/// Execute a single request against the first matching handler.
async fn run_one(
    handlers: &[Arc<dyn ProviderHandler>],
    rate_limited: &HashSet<String>,
    rate_gate: Arc<Semaphore>,
    request: DownloadRequest,
    dest_dir: &Path,
    cancel: &CancellationToken,
) -> DownloadResult {
    let url = request.url;
    let progress = request.progress;

    let Some(handler) = handlers.iter().find(|h| h.can_handle(&url)) else {
        let report = DownloadError::invalid_url(&url).failure_report(&url);
        progress.fail(&report);
        return DownloadResult::failed(report);
    };

    let _permit = if rate_limited.contains(handler.provider_key()) {
        let acquired = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = rate_gate.acquire_owned() => permit.ok(),
        };
        if acquired.is_none() {
            let report = DownloadError::Cancelled.failure_report(&url);
            progress.fail(&report);
            return DownloadResult::failed(report);
        }
        acquired
    } else {
        None
    };

    match handler
        .download(&url, dest_dir, Some(progress.as_ref()), None, cancel)
        .await
    {
        Ok(result) => result,
        Err(error) => {
            let report = error.failure_report(&url);
            tracing::warn!(
                target: "modvault.download",
                url = %url,
                provider = handler.provider_key(),
                category = error.category(),
                "download failed"
            );
            progress.fail(&report);
            DownloadResult::failed(report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use modvault_core::{DownloadStatus, ProviderMetadata};

    /// Test handler with scripted behavior.
    struct FakeHandler {
        key: &'static str,
        host: &'static str,
        delay: Duration,
        fail: bool,
        panic: bool,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FakeHandler {
        fn new(key: &'static str, host: &'static str) -> Self {
            Self {
                key,
                host,
                delay: Duration::ZERO,
                fail: false,
                panic: false,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ProviderHandler for FakeHandler {
        fn provider_key(&self) -> &'static str {
            self.key
        }

        fn can_handle(&self, url: &str) -> bool {
            url.contains(self.host)
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
            if self.panic {
                panic!("scripted panic");
            }
            if self.fail {
                return Err(DownloadError::not_found(url));
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if let Some(progress) = progress {
                progress.complete(PathBuf::from("/tmp/fake.zip"));
            }
            Ok(DownloadResult::succeeded("ok", PathBuf::from("/tmp/fake.zip")))
        }

        async fn fetch_metadata(
            &self,
            _url: &str,
            _cancel: &CancellationToken,
        ) -> Result<ProviderMetadata, DownloadError> {
            Ok(ProviderMetadata::new(self.key))
        }
    }

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest::new("mod", url)
    }

    #[tokio::test]
    async fn test_dispatch_first_match_wins() {
        let a = Arc::new(FakeHandler::new("a", "a.test"));
        let b = Arc::new(FakeHandler::new("b", ".test")); // would match both
        let manager = DownloadManager::new(vec![a, b]);
        assert_eq!(
            manager.handler_for("https://a.test/f").unwrap().provider_key(),
            "a"
        );
        assert_eq!(
            manager.handler_for("https://b.test/f").unwrap().provider_key(),
            "b"
        );
        assert!(manager.handler_for("https://other.example/f").is_none());
    }

    #[tokio::test]
    async fn test_results_in_request_order_and_errors_contained() {
        let ok = Arc::new(FakeHandler::new("ok", "ok.test"));
        let bad = Arc::new(FakeHandler {
            fail: true,
            ..FakeHandler::new("bad", "bad.test")
        });
        let manager = DownloadManager::new(vec![ok, bad]);

        let requests = vec![
            request("https://bad.test/1"),
            request("https://ok.test/2"),
            request("https://unmatched.example/3"),
        ];
        let progresses: Vec<_> = requests.iter().map(|r| Arc::clone(&r.progress)).collect();

        let dir = tempfile::tempdir().unwrap();
        let results = manager
            .download_all(requests, dir.path(), None, &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 3);
        assert!(!results[0].success);
        assert!(results[0].message.contains("manually"));
        assert!(results[1].success);
        assert!(!results[2].success);
        assert_eq!(progresses[0].snapshot().status, DownloadStatus::Failed);
        assert_eq!(progresses[1].snapshot().status, DownloadStatus::Completed);
        assert_eq!(progresses[2].snapshot().status, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let boom = Arc::new(FakeHandler {
            panic: true,
            ..FakeHandler::new("boom", "boom.test")
        });
        let manager = DownloadManager::new(vec![boom]);
        let dir = tempfile::tempdir().unwrap();
        let results = manager
            .download_all(
                vec![request("https://boom.test/1")],
                dir.path(),
                None,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].message.contains("handler task failed"));
    }

    #[tokio::test]
    async fn test_rate_limited_provider_serializes() {
        let slow = Arc::new(FakeHandler {
            delay: Duration::from_millis(50),
            ..FakeHandler::new("slow", "slow.test")
        });
        let peak = Arc::clone(&slow.peak);
        let manager = DownloadManager::new(vec![slow])
            .with_rate_limit(HashSet::from(["slow".to_string()]), 1);

        let dir = tempfile::tempdir().unwrap();
        let results = manager
            .download_all(
                vec![
                    request("https://slow.test/1"),
                    request("https://slow.test/2"),
                    request("https://slow.test/3"),
                ],
                dir.path(),
                None,
                &CancellationToken::new(),
            )
            .await;

        assert!(results.iter().all(|r| r.success));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unlimited_provider_runs_concurrently() {
        let fast = Arc::new(FakeHandler {
            delay: Duration::from_millis(50),
            ..FakeHandler::new("fast", "fast.test")
        });
        let peak = Arc::clone(&fast.peak);
        let manager = DownloadManager::new(vec![fast]);

        let dir = tempfile::tempdir().unwrap();
        manager
            .download_all(
                vec![request("https://fast.test/1"), request("https://fast.test/2")],
                dir.path(),
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_sink_sees_terminal_snapshots() {
        struct Recorder(Mutex<Vec<DownloadStatus>>);
        impl ProgressSink for Recorder {
            fn on_progress(&self, snapshot: &DownloadProgress) {
                self.0.lock().unwrap().push(snapshot.status);
            }
        }

        let ok = Arc::new(FakeHandler::new("ok", "ok.test"));
        let manager = DownloadManager::new(vec![ok]);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));

        let dir = tempfile::tempdir().unwrap();
        let sink: Arc<dyn ProgressSink> = recorder.clone() as Arc<dyn ProgressSink>;
        manager
            .download_all(
                vec![request("https://ok.test/1")],
                dir.path(),
                Some(sink),
                &CancellationToken::new(),
            )
            .await;

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.last(), Some(&DownloadStatus::Completed));
    }
}
