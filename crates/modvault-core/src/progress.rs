//! Observable download progress.
//!
//! Each URL being fetched owns a [`DownloadProgress`] snapshot published
//! through a `watch` channel; subscribers (UIs, the orchestrator) observe the
//! latest state without backpressure. Verbose logging is throttled per URL
//! so a fast stream of byte updates does not flood the log.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Status of a single download.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Not yet started.
    Pending,
    /// Bytes are flowing.
    InProgress,
    /// Finished and verified.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// The file was already present.
    Skipped,
}

impl DownloadStatus {
    /// String form for logs and persistence.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether this status is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Which path produced the bytes of a finished download.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadSource {
    /// Handler-based HTTP fetch from the upstream provider.
    #[default]
    Traditional,
    /// Fetched through the mesh engine from a cached descriptor.
    Optimized,
    /// Both the traditional and the optimized fetch completed.
    Hybrid,
}

/// Outcome of one download request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    /// Whether the file is now present and verified.
    pub success: bool,
    /// Concise user-facing message.
    pub message: String,
    /// Final path of the file when it exists.
    pub file_path: Option<PathBuf>,
    /// The file was already present; nothing was transferred.
    pub was_skipped: bool,
    /// Which pipeline produced the bytes.
    pub download_source: DownloadSource,
}

impl DownloadResult {
    /// Successful download.
    pub fn succeeded(message: impl Into<String>, file_path: PathBuf) -> Self {
        Self {
            success: true,
            message: message.into(),
            file_path: Some(file_path),
            was_skipped: false,
            download_source: DownloadSource::Traditional,
        }
    }

    /// Failed download.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            file_path: None,
            was_skipped: false,
            download_source: DownloadSource::Traditional,
        }
    }

    /// Already-present file.
    pub fn skipped(file_path: PathBuf) -> Self {
        Self {
            success: true,
            message: "File already present, download skipped".to_string(),
            file_path: Some(file_path),
            was_skipped: true,
            download_source: DownloadSource::Traditional,
        }
    }

    /// Relabel the source.
    #[must_use]
    pub const fn with_source(mut self, source: DownloadSource) -> Self {
        self.download_source = source;
        self
    }
}

/// Observable snapshot of one download.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Display name of the mod this file belongs to.
    pub mod_name: String,
    /// The URL being fetched.
    pub url: String,
    /// Current status.
    pub status: DownloadStatus,
    /// 0–100.
    pub progress_percentage: f64,
    /// Bytes written so far.
    pub bytes_downloaded: u64,
    /// Total bytes when known, 0 otherwise.
    pub total_bytes: u64,
    /// Short human-readable state line.
    pub status_message: String,
    /// Error text when failed.
    pub error_message: Option<String>,
    /// Final file path once known.
    pub file_path: Option<PathBuf>,
    /// When the download was created.
    pub start_time: DateTime<Utc>,
    /// When it reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// This record aggregates child downloads.
    pub is_grouped: bool,
    /// Append-only event log.
    pub log: Vec<String>,
}

impl DownloadProgress {
    /// Create a pending progress record.
    pub fn new(mod_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            mod_name: mod_name.into(),
            url: url.into(),
            status: DownloadStatus::Pending,
            progress_percentage: 0.0,
            bytes_downloaded: 0,
            total_bytes: 0,
            status_message: String::new(),
            error_message: None,
            file_path: None,
            start_time: Utc::now(),
            end_time: None,
            is_grouped: false,
            log: Vec::new(),
        }
    }

    /// Create a grouped parent record.
    pub fn new_group(mod_name: impl Into<String>) -> Self {
        let mut progress = Self::new(mod_name, String::new());
        progress.is_grouped = true;
        progress
    }

    /// Append a timestamped line to the log.
    pub fn push_log(&mut self, line: impl Into<String>) {
        self.log
            .push(format!("{} {}", Utc::now().format("%H:%M:%S"), line.into()));
    }

    /// Set byte counters and recompute the percentage.
    pub fn set_bytes(&mut self, downloaded: u64, total: u64) {
        self.bytes_downloaded = downloaded;
        self.total_bytes = total;
        #[allow(clippy::cast_precision_loss)]
        if total > 0 {
            self.progress_percentage = (downloaded as f64 / total as f64) * 100.0;
        }
    }

    /// Derive this grouped record's state from its children.
    ///
    /// Any running child keeps the group in progress; a fully terminal set
    /// becomes `Failed` when everything failed, `Failed` with a
    /// partial-completion message when successes and failures mix, and
    /// `Completed` otherwise. The percentage is the arithmetic mean.
    pub fn update_from_children(&mut self, children: &[Self]) {
        if children.is_empty() {
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let mean = children
            .iter()
            .map(|c| c.progress_percentage)
            .sum::<f64>()
            / children.len() as f64;

        let any_in_progress = children
            .iter()
            .any(|c| c.status == DownloadStatus::InProgress);
        let any_pending = children.iter().any(|c| c.status == DownloadStatus::Pending);
        let failed: Vec<&Self> = children
            .iter()
            .filter(|c| c.status == DownloadStatus::Failed)
            .collect();
        let succeeded = children
            .iter()
            .filter(|c| matches!(c.status, DownloadStatus::Completed | DownloadStatus::Skipped))
            .count();

        self.progress_percentage = mean;

        if any_in_progress || any_pending {
            self.status = DownloadStatus::InProgress;
            return;
        }

        if !failed.is_empty() && succeeded == 0 {
            self.status = DownloadStatus::Failed;
            self.status_message = "All downloads failed".to_string();
            self.error_message = Some(join_child_errors(&failed));
            self.end_time = Some(Utc::now());
        } else if !failed.is_empty() {
            self.status = DownloadStatus::Failed;
            self.progress_percentage = 100.0;
            self.status_message = format!(
                "Completed with errors: {succeeded} of {} files downloaded",
                children.len()
            );
            self.error_message = Some(join_child_errors(&failed));
            self.end_time = Some(Utc::now());
        } else {
            self.status = DownloadStatus::Completed;
            self.status_message = format!("All {} files downloaded", children.len());
            self.end_time = Some(Utc::now());
        }
    }
}

fn join_child_errors(failed: &[&DownloadProgress]) -> String {
    failed
        .iter()
        .map(|c| {
            let name = if c.mod_name.is_empty() { &c.url } else { &c.mod_name };
            format!(
                "{name}: {}",
                c.error_message.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Decides when a progress update deserves a verbose log line.
#[derive(Debug)]
struct LogThrottle {
    last_emit: Option<Instant>,
    last_status: Option<DownloadStatus>,
}

/// Minimum interval between routine progress log lines.
const LOG_INTERVAL: Duration = Duration::from_secs(30);

impl LogThrottle {
    const fn new() -> Self {
        Self {
            last_emit: None,
            last_status: None,
        }
    }

    /// First update, status change, terminal status, an error, or thirty
    /// seconds of silence each force an emission.
    fn should_log(&mut self, progress: &DownloadProgress) -> bool {
        let now = Instant::now();
        let status_changed = self.last_status != Some(progress.status);
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= LOG_INTERVAL);
        let emit = self.last_emit.is_none()
            || status_changed
            || progress.status.is_terminal()
            || progress.error_message.is_some()
            || due;
        if emit {
            self.last_emit = Some(now);
            self.last_status = Some(progress.status);
        }
        emit
    }
}

/// Shared handle that publishes progress updates.
///
/// Cloning is cheap; every clone publishes into the same channel.
#[derive(Debug)]
pub struct ProgressHandle {
    tx: watch::Sender<DownloadProgress>,
    throttle: Mutex<LogThrottle>,
}

impl ProgressHandle {
    /// Wrap an initial snapshot.
    #[must_use]
    pub fn new(initial: DownloadProgress) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            throttle: Mutex::new(LogThrottle::new()),
        }
    }

    /// Subscribe to snapshot updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DownloadProgress> {
        self.tx.subscribe()
    }

    /// Latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> DownloadProgress {
        self.tx.borrow().clone()
    }

    /// Apply a mutation and notify subscribers, logging if the throttle
    /// allows it.
    pub fn update(&self, apply: impl FnOnce(&mut DownloadProgress)) {
        self.tx.send_modify(apply);
        let snapshot = self.tx.borrow().clone();
        let should_log = self
            .throttle
            .lock()
            .map(|mut t| t.should_log(&snapshot))
            .unwrap_or(false);
        if should_log {
            tracing::debug!(
                target: "modvault.download",
                url = %snapshot.url,
                status = snapshot.status.as_str(),
                percent = snapshot.progress_percentage,
                downloaded = %format_bytes(snapshot.bytes_downloaded),
                error = snapshot.error_message.as_deref().unwrap_or(""),
                "progress"
            );
        }
    }

    /// Transition to `InProgress` with a status line.
    pub fn start(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|p| {
            p.status = DownloadStatus::InProgress;
            p.status_message.clone_from(&message);
            p.push_log(message.clone());
        });
    }

    /// Update byte counters.
    pub fn bytes(&self, downloaded: u64, total: u64) {
        self.update(|p| p.set_bytes(downloaded, total));
    }

    /// Transition to `Completed`.
    pub fn complete(&self, file_path: PathBuf) {
        self.update(|p| {
            p.status = DownloadStatus::Completed;
            p.progress_percentage = 100.0;
            p.file_path = Some(file_path);
            p.end_time = Some(Utc::now());
            p.push_log("download completed");
        });
    }

    /// Transition to `Skipped` for an already-present file.
    pub fn skip(&self, file_path: PathBuf, size_on_disk: u64) {
        self.update(|p| {
            p.status = DownloadStatus::Skipped;
            p.progress_percentage = 100.0;
            p.bytes_downloaded = size_on_disk;
            p.total_bytes = size_on_disk;
            p.file_path = Some(file_path);
            p.end_time = Some(Utc::now());
            p.push_log("file already present, skipped");
        });
    }

    /// Transition to `Failed` with an error message.
    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|p| {
            p.status = DownloadStatus::Failed;
            p.error_message = Some(error.clone());
            p.end_time = Some(Utc::now());
            p.push_log(format!("failed: {error}"));
        });
    }
}

/// Human-readable byte count with 1024 divisor and two decimals.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(status: DownloadStatus, percent: f64) -> DownloadProgress {
        let mut p = DownloadProgress::new("child", "https://example.com/f");
        p.status = status;
        p.progress_percentage = percent;
        if status == DownloadStatus::Failed {
            p.error_message = Some("boom".to_string());
        }
        p
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_572_864), "1.50 MB");
        assert_eq!(format_bytes(1024_u64.pow(4)), "1.00 TB");
        assert_eq!(format_bytes(1024_u64.pow(5)), "1024.00 TB");
    }

    #[test]
    fn test_group_in_progress_wins() {
        let mut parent = DownloadProgress::new_group("pack");
        parent.update_from_children(&[
            child(DownloadStatus::Completed, 100.0),
            child(DownloadStatus::InProgress, 50.0),
        ]);
        assert_eq!(parent.status, DownloadStatus::InProgress);
        assert!((parent.progress_percentage - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_group_pending_counts_as_in_progress() {
        let mut parent = DownloadProgress::new_group("pack");
        parent.update_from_children(&[
            child(DownloadStatus::Completed, 100.0),
            child(DownloadStatus::Pending, 0.0),
        ]);
        assert_eq!(parent.status, DownloadStatus::InProgress);
    }

    #[test]
    fn test_group_all_failed() {
        let mut parent = DownloadProgress::new_group("pack");
        parent.update_from_children(&[
            child(DownloadStatus::Failed, 10.0),
            child(DownloadStatus::Failed, 20.0),
        ]);
        assert_eq!(parent.status, DownloadStatus::Failed);
        assert_eq!(parent.status_message, "All downloads failed");
        assert!(parent.error_message.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn test_group_partial_failure_is_failed_at_100() {
        let mut parent = DownloadProgress::new_group("pack");
        parent.update_from_children(&[
            child(DownloadStatus::Completed, 100.0),
            child(DownloadStatus::Failed, 40.0),
            child(DownloadStatus::Skipped, 100.0),
        ]);
        assert_eq!(parent.status, DownloadStatus::Failed);
        assert!((parent.progress_percentage - 100.0).abs() < f64::EPSILON);
        assert!(parent.status_message.contains("2 of 3"));
        assert!(parent.error_message.is_some());
    }

    #[test]
    fn test_group_all_succeeded() {
        let mut parent = DownloadProgress::new_group("pack");
        parent.update_from_children(&[
            child(DownloadStatus::Completed, 100.0),
            child(DownloadStatus::Skipped, 100.0),
        ]);
        assert_eq!(parent.status, DownloadStatus::Completed);
        assert!(parent.end_time.is_some());
    }

    #[test]
    fn test_throttle_rules() {
        let mut throttle = LogThrottle::new();
        let mut p = DownloadProgress::new("m", "https://example.com/f");

        // First update always logs.
        assert!(throttle.should_log(&p));
        // Same status again, within the window: suppressed.
        assert!(!throttle.should_log(&p));
        // Status change logs.
        p.status = DownloadStatus::InProgress;
        assert!(throttle.should_log(&p));
        assert!(!throttle.should_log(&p));
        // Errors always log.
        p.error_message = Some("x".to_string());
        assert!(throttle.should_log(&p));
        // Terminal always logs.
        p.error_message = None;
        p.status = DownloadStatus::Completed;
        assert!(throttle.should_log(&p));
        assert!(throttle.should_log(&p)); // still terminal
    }

    #[test]
    fn test_handle_publishes_to_subscribers() {
        let handle = ProgressHandle::new(DownloadProgress::new("m", "https://example.com/f"));
        let rx = handle.subscribe();
        handle.start("resolving");
        handle.bytes(512, 2048);
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.status, DownloadStatus::InProgress);
        assert!((snapshot.progress_percentage - 25.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.log.len(), 1);
    }

    #[test]
    fn test_skip_populates_counters() {
        let handle = ProgressHandle::new(DownloadProgress::new("m", "https://example.com/f"));
        handle.skip(PathBuf::from("/tmp/f.zip"), 4096);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, DownloadStatus::Skipped);
        assert_eq!(snapshot.bytes_downloaded, 4096);
        assert_eq!(snapshot.total_bytes, 4096);
        assert!((snapshot.progress_percentage - 100.0).abs() < f64::EPSILON);
    }
}
