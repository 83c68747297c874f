//! Download error taxonomy.
//!
//! These errors are designed to be serializable and not depend on external
//! error types like `std::io::Error` or `reqwest::Error`; handlers capture
//! the underlying cause as strings so results can cross process boundaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for every fallible download-cache operation.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadError {
    /// The supplied URL could not be parsed or is not absolute HTTP/HTTPS.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL text.
        url: String,
    },

    /// The remote server answered with a non-success status.
    #[error("HTTP request failed with status {status}: {url}")]
    HttpRequestFailed {
        /// HTTP status code.
        status: u16,
        /// The request URL.
        url: String,
    },

    /// A network operation exceeded its deadline.
    #[error("operation timed out after {seconds}s")]
    Timeout {
        /// The deadline that elapsed.
        seconds: u64,
    },

    /// The provider rejected the request for lack of credentials.
    #[error("authentication required by {provider}")]
    AuthRequired {
        /// Provider key of the rejecting handler.
        provider: String,
    },

    /// 404, expired link, or removed file.
    #[error("not found: {url}")]
    NotFound {
        /// The request URL.
        url: String,
    },

    /// 429 Too Many Requests.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds the server asked us to wait.
        retry_after_secs: u64,
    },

    /// The response body was not what the request implied (e.g. HTML where a
    /// binary archive was expected, or a declared-size mismatch).
    #[error("content mismatch: {detail}")]
    ContentMismatch {
        /// What was expected versus observed.
        detail: String,
    },

    /// SHA-256, piece-hash, or file-size verification failed.
    #[error("integrity verification failed: {detail}")]
    IntegrityFailure {
        /// Which check failed and how.
        detail: String,
    },

    /// The mesh distribution engine is not linked or failed to initialize.
    #[error("mesh engine unavailable")]
    EngineUnavailable,

    /// The content identifier is on the compliance blocklist.
    #[error("content {content_id} is blocklisted")]
    Compliance {
        /// The blocked identifier.
        content_id: String,
    },

    /// The operation was cancelled cooperatively.
    #[error("download cancelled")]
    Cancelled,

    /// I/O error during file operations.
    #[error("I/O error ({kind}): {message}")]
    Io {
        /// The kind of I/O error (e.g. "NotFound", "PermissionDenied").
        kind: String,
        /// Detailed error message.
        message: String,
    },

    /// Caught at a handler boundary to prevent propagation.
    #[error("{message}")]
    Unexpected {
        /// Description of the underlying failure.
        message: String,
    },
}

impl DownloadError {
    /// Create an invalid-URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Create an HTTP-failure error.
    pub fn http_failed(status: u16, url: impl Into<String>) -> Self {
        Self::HttpRequestFailed {
            status,
            url: url.into(),
        }
    }

    /// Create a timeout error.
    pub const fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// Create an auth-required error.
    pub fn auth_required(provider: impl Into<String>) -> Self {
        Self::AuthRequired {
            provider: provider.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(url: impl Into<String>) -> Self {
        Self::NotFound { url: url.into() }
    }

    /// Create a content-mismatch error.
    pub fn content_mismatch(detail: impl Into<String>) -> Self {
        Self::ContentMismatch {
            detail: detail.into(),
        }
    }

    /// Create an integrity-failure error.
    pub fn integrity(detail: impl Into<String>) -> Self {
        Self::IntegrityFailure {
            detail: detail.into(),
        }
    }

    /// Create a compliance error for a blocklisted identifier.
    pub fn compliance(content_id: impl Into<String>) -> Self {
        Self::Compliance {
            content_id: content_id.into(),
        }
    }

    /// Create an I/O error from a `std::io::Error`, capturing kind and message.
    #[must_use]
    pub fn from_io_error(err: &std::io::Error) -> Self {
        Self::Io {
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }

    /// Create an unexpected error from any displayable cause.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Check if this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short category label used in progress records and logs.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "InputInvalid",
            Self::HttpRequestFailed { .. } => "Transport",
            Self::Timeout { .. } => "Timeout",
            Self::AuthRequired { .. } => "Auth",
            Self::NotFound { .. } => "NotFound",
            Self::RateLimited { .. } => "RateLimited",
            Self::ContentMismatch { .. } => "ContentMismatch",
            Self::IntegrityFailure { .. } => "IntegrityFailure",
            Self::EngineUnavailable => "EngineUnavailable",
            Self::Compliance { .. } => "Compliance",
            Self::Cancelled => "Cancelled",
            Self::Io { .. } => "Io",
            Self::Unexpected { .. } => "Unexpected",
        }
    }

    /// Multi-line user-facing failure report: likely cause, a remediation
    /// step, and the technical detail.
    #[must_use]
    pub fn failure_report(&self, url: &str) -> String {
        let cause = match self {
            Self::InvalidUrl { .. } => "The download address is not a valid URL.",
            Self::HttpRequestFailed { .. } => "The server refused the request.",
            Self::Timeout { .. } => "The connection timed out.",
            Self::AuthRequired { .. } => "The provider requires an account or API key.",
            Self::NotFound { .. } => "The file no longer exists at this address.",
            Self::RateLimited { .. } => "The provider is rate-limiting requests.",
            Self::ContentMismatch { .. } => {
                "The server sent something other than the expected file."
            }
            Self::IntegrityFailure { .. } => "The downloaded file failed integrity verification.",
            Self::EngineUnavailable => "The peer-to-peer engine is not available.",
            Self::Compliance { .. } => "This content has been blocked for compliance reasons.",
            Self::Cancelled => "The download was cancelled.",
            Self::Io { .. } => "A local file operation failed.",
            Self::Unexpected { .. } => "An unexpected error occurred.",
        };
        format!("{cause}\nPlease download the file manually from {url}.\nDetails: {self}")
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io_error(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = DownloadError::from_io_error(&io_err);
        match err {
            DownloadError::Io { kind, message } => {
                assert_eq!(kind, "NotFound");
                assert!(message.contains("file not found"));
            }
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_error_serialization_round_trip() {
        let err = DownloadError::http_failed(429, "https://example.com/file");
        let json = serde_json::to_string(&err).unwrap();
        let parsed: DownloadError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_failure_report_is_three_lines() {
        let err = DownloadError::not_found("https://example.com/mod.zip");
        let report = err.failure_report("https://example.com/mod.zip");
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("https://example.com/mod.zip"));
        assert!(lines[2].starts_with("Details:"));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            DownloadError::integrity("sha256 mismatch").category(),
            "IntegrityFailure"
        );
        assert_eq!(DownloadError::Cancelled.category(), "Cancelled");
        assert!(DownloadError::Cancelled.is_cancelled());
    }
}
