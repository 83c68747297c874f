//! Shared streaming-fetch plumbing for the HTTP handlers.
//!
//! Every handler funnels its byte transfer through [`stream_to_file`], which
//! wires together the throttled reader, cancellation, progress reporting and
//! partial-file cleanup, so the per-provider code only decides *what* to
//! request.

use std::io;
use std::path::Path;

use futures_util::TryStreamExt;
use reqwest::{Response, StatusCode, header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use modvault_core::{DownloadError, ProgressHandle};

use crate::throttle::ThrottledReader;

/// Read-buffer size for streaming transfers.
const CHUNK: usize = 64 * 1024;

/// How a response body should be written to disk.
pub(crate) struct StreamSpec<'a> {
    /// Where the bytes go (usually a partial path; promotion is the caller's
    /// job).
    pub dest: &'a Path,
    /// Progress handle updated as bytes arrive.
    pub progress: Option<&'a ProgressHandle>,
    /// Cancels the transfer and removes the partial file.
    pub cancel: &'a CancellationToken,
    /// Bytes per second, 0 for unbounded.
    pub max_bytes_per_sec: u64,
    /// Size the transfer must end up at, when the provider declared one.
    pub expected_size: Option<u64>,
}

/// Stream a response body to disk.
///
/// Returns the byte count written. On cancellation or a declared-size
/// mismatch the partial file is deleted before the error is returned.
pub(crate) async fn stream_to_file(
    response: Response,
    spec: StreamSpec<'_>,
) -> Result<u64, DownloadError> {
    let total = spec.expected_size.or_else(|| response.content_length());

    if let Some(parent) = spec.dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(spec.dest).await?;

    let stream = Box::pin(
        response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
    );
    let mut reader = ThrottledReader::new(StreamReader::new(stream), spec.max_bytes_per_sec);

    let mut buf = vec![0_u8; CHUNK];
    let mut downloaded: u64 = 0;

    let outcome: Result<(), DownloadError> = loop {
        let read = tokio::select! {
            biased;
            () = spec.cancel.cancelled() => break Err(DownloadError::Cancelled),
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = file.write_all(&buf[..n]).await {
                    break Err(e.into());
                }
                downloaded += n as u64;
                if let Some(progress) = spec.progress {
                    progress.bytes(downloaded, total.unwrap_or(0));
                }
            }
            Err(e) => break Err(e.into()),
        }
    };

    match outcome {
        Ok(()) => {
            file.flush().await?;
            drop(file);
            if let Some(expected) = spec.expected_size {
                if downloaded != expected {
                    let _ = tokio::fs::remove_file(spec.dest).await;
                    return Err(DownloadError::content_mismatch(format!(
                        "declared size {expected} bytes, received {downloaded}"
                    )));
                }
            }
            Ok(downloaded)
        }
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(spec.dest).await;
            Err(e)
        }
    }
}

/// Send a request, racing it against cancellation.
pub(crate) async fn send_cancellable(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
    timeout_secs: u64,
) -> Result<Response, DownloadError> {
    let send = request.send();
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DownloadError::Cancelled),
        outcome = send => outcome.map_err(|e| map_reqwest_error(&e, timeout_secs)),
    }
}

/// Translate a transport error into the download taxonomy.
pub(crate) fn map_reqwest_error(error: &reqwest::Error, timeout_secs: u64) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(timeout_secs)
    } else {
        DownloadError::unexpected(error.to_string())
    }
}

/// Translate a non-success status into the download taxonomy.
pub(crate) fn error_for_status(
    response: &Response,
    url: &str,
    provider: &str,
) -> Option<DownloadError> {
    let status = response.status();
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => DownloadError::not_found(url),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DownloadError::auth_required(provider),
        StatusCode::TOO_MANY_REQUESTS => DownloadError::RateLimited {
            retry_after_secs: retry_after_secs(response),
        },
        _ => DownloadError::http_failed(status.as_u16(), url),
    })
}

/// Parse `Retry-After` seconds, defaulting to 60.
pub(crate) fn retry_after_secs(response: &Response) -> u64 {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(60)
}

/// Whether the response announces an HTML body.
pub(crate) fn is_html_response(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

/// Extract a filename from a `Content-Disposition` header value.
pub(crate) fn filename_from_disposition(value: &str) -> Option<String> {
    // RFC 5987 extended form first: filename*=UTF-8''name.zip
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename*=") {
            let rest = rest.trim_matches('"');
            let name = rest.rsplit("''").next().unwrap_or(rest);
            let decoded = percent_decode(name);
            if !decoded.is_empty() {
                return Some(decoded);
            }
        }
    }
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix("filename=") {
            let name = rest.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Extract a filename from the last path segment of a URL.
pub(crate) fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?;
    let decoded = percent_decode(segment);
    (!decoded.is_empty()).then_some(decoded)
}

fn percent_decode(s: &str) -> String {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
