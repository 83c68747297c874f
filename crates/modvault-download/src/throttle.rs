//! Bandwidth-capped stream wrapper.
//!
//! Wraps an inner `AsyncRead` and keeps the transfer rate under a configured
//! bytes-per-second bound by sleeping before reads that would exceed the
//! ratio for the current one-second window. Suspension is an ordinary async
//! sleep, so cancelling the surrounding future cancels the wait promptly and
//! dropping the wrapper drops the inner stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::time::{Duration, Instant, Sleep};

/// Length of the rate-accounting window.
const WINDOW: Duration = Duration::from_millis(1000);

/// `AsyncRead` adapter that enforces a maximum transfer rate.
#[derive(Debug)]
pub struct ThrottledReader<R> {
    inner: R,
    /// Bytes per second; `None` is unbounded.
    max_bytes_per_sec: Option<u64>,
    window_start: Instant,
    window_bytes: u64,
    pause: Option<Pin<Box<Sleep>>>,
}

impl<R> ThrottledReader<R> {
    /// Wrap `inner` with a rate bound. Zero means unbounded.
    pub fn new(inner: R, max_bytes_per_sec: u64) -> Self {
        Self {
            inner,
            max_bytes_per_sec: (max_bytes_per_sec > 0).then_some(max_bytes_per_sec),
            window_start: Instant::now(),
            window_bytes: 0,
            pause: None,
        }
    }

    /// Wrap `inner` without any rate bound.
    pub fn unlimited(inner: R) -> Self {
        Self::new(inner, 0)
    }

    /// The wrapped stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    #[allow(clippy::cast_possible_truncation)]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let Some(rate) = this.max_bytes_per_sec else {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        };

        if let Some(pause) = this.pause.as_mut() {
            ready!(pause.as_mut().poll(cx));
            this.pause = None;
        }

        let now = Instant::now();
        let mut elapsed = now.duration_since(this.window_start);
        if elapsed >= WINDOW {
            this.window_start = now;
            this.window_bytes = 0;
            elapsed = Duration::ZERO;
        }

        let allowed = elapsed.as_millis() as u64 * rate / 1000;
        if this.window_bytes > allowed {
            // Sleep exactly long enough for the window ratio to catch up.
            let target_ms = this.window_bytes * 1000 / rate;
            let delta = Duration::from_millis(target_ms.saturating_sub(elapsed.as_millis() as u64));
            let mut pause = Box::pin(tokio::time::sleep(delta.max(Duration::from_millis(1))));
            match pause.as_mut().poll(cx) {
                Poll::Ready(()) => {}
                Poll::Pending => {
                    this.pause = Some(pause);
                    return Poll::Pending;
                }
            }
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.window_bytes += (buf.filled().len() - before) as u64;
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncSeek + Unpin> AsyncSeek for ThrottledReader<R> {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.get_mut().inner).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().inner).poll_complete(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_never_sleeps() {
        let data = vec![1_u8; 256 * 1024];
        let mut reader = ThrottledReader::unlimited(std::io::Cursor::new(data));
        let started = Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 256 * 1024);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_enforced() {
        // 256 KiB at 64 KiB/s should take on the order of four seconds of
        // virtual time (auto-advanced by the paused clock).
        let data = vec![1_u8; 256 * 1024];
        let mut reader = ThrottledReader::new(std::io::Cursor::new(data), 64 * 1024);
        let started = Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 256 * 1024);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_reads_under_rate_do_not_wait() {
        let data = vec![1_u8; 1024];
        let mut reader = ThrottledReader::new(std::io::Cursor::new(data), 1024 * 1024);
        let started = Instant::now();
        let mut out = [0_u8; 512];
        reader.read_exact(&mut out).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_sleep_is_cancellable() {
        let data = vec![1_u8; 1024 * 1024];
        let mut reader = ThrottledReader::new(std::io::Cursor::new(data), 1024);
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        // The cancelled branch wins as soon as the reader parks in a sleep.
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            _ = reader.read_to_end(&mut out) => panic!("read should not win against cancel"),
        }
    }
}
