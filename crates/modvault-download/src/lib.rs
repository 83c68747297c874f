//! Provider handlers and download orchestration for modvault.
//!
//! A [`ProviderHandler`] knows how to resolve and fetch content for one
//! family of URLs; the [`DownloadManager`] dispatches each request to the
//! first handler that accepts it, bounds concurrency for rate-limited
//! providers, and guarantees that no handler failure escapes as a panic or
//! error — every outcome becomes a [`modvault_core::DownloadResult`].

#![deny(unsafe_code)]

mod fetch;
pub mod handler;
pub mod handlers;
pub mod manager;
pub mod throttle;

// ============================================================================
// Public API
// ============================================================================

pub use handler::{HandlerFactory, ProviderHandler};
pub use manager::{DownloadManager, DownloadRequest, ProgressSink};
pub use throttle::ThrottledReader;
