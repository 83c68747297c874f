//! Core domain types and deterministic algorithms for modvault.
//!
//! This crate is the dependency-free heart of the download cache: the
//! metadata model, canonical bencoding, URL normalization, content
//! identification, piece-level integrity hashing, progress tracking and the
//! on-disk cache layout. It performs no network I/O; the provider handlers
//! and the mesh adapter live in their own crates and consume these types.

#![deny(unsafe_code)]

pub mod bencode;
pub mod config;
pub mod content_id;
pub mod error;
pub mod integrity;
pub mod metadata;
pub mod paths;
pub mod progress;
pub mod resource;
pub mod urlnorm;
pub mod util;

// ============================================================================
// Public API
// ============================================================================

pub use bencode::{BencodeError, BencodeValue};
pub use config::CacheConfig;
pub use content_id::{ContentId, compute_content_id, url_hash};
pub use error::DownloadError;
pub use integrity::{IntegrityData, IntegrityError, compute_integrity_data, verify_integrity};
pub use metadata::{MetadataValue, ProviderMetadata};
pub use paths::CachePaths;
pub use progress::{
    DownloadProgress, DownloadResult, DownloadSource, DownloadStatus, ProgressHandle, format_bytes,
};
pub use resource::{ResourceMetadata, determine_piece_size};
pub use urlnorm::normalize_url;
pub use util::sanitize_filename;
