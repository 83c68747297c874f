//! On-disk cache layout.
//!
//! All cache state lives under `<app-data>/ModVault/Cache/`. Descriptors and
//! resource-metadata sidecars are keyed by content id under `Network/`; the
//! persisted listen port uses a deterministic obfuscated file name so casual
//! directory listings do not advertise the peer-to-peer layer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::content_id::ContentId;

/// Application directory name under the platform app-data root.
pub const APP_NAME: &str = "ModVault";

/// File name of the blocklist audit trail.
pub const AUDIT_LOG_NAME: &str = "block-audit.log";

/// Logical name of the persisted listen port; the on-disk name is derived
/// from it, not equal to it.
const PORT_FILE_LOGICAL_NAME: &str = "p2p-port.cfg";

/// Resolver for every path the cache touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Cache rooted at an explicit directory.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Cache rooted at the platform app-data directory, falling back to the
    /// current directory when the platform offers none.
    #[must_use]
    pub fn from_app_data() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(APP_NAME).join("Cache"))
    }

    /// The cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding descriptors and metadata sidecars.
    #[must_use]
    pub fn network_dir(&self) -> PathBuf {
        self.root.join("Network")
    }

    /// Bencoded descriptor for a content id.
    #[must_use]
    pub fn descriptor_path(&self, id: &ContentId) -> PathBuf {
        self.network_dir().join(format!("{id}.dat"))
    }

    /// Resource-metadata sidecar for a content id.
    #[must_use]
    pub fn resource_metadata_path(&self, id: &ContentId) -> PathBuf {
        self.network_dir().join(format!("{id}.json"))
    }

    /// Persisted listen-port file (obfuscated name).
    #[must_use]
    pub fn port_file(&self) -> PathBuf {
        self.root.join(obfuscated_port_file_name())
    }

    /// Append-only blocklist audit log.
    #[must_use]
    pub fn audit_log(&self) -> PathBuf {
        self.root.join(AUDIT_LOG_NAME)
    }

    /// Create the root and `Network/` directories.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.network_dir())
    }
}

/// In-flight partial file inside the caller's destination directory.
#[must_use]
pub fn partial_path(dest_dir: &Path, id: &ContentId) -> PathBuf {
    dest_dir
        .join(".partial")
        .join(format!("{}.part", id.short_prefix()))
}

/// Partial file unique to one racer, so concurrent traditional and
/// distributed attempts never collide.
#[must_use]
pub fn racer_partial_path(dest_dir: &Path, id: &ContentId, tag: &str) -> PathBuf {
    dest_dir
        .join(".partial")
        .join(format!("{}.{tag}.part", id.short_prefix()))
}

/// Deterministic obfuscated name for the port file: the first twelve hex
/// characters of SHA-1 of the logical name, with the original extension.
fn obfuscated_port_file_name() -> String {
    let digest = Sha1::digest(PORT_FILE_LOGICAL_NAME.as_bytes());
    format!("{}.cfg", &hex::encode(digest)[..12])
}
