//! Resource metadata: the record persisted alongside a cached file.

use std::fs;
use std::io;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::content_id::ContentId;

/// Candidate piece sizes, smallest first.
pub const PIECE_SIZE_CANDIDATES: [u32; 7] = [
    64 * 1024,
    128 * 1024,
    256 * 1024,
    512 * 1024,
    1024 * 1024,
    2 * 1024 * 1024,
    4 * 1024 * 1024,
];

/// Upper bound on the number of pieces a file may be split into.
pub const MAX_PIECE_COUNT: u64 = 1 << 20;

/// Hex characters per piece hash (20-byte SHA-1).
pub const PIECE_HASH_HEX_LEN: usize = 40;

/// Pick the smallest candidate piece size that keeps the piece count within
/// [`MAX_PIECE_COUNT`]; very large files fall back to the largest candidate.
#[must_use]
pub fn determine_piece_size(file_size: u64) -> u32 {
    for candidate in PIECE_SIZE_CANDIDATES {
        if file_size.div_ceil(u64::from(candidate)) <= MAX_PIECE_COUNT {
            return candidate;
        }
    }
    PIECE_SIZE_CANDIDATES[PIECE_SIZE_CANDIDATES.len() - 1]
}

/// Verification record for a cached file.
///
/// Persisted as a JSON sidecar next to the descriptor; writing and reading
/// the record is lossless.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Canonical identifier of the content.
    pub content_id: ContentId,
    /// Exact file size in bytes.
    pub file_size: u64,
    /// Piece length used for piece hashing, power of two when possible.
    pub piece_length: u32,
    /// Concatenated lowercase hex SHA-1 piece hashes, 40 chars per piece,
    /// in file order. Empty when piece hashing was skipped.
    pub piece_hashes: String,
    /// Lowercase hex SHA-256 of the whole file. Empty when unknown.
    pub content_hash_sha256: String,
    /// Ordered unique tracker URLs, may be empty.
    pub trackers: Vec<String>,
    /// UTC seconds since epoch at record creation.
    pub created_at: i64,
}

impl ResourceMetadata {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(
        content_id: ContentId,
        file_size: u64,
        piece_length: u32,
        piece_hashes: String,
        content_hash_sha256: String,
        trackers: Vec<String>,
    ) -> Self {
        Self {
            content_id,
            file_size,
            piece_length,
            piece_hashes,
            content_hash_sha256,
            trackers,
            created_at: Utc::now().timestamp(),
        }
    }

    /// Number of pieces recorded.
    #[must_use]
    pub const fn piece_count(&self) -> usize {
        self.piece_hashes.len() / PIECE_HASH_HEX_LEN
    }

    /// Number of pieces the recorded size and piece length imply.
    #[must_use]
    pub fn expected_piece_count(&self) -> u64 {
        if self.piece_length == 0 {
            return 0;
        }
        self.file_size.div_ceil(u64::from(self.piece_length))
    }

    /// Check internal coherence: the piece-hash stream must cover exactly
    /// `ceil(file_size / piece_length)` pieces.
    #[must_use]
    pub fn is_coherent(&self) -> bool {
        if self.piece_hashes.is_empty() {
            return true;
        }
        self.piece_hashes.len() % PIECE_HASH_HEX_LEN == 0
            && self.piece_count() as u64 == self.expected_piece_count()
    }

    /// Persist the record as pretty JSON.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// Load a previously saved record.
    pub fn load(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
