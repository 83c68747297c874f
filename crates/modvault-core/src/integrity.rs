//! Piece-level integrity verification.
//!
//! A downloaded file is never trusted on HTTP status alone: before it is
//! promoted from its temporary path it must match the recorded whole-file
//! SHA-256, the per-piece SHA-1 stream, and the exact byte size. The same
//! single-pass walk computes the data at ingest time.
//!
//! All functions here do blocking disk I/O; async callers wrap them in
//! `tokio::task::spawn_blocking`.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::resource::{PIECE_HASH_HEX_LEN, ResourceMetadata, determine_piece_size};

/// Hashes produced by a single pass over a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntegrityData {
    /// Lowercase hex SHA-256 of the whole file.
    pub content_hash_sha256: String,
    /// Piece length the hashes were computed with.
    pub piece_length: u32,
    /// Concatenated lowercase hex SHA-1 piece hashes in file order.
    pub piece_hashes: String,
}

/// Why verification rejected a file.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// Whole-file SHA-256 did not match the record.
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch {
        /// Recorded hash.
        expected: String,
        /// Computed hash.
        actual: String,
    },

    /// A piece hash did not match, or the piece count differed.
    #[error("piece {index} hash mismatch")]
    PieceMismatch {
        /// Zero-based index of the first mismatching piece.
        index: usize,
    },

    /// The file produced a different number of pieces than recorded.
    #[error("piece count mismatch: expected {expected}, got {actual}")]
    PieceCountMismatch {
        /// Recorded piece count.
        expected: u64,
        /// Observed piece count.
        actual: u64,
    },

    /// On-disk size differs from the record.
    #[error("file size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        /// Recorded size.
        expected: u64,
        /// Observed size.
        actual: u64,
    },

    /// The file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Compute the whole-file SHA-256 and SHA-1 piece hashes in one pass.
///
/// The piece length is chosen with [`determine_piece_size`] from the file's
/// size unless `piece_length_override` is given.
pub fn compute_integrity_data(
    path: &Path,
    piece_length_override: Option<u32>,
) -> io::Result<IntegrityData> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let piece_length = piece_length_override.unwrap_or_else(|| determine_piece_size(file_size));

    let mut content_hasher = Sha256::new();
    let mut piece_hashes = String::new();
    let mut buffer = vec![0_u8; piece_length as usize];

    loop {
        let filled = read_chunk(&mut file, &mut buffer)?;
        if filled == 0 {
            break;
        }
        let chunk = &buffer[..filled];
        content_hasher.update(chunk);
        let piece_digest = Sha1::digest(chunk);
        let _ = write!(piece_hashes, "{piece_digest:x}");
        if filled < buffer.len() {
            break;
        }
    }

    Ok(IntegrityData {
        content_hash_sha256: format!("{:x}", content_hasher.finalize()),
        piece_length,
        piece_hashes,
    })
}

/// Verify a file against its recorded metadata.
///
/// Checks, in order: exact file size (when recorded), whole-file SHA-256
/// (when recorded), and the SHA-1 piece stream (when recorded). Any failure
/// is returned as a specific [`IntegrityError`]; callers that only need a
/// verdict can treat `Err` as `false`.
pub fn verify_integrity(path: &Path, meta: &ResourceMetadata) -> Result<(), IntegrityError> {
    let file_size = std::fs::metadata(path)?.len();
    if meta.file_size > 0 && file_size != meta.file_size {
        return Err(IntegrityError::SizeMismatch {
            expected: meta.file_size,
            actual: file_size,
        });
    }

    let check_pieces = !meta.piece_hashes.is_empty() && meta.piece_length > 0;
    let piece_length = if check_pieces {
        meta.piece_length
    } else {
        determine_piece_size(file_size)
    };
    let data = compute_integrity_data(path, Some(piece_length))?;

    if !meta.content_hash_sha256.is_empty()
        && !data
            .content_hash_sha256
            .eq_ignore_ascii_case(&meta.content_hash_sha256)
    {
        return Err(IntegrityError::ContentHashMismatch {
            expected: meta.content_hash_sha256.to_lowercase(),
            actual: data.content_hash_sha256,
        });
    }

    if check_pieces {
        // When the recorded size is unknown the recorded hash stream itself
        // defines the expected count.
        let expected_count = if meta.file_size > 0 {
            meta.expected_piece_count()
        } else {
            meta.piece_count() as u64
        };
        let actual_count = (data.piece_hashes.len() / PIECE_HASH_HEX_LEN) as u64;
        if actual_count != expected_count
            || meta.piece_hashes.len() != data.piece_hashes.len()
        {
            return Err(IntegrityError::PieceCountMismatch {
                expected: expected_count,
                actual: actual_count,
            });
        }
        if !data.piece_hashes.eq_ignore_ascii_case(&meta.piece_hashes) {
            let index = first_mismatching_piece(&data.piece_hashes, &meta.piece_hashes);
            return Err(IntegrityError::PieceMismatch { index });
        }
    }

    Ok(())
}

fn first_mismatching_piece(actual: &str, expected: &str) -> usize {
    actual
        .as_bytes()
        .chunks(PIECE_HASH_HEX_LEN)
        .zip(expected.as_bytes().chunks(PIECE_HASH_HEX_LEN))
        .position(|(a, e)| !a.eq_ignore_ascii_case(e))
        .unwrap_or(0)
}

/// Fill `buffer` as far as the stream allows; returns bytes read (0 at EOF).
fn read_chunk(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::ContentId;

    fn write_temp(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    fn meta_for(path: &Path, piece_length: Option<u32>) -> ResourceMetadata {
        let data = compute_integrity_data(path, piece_length).unwrap();
        let size = std::fs::metadata(path).unwrap().len();
        ResourceMetadata::new(
            ContentId::new("0123456789abcdef0123456789abcdef01234567").unwrap(),
            size,
            data.piece_length,
            data.piece_hashes,
            data.content_hash_sha256,
            vec![],
        )
    }

    #[test]
    fn test_compute_matches_known_sha256() {
        let (_dir, path) = write_temp(b"hello world");
        let data = compute_integrity_data(&path, None).unwrap();
        assert_eq!(
            data.content_hash_sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        // One piece: SHA-1("hello world").
        assert_eq!(data.piece_hashes, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn test_verify_accepts_intact_file() {
        let (_dir, path) = write_temp(&vec![7_u8; 200_000]);
        let meta = meta_for(&path, Some(65_536));
        assert_eq!(meta.piece_count(), 4);
        verify_integrity(&path, &meta).unwrap();
    }

    #[test]
    fn test_verify_rejects_corruption() {
        let (_dir, path) = write_temp(&vec![7_u8; 200_000]);
        let meta = meta_for(&path, Some(65_536));

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[70_000] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        match verify_integrity(&path, &meta) {
            Err(IntegrityError::ContentHashMismatch { .. }) => {}
            other => panic!("expected content hash mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_verify_rejects_wrong_size() {
        let (_dir, path) = write_temp(b"abcdef");
        let mut meta = meta_for(&path, None);
        meta.file_size = 5;
        assert!(matches!(
            verify_integrity(&path, &meta),
            Err(IntegrityError::SizeMismatch { expected: 5, actual: 6 })
        ));
    }

    #[test]
    fn test_verify_rejects_piece_count_drift() {
        let (_dir, path) = write_temp(&vec![1_u8; 150_000]);
        let mut meta = meta_for(&path, Some(65_536));
        // Drop one piece from the record; size check must be bypassed to
        // reach the piece comparison.
        meta.piece_hashes.truncate(meta.piece_hashes.len() - PIECE_HASH_HEX_LEN);
        meta.file_size = 0;
        assert!(matches!(
            verify_integrity(&path, &meta),
            Err(IntegrityError::PieceCountMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_skips_absent_checks() {
        let (_dir, path) = write_temp(b"anything");
        let meta = ResourceMetadata::new(
            ContentId::new("0123456789abcdef0123456789abcdef01234567").unwrap(),
            0,
            0,
            String::new(),
            String::new(),
            vec![],
        );
        verify_integrity(&path, &meta).unwrap();
    }

    #[test]
    fn test_case_insensitive_hash_comparison() {
        let (_dir, path) = write_temp(b"hello world");
        let mut meta = meta_for(&path, None);
        meta.content_hash_sha256 = meta.content_hash_sha256.to_uppercase();
        meta.piece_hashes = meta.piece_hashes.to_uppercase();
        verify_integrity(&path, &meta).unwrap();
    }
}
