//! Descriptor building and parsing.
//!
//! A descriptor is the canonical bencoded document the mesh engine
//! understands: an `info` dictionary describing the file's pieces, wrapped
//! with optional tracker and provenance fields. The SHA-1 of the bencoded
//! `info` dictionary is the descriptor's identity on the mesh; it is a
//! different identifier from the metadata-derived content id and the two
//! never mix.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use chrono::Utc;
use sha1::{Digest, Sha1};
use unicode_normalization::UnicodeNormalization;

use modvault_core::bencode::BencodeValue;
use modvault_core::resource::determine_piece_size;
use modvault_core::{DownloadError, IntegrityData, ResourceMetadata};

/// Default tracker list attached to locally built descriptors.
pub const DEFAULT_TRACKERS: [&str; 3] = [
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.stealth.si:80/announce",
    "udp://exodus.desync.com:6969/announce",
];

/// SHA-1 of the bencoded `info` dictionary, lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InfoHash(String);

impl InfoHash {
    fn from_digest(digest: [u8; 20]) -> Self {
        Self(hex::encode(digest))
    }

    /// The full hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.0)
    }
}

/// Parsed or freshly built descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    /// File name, path-stripped and NFC-normalized.
    pub name: String,
    /// File length in bytes.
    pub length: u64,
    /// Piece length in bytes.
    pub piece_length: u32,
    /// Concatenated raw 20-byte SHA-1 piece hashes in file order.
    pub pieces: Vec<u8>,
    /// Tracker URLs, deduplicated, first occurrence wins.
    pub announce: Vec<String>,
    /// UTC seconds since epoch when the descriptor was built.
    pub creation_date: Option<i64>,
    /// Software that built the descriptor.
    pub created_by: Option<String>,
}

impl Descriptor {
    #[allow(clippy::cast_possible_wrap)]
    fn info_dict(&self) -> BencodeValue {
        let mut info: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
        info.insert(b"length".to_vec(), BencodeValue::Integer(self.length as i64));
        info.insert(b"name".to_vec(), BencodeValue::text(self.name.clone()));
        info.insert(
            b"piece length".to_vec(),
            BencodeValue::Integer(i64::from(self.piece_length)),
        );
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(self.pieces.clone()));
        // 0 marks the content as shareable with any peer.
        info.insert(b"private".to_vec(), BencodeValue::Integer(0));
        BencodeValue::Dict(info)
    }

    /// The descriptor's mesh identity.
    #[must_use]
    pub fn info_hash(&self) -> InfoHash {
        let digest = Sha1::digest(self.info_dict().encode());
        InfoHash::from_digest(digest.into())
    }

    /// Number of pieces described.
    #[must_use]
    pub const fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Serialize to canonical bencode.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut outer: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
        if let Some(first) = self.announce.first() {
            outer.insert(b"announce".to_vec(), BencodeValue::text(first.clone()));
        }
        if !self.announce.is_empty() {
            let tiers = self
                .announce
                .iter()
                .map(|t| BencodeValue::List(vec![BencodeValue::text(t.clone())]))
                .collect();
            outer.insert(b"announce-list".to_vec(), BencodeValue::List(tiers));
        }
        if let Some(created_by) = &self.created_by {
            outer.insert(b"created by".to_vec(), BencodeValue::text(created_by.clone()));
        }
        if let Some(date) = self.creation_date {
            outer.insert(b"creation date".to_vec(), BencodeValue::Integer(date));
        }
        outer.insert(b"info".to_vec(), self.info_dict());
        BencodeValue::Dict(outer).encode()
    }

    /// Parse a canonical bencoded descriptor.
    pub fn parse(bytes: &[u8]) -> Result<Self, DownloadError> {
        let value = BencodeValue::parse(bytes)
            .map_err(|e| DownloadError::unexpected(format!("malformed descriptor: {e}")))?;
        let info = value
            .get("info")
            .ok_or_else(|| DownloadError::unexpected("descriptor has no info dictionary"))?;

        let name = info
            .get("name")
            .and_then(BencodeValue::as_text)
            .ok_or_else(|| DownloadError::unexpected("descriptor has no name"))?
            .to_string();
        let length = info
            .get("length")
            .and_then(BencodeValue::as_integer)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| DownloadError::unexpected("descriptor has no length"))?;
        let piece_length = info
            .get("piece length")
            .and_then(BencodeValue::as_integer)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| DownloadError::unexpected("descriptor has no piece length"))?;
        let pieces = info
            .get("pieces")
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| DownloadError::unexpected("descriptor has no pieces"))?
            .to_vec();
        if pieces.len() % 20 != 0 {
            return Err(DownloadError::unexpected("piece hash stream not a multiple of 20"));
        }

        let announce = match value.get("announce-list").and_then(BencodeValue::as_list) {
            Some(tiers) => tiers
                .iter()
                .filter_map(BencodeValue::as_list)
                .flatten()
                .filter_map(BencodeValue::as_text)
                .map(str::to_string)
                .collect(),
            None => value
                .get("announce")
                .and_then(BencodeValue::as_text)
                .map(|t| vec![t.to_string()])
                .unwrap_or_default(),
        };

        Ok(Self {
            name,
            length,
            piece_length,
            pieces,
            announce,
            creation_date: value.get("creation date").and_then(BencodeValue::as_integer),
            created_by: value
                .get("created by")
                .and_then(BencodeValue::as_text)
                .map(str::to_string),
        })
    }

    /// Load a descriptor from disk.
    pub fn load(path: &Path) -> Result<Self, DownloadError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Write the descriptor to disk.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_bytes())
    }
}

/// Everything produced by one build: the descriptor, its mesh identity, the
/// matching verification record, and optionally the serialized document.
#[derive(Clone, Debug)]
pub struct DistributionPayload {
    /// The built descriptor.
    pub descriptor: Descriptor,
    /// SHA-1 of the bencoded `info` dictionary.
    pub info_hash: InfoHash,
    /// Integrity data computed during the same file walk.
    pub integrity: IntegrityData,
    /// Canonical bencoded descriptor, when requested.
    pub descriptor_bytes: Option<Vec<u8>>,
}

impl DistributionPayload {
    /// Build the verification record for a given content id.
    #[must_use]
    pub fn resource_metadata(&self, content_id: modvault_core::ContentId) -> ResourceMetadata {
        ResourceMetadata::new(
            content_id,
            self.descriptor.length,
            self.integrity.piece_length,
            self.integrity.piece_hashes.clone(),
            self.integrity.content_hash_sha256.clone(),
            self.descriptor.announce.clone(),
        )
    }
}

/// Builds descriptors from files on disk.
pub struct DistributionBuilder;

impl DistributionBuilder {
    /// Hash `file` and build its descriptor.
    ///
    /// `trackers` defaults to [`DEFAULT_TRACKERS`]; `piece_length` defaults
    /// to the size-derived candidate. This walks the whole file, so async
    /// callers run it inside `spawn_blocking`.
    pub fn build(
        file: &Path,
        trackers: Option<&[String]>,
        piece_length: Option<u32>,
        include_descriptor: bool,
    ) -> Result<DistributionPayload, DownloadError> {
        let file_size = std::fs::metadata(file)?.len();
        let piece_length = piece_length.unwrap_or_else(|| determine_piece_size(file_size));

        let (pieces, integrity) = hash_pieces(file, piece_length)?;

        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.nfc().collect::<String>())
            .ok_or_else(|| DownloadError::unexpected("file has no representable name"))?;

        let announce = dedup_trackers(trackers.unwrap_or(
            &DEFAULT_TRACKERS.map(str::to_string),
        ));

        let descriptor = Descriptor {
            name,
            length: file_size,
            piece_length,
            pieces,
            announce,
            creation_date: Some(Utc::now().timestamp()),
            created_by: Some(concat!("modvault/", env!("CARGO_PKG_VERSION")).to_string()),
        };
        let info_hash = descriptor.info_hash();
        let descriptor_bytes = include_descriptor.then(|| descriptor.to_bytes());

        Ok(DistributionPayload {
            descriptor,
            info_hash,
            integrity,
            descriptor_bytes,
        })
    }
}

/// Deduplicate and trim tracker URLs, first occurrence winning.
fn dedup_trackers(trackers: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    trackers
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

/// One pass over the file: raw piece digests plus the hex integrity data.
fn hash_pieces(path: &Path, piece_length: u32) -> Result<(Vec<u8>, IntegrityData), DownloadError> {
    use sha2::Digest as _;

    let mut file = File::open(path)?;
    let mut content_hasher = sha2::Sha256::new();
    let mut pieces: Vec<u8> = Vec::new();
    let mut piece_hex = String::new();
    let mut buffer = vec![0_u8; piece_length as usize];

    loop {
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let chunk = &buffer[..filled];
        content_hasher.update(chunk);
        let digest = Sha1::digest(chunk);
        pieces.extend_from_slice(&digest);
        piece_hex.push_str(&hex::encode(digest));
        if filled < buffer.len() {
            break;
        }
    }

    let integrity = IntegrityData {
        content_hash_sha256: format!("{:x}", content_hasher.finalize()),
        piece_length,
        piece_hashes: piece_hex,
    };
    Ok((pieces, integrity))
}
