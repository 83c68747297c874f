//! Canonical content identification.
//!
//! A `ContentId` is the SHA-1 of the canonical-bencoded, whitelisted subset
//! of a resource's provider metadata plus its canonicalized primary URL. It
//! is a pure function of those inputs: file bytes, timestamps and transport
//! never participate, so two installations that resolve the same metadata
//! derive the same identifier and can find each other's cache entries.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::bencode::BencodeValue;
use crate::error::DownloadError;
use crate::metadata::{MetadataValue, ProviderMetadata};
use crate::urlnorm::normalize_url;

/// Deterministic 160-bit content identifier, lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Hex length of an identifier.
    pub const HEX_LEN: usize = 40;

    /// Validate and wrap a 40-character lowercase hex string.
    pub fn new(s: impl Into<String>) -> Result<Self, DownloadError> {
        let s = s.into();
        let valid = s.len() == Self::HEX_LEN
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s))
        } else {
            Err(DownloadError::unexpected(format!(
                "not a 40-char lowercase hex content id: {s:?}"
            )))
        }
    }

    /// Wrap a raw 20-byte SHA-1 digest.
    #[must_use]
    pub fn from_digest(digest: [u8; 20]) -> Self {
        Self(hex::encode(digest))
    }

    /// The full hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 32 hex characters, used for partial-file names.
    pub fn short_prefix(&self) -> &str {
        &self.0[..32]
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.0)
    }
}

/// Expected scalar kind of a whitelisted field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FieldKind {
    Text,
    Number,
}

/// Per-provider whitelists of metadata fields that participate in identity.
///
/// The whitelist is part of the public contract: adding or removing a field
/// changes every identifier derived for that provider.
fn whitelist_for(provider: &str) -> &'static [(&'static str, FieldKind)] {
    match provider {
        "nexus" => &[
            ("fileId", FieldKind::Number),
            ("fileName", FieldKind::Text),
            ("md5Hash", FieldKind::Text),
            ("size", FieldKind::Number),
            ("uploadedTimestamp", FieldKind::Number),
        ],
        "deadlystream" => &[
            ("changelogId", FieldKind::Text),
            ("fileId", FieldKind::Text),
            ("filePageId", FieldKind::Text),
            ("size", FieldKind::Number),
            ("updated", FieldKind::Text),
            ("version", FieldKind::Text),
        ],
        "mega" => &[
            ("hash", FieldKind::Text),
            ("mtime", FieldKind::Number),
            ("name", FieldKind::Text),
            ("nodeId", FieldKind::Text),
            ("size", FieldKind::Number),
        ],
        "direct" => &[
            ("contentLength", FieldKind::Number),
            ("etag", FieldKind::Text),
            ("fileName", FieldKind::Text),
            ("lastModified", FieldKind::Text),
            ("url", FieldKind::Text),
        ],
        // JS-gated and unknown providers carry no extra identity fields.
        _ => &[],
    }
}

/// Project a metadata value onto the kind the whitelist expects.
///
/// Missing string fields default to `""`, missing numeric fields to `0`;
/// mismatched kinds are coerced deterministically rather than rejected.
fn project(value: Option<&MetadataValue>, kind: FieldKind) -> BencodeValue {
    match (value, kind) {
        (Some(MetadataValue::Text(s)), FieldKind::Text) => BencodeValue::text(s.clone()),
        (Some(MetadataValue::Integer(i)), FieldKind::Text) => BencodeValue::text(i.to_string()),
        (Some(MetadataValue::Integer(i)), FieldKind::Number) => BencodeValue::Integer(*i),
        (Some(MetadataValue::Text(s)), FieldKind::Number) => {
            BencodeValue::Integer(s.parse().unwrap_or(0))
        }
        (Some(MetadataValue::Empty) | None, FieldKind::Text) => BencodeValue::text(""),
        (Some(MetadataValue::Empty) | None, FieldKind::Number) => BencodeValue::Integer(0),
    }
}

/// Derive the canonical content identifier for a metadata snapshot.
pub fn compute_content_id(
    metadata: &ProviderMetadata,
    primary_url: &str,
) -> Result<ContentId, DownloadError> {
    let provider = metadata.provider();

    let mut map: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
    map.insert(b"provider".to_vec(), BencodeValue::text(provider));
    map.insert(
        b"url_canonical".to_vec(),
        BencodeValue::text(normalize_url(primary_url, true)?),
    );
    for (key, kind) in whitelist_for(provider) {
        map.insert(
            key.as_bytes().to_vec(),
            project(metadata.get(key), *kind),
        );
    }

    let encoded = BencodeValue::Dict(map).encode();
    let digest = Sha1::digest(&encoded);
    Ok(ContentId::from_digest(digest.into()))
}

/// SHA-1 of the canonicalized URL (query preserved), lowercase hex.
///
/// Used as the cache key for downloads that never produced provider
/// metadata; it shares the `ContentId` keyspace.
pub fn url_hash(url: &str) -> Result<ContentId, DownloadError> {
    let normalized = normalize_url(url, false)?;
    let digest = Sha1::digest(normalized.as_bytes());
    Ok(ContentId::from_digest(digest.into()))
}
