//! Provider metadata model.
//!
//! Metadata returned by a provider handler is a flat mapping from field name
//! to a scalar. The value type is a closed tagged variant so downstream code
//! never relies on dynamic typing; the map participates in content-identifier
//! derivation, which is why insertion order is irrelevant (keys are kept
//! sorted) and values are immutable once the handler returns them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bencode::BencodeValue;

/// A single metadata scalar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataValue {
    /// A UTF-8 string field.
    Text(String),
    /// An integral field (sizes, timestamps, numeric ids).
    Integer(i64),
    /// Present but valueless.
    Empty,
}

impl MetadataValue {
    /// Text accessor.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer accessor.
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Whether this is the empty scalar.
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Canonical bencode form: text and empty become byte strings, integers
    /// stay integers.
    pub fn to_bencode(&self) -> BencodeValue {
        match self {
            Self::Text(s) => BencodeValue::text(s.clone()),
            Self::Integer(i) => BencodeValue::Integer(*i),
            Self::Empty => BencodeValue::Bytes(Vec::new()),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<u64> for MetadataValue {
    fn from(i: u64) -> Self {
        Self::Integer(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

/// Normalized metadata for one downloadable resource.
///
/// Always contains a `provider` field; the remaining recognized fields are
/// whitelisted per provider during content-identifier derivation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderMetadata {
    fields: BTreeMap<String, MetadataValue>,
}

impl ProviderMetadata {
    /// Field name under which the provider key is stored.
    pub const PROVIDER_FIELD: &'static str = "provider";

    /// Create metadata for the given provider key.
    pub fn new(provider: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            Self::PROVIDER_FIELD.to_string(),
            MetadataValue::Text(provider.into()),
        );
        Self { fields }
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.fields.get(key)
    }

    /// The provider key, or `""` when absent.
    pub fn provider(&self) -> &str {
        self.get(Self::PROVIDER_FIELD)
            .and_then(MetadataValue::as_text)
            .unwrap_or("")
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the map holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}
