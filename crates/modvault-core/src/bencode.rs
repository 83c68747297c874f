//! Canonical bencoding.
//!
//! Bencoding here is a deterministic serialization primitive: two processes
//! building the same value tree must produce byte-identical output, because
//! content identifiers are hashes of the encoded form. Dictionaries are kept
//! in raw-byte lexicographic key order (`BTreeMap<Vec<u8>, _>` gives this for
//! free) and the parser rejects any document that is not already canonical,
//! which makes `encode` and `parse` a bijection on the supported domain.

use std::collections::BTreeMap;

use thiserror::Error;

/// Error produced by the strict bencode parser.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof {
        /// Byte offset where input ran out.
        offset: usize,
    },

    /// A byte that cannot start or continue a value.
    #[error("invalid token 0x{byte:02x} at offset {offset}")]
    InvalidToken {
        /// The offending byte.
        byte: u8,
        /// Byte offset of the token.
        offset: usize,
    },

    /// Malformed integer literal (empty, leading zero, `-0`, or no digits).
    #[error("invalid integer literal at offset {offset}")]
    InvalidInteger {
        /// Byte offset of the literal.
        offset: usize,
    },

    /// Malformed byte-string length prefix.
    #[error("invalid string length at offset {offset}")]
    InvalidLength {
        /// Byte offset of the length prefix.
        offset: usize,
    },

    /// Dictionary keys out of raw-byte order or duplicated.
    #[error("dictionary keys not in canonical order at offset {offset}")]
    KeyOrder {
        /// Byte offset of the offending key.
        offset: usize,
    },

    /// Bytes remained after the document's single root value.
    #[error("trailing bytes after document end")]
    TrailingData,
}

/// A bencoded value.
///
/// Booleans are deliberately not representable; callers encode flags as the
/// integers `0` and `1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// `i<decimal>e`
    Integer(i64),
    /// `<len>:<bytes>`
    Bytes(Vec<u8>),
    /// `l<values>e`
    List(Vec<BencodeValue>),
    /// `d<key value pairs>e`, keys unique and sorted by raw bytes.
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Build a byte-string value from UTF-8 text.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Bytes(s.into().into_bytes())
    }

    /// Integer accessor.
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Byte-string accessor.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte-string accessor that additionally requires valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// List accessor.
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Dictionary accessor.
    pub const fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a dictionary entry by UTF-8 key.
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }

    /// Encode this value into canonical bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Integer(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Self::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Self::Dict(map) => {
                out.push(b'd');
                // BTreeMap iterates keys in raw-byte order, the canonical order.
                for (key, value) in map {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Parse a complete canonical bencode document.
    ///
    /// Rejects trailing bytes, non-canonical integers (`i-0e`, `i03e`) and
    /// out-of-order or duplicated dictionary keys, so every accepted input
    /// re-encodes to itself.
    pub fn parse(input: &[u8]) -> Result<Self, BencodeError> {
        let (value, consumed) = Self::parse_at(input, 0)?;
        if consumed != input.len() {
            return Err(BencodeError::TrailingData);
        }
        Ok(value)
    }

    fn parse_at(input: &[u8], offset: usize) -> Result<(Self, usize), BencodeError> {
        let byte = *input
            .get(offset)
            .ok_or(BencodeError::UnexpectedEof { offset })?;
        match byte {
            b'i' => Self::parse_integer(input, offset),
            b'0'..=b'9' => {
                let (bytes, next) = Self::parse_bytes(input, offset)?;
                Ok((Self::Bytes(bytes), next))
            }
            b'l' => {
                let mut items = Vec::new();
                let mut pos = offset + 1;
                loop {
                    match input.get(pos) {
                        Some(b'e') => return Ok((Self::List(items), pos + 1)),
                        Some(_) => {
                            let (item, next) = Self::parse_at(input, pos)?;
                            items.push(item);
                            pos = next;
                        }
                        None => return Err(BencodeError::UnexpectedEof { offset: pos }),
                    }
                }
            }
            b'd' => {
                let mut map = BTreeMap::new();
                let mut last_key: Option<Vec<u8>> = None;
                let mut pos = offset + 1;
                loop {
                    match input.get(pos) {
                        Some(b'e') => return Ok((Self::Dict(map), pos + 1)),
                        Some(_) => {
                            let key_offset = pos;
                            let (key, next) = Self::parse_bytes(input, pos)?;
                            if last_key.as_ref().is_some_and(|prev| *prev >= key) {
                                return Err(BencodeError::KeyOrder { offset: key_offset });
                            }
                            let (value, next) = Self::parse_at(input, next)?;
                            last_key = Some(key.clone());
                            map.insert(key, value);
                            pos = next;
                        }
                        None => return Err(BencodeError::UnexpectedEof { offset: pos }),
                    }
                }
            }
            _ => Err(BencodeError::InvalidToken { byte, offset }),
        }
    }

    fn parse_integer(input: &[u8], offset: usize) -> Result<(Self, usize), BencodeError> {
        // offset points at 'i'
        let mut pos = offset + 1;
        let start = pos;
        if input.get(pos) == Some(&b'-') {
            pos += 1;
        }
        while matches!(input.get(pos), Some(b'0'..=b'9')) {
            pos += 1;
        }
        match input.get(pos) {
            Some(b'e') => {}
            Some(_) | None => return Err(BencodeError::InvalidInteger { offset }),
        }
        let digits = &input[start..pos];
        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger { offset })?;
        // Canonical form: no empty digits, no "-0", no leading zeros.
        let canonical = match text.strip_prefix('-') {
            Some(rest) => !rest.is_empty() && rest != "0" && !rest.starts_with('0'),
            None => !text.is_empty() && (text == "0" || !text.starts_with('0')),
        };
        if !canonical {
            return Err(BencodeError::InvalidInteger { offset });
        }
        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger { offset })?;
        Ok((Self::Integer(value), pos + 1))
    }

    fn parse_bytes(input: &[u8], offset: usize) -> Result<(Vec<u8>, usize), BencodeError> {
        let mut pos = offset;
        while matches!(input.get(pos), Some(b'0'..=b'9')) {
            pos += 1;
        }
        if pos == offset || input.get(pos) != Some(&b':') {
            return Err(BencodeError::InvalidLength { offset });
        }
        let text = std::str::from_utf8(&input[offset..pos])
            .map_err(|_| BencodeError::InvalidLength { offset })?;
        // Reject non-canonical length prefixes like "07:".
        if text.len() > 1 && text.starts_with('0') {
            return Err(BencodeError::InvalidLength { offset });
        }
        let len: usize = text
            .parse()
            .map_err(|_| BencodeError::InvalidLength { offset })?;
        let start = pos + 1;
        let end = start
            .checked_add(len)
            .ok_or(BencodeError::InvalidLength { offset })?;
        if end > input.len() {
            return Err(BencodeError::UnexpectedEof { offset: input.len() });
        }
        Ok((input[start..end].to_vec(), end))
    }
}

/// Convenience builder for dictionaries with UTF-8 keys.
pub fn dict(entries: impl IntoIterator<Item = (&'static str, BencodeValue)>) -> BencodeValue {
    BencodeValue::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_integers() {
        assert_eq!(BencodeValue::Integer(0).encode(), b"i0e");
        assert_eq!(BencodeValue::Integer(42).encode(), b"i42e");
        assert_eq!(BencodeValue::Integer(-7).encode(), b"i-7e");
    }

    #[test]
    fn test_encode_bytes_and_list() {
        assert_eq!(BencodeValue::text("spam").encode(), b"4:spam");
        assert_eq!(BencodeValue::Bytes(vec![]).encode(), b"0:");

        let list = BencodeValue::List(vec![BencodeValue::text("a"), BencodeValue::Integer(1)]);
        assert_eq!(list.encode(), b"l1:ai1ee");
    }

    #[test]
    fn test_dict_keys_sorted_by_raw_bytes() {
        let value = dict([
            ("zeta", BencodeValue::Integer(1)),
            ("alpha", BencodeValue::Integer(2)),
            ("beta", BencodeValue::Integer(3)),
        ]);
        assert_eq!(value.encode(), b"d5:alphai2e4:betai3e4:zetai1ee");
    }

    #[test]
    fn test_round_trip_bijection() {
        let value = dict([
            ("files", BencodeValue::List(vec![BencodeValue::text("a.zip")])),
            ("length", BencodeValue::Integer(1_048_576)),
            (
                "nested",
                dict([("k", BencodeValue::Bytes(vec![0x00, 0xff, 0x10]))]),
            ),
        ]);
        let encoded = value.encode();
        let parsed = BencodeValue::parse(&encoded).unwrap();
        assert_eq!(parsed, value);
        assert_eq!(parsed.encode(), encoded);
    }

    #[test]
    fn test_parse_rejects_unsorted_dict() {
        assert_eq!(
            BencodeValue::parse(b"d1:bi1e1:ai2ee"),
            Err(BencodeError::KeyOrder { offset: 7 })
        );
    }

    #[test]
    fn test_parse_rejects_duplicate_key() {
        assert!(matches!(
            BencodeValue::parse(b"d1:ai1e1:ai2ee"),
            Err(BencodeError::KeyOrder { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_canonical_integers() {
        assert!(BencodeValue::parse(b"i-0e").is_err());
        assert!(BencodeValue::parse(b"i03e").is_err());
        assert!(BencodeValue::parse(b"ie").is_err());
    }

    #[test]
    fn test_parse_rejects_trailing_data() {
        assert_eq!(
            BencodeValue::parse(b"i1ei2e"),
            Err(BencodeError::TrailingData)
        );
    }

    #[test]
    fn test_parse_rejects_truncated_string() {
        assert!(matches!(
            BencodeValue::parse(b"10:short"),
            Err(BencodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_text_accessors() {
        let value = dict([("name", BencodeValue::text("mod.zip"))]);
        assert_eq!(value.get("name").and_then(BencodeValue::as_text), Some("mod.zip"));
        assert_eq!(value.get("missing"), None);
    }
}
