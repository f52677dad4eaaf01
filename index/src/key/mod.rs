//! Index keys.
//!
//! A key is a sequence of parts compared lexicographically. Single-column
//! indexes use one-part keys; composite indexes declare an arity and store
//! keys of exactly that many parts.
//!
//! Range boundaries may be shorter than the declared arity. Such a prefix is
//! padded with [`KeyPart::AlwaysLess`] or [`KeyPart::AlwaysGreater`] so that a
//! search lands just before or just after every stored key sharing the
//! prefix. Sentinels only ever appear in search boundaries, never in stored
//! keys.

pub mod codec;

use std::cmp::Ordering;

pub use codec::{BinaryKeyCodec, Int64KeyCodec, KeyCodec, KeyCodecError};

/// A concrete key component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Scalar {
    /// Convert to `key_type` where a lossless conversion exists; otherwise
    /// return the value unchanged.
    #[must_use]
    pub fn coerce(self, key_type: KeyType) -> Self {
        match (self, key_type) {
            (Self::Text(text), KeyType::Int) => match text.trim().parse::<i64>() {
                Ok(value) => Self::Int(value),
                Err(_) => Self::Text(text),
            },
            (Self::Int(value), KeyType::Text) => Self::Text(value.to_string()),
            (Self::Bool(value), KeyType::Int) => Self::Int(i64::from(value)),
            (Self::Text(text), KeyType::Bytes) => Self::Bytes(text.into_bytes()),
            (other, _) => other,
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value:?}"),
            Self::Bytes(value) => write!(f, "0x{}", hex(value)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Declared type of a key column, used to normalize caller-supplied keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Bool,
    Int,
    Text,
    Bytes,
}

/// One part of a key.
///
/// Variant order is the comparison order: `AlwaysLess` sorts below every
/// concrete value and `AlwaysGreater` above.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    AlwaysLess,
    Value(Scalar),
    AlwaysGreater,
}

impl KeyPart {
    /// True for the two boundary sentinels.
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        matches!(self, Self::AlwaysLess | Self::AlwaysGreater)
    }
}

/// How to complete a boundary key shorter than the tree's arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialSearchMode {
    /// Leave the key as is.
    None,
    /// Pad with `AlwaysGreater`: the boundary sits after every key with this prefix.
    HighestBoundary,
    /// Pad with `AlwaysLess`: the boundary sits before every key with this prefix.
    LowestBoundary,
}

/// An ordered index key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    parts: Vec<KeyPart>,
}

impl Key {
    /// Build a key from concrete values.
    #[must_use]
    pub fn new(values: Vec<Scalar>) -> Self {
        Self {
            parts: values.into_iter().map(KeyPart::Value).collect(),
        }
    }

    /// Build a key from raw parts, sentinels included.
    #[must_use]
    pub const fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self { parts }
    }

    /// Single-part integer key.
    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::new(vec![Scalar::Int(value)])
    }

    /// Single-part text key.
    #[must_use]
    pub fn text(value: &str) -> Self {
        Self::new(vec![Scalar::Text(value.to_string())])
    }

    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Number of parts.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.parts.len()
    }

    /// True if any part is a sentinel.
    #[must_use]
    pub fn has_sentinel(&self) -> bool {
        self.parts.iter().any(KeyPart::is_sentinel)
    }

    /// Normalize each part against the declared column types.
    #[must_use]
    pub fn coerce(self, key_types: &[KeyType]) -> Self {
        let parts = self
            .parts
            .into_iter()
            .enumerate()
            .map(|(i, part)| match (part, key_types.get(i)) {
                (KeyPart::Value(value), Some(&key_type)) => KeyPart::Value(value.coerce(key_type)),
                (part, _) => part,
            })
            .collect();
        Self { parts }
    }

    /// Pad a boundary prefix up to `arity` parts according to `mode`.
    ///
    /// Keys of single-column trees, keys already at full arity, and mode
    /// [`PartialSearchMode::None`] are returned unchanged.
    #[must_use]
    pub fn pad(mut self, arity: usize, mode: PartialSearchMode) -> Self {
        if arity <= 1 || self.parts.len() >= arity {
            return self;
        }
        let filler = match mode {
            PartialSearchMode::None => return self,
            PartialSearchMode::HighestBoundary => KeyPart::AlwaysGreater,
            PartialSearchMode::LowestBoundary => KeyPart::AlwaysLess,
        };
        self.parts.resize(arity, filler);
        self
    }

    /// Compare against another key part by part.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<Vec<Scalar>> for Key {
    fn from(values: Vec<Scalar>) -> Self {
        Self::new(values)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let [KeyPart::Value(value)] = self.parts.as_slice() {
            return write!(f, "{value}");
        }
        write!(f, "(")?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match part {
                KeyPart::AlwaysLess => write!(f, "-inf")?,
                KeyPart::Value(value) => write!(f, "{value}")?,
                KeyPart::AlwaysGreater => write!(f, "+inf")?,
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composite(a: i64, b: &str) -> Key {
        Key::new(vec![Scalar::Int(a), Scalar::Text(b.to_string())])
    }

    #[test]
    fn test_sentinels_bracket_every_value() {
        let low = Key::from_parts(vec![
            KeyPart::Value(Scalar::Int(5)),
            KeyPart::AlwaysLess,
        ]);
        let high = Key::from_parts(vec![
            KeyPart::Value(Scalar::Int(5)),
            KeyPart::AlwaysGreater,
        ]);

        assert!(low < composite(5, ""));
        assert!(high > composite(5, "zzzz"));
        assert!(high < composite(6, ""));
        assert!(low > composite(4, "zzzz"));
    }

    #[test]
    fn test_pad_fills_to_arity() {
        let padded = Key::int(5).pad(3, PartialSearchMode::HighestBoundary);
        assert_eq!(padded.arity(), 3);
        assert_eq!(padded.parts()[1], KeyPart::AlwaysGreater);
        assert!(padded.has_sentinel());

        let padded = Key::int(5).pad(2, PartialSearchMode::LowestBoundary);
        assert_eq!(padded.parts()[1], KeyPart::AlwaysLess);
    }

    #[test]
    fn test_pad_leaves_full_and_single_column_keys() {
        let full = composite(1, "a");
        assert_eq!(full.clone().pad(2, PartialSearchMode::HighestBoundary), full);
        assert_eq!(
            Key::int(1).pad(1, PartialSearchMode::LowestBoundary),
            Key::int(1)
        );
        assert_eq!(Key::int(1).pad(2, PartialSearchMode::None), Key::int(1));
    }

    #[test]
    fn test_coerce_by_key_type() {
        let key = Key::new(vec![Scalar::Text("42".to_string()), Scalar::Int(7)])
            .coerce(&[KeyType::Int, KeyType::Text]);

        assert_eq!(
            key,
            Key::new(vec![Scalar::Int(42), Scalar::Text("7".to_string())])
        );
    }

    #[test]
    fn test_coerce_keeps_unconvertible_text() {
        let key = Key::text("abc").coerce(&[KeyType::Int]);
        assert_eq!(key, Key::text("abc"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Key::int(3).to_string(), "3");
        assert_eq!(composite(1, "a").to_string(), "(1, \"a\")");
        assert_eq!(
            Key::int(1)
                .pad(2, PartialSearchMode::LowestBoundary)
                .to_string(),
            "(1, -inf)"
        );
    }
}
