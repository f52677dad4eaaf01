//! Key serialization.
//!
//! Buckets store keys as opaque byte strings and ask a [`KeyCodec`] how long
//! an encoded key is and how to turn it back into a [`Key`]. Ordering always
//! happens on decoded keys.
//!
//! # Binary format
//!
//! [`BinaryKeyCodec`] writes one byte with the part count, then per part a
//! type tag followed by the value:
//!
//! ```text
//! [count: u8] ([tag: u8] [value])*
//!
//! tag 1  bool   1 byte (0 or 1)
//! tag 2  int    8 bytes, little-endian i64
//! tag 3  text   u16 length + UTF-8 bytes
//! tag 4  bytes  u16 length + raw bytes
//! ```

use std::cmp::Ordering;

use crate::key::{Key, KeyPart, KeyType, Scalar};

const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BYTES: u8 = 4;

/// Errors from encoding or decoding keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCodecError {
    /// Input ended before the key was complete.
    Truncated,
    /// Unknown part type tag.
    UnknownTag(u8),
    /// Boundary sentinels cannot be stored.
    SentinelNotSerializable,
    /// A text or bytes part exceeds `u16::MAX` bytes.
    PartTooLong(usize),
    /// More parts than fit in the count byte.
    TooManyParts(usize),
    /// Stored text is not valid UTF-8.
    InvalidUtf8,
    /// The codec cannot represent this key shape.
    UnsupportedKey(String),
}

impl std::fmt::Display for KeyCodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "encoded key is truncated"),
            Self::UnknownTag(tag) => write!(f, "unknown key part tag {tag}"),
            Self::SentinelNotSerializable => {
                write!(f, "boundary sentinels cannot be serialized")
            }
            Self::PartTooLong(len) => write!(f, "key part of {len} bytes is too long"),
            Self::TooManyParts(count) => write!(f, "key has too many parts ({count})"),
            Self::InvalidUtf8 => write!(f, "key text is not valid UTF-8"),
            Self::UnsupportedKey(key) => write!(f, "codec cannot encode key {key}"),
        }
    }
}

impl std::error::Error for KeyCodecError {}

/// Converts keys to and from their stored byte form.
pub trait KeyCodec: Send + Sync {
    /// Encode a key.
    fn serialize(&self, key: &Key) -> Result<Vec<u8>, KeyCodecError>;

    /// Decode a key from the start of `bytes`. Trailing bytes are ignored.
    fn deserialize(&self, bytes: &[u8]) -> Result<Key, KeyCodecError>;

    /// Length of the encoded key at the start of `bytes`.
    fn encoded_size(&self, bytes: &[u8]) -> Result<usize, KeyCodecError>;

    /// Length `key` would have once encoded.
    fn size(&self, key: &Key) -> Result<usize, KeyCodecError> {
        self.serialize(key).map(|bytes| bytes.len())
    }

    /// Encoded length shared by every key, for fixed-width codecs.
    fn fixed_length(&self) -> Option<usize> {
        None
    }

    /// Normalize a caller-supplied key against the declared column types.
    fn preprocess(&self, key: Key, key_types: Option<&[KeyType]>) -> Key {
        match key_types {
            Some(key_types) => key.coerce(key_types),
            None => key,
        }
    }

    /// Total order used by the tree.
    fn compare(&self, a: &Key, b: &Key) -> Ordering {
        a.compare(b)
    }
}

/// Self-describing codec for keys of any arity.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryKeyCodec;

impl BinaryKeyCodec {
    fn encode_variable(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) -> Result<(), KeyCodecError> {
        let len = u16::try_from(bytes.len()).map_err(|_| KeyCodecError::PartTooLong(bytes.len()))?;
        out.push(tag);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(bytes);
        Ok(())
    }
}

/// Borrow `len` bytes at `offset`, failing on short input.
fn take(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8], KeyCodecError> {
    bytes
        .get(offset..offset + len)
        .ok_or(KeyCodecError::Truncated)
}

fn variable_len(bytes: &[u8], offset: usize) -> Result<usize, KeyCodecError> {
    let len = take(bytes, offset, 2)?;
    Ok(usize::from(u16::from_le_bytes([len[0], len[1]])))
}

impl KeyCodec for BinaryKeyCodec {
    fn serialize(&self, key: &Key) -> Result<Vec<u8>, KeyCodecError> {
        let count =
            u8::try_from(key.arity()).map_err(|_| KeyCodecError::TooManyParts(key.arity()))?;
        let mut out = vec![count];
        for part in key.parts() {
            let KeyPart::Value(value) = part else {
                return Err(KeyCodecError::SentinelNotSerializable);
            };
            match value {
                Scalar::Bool(b) => {
                    out.push(TAG_BOOL);
                    out.push(u8::from(*b));
                }
                Scalar::Int(i) => {
                    out.push(TAG_INT);
                    out.extend_from_slice(&i.to_le_bytes());
                }
                Scalar::Text(text) => Self::encode_variable(&mut out, TAG_TEXT, text.as_bytes())?,
                Scalar::Bytes(bytes) => Self::encode_variable(&mut out, TAG_BYTES, bytes)?,
            }
        }
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Key, KeyCodecError> {
        let count = take(bytes, 0, 1)?[0];
        let mut offset = 1;
        let mut values = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let tag = take(bytes, offset, 1)?[0];
            offset += 1;
            let value = match tag {
                TAG_BOOL => {
                    let b = take(bytes, offset, 1)?[0];
                    offset += 1;
                    Scalar::Bool(b != 0)
                }
                TAG_INT => {
                    let raw = take(bytes, offset, 8)?;
                    offset += 8;
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(raw);
                    Scalar::Int(i64::from_le_bytes(buf))
                }
                TAG_TEXT | TAG_BYTES => {
                    let len = variable_len(bytes, offset)?;
                    let raw = take(bytes, offset + 2, len)?.to_vec();
                    offset += 2 + len;
                    if tag == TAG_TEXT {
                        Scalar::Text(String::from_utf8(raw).map_err(|_| KeyCodecError::InvalidUtf8)?)
                    } else {
                        Scalar::Bytes(raw)
                    }
                }
                other => return Err(KeyCodecError::UnknownTag(other)),
            };
            values.push(value);
        }
        Ok(Key::new(values))
    }

    fn encoded_size(&self, bytes: &[u8]) -> Result<usize, KeyCodecError> {
        let count = take(bytes, 0, 1)?[0];
        let mut offset = 1;
        for _ in 0..count {
            let tag = take(bytes, offset, 1)?[0];
            offset += 1;
            offset += match tag {
                TAG_BOOL => 1,
                TAG_INT => 8,
                TAG_TEXT | TAG_BYTES => 2 + variable_len(bytes, offset)?,
                other => return Err(KeyCodecError::UnknownTag(other)),
            };
        }
        if offset > bytes.len() {
            return Err(KeyCodecError::Truncated);
        }
        Ok(offset)
    }

    fn size(&self, key: &Key) -> Result<usize, KeyCodecError> {
        let mut size = 1;
        for part in key.parts() {
            size += match part {
                KeyPart::Value(Scalar::Bool(_)) => 2,
                KeyPart::Value(Scalar::Int(_)) => 9,
                KeyPart::Value(Scalar::Text(text)) => 3 + text.len(),
                KeyPart::Value(Scalar::Bytes(bytes)) => 3 + bytes.len(),
                KeyPart::AlwaysLess | KeyPart::AlwaysGreater => {
                    return Err(KeyCodecError::SentinelNotSerializable);
                }
            };
        }
        Ok(size)
    }
}

/// Fixed-width codec for single-part integer keys: 8 bytes, little-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int64KeyCodec;

impl KeyCodec for Int64KeyCodec {
    fn serialize(&self, key: &Key) -> Result<Vec<u8>, KeyCodecError> {
        match key.parts() {
            [KeyPart::Value(Scalar::Int(value))] => Ok(value.to_le_bytes().to_vec()),
            parts if parts.iter().any(KeyPart::is_sentinel) => {
                Err(KeyCodecError::SentinelNotSerializable)
            }
            _ => Err(KeyCodecError::UnsupportedKey(key.to_string())),
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Key, KeyCodecError> {
        let raw = take(bytes, 0, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(Key::int(i64::from_le_bytes(buf)))
    }

    fn encoded_size(&self, bytes: &[u8]) -> Result<usize, KeyCodecError> {
        take(bytes, 0, 8).map(<[u8]>::len)
    }

    fn size(&self, key: &Key) -> Result<usize, KeyCodecError> {
        self.serialize(key).map(|_| 8)
    }

    fn fixed_length(&self) -> Option<usize> {
        Some(8)
    }

    fn preprocess(&self, key: Key, _key_types: Option<&[KeyType]>) -> Key {
        key.coerce(&[KeyType::Int])
    }
}
