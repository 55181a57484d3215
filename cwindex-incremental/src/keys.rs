//! Storage key codec
//!
//! Contract storage keys are byte strings. Every part except the last is a
//! namespace, written as a 2-byte big-endian length followed by its bytes;
//! the last part is written raw. Numbers are 8-byte big-endian. The textual
//! form used throughout the engine is the decimal value of each byte, joined
//! with `,`.
//!
//! ```text
//! ["balance", "juno1a"]  ->  0,7,98,97,108,97,110,99,101,106,117,110,111,49,97
//! ```
//!
//! Because the text is a plain join, the encoding of a map prefix is a
//! textual prefix of every key under that map, which is what prefix
//! dependencies and map scans rely on.

use std::fmt;
use thiserror::Error;

/// Errors produced while encoding or decoding keys
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("no key parts given")]
    Empty,

    #[error("namespace of {0} bytes does not fit a 2-byte length prefix")]
    NamespaceTooLong(usize),

    #[error("invalid byte component {0:?}")]
    InvalidByte(String),

    #[error("length prefix truncated at byte {offset}")]
    TruncatedLength { offset: usize },

    #[error("namespace at byte {offset} declares {len} bytes but only {available} remain")]
    Truncated {
        offset: usize,
        len: usize,
        available: usize,
    },

    #[error("numeric key part must be 1 to 8 bytes, got {0}")]
    InvalidNumber(usize),

    #[error("key part {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    #[error("no part kinds given for decoding")]
    NoKinds,
}

/// One component of a storage key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Str(String),
    Num(u64),
    Bytes(Vec<u8>),
}

impl KeyPart {
    /// Raw bytes of this part, without any length prefix
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            KeyPart::Str(s) => s.as_bytes().to_vec(),
            KeyPart::Num(n) => n.to_be_bytes().to_vec(),
            KeyPart::Bytes(b) => b.clone(),
        }
    }

    pub fn kind(&self) -> KeyPartKind {
        match self {
            KeyPart::Str(_) => KeyPartKind::String,
            KeyPart::Num(_) => KeyPartKind::Number,
            KeyPart::Bytes(_) => KeyPartKind::Bytes,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Str(s) => f.write_str(s),
            KeyPart::Num(n) => write!(f, "{}", n),
            KeyPart::Bytes(b) => f.write_str(&from_bytes(b)),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Str(s)
    }
}

impl From<&String> for KeyPart {
    fn from(s: &String) -> Self {
        KeyPart::Str(s.clone())
    }
}

impl From<u64> for KeyPart {
    fn from(n: u64) -> Self {
        KeyPart::Num(n)
    }
}

impl From<Vec<u8>> for KeyPart {
    fn from(b: Vec<u8>) -> Self {
        KeyPart::Bytes(b)
    }
}

/// How to interpret a part when decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPartKind {
    String,
    Number,
    Bytes,
}

/// Encode key parts into the textual key form.
pub fn encode(parts: &[KeyPart]) -> Result<String, KeyError> {
    let (last, namespaces) = parts.split_last().ok_or(KeyError::Empty)?;
    let mut bytes = namespace_bytes(namespaces)?;
    bytes.extend(last.to_bytes());
    Ok(from_bytes(&bytes))
}

/// Encode the prefix shared by every key of a map named by `name`.
///
/// Every part of `name` is written as a namespace, followed by the
/// separator, so any key `encode(name ++ [k])` with a non-empty `k` starts
/// with the returned text.
pub fn encode_map_prefix(name: &[KeyPart]) -> Result<String, KeyError> {
    if name.is_empty() {
        return Err(KeyError::Empty);
    }
    let mut text = from_bytes(&namespace_bytes(name)?);
    text.push(',');
    Ok(text)
}

fn namespace_bytes(namespaces: &[KeyPart]) -> Result<Vec<u8>, KeyError> {
    let mut bytes = Vec::new();
    for part in namespaces {
        let raw = part.to_bytes();
        let len = u16::try_from(raw.len()).map_err(|_| KeyError::NamespaceTooLong(raw.len()))?;
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend(raw);
    }
    Ok(bytes)
}

/// Decode a textual key into typed parts.
///
/// Every kind but the last consumes one length-prefixed namespace; the last
/// kind consumes the remaining bytes.
pub fn decode_typed(text: &str, kinds: &[KeyPartKind]) -> Result<Vec<KeyPart>, KeyError> {
    let (last_kind, namespace_kinds) = kinds.split_last().ok_or(KeyError::NoKinds)?;
    let bytes = to_bytes(text)?;

    let mut parts = Vec::with_capacity(kinds.len());
    let mut offset = 0;
    for (index, kind) in namespace_kinds.iter().enumerate() {
        let len_bytes = bytes
            .get(offset..offset + 2)
            .ok_or(KeyError::TruncatedLength { offset })?;
        let len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
        let start = offset + 2;
        let raw = bytes.get(start..start + len).ok_or(KeyError::Truncated {
            offset,
            len,
            available: bytes.len().saturating_sub(start),
        })?;
        parts.push(typed_part(raw, *kind, index)?);
        offset = start + len;
    }

    parts.push(typed_part(&bytes[offset..], *last_kind, namespace_kinds.len())?);
    Ok(parts)
}

/// Decode a textual key, with `numeric[i]` selecting whether part `i` is a
/// number or a string.
pub fn decode(text: &str, numeric: &[bool]) -> Result<Vec<KeyPart>, KeyError> {
    let kinds: Vec<KeyPartKind> = numeric
        .iter()
        .map(|&n| {
            if n {
                KeyPartKind::Number
            } else {
                KeyPartKind::String
            }
        })
        .collect();
    decode_typed(text, &kinds)
}

fn typed_part(raw: &[u8], kind: KeyPartKind, index: usize) -> Result<KeyPart, KeyError> {
    match kind {
        KeyPartKind::String => String::from_utf8(raw.to_vec())
            .map(KeyPart::Str)
            .map_err(|_| KeyError::InvalidUtf8 { index }),
        KeyPartKind::Number => {
            if raw.is_empty() || raw.len() > 8 {
                return Err(KeyError::InvalidNumber(raw.len()));
            }
            let mut buf = [0u8; 8];
            buf[8 - raw.len()..].copy_from_slice(raw);
            Ok(KeyPart::Num(u64::from_be_bytes(buf)))
        }
        KeyPartKind::Bytes => Ok(KeyPart::Bytes(raw.to_vec())),
    }
}

/// Parse the textual form back into bytes.
pub fn to_bytes(text: &str) -> Result<Vec<u8>, KeyError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|component| {
            component
                .parse::<u8>()
                .map_err(|_| KeyError::InvalidByte(component.to_string()))
        })
        .collect()
}

/// Render bytes in the textual form.
pub fn from_bytes(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 4);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            text.push(',');
        }
        text.push_str(&byte.to_string());
    }
    text
}
