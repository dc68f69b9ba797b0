//! Bencode codec: a deterministic, byte-exact encoder/decoder for the
//! metainfo wire format and tracker responses.
//!
//! Four value kinds are supported: byte-strings, integers, ordered lists,
//! and ordered mappings whose keys are byte-strings in lexicographic
//! ascending order. We use `BTreeMap` for dicts so the sortedness the
//! format requires falls out of the type; the decoder still rejects
//! unsorted/duplicate input explicitly (BTreeMap would silently overwrite
//! a duplicate key, hiding a malformed-input error), and the encoder still
//! enforces sorted emission rather than trusting the map's iteration order.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// Nesting depth ceiling for lists/dicts, guarding against hostile or
/// pathologically deep input. 64 Ki matches the floor the protocol calls for.
pub const MAX_DEPTH: usize = 64 * 1024;

/// A decoded (or to-be-encoded) Bencode value.
///
/// Booleans have no representation: Bencode only has integers, and a
/// caller wanting boolean semantics encodes `0`/`1` itself.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

/// Errors that can occur while decoding or encoding a Bencode value.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer literal: {0}")]
    InvalidInteger(String),

    #[error("invalid byte-string length prefix: {0}")]
    InvalidStringLength(String),

    #[error("unknown leading byte: {0:#04x}")]
    UnknownTag(u8),

    #[error("dictionary keys must be strictly ascending and unique (offending key: {0:?})")]
    UnsortedOrDuplicateKeys(Vec<u8>),

    #[error("trailing bytes after decoded value")]
    TrailingBytes,

    #[error("nesting depth exceeded the {0} level limit")]
    DepthExceeded(usize),

    #[error("cannot encode type: {0}")]
    CannotEncodeType(&'static str),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
