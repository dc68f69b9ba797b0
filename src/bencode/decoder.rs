//! Decoding side of the Bencode codec.
//!
//! The decoder walks a byte slice with a cursor rather than an `io::Read`
//! stream: metainfo files and tracker responses are always fully buffered
//! before decoding (we need the whole `info` sub-tree intact to re-encode
//! it for the info hash), so there's no streaming benefit to paying for a
//! `Read` abstraction here.
use super::{BencodeError, BencodeResult, BencodeValue, MAX_DEPTH};
use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes a single Bencode value from `data`, erroring if anything but
/// whitespace-free trailing garbage follows it.
#[instrument(skip(data), level = "debug")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = decode_value(&mut cursor, 0)?;
    if cursor.pos != cursor.data.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> BencodeResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn next(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let idx = rest
            .iter()
            .position(|&b| b == delimiter)
            .ok_or(BencodeError::UnexpectedEof)?;
        let slice = &rest[..idx];
        self.pos += idx + 1;
        Ok(slice)
    }
}

fn decode_value(cursor: &mut Cursor, depth: usize) -> BencodeResult<BencodeValue> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::DepthExceeded(MAX_DEPTH));
    }
    match cursor.peek()? {
        b'0'..=b'9' => decode_bytes(cursor).map(BencodeValue::Bytes),
        b'i' => decode_integer(cursor).map(BencodeValue::Integer),
        b'l' => decode_list(cursor, depth).map(BencodeValue::List),
        b'd' => decode_dict(cursor, depth).map(BencodeValue::Dict),
        other => Err(BencodeError::UnknownTag(other)),
    }
}

/// Decodes a `<length>:<data>` byte-string.
fn decode_bytes(cursor: &mut Cursor) -> BencodeResult<Vec<u8>> {
    let len_bytes = cursor.take_until(b':')?;
    let len = parse_length(len_bytes)?;
    Ok(cursor.take(len)?.to_vec())
}

/// Parses the decimal length prefix of a byte-string. No leading zeros, no
/// sign, and it must be plain ASCII digits — this is stricter than the
/// integer grammar because a negative or zero-padded length makes no sense.
fn parse_length(bytes: &[u8]) -> BencodeResult<usize> {
    let s = std::str::from_utf8(bytes)
        .map_err(|_| BencodeError::InvalidStringLength(format!("{:?}", bytes)))?;
    if s.is_empty() || (s.len() > 1 && s.starts_with('0')) || s.starts_with('-') {
        return Err(BencodeError::InvalidStringLength(s.to_string()));
    }
    s.parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength(s.to_string()))
}

/// Decodes an `i<digits>e` integer, rejecting leading zeros, `-0`, and the
/// empty-body form `ie`.
fn decode_integer(cursor: &mut Cursor) -> BencodeResult<i64> {
    debug_assert_eq!(cursor.peek()?, b'i');
    cursor.next()?;
    let digits = cursor.take_until(b'e')?;
    let s = std::str::from_utf8(digits)
        .map_err(|_| BencodeError::InvalidInteger(format!("{:?}", digits)))?;

    if s.is_empty() {
        return Err(BencodeError::InvalidInteger(s.to_string()));
    }
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    if unsigned.is_empty() || (unsigned.len() > 1 && unsigned.starts_with('0')) {
        return Err(BencodeError::InvalidInteger(s.to_string()));
    }
    if s == "-0" {
        return Err(BencodeError::InvalidInteger(s.to_string()));
    }

    s.parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger(s.to_string()))
}

/// Decodes an `l<items>e` list.
fn decode_list(cursor: &mut Cursor, depth: usize) -> BencodeResult<Vec<BencodeValue>> {
    debug_assert_eq!(cursor.peek()?, b'l');
    cursor.next()?;
    let mut items = Vec::new();
    while cursor.peek()? != b'e' {
        items.push(decode_value(cursor, depth + 1)?);
    }
    cursor.next()?;
    Ok(items)
}

/// Decodes a `d<key><value>...e` mapping, rejecting keys that are not
/// strictly ascending (this also catches duplicates, since a duplicate key
/// is never strictly greater than the previous one).
fn decode_dict(cursor: &mut Cursor, depth: usize) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
    debug_assert_eq!(cursor.peek()?, b'd');
    cursor.next()?;
    let mut dict = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    while cursor.peek()? != b'e' {
        let key = decode_bytes(cursor)?;
        if let Some(prev) = &last_key {
            if key <= *prev {
                return Err(BencodeError::UnsortedOrDuplicateKeys(key));
            }
        }
        let value = decode_value(cursor, depth + 1)?;
        last_key = Some(key.clone());
        dict.insert(key, value);
    }
    cursor.next()?;
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        assert_eq!(decode(b"5:hello").unwrap(), BencodeValue::Bytes(b"hello".to_vec()));
    }

    #[test]
    fn decodes_zero_length_string() {
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::Bytes(vec![]));
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn rejects_malformed_integers() {
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i01e").is_err());
        assert!(decode(b"i-01e").is_err());
        assert!(decode(b"ie").is_err());
    }

    #[test]
    fn rejects_short_string() {
        assert!(matches!(decode(b"3:ab"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn decodes_list() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            BencodeValue::List(vec![
                BencodeValue::Bytes(b"spam".to_vec()),
                BencodeValue::Integer(42),
            ])
        );
    }

    #[test]
    fn decodes_dict() {
        let mut expected = BTreeMap::new();
        expected.insert(b"foo".to_vec(), BencodeValue::Bytes(b"bar".to_vec()));
        assert_eq!(decode(b"d3:foo3:bare").unwrap(), BencodeValue::Dict(expected));
    }

    #[test]
    fn rejects_unsorted_dict_keys() {
        assert!(matches!(
            decode(b"d1:b1:x1:a1:ye"),
            Err(BencodeError::UnsortedOrDuplicateKeys(_))
        ));
    }

    #[test]
    fn rejects_duplicate_dict_keys() {
        assert!(matches!(
            decode(b"d1:a1:x1:a1:ye"),
            Err(BencodeError::UnsortedOrDuplicateKeys(_))
        ));
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(matches!(decode(b"x"), Err(BencodeError::UnknownTag(b'x'))));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingBytes)));
    }
}
