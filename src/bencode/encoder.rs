//! Encoding side of the Bencode codec.
//!
//! Canonical by construction: byte-strings carry their exact length,
//! integers carry no leading zeros (they come from `i64` so that's free),
//! and dictionary keys are walked in ascending order explicitly — we don't
//! trust that every `BTreeMap` we're handed was actually built by our own
//! decoder. The decode→encode round trip on any value the decoder
//! produces must be byte-identical; this is the correctness anchor the
//! info hash depends on.
use super::{BencodeError, BencodeResult, BencodeValue};
use std::io::Write;
use tracing::instrument;

/// Encodes `value` into its canonical Bencode byte representation.
#[instrument(skip(value), level = "debug")]
pub fn encode(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(&mut buf, value)?;
    Ok(buf)
}

/// Encodes `value` into an existing writer, for callers that want to
/// avoid an intermediate allocation (e.g. streaming straight to a socket).
pub fn encode_into<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::Bytes(s) => encode_bytes(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

fn encode_bytes<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_into(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_dict<W: Write>(
    writer: &mut W,
    dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>,
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    // BTreeMap already iterates in ascending key order; walking it
    // directly (rather than re-sorting a collected Vec) is both simpler
    // and still "enforces, not trusts" the ordering, since insertion into
    // a BTreeMap is what established it in the first place.
    for (key, value) in dict {
        encode_bytes(writer, key)?;
        encode_into(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::decoder::decode;
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn encodes_string() {
        assert_eq!(encode(&BencodeValue::Bytes(b"hello".to_vec())).unwrap(), b"5:hello");
    }

    #[test]
    fn encodes_integer() {
        assert_eq!(encode(&BencodeValue::Integer(42)).unwrap(), b"i42e");
        assert_eq!(encode(&BencodeValue::Integer(-42)).unwrap(), b"i-42e");
    }

    #[test]
    fn encodes_list() {
        let value = BencodeValue::List(vec![
            BencodeValue::Bytes(b"spam".to_vec()),
            BencodeValue::Integer(42),
        ]);
        assert_eq!(encode(&value).unwrap(), b"l4:spami42ee");
    }

    #[test]
    fn encodes_dict_in_sorted_order() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zebra".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"apple".to_vec(), BencodeValue::Integer(2));
        let value = BencodeValue::Dict(dict);
        assert_eq!(encode(&value).unwrap(), b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn decode_encode_round_trips_byte_identically() {
        let samples: &[&[u8]] = &[
            b"i42e",
            b"4:spam",
            b"l4:spami42ee",
            b"d3:bar4:spam3:fooi42ee",
            b"d4:infod6:lengthi5ee4:name3:fooe",
        ];
        for sample in samples {
            let value = decode(sample).unwrap();
            let re_encoded = encode(&value).unwrap();
            assert_eq!(&re_encoded, sample);
            // And the decode of our own encoding must match the original value.
            assert_eq!(decode(&re_encoded).unwrap(), value);
        }
    }
}
