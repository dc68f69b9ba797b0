//! Computes the info hash: SHA-1 of the canonical re-encoding of the
//! `info` sub-tree. The Bencode encoder's canonicalization (§4.1) is what
//! guarantees this matches what every other client computes for the same
//! `.torrent` file, byte for byte.
use crate::bencode::{encoder, BencodeValue};
use sha1::{Digest, Sha1};

use super::MetainfoError;

pub fn calculate(info: &BencodeValue) -> Result<[u8; 20], MetainfoError> {
    let encoded = encoder::encode(info)?;
    let mut hasher = Sha1::new();
    hasher.update(&encoded);
    let digest = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&digest);
    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hashes_the_canonical_encoding() {
        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), BencodeValue::Integer(5));
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"hi.txt".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(vec![0u8; 20]));
        let value = BencodeValue::Dict(info);

        let expected = {
            let encoded = encoder::encode(&value).unwrap();
            let mut hasher = Sha1::new();
            hasher.update(&encoded);
            hasher.finalize()
        };

        assert_eq!(calculate(&value).unwrap()[..], expected[..]);
    }
}
