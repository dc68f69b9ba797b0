//! Metainfo loading and validation.
//!
//! Reads a `.torrent` file, decodes it with the Bencode codec, validates the
//! required structure, computes the info hash, and builds the file/piece
//! tables the rest of the client works against. A `Metainfo` is immutable
//! once loaded — none of the download-time mutable state (which pieces are
//! complete, which blocks are in flight) lives here; that's the
//! scheduler's job.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::instrument;

use crate::bencode::{decoder, BencodeError, BencodeValue};

pub mod info_hash;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("malformed torrent file: {0}")]
    Malformed(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {0} has the wrong type")]
    WrongFieldType(&'static str),

    #[error("`pieces` length ({0}) is not a multiple of 20")]
    InvalidPiecesLength(usize),

    #[error("file sizes ({computed}) do not sum to the declared content length ({expected})")]
    SizeMismatch { computed: u64, expected: u64 },

    #[error("path component is not valid UTF-8: {0}")]
    InvalidPath(String),
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;

/// A single file within the torrent's content, as laid out on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent's destination root.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of this file within the concatenated content.
    pub offset: u64,
    /// Whether this file already existed on disk at load time.
    pub exists: bool,
}

/// An immutable, validated view of a `.torrent` file's metadata.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Flattened, tiered announce URL list (outer = tiers, in original order).
    pub announce_tiers: Vec<Vec<String>>,
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub last_piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub name: String,
    pub is_multi_file: bool,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<SystemTime>,
    pub private: bool,
}

impl Metainfo {
    /// Loads and validates a `.torrent` file from `path`, resolving file
    /// existence flags against `destination`.
    #[instrument(skip(destination), fields(path = %path.display()))]
    pub fn load(path: &Path, destination: &Path) -> MetainfoResult<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data, destination)
    }

    /// Parses already-read `.torrent` bytes.
    #[instrument(skip(data, destination), level = "debug")]
    pub fn parse(data: &[u8], destination: &Path) -> MetainfoResult<Self> {
        let root = decoder::decode(data)?;
        let root = root
            .as_dict()
            .ok_or_else(|| MetainfoError::Malformed("top level value is not a dictionary".into()))?;

        let announce_tiers = parse_announce_tiers(root)?;
        if announce_tiers.is_empty() {
            return Err(MetainfoError::MissingField("announce/announce-list"));
        }

        let info_value = root.get(b"info" as &[u8]).ok_or(MetainfoError::MissingField("info"))?;
        let info_hash = info_hash::calculate(info_value)?;
        let info = info_value
            .as_dict()
            .ok_or_else(|| MetainfoError::Malformed("info is not a dictionary".into()))?;

        let piece_length = get_integer(info, "piece length")? as u64;
        let pieces_blob = get_bytes(info, "pieces")?;
        if pieces_blob.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPiecesLength(pieces_blob.len()));
        }
        let pieces: Vec<[u8; 20]> = pieces_blob
            .chunks_exact(20)
            .map(|chunk| {
                let mut h = [0u8; 20];
                h.copy_from_slice(chunk);
                h
            })
            .collect();

        let private = matches!(info.get(b"private" as &[u8]), Some(BencodeValue::Integer(1)));
        let name = String::from_utf8(get_bytes(info, "name")?.to_vec())
            .map_err(|e| MetainfoError::InvalidPath(e.to_string()))?;

        let (files, is_multi_file) = build_files(info, &name, destination)?;

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let num_pieces = pieces.len();
        if piece_length == 0 {
            return Err(MetainfoError::Malformed("piece length must be positive".into()));
        }
        if num_pieces == 0 {
            return Err(MetainfoError::Malformed("pieces must contain at least one hash".into()));
        }

        // `last_piece_length` must be derived independently from
        // `total_length`/`piece_length`/`num_pieces` — not solved for from
        // the very equation it's meant to validate — otherwise the §3
        // invariant check is tautological and a torrent whose `pieces`
        // count doesn't actually match its content size sails through.
        let full_pieces_length = (num_pieces as u64 - 1)
            .checked_mul(piece_length)
            .ok_or_else(|| MetainfoError::Malformed("piece length * num_pieces overflows".into()))?;
        if total_length < full_pieces_length {
            return Err(MetainfoError::SizeMismatch {
                computed: total_length,
                expected: full_pieces_length,
            });
        }
        let last_piece_length = total_length - full_pieces_length;
        if last_piece_length == 0 || last_piece_length > piece_length {
            return Err(MetainfoError::SizeMismatch {
                computed: total_length,
                expected: full_pieces_length + piece_length,
            });
        }

        let comment = get_optional_string(root, "comment");
        let created_by = get_optional_string(root, "created by");
        let creation_date = match root.get(b"creation date" as &[u8]) {
            Some(BencodeValue::Integer(secs)) if *secs >= 0 => {
                Some(UNIX_EPOCH + std::time::Duration::from_secs(*secs as u64))
            }
            _ => None,
        };

        Ok(Metainfo {
            announce_tiers,
            info_hash,
            piece_length,
            last_piece_length,
            pieces,
            files,
            name,
            is_multi_file,
            comment,
            created_by,
            creation_date,
            private,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// The length of piece `index`, accounting for the shorter final piece.
    pub fn piece_length(&self, index: usize) -> u64 {
        if index + 1 == self.num_pieces() {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Resolves a piece index to the (file index, file-local offset, span
    /// length) triples it straddles, in order. A piece that sits entirely
    /// within one file yields a single entry.
    pub fn file_spans_for_piece(&self, index: usize) -> Vec<(usize, u64, u64)> {
        let piece_start = index as u64 * self.piece_length;
        let piece_end = piece_start + self.piece_length(index);
        let mut spans = Vec::new();
        for (file_index, file) in self.files.iter().enumerate() {
            let file_start = file.offset;
            let file_end = file_start + file.length;
            if file_end <= piece_start || file_start >= piece_end {
                continue;
            }
            let span_start = piece_start.max(file_start);
            let span_end = piece_end.min(file_end);
            spans.push((file_index, span_start - file_start, span_end - span_start));
        }
        spans
    }

    /// Walks every piece, re-reading its bytes from `destination` and
    /// comparing the SHA-1 against the expected hash. Returns a per-piece
    /// completeness vector the orchestrator seeds the scheduler with
    /// before starting the swarm, so a resumed download doesn't re-fetch
    /// data already present on disk.
    #[instrument(skip(self), fields(destination = %destination.display()))]
    pub fn verify_existing(&self, destination: &Path) -> MetainfoResult<Vec<bool>> {
        let mut handles: Vec<Option<std::fs::File>> = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let full_path = destination.join(&file.path);
            handles.push(std::fs::File::open(&full_path).ok());
        }

        let mut complete = Vec::with_capacity(self.num_pieces());
        for index in 0..self.num_pieces() {
            complete.push(self.verify_one_piece(index, &mut handles)?);
        }
        Ok(complete)
    }

    fn verify_one_piece(
        &self,
        index: usize,
        handles: &mut [Option<std::fs::File>],
    ) -> MetainfoResult<bool> {
        use std::io::{Read, Seek, SeekFrom};

        let expected_len = self.piece_length(index) as usize;
        let mut buffer = Vec::with_capacity(expected_len);
        for (file_index, file_offset, span_len) in self.file_spans_for_piece(index) {
            let Some(handle) = handles[file_index].as_mut() else {
                return Ok(false);
            };
            let mut chunk = vec![0u8; span_len as usize];
            if handle.seek(SeekFrom::Start(file_offset)).is_err() {
                return Ok(false);
            }
            if handle.read_exact(&mut chunk).is_err() {
                return Ok(false);
            }
            buffer.extend_from_slice(&chunk);
        }
        if buffer.len() != expected_len {
            return Ok(false);
        }

        let mut hasher = Sha1::new();
        hasher.update(&buffer);
        let digest = hasher.finalize();
        Ok(digest.as_slice() == self.pieces[index])
    }
}

fn get_bytes<'a>(dict: &'a std::collections::BTreeMap<Vec<u8>, BencodeValue>, key: &'static str) -> MetainfoResult<&'a [u8]> {
    match dict.get(key.as_bytes()) {
        Some(BencodeValue::Bytes(b)) => Ok(b),
        Some(_) => Err(MetainfoError::WrongFieldType(key)),
        None => Err(MetainfoError::MissingField(key)),
    }
}

fn get_integer(dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>, key: &'static str) -> MetainfoResult<i64> {
    match dict.get(key.as_bytes()) {
        Some(BencodeValue::Integer(i)) => Ok(*i),
        Some(_) => Err(MetainfoError::WrongFieldType(key)),
        None => Err(MetainfoError::MissingField(key)),
    }
}

fn get_optional_string(dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> Option<String> {
    match dict.get(key.as_bytes()) {
        Some(BencodeValue::Bytes(b)) => String::from_utf8(b.clone()).ok(),
        _ => None,
    }
}

fn parse_announce_tiers(
    root: &std::collections::BTreeMap<Vec<u8>, BencodeValue>,
) -> MetainfoResult<Vec<Vec<String>>> {
    if let Some(list_value) = root.get(b"announce-list" as &[u8]) {
        let tiers = list_value
            .as_list()
            .ok_or_else(|| MetainfoError::Malformed("announce-list is not a list".into()))?;
        let mut result = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let urls = tier
                .as_list()
                .ok_or_else(|| MetainfoError::Malformed("announce-list tier is not a list".into()))?;
            let mut tier_urls = Vec::with_capacity(urls.len());
            for url in urls {
                let bytes = url
                    .as_bytes()
                    .ok_or_else(|| MetainfoError::Malformed("tracker URL is not a string".into()))?;
                tier_urls.push(
                    String::from_utf8(bytes.to_vec()).map_err(|e| MetainfoError::InvalidPath(e.to_string()))?,
                );
            }
            result.push(tier_urls);
        }
        return Ok(result);
    }

    if let Some(BencodeValue::Bytes(announce)) = root.get(b"announce" as &[u8]) {
        let url = String::from_utf8(announce.clone()).map_err(|e| MetainfoError::InvalidPath(e.to_string()))?;
        return Ok(vec![vec![url]]);
    }

    Ok(Vec::new())
}

/// Builds the ordered file table with running offsets, and marks which
/// files already exist under `destination`.
fn build_files(
    info: &std::collections::BTreeMap<Vec<u8>, BencodeValue>,
    name: &str,
    destination: &Path,
) -> MetainfoResult<(Vec<FileEntry>, bool)> {
    if let Some(files_value) = info.get(b"files" as &[u8]) {
        let entries = files_value
            .as_list()
            .ok_or_else(|| MetainfoError::Malformed("files is not a list".into()))?;
        if entries.is_empty() {
            return Err(MetainfoError::Malformed("files list is empty".into()));
        }

        let mut files = Vec::with_capacity(entries.len());
        let mut offset = 0u64;
        let mut seen_paths = HashSet::new();
        for entry in entries {
            let dict = entry
                .as_dict()
                .ok_or_else(|| MetainfoError::Malformed("file entry is not a dictionary".into()))?;
            let length = get_integer(dict, "length")? as u64;
            let path_list = dict
                .get(b"path" as &[u8])
                .and_then(BencodeValue::as_list)
                .ok_or(MetainfoError::MissingField("path"))?;

            let mut rel_path = PathBuf::from(name);
            for component in path_list {
                let component = component
                    .as_bytes()
                    .ok_or_else(|| MetainfoError::Malformed("path component is not a string".into()))?;
                let component = std::str::from_utf8(component)
                    .map_err(|e| MetainfoError::InvalidPath(e.to_string()))?;
                rel_path.push(component);
            }

            if !seen_paths.insert(rel_path.clone()) {
                return Err(MetainfoError::Malformed(format!(
                    "duplicate file path: {}",
                    rel_path.display()
                )));
            }

            let exists = destination.join(&rel_path).is_file();
            files.push(FileEntry {
                path: rel_path,
                length,
                offset,
                exists,
            });
            offset += length;
        }
        Ok((files, true))
    } else {
        let length = get_integer(info, "length")? as u64;
        let path = PathBuf::from(name);
        let exists = destination.join(&path).is_file();
        Ok((
            vec![FileEntry {
                path,
                length,
                offset: 0,
                exists,
            }],
            false,
        ))
    }
}
