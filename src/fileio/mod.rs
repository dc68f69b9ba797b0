//! File writer: resolves completed pieces to on-disk (file, offset) spans
//! and writes them, splitting a write across file boundaries when a piece
//! straddles more than one file.
//!
//! Writes are serialized behind a single async lock — `FileWriter._lock`
//! in the Python reference does the same with an `asyncio.Lock` around an
//! executor dispatch — so two pieces completing back-to-back never
//! interleave their writes to the same (possibly shared) file descriptor.
//! The actual blocking I/O runs on `tokio::task::spawn_blocking`, the
//! async equivalent of `run_in_executor(None, ...)`.
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::metainfo::Metainfo;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type WriterResult<T> = std::result::Result<T, WriterError>;

/// Open file handles for one torrent's content, created/truncated lazily
/// on first write. Lives behind `FileWriter`'s async lock.
struct OpenFiles {
    destination: PathBuf,
    paths: Vec<PathBuf>,
    handles: HashMap<usize, File>,
}

impl OpenFiles {
    fn open(&mut self, file_index: usize) -> WriterResult<&mut File> {
        if !self.handles.contains_key(&file_index) {
            let path = self.destination.join(&self.paths[file_index]);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| WriterError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|source| WriterError::Io { path, source })?;
            self.handles.insert(file_index, file);
        }
        Ok(self.handles.get_mut(&file_index).expect("just inserted"))
    }

    fn write_span(&mut self, file_index: usize, offset: u64, data: &[u8]) -> WriterResult<()> {
        let path = self.destination.join(&self.paths[file_index]);
        let file = self.open(file_index)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|source| WriterError::Io { path, source })?;
        Ok(())
    }
}

/// Owns the open file handles for one torrent's content and serializes
/// writes to them behind a single lock. Safe to share across peer tasks
/// via `Arc`.
pub struct FileWriter {
    lock: Mutex<OpenFiles>,
}

impl FileWriter {
    pub fn new(destination: &Path, metainfo: &Metainfo) -> Self {
        let paths = metainfo.files.iter().map(|f| f.path.clone()).collect();
        FileWriter {
            lock: Mutex::new(OpenFiles {
                destination: destination.to_path_buf(),
                paths,
                handles: HashMap::new(),
            }),
        }
    }

    /// Writes a complete, hash-verified piece to disk, splitting the write
    /// across file boundaries per `spans` (as produced by
    /// `Metainfo::file_spans_for_piece`). The blocking writes run on the
    /// blocking thread pool; only one piece's writes are in flight at a
    /// time thanks to the async lock, matching the ordering guarantee that
    /// a block acceptance completing a piece happens-before the writer
    /// observes it.
    #[instrument(skip(self, spans, data), fields(piece_index = piece_index))]
    pub async fn write_piece(
        &self,
        piece_index: usize,
        spans: Vec<(usize, u64, u64)>,
        data: Vec<u8>,
    ) -> WriterResult<()> {
        let mut guard = self.lock.lock().await;
        let owned = std::mem::replace(
            &mut *guard,
            OpenFiles {
                destination: PathBuf::new(),
                paths: Vec::new(),
                handles: HashMap::new(),
            },
        );

        let (result, restored) = tokio::task::spawn_blocking(move || {
            let mut owned = owned;
            let mut cursor = 0usize;
            let mut result = Ok(());
            for (file_index, file_offset, span_len) in &spans {
                let span_len = *span_len as usize;
                let chunk = &data[cursor..cursor + span_len];
                if let Err(e) = owned.write_span(*file_index, *file_offset, chunk) {
                    result = Err(e);
                    break;
                }
                cursor += span_len;
            }
            (result, owned)
        })
        .await
        .expect("writer blocking task panicked");

        *guard = restored;
        result
    }

    /// Flushes and closes every open file handle. Idempotent: calling it
    /// again on an already-closed writer is a no-op since the handle map
    /// is simply empty.
    pub async fn close(&self) -> WriterResult<()> {
        let mut guard = self.lock.lock().await;
        for (_, mut file) in guard.handles.drain() {
            let _ = file.flush();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encoder, BencodeValue};
    use std::collections::BTreeMap;

    fn two_file_metainfo() -> Metainfo {
        let mut files = Vec::new();
        for (name, len) in [("a.bin", 10i64), ("b.bin", 10i64)] {
            let mut f = BTreeMap::new();
            f.insert(b"length".to_vec(), BencodeValue::Integer(len));
            f.insert(
                b"path".to_vec(),
                BencodeValue::List(vec![BencodeValue::Bytes(name.as_bytes().to_vec())]),
            );
            files.push(BencodeValue::Dict(f));
        }
        let mut info = BTreeMap::new();
        info.insert(b"files".to_vec(), BencodeValue::List(files));
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"multi".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(8));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(vec![0u8; 60]));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), BencodeValue::Bytes(b"http://x".to_vec()));
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encoder::encode(&BencodeValue::Dict(root)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        Metainfo::parse(&bytes, dir.path()).unwrap()
    }

    #[tokio::test]
    async fn splits_a_piece_across_a_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let meta = two_file_metainfo();
        let writer = FileWriter::new(dir.path(), &meta);

        // Piece 1 = bytes [8, 16): last 2 bytes of a.bin, first 6 of b.bin.
        let spans = meta.file_spans_for_piece(1);
        let piece1_data: Vec<u8> = (8u8..16u8).collect();
        writer.write_piece(1, spans, piece1_data).await.unwrap();
        writer.close().await.unwrap();

        let a = std::fs::read(dir.path().join("multi/a.bin")).unwrap();
        let b = std::fs::read(dir.path().join("multi/b.bin")).unwrap();
        assert_eq!(a[8..10], [8, 9]);
        assert_eq!(b[0..6], [10, 11, 12, 13, 14, 15]);
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let meta = two_file_metainfo();
        let writer = FileWriter::new(dir.path(), &meta);
        let spans = meta.file_spans_for_piece(0);
        writer.write_piece(0, spans, vec![1u8; 8]).await.unwrap();
        assert!(dir.path().join("multi").is_dir());
    }
}
