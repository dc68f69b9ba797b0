//! Piece scheduler (§4.6): request planning, block accounting, hash
//! verification, and completion tracking. One scheduler is shared by
//! every peer connection for a single download; all of its methods are
//! short, synchronous, and lock-protected, matching the single
//! event-loop-thread mutation model of §5 even though peer tasks
//! themselves run concurrently under tokio.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::fileio::FileWriter;
use crate::metainfo::Metainfo;
use crate::peer::connection::{PeerId, SchedulerHandle};

pub const BLOCK_LEN: u32 = 16 * 1024;

/// A piece resetting this many times (hash mismatches) is treated as a
/// fatal download error — see §7.
pub const MAX_RESETS_PER_PIECE: u32 = 3;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("piece {0} failed hash verification {1} times, giving up")]
    TooManyResets(usize, u32),

    #[error(transparent)]
    Writer(#[from] crate::fileio::WriterError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceState {
    Empty,
    Downloading,
    Complete,
}

/// A piece's in-progress download state: its block bitmap, receive
/// buffer, and next-unrequested-offset cursor.
struct Piece {
    index: usize,
    length: usize,
    num_blocks: usize,
    block_present: Vec<bool>,
    buffer: Vec<u8>,
    cursor: usize,
    state: PieceState,
    reset_count: u32,
}

impl Piece {
    fn new(index: usize, length: usize) -> Self {
        let num_blocks = length.div_ceil(BLOCK_LEN as usize);
        Piece {
            index,
            length,
            num_blocks,
            block_present: vec![false; num_blocks],
            buffer: vec![0u8; length],
            cursor: 0,
            state: PieceState::Empty,
            reset_count: 0,
        }
    }

    fn block_len(&self, block_index: usize) -> usize {
        let start = block_index * BLOCK_LEN as usize;
        (self.length - start).min(BLOCK_LEN as usize)
    }

    /// Returns the next unrequested block's (begin, length), advancing
    /// the cursor, or `None` if every block has already been requested.
    fn next_block(&mut self) -> Option<(u32, u32)> {
        if self.cursor >= self.num_blocks {
            return None;
        }
        let block_index = self.cursor;
        self.cursor += 1;
        Some((
            (block_index * BLOCK_LEN as usize) as u32,
            self.block_len(block_index) as u32,
        ))
    }

    /// Writes `data` at `begin` into the piece buffer, returning `false`
    /// (without touching the buffer) if the offset/length don't fit inside
    /// this piece. A peer can pass the `pending_requests` key check and
    /// still send an oversized `piece` payload — nothing in the wire codec
    /// caps block length — so this must reject rather than panic.
    fn accept_block(&mut self, begin: u32, data: &[u8]) -> bool {
        let start = begin as usize;
        let Some(end) = start.checked_add(data.len()) else {
            return false;
        };
        if end > self.length {
            return false;
        }
        let block_index = start / BLOCK_LEN as usize;
        if block_index >= self.num_blocks {
            return false;
        }
        self.buffer[start..end].copy_from_slice(data);
        self.block_present[block_index] = true;
        if self.state == PieceState::Empty {
            self.state = PieceState::Downloading;
        }
        true
    }

    fn is_fully_received(&self) -> bool {
        self.block_present.iter().all(|&b| b)
    }

    fn reset(&mut self) {
        self.block_present.fill(false);
        self.buffer.fill(0);
        self.cursor = 0;
        self.state = PieceState::Empty;
        self.reset_count += 1;
    }
}

struct SchedulerState {
    piece_peers: Vec<HashSet<PeerId>>,
    downloading: HashMap<usize, Piece>,
    completed: HashSet<usize>,
    pending_requests: HashSet<(usize, u32)>,
    expected_hashes: Vec<[u8; 20]>,
    piece_length: u64,
    last_piece_length: u64,
    num_pieces: usize,
}

impl SchedulerState {
    fn piece_len(&self, index: usize) -> usize {
        if index + 1 == self.num_pieces {
            self.last_piece_length as usize
        } else {
            self.piece_length as usize
        }
    }

    fn next_piece_index_for_peer(&self, peer: PeerId, start: Option<usize>) -> Option<usize> {
        let start = start.map(|s| s + 1).unwrap_or(0);

        // Step 1: a piece already downloading that this peer has.
        let mut downloading_indices: Vec<usize> = self.downloading.keys().copied().collect();
        downloading_indices.sort_unstable();
        for index in downloading_indices {
            if index >= start && self.piece_peers[index].contains(&peer) {
                return Some(index);
            }
        }

        // Step 2: the lowest-index piece the peer has that isn't
        // downloaded or downloading yet.
        for index in start..self.num_pieces {
            if self.completed.contains(&index) || self.downloading.contains_key(&index) {
                continue;
            }
            if self.piece_peers[index].contains(&peer) {
                return Some(index);
            }
        }

        None
    }

    fn is_complete(&self) -> bool {
        self.completed.len() == self.num_pieces
    }
}

/// Shared scheduler state plus the pieces of the download it needs to
/// talk to: the writer (to persist verified pieces) and a notifier the
/// orchestrator awaits for overall completion.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    writer: Arc<FileWriter>,
    metainfo: Arc<Metainfo>,
    completed_count: AtomicUsize,
    num_pieces: usize,
    done: Notify,
    /// The first fatal error encountered while finishing a piece (too
    /// many hash-mismatch resets, or a disk write failure — both fatal
    /// to the download per §7). Polled by the orchestrator after
    /// `wait_for_completion` returns without every piece present.
    fatal: Mutex<Option<SchedulerError>>,
    self_weak: std::sync::Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(metainfo: Arc<Metainfo>, writer: Arc<FileWriter>) -> Arc<Self> {
        let num_pieces = metainfo.num_pieces();
        let state = SchedulerState {
            piece_peers: vec![HashSet::new(); num_pieces],
            downloading: HashMap::new(),
            completed: HashSet::new(),
            pending_requests: HashSet::new(),
            expected_hashes: metainfo.pieces.clone(),
            piece_length: metainfo.piece_length,
            last_piece_length: metainfo.last_piece_length,
            num_pieces,
        };
        Arc::new_cyclic(|weak| Scheduler {
            state: Mutex::new(state),
            writer,
            metainfo,
            completed_count: AtomicUsize::new(0),
            num_pieces,
            done: Notify::new(),
            fatal: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    /// The first fatal error recorded by a background piece-finish task,
    /// if any. The orchestrator checks this after `wait_for_completion`
    /// returns in case it was woken by a failure rather than success.
    pub fn take_fatal_error(&self) -> Option<SchedulerError> {
        self.fatal.lock().unwrap().take()
    }

    /// Pre-marks pieces already verified present on disk (resume
    /// support, §4.2). Must be called before any peer connections start.
    pub fn mark_complete(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        state.completed.insert(index);
        self.completed_count.fetch_add(1, Ordering::SeqCst);
        if state.is_complete() {
            self.done.notify_waiters();
        }
    }

    pub fn remaining_length(&self) -> u64 {
        let state = self.state.lock().unwrap();
        (0..state.num_pieces)
            .filter(|i| !state.completed.contains(i))
            .map(|i| state.piece_len(i) as u64)
            .sum()
    }

    /// Bytes verified and written so far, the complement of
    /// [`Scheduler::remaining_length`] against the content's total length —
    /// what feeds the tracker's `downloaded` announce parameter.
    pub fn downloaded_length(&self) -> u64 {
        self.metainfo.total_length().saturating_sub(self.remaining_length())
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count.load(Ordering::SeqCst) == self.num_pieces
    }

    /// Resolves once every piece has been completed and verified.
    pub async fn wait_for_completion(&self) {
        if self.is_complete() {
            return;
        }
        self.done.notified().await;
    }

    /// Verifies a just-completed piece's hash, writing it to disk on a
    /// match or resetting it on a mismatch.
    async fn finish_piece(self: &Arc<Self>, index: usize) -> SchedulerResult<()> {
        let (data, expected, reset_count) = {
            let mut state = self.state.lock().unwrap();
            let piece = state
                .downloading
                .get(&index)
                .expect("finish_piece called for a piece not downloading");
            let data = piece.buffer.clone();
            let expected = state.expected_hashes[index];
            (data, expected, piece.reset_count)
        };

        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest = hasher.finalize();

        if digest.as_slice() == expected {
            let spans = self.metainfo.file_spans_for_piece(index);
            self.writer.write_piece(index, spans, data).await?;
            let mut state = self.state.lock().unwrap();
            state.downloading.remove(&index);
            state.completed.insert(index);
            let newly_complete = state.is_complete();
            drop(state);
            self.completed_count.fetch_add(1, Ordering::SeqCst);
            debug!(index, "piece verified and written");
            if newly_complete {
                self.done.notify_waiters();
            }
            Ok(())
        } else {
            let mut state = self.state.lock().unwrap();
            let piece = state.downloading.get_mut(&index).expect("still downloading");
            piece.reset();
            let new_reset_count = piece.reset_count;
            drop(state);
            warn!(index, attempts = new_reset_count, "piece hash mismatch, resetting");
            if reset_count + 1 >= MAX_RESETS_PER_PIECE {
                return Err(SchedulerError::TooManyResets(index, new_reset_count));
            }
            Ok(())
        }
    }
}

impl SchedulerHandle for Scheduler {
    fn on_bitfield(&self, peer: PeerId, bitfield: &[u8]) {
        let mut state = self.state.lock().unwrap();
        for index in 0..state.num_pieces {
            let byte = index / 8;
            let bit = 7 - (index % 8);
            let Some(&b) = bitfield.get(byte) else { break };
            if (b >> bit) & 1 == 1 {
                state.piece_peers[index].insert(peer);
            }
        }
    }

    fn on_have(&self, peer: PeerId, piece_index: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(set) = state.piece_peers.get_mut(piece_index as usize) {
            set.insert(peer);
        }
    }

    fn on_block(&self, peer: PeerId, index: u32, begin: u32, block: Bytes) -> bool {
        let index = index as usize;
        let key = (index, begin);

        let became_complete = {
            let mut state = self.state.lock().unwrap();
            if !state.pending_requests.remove(&key) {
                debug!(peer, index, begin, "dropping unrequested or duplicate block");
                return true;
            }
            let Some(piece) = state.downloading.get_mut(&index) else {
                debug!(peer, index, "dropping block for piece no longer downloading");
                return true;
            };
            if !piece.accept_block(begin, &block) {
                warn!(peer, index, begin, len = block.len(), "block does not fit its piece, rejecting");
                return false;
            }
            piece.is_fully_received()
        };

        if became_complete {
            self.spawn_finish(index);
        }
        true
    }

    fn next_request(&self, peer: PeerId) -> Option<(u32, u32, u32)> {
        let mut state = self.state.lock().unwrap();
        let mut start = None;
        loop {
            let piece_index = state.next_piece_index_for_peer(peer, start)?;
            let piece_len = state.piece_len(piece_index);
            let piece = state
                .downloading
                .entry(piece_index)
                .or_insert_with(|| Piece::new(piece_index, piece_len));

            match piece.next_block() {
                Some((begin, length)) => {
                    let key = (piece_index, begin);
                    if state.pending_requests.insert(key) {
                        return Some((piece_index as u32, begin, length));
                    }
                    // Already pending (shouldn't normally happen since
                    // cursor only advances forward); keep scanning.
                    start = Some(piece_index);
                }
                None => {
                    start = Some(piece_index);
                }
            }
        }
    }

    fn remove_peer(&self, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        for set in &mut state.piece_peers {
            set.remove(&peer);
        }
    }
}

impl Scheduler {
    /// Dispatches the blocking hash/write work for a just-completed
    /// piece onto the current async context. Peer connections call
    /// `on_block` synchronously (it's a plain trait method), so the
    /// actual verify-and-write happens on a spawned task; scheduler
    /// errors here are fatal to the download and are observed by the
    /// orchestrator via `take_fatal_error`.
    fn spawn_finish(&self, index: usize) {
        let Some(this) = self.self_weak.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(e) = this.finish_piece(index).await {
                warn!(error = %e, index, "fatal scheduler error");
                this.fatal.lock().unwrap().get_or_insert(e);
                this.done.notify_waiters();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encoder, BencodeValue};
    use std::collections::BTreeMap;

    fn single_piece_metainfo(data: &[u8]) -> (Arc<Metainfo>, tempfile::TempDir) {
        single_piece_metainfo_with_length(data, 16384)
    }

    fn single_piece_metainfo_with_length(data: &[u8], piece_length: i64) -> (Arc<Metainfo>, tempfile::TempDir) {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash = hasher.finalize().to_vec();

        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), BencodeValue::Integer(data.len() as i64));
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"hi.txt".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(hash));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), BencodeValue::Bytes(b"http://x".to_vec()));
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encoder::encode(&BencodeValue::Dict(root)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let meta = crate::metainfo::Metainfo::parse(&bytes, dir.path()).unwrap();
        (Arc::new(meta), dir)
    }

    fn scheduler_for(meta: Arc<Metainfo>, dir: &tempfile::TempDir) -> Arc<Scheduler> {
        let writer = Arc::new(FileWriter::new(dir.path(), &meta));
        Scheduler::new(meta, writer)
    }

    #[test]
    fn next_request_requires_peer_to_have_the_piece() {
        let (meta, dir) = single_piece_metainfo(b"hello");
        let scheduler = scheduler_for(meta, &dir);
        assert_eq!(scheduler.next_request(1), None);

        scheduler.on_bitfield(1, &[0b1000_0000]);
        assert_eq!(scheduler.next_request(1), Some((0, 0, 5)));
        // The whole (short) piece is one block; nothing left to request.
        assert_eq!(scheduler.next_request(1), None);
    }

    #[test]
    fn pending_requests_never_duplicates_a_block() {
        let data = vec![0u8; 20000];
        let (meta, dir) = single_piece_metainfo_with_length(&data, 20000);
        let scheduler = scheduler_for(meta, &dir);
        scheduler.on_bitfield(1, &[0b1000_0000]);
        scheduler.on_bitfield(2, &[0b1000_0000]);

        let first = scheduler.next_request(1).unwrap();
        let second = scheduler.next_request(2).unwrap();
        assert_ne!((first.0, first.1), (second.0, second.1));
    }

    #[tokio::test]
    async fn a_fully_received_piece_is_verified_and_written() {
        let (meta, dir) = single_piece_metainfo(b"hello");
        let scheduler = scheduler_for(meta, &dir);
        scheduler.on_bitfield(1, &[0b1000_0000]);
        scheduler.next_request(1).unwrap();
        scheduler.on_block(1, 0, 0, Bytes::from_static(b"hello"));

        scheduler.wait_for_completion().await;
        assert!(scheduler.is_complete());
        assert!(scheduler.take_fatal_error().is_none());
        assert_eq!(std::fs::read(dir.path().join("hi.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn hash_mismatch_resets_the_piece_for_redelivery() {
        let (meta, dir) = single_piece_metainfo(b"hello");
        let scheduler = scheduler_for(meta, &dir);
        scheduler.on_bitfield(1, &[0b1000_0000]);
        scheduler.next_request(1).unwrap();
        scheduler.on_block(1, 0, 0, Bytes::from_static(b"wrong"));

        // Give the spawned verify task a chance to run and reset the piece.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!scheduler.is_complete());

        // The piece is requestable again after the reset.
        let retried = scheduler.next_request(1);
        assert_eq!(retried, Some((0, 0, 5)));

        scheduler.on_block(1, 0, 0, Bytes::from_static(b"hello"));
        scheduler.wait_for_completion().await;
        assert!(scheduler.is_complete());
        assert_eq!(std::fs::read(dir.path().join("hi.txt")).unwrap(), b"hello");
    }

    #[test]
    fn mark_complete_seeds_resume_state() {
        let (meta, dir) = single_piece_metainfo(b"hello");
        let scheduler = scheduler_for(meta, &dir);
        scheduler.mark_complete(0);
        assert!(scheduler.is_complete());
        assert_eq!(scheduler.remaining_length(), 0);
    }

    #[test]
    fn remove_peer_clears_availability() {
        let (meta, dir) = single_piece_metainfo(b"hello");
        let scheduler = scheduler_for(meta, &dir);
        scheduler.on_bitfield(1, &[0b1000_0000]);
        scheduler.remove_peer(1);
        assert_eq!(scheduler.next_request(1), None);
    }

    #[test]
    fn oversized_block_is_rejected_without_panicking() {
        let (meta, dir) = single_piece_metainfo(b"hello");
        let scheduler = scheduler_for(meta, &dir);
        scheduler.on_bitfield(1, &[0b1000_0000]);
        scheduler.next_request(1).unwrap();

        // The piece is only 5 bytes; a block claiming to start at 0 with
        // far more data than fits must be rejected, not panic the lock.
        let accepted = scheduler.on_block(1, 0, 0, Bytes::from_static(&[0u8; 16384]));
        assert!(!accepted);
        assert!(!scheduler.is_complete());

        // The mutex must still be usable afterwards.
        assert_eq!(scheduler.next_request(2), None);
    }

    #[test]
    fn oversized_last_block_is_rejected_without_panicking() {
        // Piece is 20000 bytes: a full 16384-byte block plus a short
        // 3616-byte tail block. A peer legitimately has the tail block's
        // (index, begin) pending but sends far more data than the tail
        // actually holds, which must not overrun the buffer.
        let data = vec![0u8; 20000];
        let (meta, dir) = single_piece_metainfo_with_length(&data, 20000);
        let scheduler = scheduler_for(meta, &dir);
        scheduler.on_bitfield(1, &[0b1000_0000]);

        assert_eq!(scheduler.next_request(1), Some((0, 0, 16384)));
        assert_eq!(scheduler.next_request(1), Some((0, 16384, 3616)));

        let accepted = scheduler.on_block(1, 0, 16384, Bytes::from_static(&[0u8; 16384]));
        assert!(!accepted);
        assert!(!scheduler.is_complete());

        // The mutex must still be usable afterwards, from any peer.
        assert_eq!(scheduler.next_request(2), None);
    }
}
