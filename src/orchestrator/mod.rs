//! Download orchestrator (§4.8): owns the whole lifecycle of a single
//! download — metainfo loading, resume verification, the tracker loop,
//! the fixed-size peer pool, and graceful shutdown. Everything else in
//! this crate is a component the orchestrator wires together; nothing
//! here talks to a socket or a file directly.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::fileio::FileWriter;
use crate::metainfo::Metainfo;
use crate::peer::connection::{self, PeerId};
use crate::scheduler::Scheduler;
use crate::tracker::{self, PeerQueue, Progress, TrackerSession};

/// Peer slots held open at once, matching `Download.MAX_PEER_CONNECTIONS`
/// in the Python reference.
pub const MAX_PEER_CONNECTIONS: usize = 5;

/// The port this client advertises in announces. Download-only: nothing
/// ever actually listens on it, but the tracker still needs a value and
/// the self-filter in §4.3 needs something to compare peers against.
const ADVERTISED_PORT: u16 = 6881;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Metainfo(#[from] crate::metainfo::MetainfoError),

    #[error(transparent)]
    Writer(#[from] crate::fileio::WriterError),

    #[error(transparent)]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Final accounting for a finished (or cancelled) download, the
/// supplemented "download statistics" feature from `Download.stats`.
#[derive(Debug, Clone, Copy)]
pub struct DownloadSummary {
    pub downloaded: u64,
    pub total: u64,
    pub elapsed: Duration,
}

impl DownloadSummary {
    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.total
    }

    /// Bytes per second averaged over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.downloaded as f64 / secs
        }
    }
}

/// Adapts a shared [`Scheduler`] to the small interface the tracker loop
/// needs, per §4.3's "thin adapter" note — the tracker module never
/// depends on the scheduler directly.
struct SchedulerProgress(Arc<Scheduler>);

impl Progress for SchedulerProgress {
    fn downloaded(&self) -> u64 {
        self.0.downloaded_length()
    }

    fn left(&self) -> u64 {
        self.0.remaining_length()
    }

    fn is_complete(&self) -> bool {
        self.0.is_complete()
    }
}

/// Owns one download end to end. Construct with [`Orchestrator::load`],
/// drive to completion with [`Orchestrator::run`]; [`Orchestrator::stop`]
/// requests graceful, idempotent cancellation from any other task.
pub struct Orchestrator {
    metainfo: Arc<Metainfo>,
    destination: std::path::PathBuf,
    writer: Arc<FileWriter>,
    scheduler: Arc<Scheduler>,
    peer_queue: Arc<PeerQueue>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    peer_id: [u8; 20],
    next_connection_id: Arc<AtomicU64>,
    pool_size: usize,
    started_at: Instant,
}

impl Orchestrator {
    /// Loads the torrent at `torrent_path`, resolving file existence and
    /// resume state against `destination`.
    #[instrument(skip(destination), fields(torrent = %torrent_path.display()))]
    pub fn load(torrent_path: &Path, destination: &Path) -> OrchestratorResult<Self> {
        let metainfo = Metainfo::load(torrent_path, destination)?;
        Ok(Self::from_metainfo(metainfo, destination.to_path_buf()))
    }

    fn from_metainfo(metainfo: Metainfo, destination: std::path::PathBuf) -> Self {
        let metainfo = Arc::new(metainfo);
        let writer = Arc::new(FileWriter::new(&destination, &metainfo));
        let scheduler = Scheduler::new(metainfo.clone(), writer.clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Orchestrator {
            metainfo,
            destination,
            writer,
            scheduler,
            peer_queue: Arc::new(PeerQueue::new()),
            cancel_tx,
            cancel_rx,
            peer_id: tracker::generate_peer_id(),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            pool_size: MAX_PEER_CONNECTIONS,
            started_at: Instant::now(),
        }
    }

    /// Requests a graceful stop: the tracker loop sends a final `stopped`
    /// announce and every peer slot is aborted. Safe to call more than
    /// once, from any task, including while `run` is in progress.
    pub fn stop(&self) {
        let _ = self.cancel_tx.send(true);
    }

    fn summary(&self) -> DownloadSummary {
        DownloadSummary {
            downloaded: self.scheduler.downloaded_length(),
            total: self.metainfo.total_length(),
            elapsed: self.started_at.elapsed(),
        }
    }

    /// Runs the resume check, swarm, and tracker loop to completion (or
    /// until [`Orchestrator::stop`] is called), then closes every open
    /// file and returns final statistics.
    #[instrument(skip(self), fields(name = %self.metainfo.name))]
    pub async fn run(&self) -> OrchestratorResult<DownloadSummary> {
        self.verify_resume()?;

        if self.scheduler.is_complete() {
            info!("already complete on disk, skipping the swarm entirely");
        } else {
            self.run_swarm().await?;
        }

        self.writer.close().await?;
        if let Some(err) = self.scheduler.take_fatal_error() {
            return Err(err.into());
        }
        Ok(self.summary())
    }

    /// Re-reads and re-hashes any files already present at the
    /// destination, pre-seeding the scheduler's completed set (§4.2).
    fn verify_resume(&self) -> OrchestratorResult<()> {
        let verified = self.metainfo.verify_existing(&self.destination)?;
        let mut already_complete = 0usize;
        for (index, complete) in verified.into_iter().enumerate() {
            if complete {
                self.scheduler.mark_complete(index);
                already_complete += 1;
            }
        }
        if already_complete > 0 {
            debug!(already_complete, total = self.metainfo.num_pieces(), "resumed pieces verified on disk");
        }
        Ok(())
    }

    /// Spawns the tracker announce loop and the peer slot pool, then
    /// waits for either full completion or an external cancellation,
    /// tearing both down before returning.
    async fn run_swarm(&self) -> OrchestratorResult<()> {
        let local_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), ADVERTISED_PORT);
        let http = reqwest::Client::new();
        let progress = Arc::new(SchedulerProgress(self.scheduler.clone()));

        let mut session = TrackerSession::new(&self.metainfo.announce_tiers);
        let queue = self.peer_queue.clone();
        let info_hash = self.metainfo.info_hash;
        let peer_id = self.peer_id;
        let tracker_cancel = self.cancel_rx.clone();
        let tracker_handle: JoinHandle<crate::tracker::TrackerResult<()>> = tokio::spawn(async move {
            tracker::run(
                &mut session,
                &queue,
                local_addr,
                &http,
                peer_id,
                ADVERTISED_PORT,
                info_hash,
                progress.as_ref(),
                tracker_cancel,
            )
            .await
        });

        let peer_handles: Vec<JoinHandle<()>> = (0..self.pool_size).map(|_| self.spawn_peer_slot()).collect();

        tokio::select! {
            _ = self.scheduler.wait_for_completion() => {
                debug!("every piece verified, stopping the swarm");
            }
            _ = self.wait_for_cancel() => {
                info!("cancelled, stopping the swarm");
            }
        }
        self.stop();

        for handle in peer_handles {
            handle.abort();
        }

        match tracker_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "tracker loop ended with an error"),
            Err(e) => warn!(error = %e, "tracker task panicked"),
        }

        Ok(())
    }

    async fn wait_for_cancel(&self) {
        let mut rx = self.cancel_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Spawns one peer slot: repeatedly pulls a [`tracker::PeerInfo`] off
    /// the shared queue and runs a connection to completion, looping
    /// until told to stop. A slot that's mid-connection when cancellation
    /// arrives isn't interrupted cooperatively — the orchestrator aborts
    /// its task instead, which drops (and so closes) the socket.
    fn spawn_peer_slot(&self) -> JoinHandle<()> {
        let queue = self.peer_queue.clone();
        let scheduler = self.scheduler.clone();
        let info_hash = self.metainfo.info_hash;
        let our_peer_id = self.peer_id;
        let next_id = self.next_connection_id.clone();
        let mut cancel = self.cancel_rx.clone();

        tokio::spawn(async move {
            loop {
                let peer = tokio::select! {
                    _ = cancel.changed() => break,
                    peer = queue.pop() => peer,
                };
                if *cancel.borrow() {
                    break;
                }
                let id: PeerId = next_id.fetch_add(1, Ordering::Relaxed);
                let _ = connection::run(id, peer.addr(), info_hash, our_peer_id, scheduler.clone()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encoder, BencodeValue};
    use std::collections::BTreeMap;

    fn single_file_torrent() -> Vec<u8> {
        let data = b"hello world";
        let mut hasher = sha1::Sha1::default();
        use sha1::Digest;
        hasher.update(data);
        let hash = hasher.finalize().to_vec();

        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), BencodeValue::Integer(data.len() as i64));
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"hello.txt".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(hash));
        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), BencodeValue::Bytes(b"http://127.0.0.1:1/announce".to_vec()));
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        encoder::encode(&BencodeValue::Dict(root)).unwrap()
    }

    #[tokio::test]
    async fn already_complete_on_disk_skips_the_swarm() {
        let dest = tempfile::tempdir().unwrap();
        let torrent_bytes = single_file_torrent();
        std::fs::write(dest.path().join("hello.txt"), b"hello world").unwrap();

        let metainfo = Metainfo::parse(&torrent_bytes, dest.path()).unwrap();
        let orchestrator = Orchestrator::from_metainfo(metainfo, dest.path().to_path_buf());

        let summary = orchestrator.run().await.unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.downloaded, summary.total);
    }

    #[test]
    fn stop_is_idempotent() {
        let dest = tempfile::tempdir().unwrap();
        let torrent_bytes = single_file_torrent();
        let metainfo = Metainfo::parse(&torrent_bytes, dest.path()).unwrap();
        let orchestrator = Orchestrator::from_metainfo(metainfo, dest.path().to_path_buf());
        orchestrator.stop();
        orchestrator.stop();
        assert!(*orchestrator.cancel_rx.borrow());
    }
}
