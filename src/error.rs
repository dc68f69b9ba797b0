//! Top-level error aggregation (§7). Each module keeps its own
//! `thiserror`-derived error enum; `ClientError` is the single type the
//! orchestrator and the CLI binary deal with, the way a thin `anyhow`
//! boundary already sits above the rest of this crate's typed errors.
use thiserror::Error;

use crate::bencode::BencodeError;
use crate::fileio::WriterError;
use crate::metainfo::MetainfoError;
use crate::orchestrator::OrchestratorError;
use crate::peer::PeerError;
use crate::scheduler::SchedulerError;
use crate::tracker::TrackerError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error(transparent)]
    Metainfo(#[from] MetainfoError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
