//! Per-peer connection state machine, message pump, and request pacing
//! (§4.5). A connection owns nothing of the download itself — it reaches
//! into the scheduler through the small [`SchedulerHandle`] interface
//! (§9's prescribed indirection for the peer ↔ scheduler cycle) and is
//! otherwise a dumb pipe: connect, handshake, pump messages, request
//! blocks, die on the first protocol violation.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, trace, warn};

use super::handshake::Handshake;
use super::message::{Message, MessageCodec};
use super::{PeerError, PeerResult};

/// Opaque handle a peer connection uses to address itself to the
/// scheduler, per §9 ("peers hold a small handle ... rather than a
/// back-pointer").
pub type PeerId = u64;

/// Request pacing: up to this many blocks outstanding per peer at once.
pub const PIPELINE_DEPTH: usize = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The scheduler's mutating interface, as seen by a peer connection.
/// Implemented by `scheduler::Scheduler`; kept as a trait so this module
/// never depends on the scheduler's internals.
pub trait SchedulerHandle: Send + Sync {
    fn on_bitfield(&self, peer: PeerId, bitfield: &[u8]);
    fn on_have(&self, peer: PeerId, piece_index: u32);
    /// Accounts for an incoming block. Returns `false` if `begin`/`block`
    /// don't fit inside the piece they claim to belong to (a protocol
    /// violation — an oversized or misaligned payload) so the caller can
    /// terminate just this connection instead of propagating a panic.
    fn on_block(&self, peer: PeerId, index: u32, begin: u32, block: Bytes) -> bool;
    /// Returns the next (index, begin, length) to request from this
    /// peer, or `None` if nothing is requestable from it right now.
    fn next_request(&self, peer: PeerId) -> Option<(u32, u32, u32)>;
    fn remove_peer(&self, peer: PeerId);
}

#[derive(Debug, Default)]
struct Flags {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Flags {
    fn initial() -> Self {
        // §4.5: {am_choking, am_interested, peer_choking, peer_interested}
        // start at {true, false, true, false}.
        Flags {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Runs one peer connection to completion: connects, handshakes, pumps
/// messages and requests until the connection ends (error, protocol
/// violation, or the scheduler has nothing left for this peer). Always
/// removes itself from the scheduler's availability maps on the way out,
/// successful or not.
#[instrument(skip(scheduler, our_peer_id), fields(peer = peer_id, %addr))]
pub async fn run(
    peer_id: PeerId,
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    scheduler: Arc<dyn SchedulerHandle>,
) -> PeerResult<()> {
    let result = run_inner(peer_id, addr, info_hash, our_peer_id, scheduler.as_ref()).await;
    scheduler.remove_peer(peer_id);
    if let Err(ref e) = result {
        debug!(error = %e, "peer connection ended");
    }
    result
}

async fn run_inner(
    peer_id: PeerId,
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    scheduler: &dyn SchedulerHandle,
) -> PeerResult<()> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??;

    Handshake::perform(&mut stream, info_hash, our_peer_id).await?;

    let mut framed = Framed::new(stream, MessageCodec);
    let mut flags = Flags::initial();
    let mut in_flight = 0usize;

    framed.send(Message::Interested).await?;
    flags.am_interested = true;

    loop {
        let Some(frame) = framed.next().await else {
            return Ok(());
        };
        let message = frame?;

        match message {
            Message::KeepAlive => continue,
            Message::Choke => {
                // Outstanding requests may still arrive; duplicates are
                // dropped by the scheduler's pending_requests dedup.
                flags.peer_choking = true;
                in_flight = 0;
                continue;
            }
            Message::Unchoke => {
                flags.peer_choking = false;
            }
            Message::Interested => {
                flags.peer_interested = true;
                continue;
            }
            Message::NotInterested => {
                flags.peer_interested = false;
                continue;
            }
            Message::Have { piece_index } => {
                scheduler.on_have(peer_id, piece_index);
                continue;
            }
            Message::Bitfield(bits) => {
                scheduler.on_bitfield(peer_id, &bits);
                continue;
            }
            // Download-only: requests/cancels from the remote are parsed
            // and ignored.
            Message::Request { .. } | Message::Cancel { .. } => continue,
            Message::Piece { index, begin, block } => {
                trace!(index, begin, len = block.len(), "received block");
                let block_len = block.len();
                if !scheduler.on_block(peer_id, index, begin, block) {
                    warn!(index, begin, block_len, "peer sent an out-of-bounds block, terminating");
                    return Err(PeerError::MalformedFrame(format!(
                        "block (index {index}, begin {begin}, len {block_len}) does not fit its piece"
                    )));
                }
                in_flight = in_flight.saturating_sub(1);
            }
        }

        if !flags.am_interested || flags.peer_choking {
            continue;
        }

        if top_up_requests(&mut framed, scheduler, peer_id, &mut in_flight).await? {
            continue;
        }
        if in_flight == 0 {
            warn!("no requestable piece remains for this peer");
            return Err(PeerError::NoRequestablePiece);
        }
    }
}

/// Requests blocks from the scheduler until `PIPELINE_DEPTH` are
/// in-flight or the scheduler has nothing more to offer right now.
/// Returns whether at least one request was issued or was already
/// in-flight (i.e. the caller should keep the connection open).
async fn top_up_requests<S: AsyncRead + AsyncWrite + Unpin>(
    framed: &mut Framed<S, MessageCodec>,
    scheduler: &dyn SchedulerHandle,
    peer_id: PeerId,
    in_flight: &mut usize,
) -> PeerResult<bool> {
    let mut issued_any = *in_flight > 0;
    while *in_flight < PIPELINE_DEPTH {
        match scheduler.next_request(peer_id) {
            Some((index, begin, length)) => {
                framed
                    .send(Message::Request { index, begin, length })
                    .await?;
                *in_flight += 1;
                issued_any = true;
            }
            None => break,
        }
    }
    Ok(issued_any)
}
