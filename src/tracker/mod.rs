//! Tracker client (§4.3): announce request/response shapes, the rotating
//! announce-URL session, the bounded peer-discovery queue, and the
//! long-running announce loop that feeds it.
//!
//! Announce bodies are bencoded, so they go through our own codec rather
//! than a second, independent bencode implementation — `serde_bencode`
//! would duplicate the canonicalization rules `bencode::decoder` already
//! enforces and gives us nothing extra for a handful of known keys.
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, instrument, warn};

use crate::bencode::{decoder, BencodeError, BencodeValue};

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_INTERVAL: u64 = 60;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker URL is invalid: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("announce request timed out")]
    Timeout,

    #[error("non-200 HTTP status: {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("malformed tracker response: {0}")]
    Bencode(#[from] BencodeError),

    #[error("tracker response is not a dictionary")]
    NotADict,

    #[error("tracker reported failure: {0}")]
    FailureReason(String),

    #[error("tracker response has no `peers` key")]
    MissingPeers,

    #[error("all announce URLs exhausted")]
    AllUrlsExhausted,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A peer endpoint as returned by the tracker, before a connection has
/// been attempted. Entirely distinct from [`crate::peer::connection::PeerId`],
/// which only exists once this client has pulled one off the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerInfo {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// The lifecycle event reported alongside an announce, per §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

/// Everything needed to build one announce request's query string.
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

/// A parsed, successful announce response (a `failure reason` key turns
/// into an `Err` before this type is ever constructed).
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub peers: Vec<PeerInfo>,
}

impl AnnounceResponse {
    /// The effective interval to wait before the next announce: the
    /// minimum of `interval` and `min interval` when both are present.
    pub fn effective_interval(&self) -> u64 {
        match self.min_interval {
            Some(min) => self.interval.min(min),
            None => self.interval,
        }
    }
}

/// Percent-encodes raw bytes per RFC 3986, leaving only the unreserved
/// character set untouched. `info_hash` and `peer_id` are raw 20-byte
/// digests, not UTF-8 text, so a general URL query-builder (which encodes
/// `&str`s) can't be used for them directly.
fn percent_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn build_announce_url(base: &str, params: &AnnounceParams) -> TrackerResult<String> {
    let mut url = url::Url::parse(base)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("port", &params.port.to_string())
            .append_pair("uploaded", &params.uploaded.to_string())
            .append_pair("downloaded", &params.downloaded.to_string())
            .append_pair("left", &params.left.to_string())
            .append_pair("compact", "1");
    }
    // `query_pairs_mut` percent-encodes through the `form-urlencoded`
    // rules, which escape `~` and aren't byte-exact for raw digests;
    // info_hash/peer_id are appended manually afterwards.
    let mut query_string = url.query().unwrap_or("").to_string();
    if !query_string.is_empty() {
        query_string.push('&');
    }
    query_string.push_str(&format!(
        "info_hash={}&peer_id={}",
        percent_encode(&params.info_hash),
        percent_encode(&params.peer_id)
    ));
    if let Some(event) = params.event {
        query_string.push_str("&event=");
        query_string.push_str(event.as_str());
    }
    url.set_query(Some(&query_string));
    Ok(url.to_string())
}

/// Sends one announce request and parses the response. Does not retry or
/// rotate URLs itself — that's the loop's job.
#[instrument(skip(http, params), fields(%url))]
async fn announce_once(http: &reqwest::Client, url: &str, params: &AnnounceParams) -> TrackerResult<AnnounceResponse> {
    let request_url = build_announce_url(url, params)?;
    let response = tokio::time::timeout(ANNOUNCE_TIMEOUT, http.get(&request_url).send())
        .await
        .map_err(|_| TrackerError::Timeout)??;

    if !response.status().is_success() {
        return Err(TrackerError::HttpStatus(response.status()));
    }
    let body = tokio::time::timeout(ANNOUNCE_TIMEOUT, response.bytes())
        .await
        .map_err(|_| TrackerError::Timeout)??;

    parse_announce_response(&body)
}

fn parse_announce_response(body: &[u8]) -> TrackerResult<AnnounceResponse> {
    let value = decoder::decode(body)?;
    let dict = value.as_dict().ok_or(TrackerError::NotADict)?;

    if let Some(reason) = dict.get(b"failure reason" as &[u8]).and_then(BencodeValue::as_bytes) {
        return Err(TrackerError::FailureReason(String::from_utf8_lossy(reason).into_owned()));
    }

    let interval = dict
        .get(b"interval" as &[u8])
        .and_then(BencodeValue::as_integer)
        .map(|i| i.max(0) as u64)
        .unwrap_or(DEFAULT_INTERVAL);
    let min_interval = dict
        .get(b"min interval" as &[u8])
        .and_then(BencodeValue::as_integer)
        .map(|i| i.max(0) as u64);

    let peers = match dict.get(b"peers" as &[u8]) {
        Some(BencodeValue::Bytes(compact)) => parse_compact_peers(compact),
        Some(BencodeValue::List(list)) => parse_dict_peers(list),
        _ => return Err(TrackerError::MissingPeers),
    };

    Ok(AnnounceResponse { interval, min_interval, peers })
}

fn parse_compact_peers(bytes: &[u8]) -> Vec<PeerInfo> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerInfo { ip: IpAddr::V4(ip), port }
        })
        .collect()
}

fn parse_dict_peers(list: &[BencodeValue]) -> Vec<PeerInfo> {
    list.iter()
        .filter_map(|entry| {
            let dict = entry.as_dict()?;
            let ip_bytes = dict.get(b"ip" as &[u8])?.as_bytes()?;
            let ip_str = std::str::from_utf8(ip_bytes).ok()?;
            let ip = ip_str.parse::<IpAddr>().ok()?;
            let port = dict.get(b"port" as &[u8])?.as_integer()? as u16;
            Some(PeerInfo { ip, port })
        })
        .collect()
}

/// Per-swarm tracker state: the rotating announce-URL deque and the
/// last-known interval. Exclusively owned by the orchestrator (§3); the
/// announce loop below borrows it mutably for its lifetime.
pub struct TrackerSession {
    urls: VecDeque<String>,
    pub interval: u64,
}

impl TrackerSession {
    /// Flattens the tiered announce-URL list into simple round-robin
    /// order (§9 open question (c): no within-tier shuffle, no BEP 12
    /// tier-priority promotion — a plain flattened deque).
    pub fn new(tiers: &[Vec<String>]) -> Self {
        let urls = tiers.iter().flatten().cloned().collect();
        TrackerSession { urls, interval: DEFAULT_INTERVAL }
    }

    fn rotate(&mut self) {
        if let Some(front) = self.urls.pop_front() {
            self.urls.push_back(front);
        }
    }
}

/// Progress the tracker loop needs from the rest of the download to fill
/// in `downloaded`/`left` and to decide between a final `completed` or
/// `stopped` announce. Implemented by a thin adapter over the scheduler
/// so this module never depends on it directly.
pub trait Progress: Send + Sync {
    fn downloaded(&self) -> u64;
    fn left(&self) -> u64;
    fn is_complete(&self) -> bool;
}

/// The bounded peer-discovery feed (§1, §4.3, §4.8): each announce
/// replaces the queue's contents wholesale ("oldest dropped when
/// refreshed", §5) rather than appending, so peer slots never pull a
/// long-stale endpoint once the tracker has reported a fresher list.
pub struct PeerQueue {
    items: Mutex<VecDeque<PeerInfo>>,
    ready: Notify,
}

impl PeerQueue {
    pub fn new() -> Self {
        PeerQueue { items: Mutex::new(VecDeque::new()), ready: Notify::new() }
    }

    /// Replaces the queue's contents, skipping any endpoint matching
    /// `local_addr` (the Python reference's `if peer[0] == self.client_info.ip`
    /// self-filter in `download_coro`).
    fn refill(&self, peers: Vec<PeerInfo>, local_addr: SocketAddr) {
        let mut items = self.items.lock().unwrap();
        items.clear();
        items.extend(peers.into_iter().filter(|p| p.addr() != local_addr));
        if !items.is_empty() {
            self.ready.notify_waiters();
        }
    }

    /// Pulls the next peer, waiting if the queue is currently empty.
    pub async fn pop(&self) -> PeerInfo {
        loop {
            if let Some(peer) = self.items.lock().unwrap().pop_front() {
                return peer;
            }
            self.ready.notified().await;
        }
    }
}

impl Default for PeerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the announce loop to completion (§4.3): `started`, then periodic
/// re-announces publishing fresh peers, until the download completes or
/// is cancelled, ending with a `completed`/`stopped` announce.
///
/// Returns `Err(AllUrlsExhausted)` only when every announce URL has
/// failed in the same round with no intervening success — per §7 that is
/// the one tracker failure mode fatal to the whole download.
#[instrument(skip_all)]
pub async fn run(
    session: &mut TrackerSession,
    queue: &PeerQueue,
    local_addr: SocketAddr,
    http: &reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
    info_hash: [u8; 20],
    progress: &dyn Progress,
    mut cancel: watch::Receiver<bool>,
) -> TrackerResult<()> {
    let mut event = Some(AnnounceEvent::Started);
    let url_count = session.urls.len().max(1);

    loop {
        if progress.is_complete() || *cancel.borrow() {
            break;
        }

        let params = AnnounceParams {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: progress.downloaded(),
            left: progress.left(),
            event,
        };

        let mut failures = 0;
        let response = loop {
            let Some(url) = session.urls.front().cloned() else {
                return Err(TrackerError::AllUrlsExhausted);
            };
            match announce_once(http, &url, &params).await {
                Ok(response) => break response,
                Err(e) => {
                    warn!(url, error = %e, "announce failed, rotating tracker URL");
                    session.rotate();
                    failures += 1;
                    if failures >= url_count {
                        return Err(TrackerError::AllUrlsExhausted);
                    }
                }
            }
        };

        session.interval = response.effective_interval();
        debug!(interval = session.interval, peers = response.peers.len(), "announce succeeded");
        queue.refill(response.peers, local_addr);
        event = None;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(session.interval)) => {}
            _ = cancel.changed() => {}
        }
    }

    let final_event = if progress.is_complete() { AnnounceEvent::Completed } else { AnnounceEvent::Stopped };
    let params = AnnounceParams {
        info_hash,
        peer_id,
        port,
        uploaded: 0,
        downloaded: progress.downloaded(),
        left: progress.left(),
        event: Some(final_event),
    };
    if let Some(url) = session.urls.front().cloned() {
        if let Err(e) = announce_once(http, &url, &params).await {
            warn!(error = %e, "final announce failed");
        }
    }
    Ok(())
}

/// Generates a 20-byte peer id: an Azureus-style `-RT0001-` client prefix
/// followed by 11 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    use rand::Rng;
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn encode_dict(pairs: Vec<(&[u8], BencodeValue)>) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        for (k, v) in pairs {
            dict.insert(k.to_vec(), v);
        }
        crate::bencode::encoder::encode(&BencodeValue::Dict(dict)).unwrap()
    }

    #[test]
    fn parses_compact_peers() {
        let body = encode_dict(vec![
            (b"interval", BencodeValue::Integer(1800)),
            (b"peers", BencodeValue::Bytes(vec![127, 0, 0, 1, 0x1A, 0xE1])),
        ]);
        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers, vec![PeerInfo { ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port: 6881 }]);
    }

    #[test]
    fn parses_dict_peers() {
        let peer_dict = {
            let mut d = BTreeMap::new();
            d.insert(b"ip".to_vec(), BencodeValue::Bytes(b"10.0.0.1".to_vec()));
            d.insert(b"port".to_vec(), BencodeValue::Integer(51413));
            BencodeValue::Dict(d)
        };
        let body = encode_dict(vec![
            (b"interval", BencodeValue::Integer(900)),
            (b"peers", BencodeValue::List(vec![peer_dict])),
        ]);
        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.peers, vec![PeerInfo { ip: "10.0.0.1".parse().unwrap(), port: 51413 }]);
    }

    #[test]
    fn failure_reason_is_an_error() {
        let body = encode_dict(vec![(b"failure reason", BencodeValue::Bytes(b"nope".to_vec()))]);
        assert!(matches!(parse_announce_response(&body), Err(TrackerError::FailureReason(_))));
    }

    #[test]
    fn missing_peers_is_an_error() {
        let body = encode_dict(vec![(b"interval", BencodeValue::Integer(60))]);
        assert!(matches!(parse_announce_response(&body), Err(TrackerError::MissingPeers)));
    }

    #[test]
    fn effective_interval_takes_the_minimum() {
        let response = AnnounceResponse { interval: 1800, min_interval: Some(300), peers: vec![] };
        assert_eq!(response.effective_interval(), 300);

        let response = AnnounceResponse { interval: 1800, min_interval: None, peers: vec![] };
        assert_eq!(response.effective_interval(), 1800);
    }

    #[test]
    fn session_rotates_round_robin() {
        let mut session = TrackerSession::new(&[vec!["http://a".into(), "http://b".into()]]);
        assert_eq!(session.urls.front().unwrap(), "http://a");
        session.rotate();
        assert_eq!(session.urls.front().unwrap(), "http://b");
        session.rotate();
        assert_eq!(session.urls.front().unwrap(), "http://a");
    }

    #[test]
    fn percent_encode_matches_rfc3986_unreserved_set() {
        assert_eq!(percent_encode(b"az09-._~"), "az09-._~");
        assert_eq!(percent_encode(&[0x00, 0xFF]), "%00%FF");
    }

    #[tokio::test]
    async fn peer_queue_filters_local_endpoint_and_replaces_contents() {
        let queue = PeerQueue::new();
        let local: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let remote = PeerInfo { ip: "127.0.0.1".parse().unwrap(), port: 6882 };
        let us = PeerInfo { ip: "127.0.0.1".parse().unwrap(), port: 6881 };
        queue.refill(vec![us, remote], local);
        assert_eq!(queue.pop().await, remote);
    }
}
