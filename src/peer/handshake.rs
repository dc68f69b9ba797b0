//! The BitTorrent peer handshake: the first message exchanged between two
//! peers. It verifies both sides are talking about the same torrent (via
//! the info hash) and establishes basic protocol compatibility.
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

use super::{PeerError, PeerResult};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A parsed 68-byte handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its 68-byte wire form:
    /// `{1: 19, 19: "BitTorrent protocol", 8: reserved, 20: info_hash, 20: peer_id}`.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    fn deserialize(buf: &[u8; HANDSHAKE_LEN]) -> PeerResult<Self> {
        let protocol_len = buf[0];
        if protocol_len as usize != PROTOCOL.len() {
            return Err(PeerError::InvalidProtocolLength(protocol_len));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(PeerError::InvalidProtocolString(buf[1..20].to_vec()));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Reads and parses a handshake from `stream`, bounded by
    /// `HANDSHAKE_TIMEOUT` — an unresponsive peer must not hang a
    /// connection slot forever.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut buf))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
        Self::deserialize(&buf)
    }

    pub async fn write(&self, stream: &mut TcpStream) -> PeerResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }

    /// Validates this handshake's info hash against the expected value.
    /// A mismatch aborts the connection per §4.4; a peer-id mismatch
    /// against a tracker-provided id is the caller's concern to log, not
    /// this function's to reject.
    pub fn validate_info_hash(&self, expected: &[u8; 20]) -> PeerResult<()> {
        if &self.info_hash != expected {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }

    /// Performs a full handshake over a freshly connected TCP stream:
    /// sends ours, reads theirs, validates the info hash.
    #[instrument(level = "debug", skip(stream, peer_id))]
    pub async fn perform(
        stream: &mut TcpStream,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<Handshake> {
        let ours = Handshake::new(info_hash, peer_id);
        ours.write(stream).await?;
        let theirs = Handshake::read(stream).await?;
        theirs.validate_info_hash(&info_hash)?;
        Ok(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_deserialize() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL);
        let parsed = Handshake::deserialize(&bytes).unwrap();
        assert_eq!(parsed, hs);
    }

    #[test]
    fn rejects_wrong_protocol_length() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[0] = 18;
        assert!(matches!(
            Handshake::deserialize(&bytes),
            Err(PeerError::InvalidProtocolLength(18))
        ));
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(matches!(
            Handshake::deserialize(&bytes),
            Err(PeerError::InvalidProtocolString(_))
        ));
    }

    #[test]
    fn validates_info_hash_match() {
        let hs = Handshake::new([7u8; 20], [2u8; 20]);
        assert!(hs.validate_info_hash(&[7u8; 20]).is_ok());
        assert!(matches!(
            hs.validate_info_hash(&[8u8; 20]),
            Err(PeerError::InfoHashMismatch)
        ));
    }
}
