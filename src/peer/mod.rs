//! Peer protocol and per-peer connection handling.
//!
//! `handshake` implements the fixed 68-byte initiation exchange (§4.4),
//! `message` implements the length-prefixed regular message framing and
//! codec (§4.4), and `connection` drives one peer through its state
//! machine and request pacing (§4.5).
use thiserror::Error;

pub mod connection;
pub mod handshake;
pub mod message;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid protocol length byte: {0}")]
    InvalidProtocolLength(u8),

    #[error("invalid protocol identifier: {0:?}")]
    InvalidProtocolString(Vec<u8>),

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("malformed message frame: {0}")]
    MalformedFrame(String),

    #[error("peer has no requestable piece for us")]
    NoRequestablePiece,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
