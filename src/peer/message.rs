//! Regular peer message framing and codec (§4.4).
//!
//! Frame layout: `{4-byte big-endian length N, if N>0: 1-byte id, N-1 byte
//! payload}`. `N=0` is a keep-alive. We implement `tokio_util::codec`'s
//! `Decoder`/`Encoder` so a peer connection can drive the socket through a
//! `Framed<TcpStream, MessageCodec>` and let the codec handle partial
//! reads — `Framed` already accumulates into a buffer and only calls
//! `decode` again once more bytes have arrived, which is exactly the
//! "arbitrary chunking" behavior §4.4 asks the reader to implement.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{PeerError, PeerResult};

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = PeerError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> PeerResult<()> {
        let Some(id) = message.id() else {
            dst.put_u32(0);
            return Ok(());
        };

        match &message {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(id);
            }
            Message::Have { piece_index } => {
                dst.put_u32(5);
                dst.put_u8(id);
                dst.put_u32(*piece_index);
            }
            Message::Bitfield(bits) => {
                dst.put_u32(1 + bits.len() as u32);
                dst.put_u8(id);
                dst.put_slice(bits);
            }
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                dst.put_u32(13);
                dst.put_u8(id);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                dst.put_u32(9 + block.len() as u32);
                dst.put_u8(id);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_slice(block);
            }
            Message::KeepAlive => unreachable!("handled above"),
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> PeerResult<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if src.len() < HEADER_LEN + length {
            // Frame not fully arrived yet; reserve room and wait for more.
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        if length == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut frame = src.split_to(length);
        let id = frame.get_u8();
        let message = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if frame.len() != 4 {
                    return Err(PeerError::MalformedFrame("have payload must be 4 bytes".into()));
                }
                Message::Have { piece_index: frame.get_u32() }
            }
            5 => Message::Bitfield(frame.freeze()),
            6 => {
                if frame.len() != 12 {
                    return Err(PeerError::MalformedFrame("request payload must be 12 bytes".into()));
                }
                Message::Request {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            7 => {
                if frame.len() < 8 {
                    return Err(PeerError::MalformedFrame("piece payload must be at least 8 bytes".into()));
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Message::Piece { index, begin, block: frame.freeze() }
            }
            8 => {
                if frame.len() != 12 {
                    return Err(PeerError::MalformedFrame("cancel payload must be 12 bytes".into()));
                }
                Message::Cancel {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            other => return Err(PeerError::UnknownMessageId(other)),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn round_trips_fixed_messages() {
        assert_eq!(round_trip(Message::KeepAlive), Message::KeepAlive);
        assert_eq!(round_trip(Message::Choke), Message::Choke);
        assert_eq!(round_trip(Message::Unchoke), Message::Unchoke);
        assert_eq!(round_trip(Message::Interested), Message::Interested);
        assert_eq!(round_trip(Message::NotInterested), Message::NotInterested);
        assert_eq!(round_trip(Message::Have { piece_index: 7 }), Message::Have { piece_index: 7 });
    }

    #[test]
    fn round_trips_variable_length_messages() {
        let bitfield = Message::Bitfield(Bytes::from_static(&[0b1010_0000]));
        assert_eq!(round_trip(bitfield.clone()), bitfield);

        let req = Message::Request { index: 1, begin: 2, length: 16384 };
        assert_eq!(round_trip(req.clone()), req);

        let piece = Message::Piece { index: 1, begin: 0, block: Bytes::from_static(b"hello") };
        assert_eq!(round_trip(piece.clone()), piece);

        let cancel = Message::Cancel { index: 1, begin: 2, length: 16384 };
        assert_eq!(round_trip(cancel.clone()), cancel);
    }

    #[test]
    fn decode_waits_for_full_frame_across_chunked_reads() {
        let mut codec = MessageCodec;
        let mut encoded = BytesMut::new();
        codec
            .encode(Message::Have { piece_index: 42 }, &mut encoded)
            .unwrap();

        let mut partial = BytesMut::from(&encoded[..3]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&encoded[3..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::Have { piece_index: 42 })
        );
    }

    #[test]
    fn rejects_unknown_message_id() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(matches!(codec.decode(&mut buf), Err(PeerError::UnknownMessageId(99))));
    }
}
