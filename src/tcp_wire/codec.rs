//! The length-prefixed messages exchanged after a successful handshake:
//! 4-byte big-endian length, then a one-byte message id and its payload.
//! A length of zero is a keep-alive.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::{
    bitfield::Bitfield,
    error::Error,
    tcp_wire::{Block, BlockInfo},
};

/// Messages of the peer wire protocol. This client acts on choke, unchoke,
/// have, bitfield and piece; the rest may arrive and are tolerated.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Port(u16),
    /// Any well-formed message with an id this client does not act on.
    /// The payload is consumed and dropped.
    Unknown(u8),
}

/// The ids of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

#[derive(Debug, Clone)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            // <len=0000>
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            // <len=0001><id=0>
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            // <len=0001><id=1>
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            // <len=0001><id=2>
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            // <len=0001><id=3>
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece_index) => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block_info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                block_info.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                let Block { index, begin, block } = block;

                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(index as u32);
                buf.put_u32(begin);
                buf.put(&block[..]);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block_info) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                block_info.encode(buf);
            }
            // <len=0003><id=9><listen-port>
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Message::Unknown(_) => {
                // never sent; only produced by the decoder
                return Err(Error::MessageInvalid);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the length header must be present at the minimum
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek the length without advancing: the full message may not be
        // buffered yet
        let mut peek = Cursor::new(&buf[..]);
        let msg_len = peek.get_u32() as usize;

        if buf.remaining() < 4 + msg_len {
            trace!(
                "read buffer has {} bytes but message is {} bytes long",
                buf.remaining(),
                msg_len
            );
            return Ok(None);
        }

        buf.advance(4);

        // only a keep-alive has no message id
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let msg_id = buf.get_u8();

        let msg = match msg_id {
            // <len=0001><id=0>
            id if id == MessageId::Choke as u8 && msg_len == 1 => {
                Message::Choke
            }
            // <len=0001><id=1>
            id if id == MessageId::Unchoke as u8 && msg_len == 1 => {
                Message::Unchoke
            }
            // <len=0001><id=2>
            id if id == MessageId::Interested as u8 && msg_len == 1 => {
                Message::Interested
            }
            // <len=0001><id=3>
            id if id == MessageId::NotInterested as u8 && msg_len == 1 => {
                Message::NotInterested
            }
            // <len=0005><id=4><piece index>
            id if id == MessageId::Have as u8 && msg_len == 5 => {
                Message::Have(buf.get_u32())
            }
            // <len=0001+X><id=5><bitfield>
            id if id == MessageId::Bitfield as u8 => {
                let mut bitfield = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            // <len=0013><id=6><index><begin><length>
            id if id == MessageId::Request as u8 && msg_len == 13 => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo { index, begin, len })
            }
            // <len=0009+X><id=7><index><begin><block>
            id if id == MessageId::Piece as u8 && msg_len >= 9 => {
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();

                let mut block = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut block);

                Message::Piece(Block { index, begin, block })
            }
            // <len=0013><id=8><index><begin><length>
            id if id == MessageId::Cancel as u8 && msg_len == 13 => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo { index, begin, len })
            }
            // <len=0003><id=9><listen-port>
            id if id == MessageId::Port as u8 && msg_len == 3 => {
                Message::Port(buf.get_u16())
            }
            id if id > MessageId::Port as u8 => {
                // tolerated: consume the payload, surface only the id
                buf.advance(msg_len - 1);
                Message::Unknown(id)
            }
            // a known id with the wrong length is a framing error
            _ => return Err(Error::MessageInvalid),
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_wire::BLOCK_LEN;

    fn roundtrip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).unwrap();
        MessageCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn keep_alive() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], [0, 0, 0, 0]);
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn choke_family_has_length_one() {
        for (msg, id) in [
            (Message::Choke, 0u8),
            (Message::Unchoke, 1),
            (Message::Interested, 2),
            (Message::NotInterested, 3),
        ] {
            let mut buf = BytesMut::new();
            MessageCodec.encode(msg.clone(), &mut buf).unwrap();
            assert_eq!(&buf[..], [0, 0, 0, 1, id]);
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn have_has_length_five() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Have(0x0102), &mut buf).unwrap();
        assert_eq!(&buf[..], [0, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(roundtrip(Message::Have(0x0102)), Message::Have(0x0102));
    }

    #[test]
    fn port_has_length_three() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Port(6881), &mut buf).unwrap();
        assert_eq!(&buf[..], [0, 0, 0, 3, 9, 0x1a, 0xe1]);
    }

    #[test]
    fn request() {
        let info = BlockInfo { index: 1, begin: BLOCK_LEN, len: BLOCK_LEN };
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Request(info), &mut buf).unwrap();

        assert_eq!(buf.len(), 17);
        assert_eq!(buf.get_u32(), 13);
        assert_eq!(buf.get_u8(), MessageId::Request as u8);
        assert_eq!(buf.get_u32(), 1);
        assert_eq!(buf.get_u32(), BLOCK_LEN);
        assert_eq!(buf.get_u32(), BLOCK_LEN);

        assert_eq!(roundtrip(Message::Request(info)), Message::Request(info));
    }

    #[test]
    fn piece() {
        let block = Block { index: 3, begin: 0, block: vec![0xab; 10] };
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Piece(block.clone()), &mut buf).unwrap();

        assert_eq!(buf.get_u32(), 9 + 10);
        assert_eq!(buf.get_u8(), MessageId::Piece as u8);
        assert_eq!(buf.get_u32(), 3);
        assert_eq!(buf.get_u32(), 0);

        assert_eq!(roundtrip(Message::Piece(block.clone())), Message::Piece(block));
    }

    #[test]
    fn bitfield() {
        let bits = Bitfield::from_vec(vec![0x50, 0x30, 0x43]);
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Bitfield(bits.clone()), &mut buf).unwrap();

        assert_eq!(buf.get_u32(), 4);
        assert_eq!(buf.get_u8(), MessageId::Bitfield as u8);

        let decoded = roundtrip(Message::Bitfield(bits.clone()));
        let Message::Bitfield(decoded) = decoded else { panic!() };
        assert_eq!(decoded.into_vec(), [0x50, 0x30, 0x43]);
    }

    #[test]
    fn unknown_id_is_tolerated_and_payload_consumed() {
        let mut buf = BytesMut::new();
        // an extension-protocol message (id 20) with a 3-byte payload,
        // followed by an unchoke
        buf.put_u32(4);
        buf.put_u8(20);
        buf.extend_from_slice(&[1, 2, 3]);
        buf.put_u32(1);
        buf.put_u8(MessageId::Unchoke as u8);

        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Unknown(20)
        );
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Unchoke
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_yield_none() {
        let mut buf = BytesMut::new();
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());

        buf.put_u32(13);
        buf.put_u8(MessageId::Request as u8);
        // only 5 of the 17 bytes arrived
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);
    }
}
