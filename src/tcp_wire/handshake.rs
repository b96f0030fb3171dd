//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages: a fixed 68 bytes with no length
//! prefix, sent exactly once at the start of a connection. After the
//! exchange the connection switches to [`MessageCodec`], taking care to
//! carry the receive buffer over.
//!
//! [`MessageCodec`]: crate::tcp_wire::codec::MessageCodec

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{metainfo::InfoHash, peer::PeerId, tcp_wire::PSTR};

/// The very first message exchanged on a peer connection:
/// `pstrlen (1) || pstr (19) || reserved (8) || info_hash (20) || peer_id (20)`.
/// If the peer's protocol string or info hash differs from ours, the
/// connection is severed.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub const LEN: usize = 68;

    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: 19,
            pstr: PSTR,
            // no extensions supported, so none advertised
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Validate a received handshake against our own.
    pub fn validate(&self, theirs: &Self) -> bool {
        if theirs.pstr_len != 19 {
            warn!("handshake with wrong pstr_len, dropping connection");
            return false;
        }
        if theirs.pstr != PSTR {
            warn!("handshake with wrong pstr, dropping connection");
            return false;
        }
        if theirs.info_hash != self.info_hash {
            warn!("info_hash of received handshake does not match ours");
            return false;
        }
        true
    }
}

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake { pstr_len, pstr, reserved, info_hash, peer_id } =
            handshake;

        buf.put_u8(pstr_len);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.remaining() < Handshake::LEN {
            return Ok(None);
        }

        let pstr_len = buf.get_u8();

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len,
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_hash(hex: &str) -> InfoHash {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap();
        }
        InfoHash(out)
    }

    #[test]
    fn serializes_to_the_fixed_68_bytes() {
        let handshake =
            Handshake::new(InfoHash([5u8; 20]), PeerId([7u8; 20]));

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();

        assert_eq!(buf.len(), Handshake::LEN);
        assert_eq!(
            &buf[..],
            [
                19, 66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112,
                114, 111, 116, 111, 99, 111, 108, 0, 0, 0, 0, 0, 0, 0, 0, 5,
                5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 7, 7,
                7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7
            ]
        );
    }

    #[test]
    fn roundtrips_through_the_codec() {
        let ours = Handshake::new(InfoHash([5u8; 20]), PeerId([7u8; 20]));

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(ours.clone(), &mut buf).unwrap();
        let theirs = HandshakeCodec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(theirs, ours);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_yields_none() {
        let mut buf = BytesMut::from(&[19u8; 30][..]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn validates_regardless_of_peer_id() {
        let hash =
            hex_hash("c9e15763f722f23e98a29decdfae341b98d53056");
        let ours = Handshake::new(hash, PeerId([1u8; 20]));

        // bytes 28..48 carry the expected hash, the peer id suffix is free
        let theirs = Handshake::new(hash, PeerId(*b"-XX9999-abcdefghijkl"));
        assert!(ours.validate(&theirs));
    }

    #[test]
    fn rejects_wrong_pstr_or_hash() {
        let ours = Handshake::new(InfoHash([5u8; 20]), PeerId([7u8; 20]));

        let mut wrong_pstr = ours.clone();
        wrong_pstr.pstr[0] = b'b';
        assert!(!ours.validate(&wrong_pstr));

        let mut wrong_len = ours.clone();
        wrong_len.pstr_len = 20;
        assert!(!ours.validate(&wrong_len));

        let wrong_hash =
            Handshake::new(InfoHash([6u8; 20]), PeerId([7u8; 20]));
        assert!(!ours.validate(&wrong_hash));
    }
}
