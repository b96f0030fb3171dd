use bytes::{Buf, BufMut, BytesMut};

use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

use super::{action::Action, event::Event};

/// The 98-byte announce request. All integers big-endian.
#[derive(Debug, PartialEq, Clone)]
pub struct Request {
    pub connection_id: u64,
    pub action: Action,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: Event,
    pub ip_address: u32,
    pub key: u32,
    pub num_want: i32,
    pub port: u16,
}

impl Request {
    pub const LEN: usize = 98;

    pub fn new(
        connection_id: u64,
        info_hash: InfoHash,
        peer_id: PeerId,
        left: u64,
        port: u16,
    ) -> Self {
        Self {
            connection_id,
            action: Action::Announce,
            transaction_id: rand::random(),
            info_hash,
            peer_id,
            downloaded: 0,
            left,
            uploaded: 0,
            event: Event::None,
            ip_address: 0,
            key: rand::random(),
            num_want: -1,
            port,
        }
    }

    pub fn serialize(&self) -> [u8; Self::LEN] {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u64(self.connection_id);
        buf.put_u32(self.action as u32);
        buf.put_u32(self.transaction_id);
        buf.extend_from_slice(&self.info_hash.0);
        buf.extend_from_slice(&self.peer_id.0);
        buf.put_u64(self.downloaded);
        buf.put_u64(self.left);
        buf.put_u64(self.uploaded);
        buf.put_u32(self.event as u32);
        buf.put_u32(self.ip_address);
        buf.put_u32(self.key);
        buf.put_i32(self.num_want);
        buf.put_u16(self.port);
        buf[..].try_into().expect("announce request is 98 bytes")
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::LEN {
            return Err(Error::TrackerResponseLength);
        }

        let mut buf = BytesMut::from(buf);
        let connection_id = buf.get_u64();
        let action = Action::try_from(buf.get_u32())?;
        let transaction_id = buf.get_u32();

        let mut info_hash = [0u8; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Self {
            connection_id,
            action,
            transaction_id,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
            downloaded: buf.get_u64(),
            left: buf.get_u64(),
            uploaded: buf.get_u64(),
            event: match buf.get_u32() {
                1 => Event::Completed,
                2 => Event::Started,
                3 => Event::Stopped,
                _ => Event::None,
            },
            ip_address: buf.get_u32(),
            key: buf.get_u32(),
            num_want: buf.get_i32(),
            port: buf.get_u16(),
        })
    }
}

/// The fixed 20-byte head of an announce response. The compact peer list
/// follows it on the wire.
#[derive(Debug, PartialEq, Clone)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    /// Seconds to wait before re-announcing.
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}

impl Response {
    pub const MIN_LEN: usize = 20;

    /// Split a datagram into the fixed head and the trailing compact peer
    /// records.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Self::MIN_LEN {
            return Err(Error::TrackerResponseLength);
        }

        let (head, payload) = buf.split_at(Self::MIN_LEN);
        let mut head = BytesMut::from(head);

        let res = Self {
            action: head.get_u32(),
            transaction_id: head.get_u32(),
            interval: head.get_u32(),
            leechers: head.get_u32(),
            seeders: head.get_u32(),
        };

        Ok((res, payload))
    }

    pub fn serialize(&self) -> [u8; Self::MIN_LEN] {
        let mut buf = BytesMut::with_capacity(Self::MIN_LEN);
        buf.put_u32(self.action);
        buf.put_u32(self.transaction_id);
        buf.put_u32(self.interval);
        buf.put_u32(self.leechers);
        buf.put_u32(self.seeders);
        buf[..].try_into().expect("announce response head is 20 bytes")
    }
}
