use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;

use super::action::Action;

/// The 16-byte connect request that opens every tracker exchange.
#[derive(Debug, PartialEq, Clone)]
pub struct Request {
    pub protocol_id: u64,
    pub action: Action,
    pub transaction_id: u32,
}

impl Request {
    pub const LEN: usize = 16;
    const MAGIC: u64 = 0x41727101980;

    pub fn new() -> Self {
        Self {
            protocol_id: Self::MAGIC,
            action: Action::Connect,
            transaction_id: rand::random(),
        }
    }

    pub fn serialize(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..8].copy_from_slice(&self.protocol_id.to_be_bytes());
        buf[8..12].copy_from_slice(&(self.action as u32).to_be_bytes());
        buf[12..16].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::LEN {
            return Err(Error::TrackerResponseLength);
        }

        let mut buf = BytesMut::from(buf);
        let protocol_id = buf.get_u64();
        let action = Action::try_from(buf.get_u32())?;
        let transaction_id = buf.get_u32();

        if protocol_id != Self::MAGIC {
            return Err(Error::TrackerResponse);
        }

        Ok(Self { protocol_id, action, transaction_id })
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// The 16-byte connect response carrying the connection id every announce
/// must echo.
#[derive(Debug, PartialEq, Clone)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl Response {
    pub const LEN: usize = 16;

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LEN {
            return Err(Error::TrackerResponseLength);
        }

        let mut buf = BytesMut::from(&buf[..Self::LEN]);

        Ok(Self {
            action: buf.get_u32(),
            transaction_id: buf.get_u32(),
            connection_id: buf.get_u64(),
        })
    }

    pub fn serialize(&self) -> [u8; Self::LEN] {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.action);
        buf.put_u32(self.transaction_id);
        buf.put_u64(self.connection_id);
        buf[..].try_into().expect("connect response is 16 bytes")
    }
}
