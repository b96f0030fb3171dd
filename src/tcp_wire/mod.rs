//! The "TCP wire" protocol spoken between peers after the tracker has
//! introduced them: a fixed 68-byte handshake followed by length-prefixed
//! messages.
pub mod codec;
pub mod handshake;

use bytes::{BufMut, BytesMut};

/// The block length most clients expect. Requests larger than this are
/// commonly answered by dropping the connection. The last block of a piece
/// may be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// String identifier of the protocol, "BitTorrent protocol".
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A block of downloaded data, carried by the "piece" message. Blocks are
/// subsets of a piece; pieces are subsets of the torrent content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: usize,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data, at most [`BLOCK_LEN`] bytes.
    pub block: Vec<u8>,
}

impl Block {
    /// The block index within its piece, given that blocks are laid out
    /// back to back in [`BLOCK_LEN`] strides.
    pub fn block_index(&self) -> Option<usize> {
        if self.begin % BLOCK_LEN != 0 {
            return None;
        }
        Some((self.begin / BLOCK_LEN) as usize)
    }
}

/// The identity of a [`Block`], without its payload. This is what a
/// "request" message carries and what the downloader tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes, at most [`BLOCK_LEN`].
    pub len: u32,
}

impl BlockInfo {
    /// Encodes the block info in the wire format into the given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }

    pub fn block_index(&self) -> usize {
        (self.begin / BLOCK_LEN) as usize
    }

    pub fn is_valid(&self) -> bool {
        self.len > 0 && self.len <= BLOCK_LEN && self.begin % BLOCK_LEN == 0
    }
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        BlockInfo {
            index: block.index as u32,
            begin: block.begin,
            len: block.block.len() as u32,
        }
    }
}
