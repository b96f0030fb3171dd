use std::io;

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinError};

use crate::disk::PieceData;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bencode: truncated input")]
    BencodeEof,

    #[error("bencode: unexpected byte {0:#04x} at offset {1}")]
    BencodeUnexpected(u8, usize),

    #[error("bencode: malformed integer")]
    BencodeInteger,

    #[error("bencode: malformed string length")]
    BencodeStringLength,

    #[error("bencode: dictionary key is not a byte string")]
    BencodeKey,

    #[error("bencode: dictionary keys out of order or duplicated")]
    BencodeKeyOrder,

    #[error("bencode: trailing bytes after the top-level value")]
    BencodeTrailing,

    #[error("string is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("metainfo: missing or invalid field `{0}`")]
    MetainfoField(&'static str),

    #[error("metainfo: `pieces` length is not a multiple of 20")]
    PiecesLength,

    #[error("metainfo: piece count does not match the total length")]
    PieceCountMismatch,

    #[error("metainfo: a declared file path is invalid")]
    PathInvalid,

    #[error("piece index out of range")]
    PieceIndex,

    #[error("block index out of range")]
    BlockIndex,

    #[error("the tracker URL `{0}` is not a UDP tracker")]
    TrackerScheme(String),

    #[error("tracker resolved to no usable address")]
    TrackerSocketAddr,

    #[error("could not connect to the UDP socket of the tracker")]
    TrackerSocketConnect,

    #[error("the response received from the tracker was not valid")]
    TrackerResponse,

    #[error("the response received from the tracker was too short")]
    TrackerResponseLength,

    #[error("the tracker did not answer the announce in time")]
    TrackerTimeout,

    #[error("the handshake received is not valid")]
    HandshakeInvalid,

    #[error("the peer took too long to send the handshake")]
    HandshakeTimeout,

    #[error("the message took too long to arrive")]
    MessageTimeout,

    #[error("the peer sent an invalid message")]
    MessageInvalid,

    #[error("the peer closed the socket")]
    PeerClosedSocket,

    #[error("the peer could not be reached")]
    PeerUnreachable,

    #[error("the tracker returned no peers")]
    NoPeers,

    #[error("all peer connections closed before the download completed")]
    DownloadIncomplete,

    #[error("could not open the file `{0}`")]
    FileOpenError(String),

    #[error("error while trying to load the configuration")]
    ConfigError,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("could not send a piece to the disk writer")]
    SendErrorDisk(#[from] mpsc::error::SendError<PieceData>),

    #[error("a background task failed")]
    TaskJoin(#[from] JoinError),
}
