//! Typed model of a .torrent (metainfo) file.
//!
//! The bencode tree is walked exactly once, here, by a validating conversion
//! pass. The rest of the crate only ever sees [`Metainfo`] and friends.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::{
    bencode::{self, Value},
    error::Error,
    tcp_wire::BLOCK_LEN,
};

/// SHA-1 of the bencoded `info` dictionary. Identifies a torrent on
/// trackers and between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    fn of(info_bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        InfoHash(hasher.finalize().into())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
    info_hash: InfoHash,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// Name of the single file, or of the root directory in multi-file mode.
    pub name: String,

    /// Length in bytes of each piece, except possibly the last.
    pub piece_length: u32,

    /// SHA-1 hash of every piece, in order.
    pub pieces: Vec<[u8; 20]>,

    /// Set in single-file mode, `None` in multi-file mode.
    pub file_length: Option<u64>,

    /// Set in multi-file mode, `None` in single-file mode.
    pub files: Option<Vec<TorrentFile>>,
}

/// One declared file of a multi-file torrent. Paths are relative to the
/// torrent's root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub length: u64,
    pub path: Vec<String>,
}

impl Metainfo {
    /// Parse and validate a metainfo file.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        let root = bencode::decode(buf)?;

        let announce = root
            .get(b"announce")
            .and_then(Value::as_bytes)
            .ok_or(Error::MetainfoField("announce"))?;
        let announce = String::from_utf8(announce.to_vec())?;

        let info_value = root.get(b"info").ok_or(Error::MetainfoField("info"))?;
        if info_value.as_dict().is_none() {
            return Err(Error::MetainfoField("info"));
        }

        // the codec is canonical, so this re-encoding is byte-identical to
        // the `info` range of the source file
        let info_hash = InfoHash::of(&bencode::encode(info_value));
        let info = Info::from_value(info_value)?;

        let total = info.total_size();
        if total == 0 {
            return Err(Error::MetainfoField("length"));
        }
        let expected_pieces =
            total.div_ceil(info.piece_length as u64) as usize;
        if info.pieces.len() != expected_pieces {
            return Err(Error::PieceCountMismatch);
        }

        Ok(Self { announce, info, info_hash })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// `host:port` of the announce URL. Only UDP trackers are supported;
    /// any `/announce` style suffix is stripped.
    pub fn announce_addr(&self) -> Result<String, Error> {
        let rest = self
            .announce
            .strip_prefix("udp://")
            .ok_or_else(|| Error::TrackerScheme(self.announce.clone()))?;

        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return Err(Error::TrackerScheme(self.announce.clone()));
        }

        Ok(host.to_string())
    }

    pub fn total_size(&self) -> u64 {
        self.info.total_size()
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len()
    }

    pub fn piece_hash(&self, piece: usize) -> Result<[u8; 20], Error> {
        self.info.pieces.get(piece).copied().ok_or(Error::PieceIndex)
    }

    /// Absolute byte offset of a piece within the concatenated content.
    pub fn piece_offset(&self, piece: usize) -> u64 {
        piece as u64 * self.info.piece_length as u64
    }

    /// Length in bytes of the given piece. Every piece has the declared
    /// piece length except the last, whose length is in `(0, piece_length]`.
    pub fn piece_length_at(&self, piece: usize) -> Result<u32, Error> {
        let count = self.piece_count();
        if piece >= count {
            return Err(Error::PieceIndex);
        }

        if piece == count - 1 {
            let rem = (self.total_size() % self.info.piece_length as u64) as u32;
            if rem == 0 {
                return Ok(self.info.piece_length);
            }
            return Ok(rem);
        }

        Ok(self.info.piece_length)
    }

    /// How many blocks the given piece divides into.
    pub fn block_count(&self, piece: usize) -> Result<usize, Error> {
        Ok(self.piece_length_at(piece)?.div_ceil(BLOCK_LEN) as usize)
    }

    /// Length in bytes of one block of a piece. Every block is `BLOCK_LEN`
    /// except the last, whose length is in `(0, BLOCK_LEN]`.
    pub fn block_length(&self, piece: usize, block: usize) -> Result<u32, Error> {
        let count = self.block_count(piece)?;
        if block >= count {
            return Err(Error::BlockIndex);
        }

        if block == count - 1 {
            let rem = self.piece_length_at(piece)? % BLOCK_LEN;
            if rem == 0 {
                return Ok(BLOCK_LEN);
            }
            return Ok(rem);
        }

        Ok(BLOCK_LEN)
    }

    /// The declared files in declaration order, with their paths relative to
    /// the torrent directory. Single-file torrents yield one entry named
    /// after `info.name`.
    pub fn output_files(&self) -> Vec<TorrentFile> {
        match &self.info.files {
            Some(files) => files.clone(),
            None => vec![TorrentFile {
                length: self.info.file_length.unwrap_or_default(),
                path: vec![self.info.name.clone()],
            }],
        }
    }
}

impl Info {
    pub fn total_size(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or_default(),
        }
    }

    fn from_value(value: &Value) -> Result<Self, Error> {
        let name = value
            .get(b"name")
            .and_then(Value::as_bytes)
            .ok_or(Error::MetainfoField("info.name"))?;
        let name = String::from_utf8(name.to_vec())?;
        if name.is_empty() {
            return Err(Error::MetainfoField("info.name"));
        }

        let piece_length = value
            .get(b"piece length")
            .and_then(Value::as_int)
            .filter(|len| (1..=u32::MAX as i64).contains(len))
            .ok_or(Error::MetainfoField("info.piece length"))?
            as u32;

        let pieces_raw = value
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or(Error::MetainfoField("info.pieces"))?;
        if pieces_raw.is_empty() || pieces_raw.len() % 20 != 0 {
            return Err(Error::PiecesLength);
        }
        let pieces = pieces_raw
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().expect("chunks are 20 bytes"))
            .collect();

        let file_length = value.get(b"length").and_then(Value::as_int);
        let files = value.get(b"files").and_then(Value::as_list);

        match (file_length, files) {
            (Some(len), None) if len > 0 => Ok(Self {
                name,
                piece_length,
                pieces,
                file_length: Some(len as u64),
                files: None,
            }),
            (None, Some(files)) if !files.is_empty() => Ok(Self {
                name,
                piece_length,
                pieces,
                file_length: None,
                files: Some(
                    files
                        .iter()
                        .map(TorrentFile::from_value)
                        .collect::<Result<_, _>>()?,
                ),
            }),
            _ => Err(Error::MetainfoField("info.length")),
        }
    }
}

impl TorrentFile {
    fn from_value(value: &Value) -> Result<Self, Error> {
        let length = value
            .get(b"length")
            .and_then(Value::as_int)
            .filter(|len| *len >= 0)
            .ok_or(Error::MetainfoField("info.files.length"))? as u64;

        let path = value
            .get(b"path")
            .and_then(Value::as_list)
            .ok_or(Error::MetainfoField("info.files.path"))?
            .iter()
            .map(|segment| {
                let bytes = segment
                    .as_bytes()
                    .ok_or(Error::MetainfoField("info.files.path"))?;
                Ok(String::from_utf8(bytes.to_vec())?)
            })
            .collect::<Result<Vec<String>, Error>>()?;

        // the path lands on the local filesystem, keep it inside the
        // torrent directory
        if path.is_empty()
            || path.iter().any(|s| s.is_empty() || s == ".." || s.contains('/'))
        {
            return Err(Error::PathInvalid);
        }

        Ok(Self { length, path })
    }
}
