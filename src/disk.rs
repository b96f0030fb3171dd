//! File I/O for a torrent: the sparse staging file, the single writer task
//! that owns it during the download, and the post-completion splitter that
//! materializes the declared file tree.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{self, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::mpsc::Receiver,
};
use tracing::{debug, info, trace, warn};

use crate::{error::Error, metainfo::Metainfo, utils::human_bytes};

/// The writer consumes from a channel bounded to this many pieces, which is
/// what backpressures peer sessions when the disk is slow.
pub const WRITER_CHANNEL_BOUND: usize = 10;

/// The staging file holding the concatenated pieces, piece `i` at byte
/// offset `i * piece_length`.
pub const SPARSE_FILE_NAME: &str = "torrent.data";

/// Data is pushed to disk every this many written pieces, and once more on
/// completion.
const SYNC_EVERY_PIECES: usize = 10;

/// A verified, assembled piece on its way to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceData {
    pub index: usize,
    /// Absolute byte offset within the staging file.
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Create (or truncate) the staging file under
/// `<download_dir>/<torrent name>/` with its full logical size allocated.
/// Returns the open file and the torrent directory.
pub async fn create_sparse_file(
    meta: &Metainfo,
    download_dir: &str,
) -> Result<(File, PathBuf), Error> {
    let torrent_dir = Path::new(download_dir).join(&meta.info.name);
    create_dir_all(&torrent_dir).await?;

    let path = torrent_dir.join(SPARSE_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .await
        .map_err(|_| Error::FileOpenError(path.display().to_string()))?;

    file.set_len(meta.total_size()).await?;
    debug!(
        "created staging file {} ({})",
        path.display(),
        human_bytes(meta.total_size())
    );

    Ok((file, torrent_dir))
}

/// The one task allowed to touch the staging file while the download runs.
/// Serializing every write through it removes the need for any file lock,
/// and `persisted` guarantees a piece hits the disk at most once.
#[derive(Debug)]
pub struct Writer {
    file: File,
    persisted: Vec<bool>,
    written: usize,
}

impl Writer {
    pub fn new(file: File, piece_count: usize) -> Self {
        Self { file, persisted: vec![false; piece_count], written: 0 }
    }

    /// Drain the channel until the downloader closes it on completion, then
    /// fsync. The caller awaiting this task is the completion barrier.
    pub async fn run(mut self, mut rx: Receiver<PieceData>) -> Result<(), Error> {
        while let Some(piece) = rx.recv().await {
            self.write_piece(piece).await?;
        }

        self.file.sync_all().await?;
        debug!("writer drained after {} pieces, file synced", self.written);

        Ok(())
    }

    async fn write_piece(&mut self, piece: PieceData) -> Result<(), Error> {
        if self.persisted[piece.index] {
            warn!("piece {} is already persisted, skipping", piece.index);
            return Ok(());
        }

        self.probe_overwrite(&piece).await?;

        self.file.seek(SeekFrom::Start(piece.offset)).await?;
        self.file.write_all(&piece.data).await?;

        self.persisted[piece.index] = true;
        self.written += 1;
        trace!(
            "persisted piece {} at offset {} ({} bytes)",
            piece.index,
            piece.offset,
            piece.data.len()
        );

        if self.written % SYNC_EVERY_PIECES == 0 {
            self.file.sync_data().await?;
        }

        Ok(())
    }

    /// Read one byte at each end of the target range. The piece layout
    /// already guarantees no two pieces cover the same byte, so a non-zero
    /// byte is only a detection signal; the write proceeds regardless.
    async fn probe_overwrite(&mut self, piece: &PieceData) -> Result<(), Error> {
        if piece.data.is_empty() {
            return Ok(());
        }

        let mut probe = [0u8; 1];
        for offset in
            [piece.offset, piece.offset + piece.data.len() as u64 - 1]
        {
            self.file.seek(SeekFrom::Start(offset)).await?;
            if self.file.read_exact(&mut probe).await.is_ok() && probe[0] != 0
            {
                warn!(
                    "writing piece {} over non-zero data at offset {offset}",
                    piece.index
                );
                break;
            }
        }

        Ok(())
    }
}

/// Split the staging file back into the declared file layout: for each file
/// in declaration order, copy exactly its length from the running offset
/// into `<torrent dir>/<full nested path>`.
pub async fn split_into_files(
    meta: &Metainfo,
    torrent_dir: &Path,
) -> Result<(), Error> {
    let sparse_path = torrent_dir.join(SPARSE_FILE_NAME);
    let mut src = File::open(&sparse_path)
        .await
        .map_err(|_| Error::FileOpenError(sparse_path.display().to_string()))?;

    let mut offset = 0u64;

    for file in meta.output_files() {
        let mut dest = torrent_dir.to_path_buf();
        for segment in &file.path {
            dest.push(segment);
        }
        if let Some(parent) = dest.parent() {
            create_dir_all(parent).await?;
        }

        let mut dst = File::create(&dest)
            .await
            .map_err(|_| Error::FileOpenError(dest.display().to_string()))?;

        src.seek(SeekFrom::Start(offset)).await?;
        let copied =
            io::copy(&mut (&mut src).take(file.length), &mut dst).await?;
        if copied != file.length {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "staging file is shorter than the declared layout",
            )));
        }

        info!(
            "materialized {} ({})",
            dest.display(),
            human_bytes(file.length)
        );
        offset += file.length;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn multi_file_meta() -> Metainfo {
        let files = Value::List(vec![
            Value::Dict(BTreeMap::from([
                (b"length".to_vec(), Value::Int(6)),
                (
                    b"path".to_vec(),
                    Value::List(vec![
                        Value::Str(b"docs".to_vec()),
                        Value::Str(b"a.txt".to_vec()),
                    ]),
                ),
            ])),
            Value::Dict(BTreeMap::from([
                (b"length".to_vec(), Value::Int(4)),
                (
                    b"path".to_vec(),
                    Value::List(vec![Value::Str(b"b.bin".to_vec())]),
                ),
            ])),
        ]);
        let info = Value::Dict(BTreeMap::from([
            (b"files".to_vec(), files),
            (b"name".to_vec(), Value::Str(b"bundle".to_vec())),
            (b"piece length".to_vec(), Value::Int(16384)),
            (b"pieces".to_vec(), Value::Str(vec![0u8; 20])),
        ]));
        let root = Value::Dict(BTreeMap::from([
            (
                b"announce".to_vec(),
                Value::Str(b"udp://tracker.example.org:1337".to_vec()),
            ),
            (b"info".to_vec(), info),
        ]));

        Metainfo::parse(&bencode::encode(&root)).unwrap()
    }

    fn scratch_dir(tag: &str) -> String {
        let dir = std::env::temp_dir()
            .join(format!("remora-disk-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.display().to_string()
    }

    #[tokio::test]
    async fn writer_persists_and_splits_nested_files() {
        let meta = multi_file_meta();
        let download_dir = scratch_dir("split");

        let (file, torrent_dir) =
            create_sparse_file(&meta, &download_dir).await.unwrap();

        let (tx, rx) = mpsc::channel(WRITER_CHANNEL_BOUND);
        let writer = Writer::new(file, meta.piece_count());
        let handle = tokio::spawn(writer.run(rx));

        tx.send(PieceData {
            index: 0,
            offset: 0,
            data: b"abcdefwxyz".to_vec(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        split_into_files(&meta, &torrent_dir).await.unwrap();

        let a = std::fs::read(torrent_dir.join("docs/a.txt")).unwrap();
        let b = std::fs::read(torrent_dir.join("b.bin")).unwrap();
        assert_eq!(a, b"abcdef");
        assert_eq!(b, b"wxyz");

        let _ = std::fs::remove_dir_all(&download_dir);
    }

    #[tokio::test]
    async fn writer_never_writes_a_piece_twice() {
        let meta = multi_file_meta();
        let download_dir = scratch_dir("dedup");

        let (file, torrent_dir) =
            create_sparse_file(&meta, &download_dir).await.unwrap();

        let (tx, rx) = mpsc::channel(WRITER_CHANNEL_BOUND);
        let writer = Writer::new(file, meta.piece_count());
        let handle = tokio::spawn(writer.run(rx));

        tx.send(PieceData {
            index: 0,
            offset: 0,
            data: b"abcdefwxyz".to_vec(),
        })
        .await
        .unwrap();
        tx.send(PieceData {
            index: 0,
            offset: 0,
            data: b"0000000000".to_vec(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        let data =
            std::fs::read(torrent_dir.join(SPARSE_FILE_NAME)).unwrap();
        assert_eq!(data, b"abcdefwxyz");

        let _ = std::fs::remove_dir_all(&download_dir);
    }
}
