//! Global request/download bookkeeping, shared by every peer session.
//!
//! Two parallel per-piece bit rows track which blocks were requested and
//! which arrived; arrived blocks are staged until their piece is whole, then
//! the piece is assembled, SHA-1 verified and handed to the disk writer.
//! Everything lives behind one mutex with short critical sections; the
//! writer channel send happens outside the lock so a slow disk backpressures
//! the sessions without ever holding the bookkeeping hostage.

use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::{
    bitfield::Bitfield,
    disk::{PieceData, WRITER_CHANNEL_BOUND},
    error::Error,
    metainfo::Metainfo,
    tcp_wire::{BlockInfo, BLOCK_LEN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded_blocks: usize,
    pub requested_blocks: usize,
    pub total_blocks: usize,
}

#[derive(Debug)]
struct State {
    /// `requested[piece][block]`
    requested: Vec<Bitfield>,
    /// `downloaded[piece][block]`
    downloaded: Vec<Bitfield>,
    /// Arrived block payloads, per piece, until the piece verifies.
    staged: Vec<Vec<Vec<u8>>>,
}

#[derive(Debug)]
pub struct Downloader {
    meta: Arc<Metainfo>,
    total_blocks: usize,
    state: Mutex<State>,
    /// Taken (and thereby closed) exactly once, on the transition to
    /// complete. The writer drains what is left and fsyncs.
    writer_tx: Mutex<Option<mpsc::Sender<PieceData>>>,
}

impl Downloader {
    /// Build the bookkeeping for a torrent and the channel its writer will
    /// consume from.
    pub fn new(
        meta: Arc<Metainfo>,
    ) -> Result<(Self, mpsc::Receiver<PieceData>), Error> {
        let piece_count = meta.piece_count();
        let mut requested = Vec::with_capacity(piece_count);
        let mut downloaded = Vec::with_capacity(piece_count);
        let mut staged = Vec::with_capacity(piece_count);
        let mut total_blocks = 0;

        for piece in 0..piece_count {
            let blocks = meta.block_count(piece)?;
            total_blocks += blocks;
            requested.push(Bitfield::repeat(false, blocks));
            downloaded.push(Bitfield::repeat(false, blocks));
            staged.push(vec![Vec::new(); blocks]);
        }

        let (tx, rx) = mpsc::channel(WRITER_CHANNEL_BOUND);

        Ok((
            Self {
                meta,
                total_blocks,
                state: Mutex::new(State { requested, downloaded, staged }),
                writer_tx: Mutex::new(Some(tx)),
            },
            rx,
        ))
    }

    /// Mark a block as requested. Out-of-range blocks are logged and
    /// ignored.
    pub async fn record_requested(&self, block: BlockInfo) {
        let Some((piece, index)) = self.coords(block) else {
            warn!("request for out-of-range block {block:?} ignored");
            return;
        };

        let mut state = self.state.lock().await;
        state.requested[piece].set(index, true);
    }

    /// Whether a block should still be requested.
    ///
    /// When every block is marked requested but the download is not done,
    /// the outstanding requests belong to dead or silent peers; the
    /// requested set is reset to the downloaded set so they become eligible
    /// again.
    pub async fn is_needed(&self, block: BlockInfo) -> bool {
        let Some((piece, index)) = self.coords(block) else {
            return false;
        };

        let mut state = self.state.lock().await;

        let all_requested = state.requested.iter().all(|row| row.all());
        if all_requested && !state.downloaded.iter().all(|row| row.all()) {
            debug!("every block is pending, re-eligible the undelivered ones");
            state.requested = state.downloaded.clone();
        }

        !state.requested[piece][index]
    }

    /// Record an arrived block. If it completes its piece, the piece is
    /// assembled and verified: a hash match sends it to the writer (this is
    /// where disk backpressure is felt), a mismatch resets the piece so any
    /// peer can re-download it.
    pub async fn record_downloaded(
        &self,
        block: BlockInfo,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        let Some((piece, index)) = self.coords(block) else {
            warn!("downloaded out-of-range block {block:?} ignored");
            return Ok(());
        };

        let mut state = self.state.lock().await;

        if state.downloaded[piece][index] {
            trace!("duplicate block {block:?} ignored");
            return Ok(());
        }

        state.downloaded[piece].set(index, true);
        state.staged[piece][index] = data;

        if !state.downloaded[piece].all() {
            return Ok(());
        }

        // the piece is whole: byte-concatenate its blocks in order
        let assembled = state.staged[piece].concat();

        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest != self.meta.piece_hash(piece)? {
            warn!("piece {piece} failed hash verification, resetting it");
            state.downloaded[piece].fill(false);
            state.requested[piece].fill(false);
            for slot in &mut state.staged[piece] {
                *slot = Vec::new();
            }
            return Ok(());
        }

        trace!("piece {piece} verified");
        for slot in &mut state.staged[piece] {
            *slot = Vec::new();
        }
        drop(state);

        self.send_to_writer(PieceData {
            index: piece,
            offset: self.meta.piece_offset(piece),
            data: assembled,
        })
        .await?;

        if self.is_complete().await {
            self.close_writer().await;
        }

        Ok(())
    }

    pub async fn progress(&self) -> Progress {
        let state = self.state.lock().await;

        Progress {
            downloaded_blocks: state
                .downloaded
                .iter()
                .map(|row| row.count_ones())
                .sum(),
            requested_blocks: state
                .requested
                .iter()
                .map(|row| row.count_ones())
                .sum(),
            total_blocks: self.total_blocks,
        }
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.state.lock().await;
        state.downloaded.iter().all(|row| row.all())
    }

    async fn send_to_writer(&self, piece: PieceData) -> Result<(), Error> {
        let tx = self.writer_tx.lock().await.clone();
        if let Some(tx) = tx {
            tx.send(piece).await?;
        }
        Ok(())
    }

    async fn close_writer(&self) {
        if self.writer_tx.lock().await.take().is_some() {
            debug!("every block downloaded, closing the writer channel");
        }
    }

    /// Validate a wire-level block against the torrent's layout and return
    /// its `(piece, block)` coordinates.
    fn coords(&self, block: BlockInfo) -> Option<(usize, usize)> {
        if block.begin % BLOCK_LEN != 0 {
            return None;
        }

        let piece = block.index as usize;
        let index = block.block_index();

        let count = self.meta.block_count(piece).ok()?;
        if index >= count {
            return None;
        }
        if self.meta.block_length(piece, index).ok()? != block.len {
            return None;
        }

        Some((piece, index))
    }
}
