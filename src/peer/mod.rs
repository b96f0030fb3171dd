//! A remote peer that the client downloads from.
//!
//! One session owns one TCP connection: it dials, handshakes, then reads
//! length-prefixed messages until the download completes, the peer
//! misbehaves, or the session is cancelled. Sessions never upload; the only
//! messages this client sends after the handshake are `interested` and
//! `request`.

pub mod queue;

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    select,
    time::{sleep, timeout},
};
use tokio_util::{
    codec::{Framed, FramedParts},
    sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use crate::{
    error::Error,
    metainfo::Metainfo,
    tcp_wire::{
        codec::{Message, MessageCodec},
        handshake::{Handshake, HandshakeCodec},
        Block, BlockInfo, BLOCK_LEN,
    },
    torrent::downloader::Downloader,
};

use self::queue::BlockQueue;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// A 20-byte peer identity, exchanged in handshakes and announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

/// Azureus-style: `-`, two characters of client id, four digits of version,
/// `-`, then random bytes.
static LOCAL_PEER_ID: LazyLock<PeerId> = LazyLock::new(|| {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-AT0001-");
    let suffix: [u8; 12] = rand::random();
    id[8..].copy_from_slice(&suffix);
    PeerId(id)
});

impl PeerId {
    /// The process-wide identity of this client, generated once.
    pub fn local() -> Self {
        *LOCAL_PEER_ID
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// What every session shares: the torrent, the download bookkeeping and the
/// shutdown signal.
#[derive(Debug)]
pub struct SessionCtx {
    pub meta: Arc<Metainfo>,
    pub downloader: Arc<Downloader>,
    pub cancel: CancellationToken,
}

/// A connected, handshaked peer session.
pub struct PeerSession {
    addr: SocketAddr,
    /// Captured from the peer's handshake.
    peer_id: PeerId,
    /// Peers start out choking us.
    am_choked: bool,
    am_interested: bool,
    queue: BlockQueue,
    socket: Framed<TcpStream, MessageCodec>,
    ctx: Arc<SessionCtx>,
}

impl PeerSession {
    /// Dial and handshake a peer. The dial gets one retry after a delay;
    /// a peer that is still unreachable is dropped by the caller.
    pub async fn connect(
        addr: SocketAddr,
        ctx: Arc<SessionCtx>,
    ) -> Result<Self, Error> {
        let stream = Self::dial(addr).await?;
        let (socket, peer_id) = Self::handshake(stream, &ctx).await?;

        debug!("{addr} handshaked, peer id {peer_id}");

        Ok(Self {
            addr,
            peer_id,
            am_choked: true,
            am_interested: false,
            queue: BlockQueue::new(),
            socket,
            ctx,
        })
    }

    async fn dial(addr: SocketAddr) -> Result<TcpStream, Error> {
        match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => debug!("{addr} dial failed ({e}), retrying once"),
            Err(_) => debug!("{addr} dial timed out, retrying once"),
        }

        sleep(DIAL_RETRY_DELAY).await;

        match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(Error::PeerUnreachable),
        }
    }

    /// Exchange the 68-byte handshakes, then switch the connection to the
    /// message codec, preserving whatever the peer already sent after it.
    async fn handshake(
        stream: TcpStream,
        ctx: &SessionCtx,
    ) -> Result<(Framed<TcpStream, MessageCodec>, PeerId), Error> {
        let mut socket = Framed::new(stream, HandshakeCodec);

        let ours = Handshake::new(ctx.meta.info_hash(), PeerId::local());
        socket.send(ours.clone()).await?;

        let theirs = match timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
            Err(_) => return Err(Error::HandshakeTimeout),
            Ok(None) => return Err(Error::PeerClosedSocket),
            Ok(Some(handshake)) => handshake?,
        };

        if !ours.validate(&theirs) {
            return Err(Error::HandshakeInvalid);
        }

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;

        Ok((Framed::from_parts(new_parts), theirs.peer_id))
    }

    /// The session event loop. Returns `Ok` on completion or cancellation;
    /// any error closes only this session. The socket is closed exactly
    /// once, when the session is dropped.
    #[tracing::instrument(
        name = "peer",
        skip_all,
        fields(addr = %self.addr, id = %self.peer_id)
    )]
    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            select! {
                _ = self.ctx.cancel.cancelled() => {
                    debug!("cancelled, closing");
                    return Ok(());
                }
                msg = timeout(MESSAGE_TIMEOUT, self.socket.next()) => {
                    let msg = match msg {
                        Err(_) => return Err(Error::MessageTimeout),
                        Ok(None) => return Err(Error::PeerClosedSocket),
                        Ok(Some(msg)) => msg?,
                    };

                    if self.handle_msg(msg).await? {
                        debug!("download complete, closing");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dispatch one message. Returns `true` once the download completed.
    async fn handle_msg(&mut self, msg: Message) -> Result<bool, Error> {
        match msg {
            Message::KeepAlive => trace!("keepalive"),
            Message::Choke => {
                debug!("choke");
                self.am_choked = true;
            }
            Message::Unchoke => {
                debug!("unchoke");
                self.am_choked = false;
                self.request_one_block().await?;
            }
            Message::Have(piece_index) => {
                trace!("have {piece_index}");
                let was_empty = self.queue.is_empty();

                if (piece_index as usize) < self.ctx.meta.piece_count() {
                    self.enqueue_piece(piece_index as usize)?;
                    self.declare_interest().await?;
                } else {
                    warn!("have with out-of-range piece {piece_index}");
                }

                if was_empty && !self.queue.is_empty() {
                    self.request_one_block().await?;
                }
            }
            Message::Bitfield(bitfield) => {
                debug!("bitfield with {} pieces", bitfield.count_ones());
                let was_empty = self.queue.is_empty();
                let piece_count = self.ctx.meta.piece_count();

                for piece_index in bitfield.iter_ones() {
                    // the trailing bits of the last byte pad the message,
                    // they name no piece
                    if piece_index >= piece_count {
                        break;
                    }
                    self.enqueue_piece(piece_index)?;
                }

                if !self.queue.is_empty() {
                    self.declare_interest().await?;
                }
                if was_empty && !self.queue.is_empty() {
                    self.request_one_block().await?;
                }
            }
            Message::Piece(block) => return self.handle_block(block).await,
            // this client never uploads and supports no extensions
            Message::Interested
            | Message::NotInterested
            | Message::Request(_)
            | Message::Cancel(_)
            | Message::Port(_) => trace!("ignoring {msg:?}"),
            Message::Unknown(id) => trace!("ignoring message id {id}"),
        }

        Ok(false)
    }

    /// A received block: validate it, hand it to the downloader, then either
    /// request the next block or report completion.
    async fn handle_block(&mut self, block: Block) -> Result<bool, Error> {
        let Some(block_index) = block.block_index() else {
            warn!("piece message with misaligned offset {}", block.begin);
            return Ok(false);
        };

        let info = BlockInfo::from(&block);
        let valid = self.ctx.meta.block_length(block.index, block_index)
            .map(|expected| expected == block.block.len() as u32)
            .unwrap_or(false);

        if !valid {
            warn!(
                "invalid piece message: piece {} offset {} len {}",
                block.index,
                block.begin,
                block.block.len()
            );
            return Ok(false);
        }

        self.ctx.downloader.record_downloaded(info, block.block).await?;

        if self.ctx.downloader.is_complete().await {
            return Ok(true);
        }

        self.request_one_block().await?;
        Ok(false)
    }

    /// The request pump: pop candidates until one is still needed, request
    /// it, and record the request. One outstanding request per peer; many
    /// peers compensate for the missing pipeline depth.
    async fn request_one_block(&mut self) -> Result<(), Error> {
        if self.am_choked {
            return Ok(());
        }

        while let Some(block) = self.queue.pop() {
            if !self.ctx.downloader.is_needed(block).await {
                continue;
            }

            trace!(
                "requesting piece {} offset {} len {}",
                block.index,
                block.begin,
                block.len
            );
            self.socket.send(Message::Request(block)).await?;
            self.ctx.downloader.record_requested(block).await;
            return Ok(());
        }

        // queue exhausted, wait for more `have`s or a re-eligible block
        Ok(())
    }

    /// Enqueue every block of a piece this peer just advertised.
    fn enqueue_piece(&mut self, piece_index: usize) -> Result<(), Error> {
        for block in 0..self.ctx.meta.block_count(piece_index)? {
            self.queue.push(BlockInfo {
                index: piece_index as u32,
                begin: block as u32 * BLOCK_LEN,
                len: self.ctx.meta.block_length(piece_index, block)?,
            });
        }
        Ok(())
    }

    /// Tell the peer we want its pieces, once. Peers only unchoke
    /// interested leechers.
    async fn declare_interest(&mut self) -> Result<(), Error> {
        if self.am_interested {
            return Ok(());
        }
        self.am_interested = true;
        self.socket.send(Message::Interested).await
    }
}
