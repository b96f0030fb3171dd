//! The UDP tracker protocol (BEP 15): a connect handshake to obtain a
//! connection id, then an announce that returns the compact peer list.
pub mod action;
pub mod announce;
pub mod connect;
pub mod event;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, info, warn};

use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

static ANNOUNCE_RES_BUF_LEN: usize = 8192;

/// Per-read deadline for the announce exchange. Announce failures are fatal:
/// without peers the download cannot start.
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect requests that time out are retransmitted on the BEP 15 schedule,
/// 15 * 2^n seconds for n in 0..=MAX_RETRANSMITS.
const MAX_RETRANSMITS: u32 = 8;

/// A connected UDP tracker for one torrent.
pub struct Tracker {
    socket: UdpSocket,
    pub tracker_addr: SocketAddr,
    connection_id: u64,
}

impl Tracker {
    /// Bind a UDP socket, connect it to the tracker and perform the connect
    /// exchange. `addr` is `host:port`, as produced by
    /// [`Metainfo::announce_addr`](crate::metainfo::Metainfo::announce_addr).
    pub async fn connect_to(addr: &str) -> Result<Self, Error> {
        let socket = Self::new_udp_socket(addr).await?;

        let mut tracker = Self {
            tracker_addr: socket
                .peer_addr()
                .map_err(|_| Error::TrackerSocketAddr)?,
            socket,
            connection_id: 0,
        };

        tracker.connect_exchange().await?;

        Ok(tracker)
    }

    /// Create a UDP socket reaching the given tracker address.
    async fn new_udp_socket(addr: &str) -> Result<UdpSocket, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|_| Error::TrackerSocketAddr)?;

        socket
            .connect(addr)
            .await
            .map_err(|_| Error::TrackerSocketConnect)?;

        Ok(socket)
    }

    /// The connect handshake. Lost requests are retransmitted with the
    /// BEP 15 backoff schedule.
    async fn connect_exchange(&mut self) -> Result<(), Error> {
        let req = connect::Request::new();
        let mut buf = [0u8; connect::Response::LEN];

        debug!("connecting to tracker {}", self.tracker_addr);
        self.socket.send(&req.serialize()).await?;

        let mut len = 0;
        for n in 0..=MAX_RETRANSMITS {
            let deadline = Duration::from_secs(15 * 2u64.pow(n));

            match timeout(deadline, self.socket.recv(&mut buf)).await {
                Ok(read) => {
                    len = read?;
                    break;
                }
                Err(_) if n == MAX_RETRANSMITS => {
                    return Err(Error::TrackerTimeout);
                }
                Err(_) => {
                    debug!(
                        "tracker connect request was lost, trying again in \
                         {deadline:?}"
                    );
                    self.socket.send(&req.serialize()).await?;
                }
            }
        }

        let res = connect::Response::deserialize(&buf[..len])?;

        if res.action != action::Action::Connect as u32
            || res.transaction_id != req.transaction_id
        {
            warn!("tracker connect response is not valid: {res:?}");
            return Err(Error::TrackerResponse);
        }

        debug!("connected, connection_id {:#x}", res.connection_id);
        self.connection_id = res.connection_id;

        Ok(())
    }

    /// Announce the torrent and collect the compact peer list. Only called
    /// once, at startup, with `left` = total torrent size.
    pub async fn announce(
        &mut self,
        info_hash: InfoHash,
        left: u64,
        port: u16,
    ) -> Result<(announce::Response, Vec<SocketAddr>), Error> {
        let req = announce::Request::new(
            self.connection_id,
            info_hash,
            PeerId::local(),
            left,
            port,
        );

        debug!("announcing to tracker {}", self.tracker_addr);
        self.socket.send(&req.serialize()).await?;

        let mut buf = vec![0u8; ANNOUNCE_RES_BUF_LEN];
        let len = match timeout(ANNOUNCE_TIMEOUT, self.socket.recv(&mut buf))
            .await
        {
            Err(_) => return Err(Error::TrackerTimeout),
            Ok(read) => read?,
        };

        let (res, payload) = announce::Response::deserialize(&buf[..len])?;

        if res.action != action::Action::Announce as u32
            || res.transaction_id != req.transaction_id
        {
            warn!("tracker announce response is not valid: {res:?}");
            return Err(Error::TrackerResponse);
        }

        let peers = parse_compact_peer_list(payload);
        info!(
            "tracker returned {} peers ({} seeders, {} leechers)",
            peers.len(),
            res.seeders,
            res.leechers
        );

        Ok((res, peers))
    }
}

/// Decode 6-byte compact IPv4 peer records: 4 bytes address, 2 bytes port.
/// A trailing partial record is discarded.
pub fn parse_compact_peer_list(buf: &[u8]) -> Vec<SocketAddr> {
    let chunks = buf.chunks_exact(6);

    if !chunks.remainder().is_empty() {
        debug!(
            "discarding {} trailing bytes of the peer list",
            chunks.remainder().len()
        );
    }

    chunks
        .map(|record| {
            let ip = IpAddr::V4(Ipv4Addr::new(
                record[0], record[1], record[2], record[3],
            ));
            let port = u16::from_be_bytes([record[4], record[5]]);
            SocketAddr::new(ip, port)
        })
        .collect()
}
