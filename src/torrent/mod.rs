//! The orchestrator of one download: wires the metainfo through the
//! tracker, fans sessions out to every returned peer, and drives the
//! pipeline until the content is verified on disk and split into its
//! declared files.
pub mod downloader;

use std::{sync::Arc, time::Duration};

use tokio::{select, spawn, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::CONFIG,
    disk,
    error::Error,
    metainfo::Metainfo,
    peer::{PeerSession, SessionCtx},
    tracker::Tracker,
    utils::human_bytes,
};

use self::downloader::Downloader;

/// How often the progress line is printed.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

pub struct Torrent {
    pub meta: Arc<Metainfo>,
    download_dir: String,
    cancel: CancellationToken,
}

impl Torrent {
    pub fn new(meta: Metainfo, download_dir: String) -> Self {
        Self {
            meta: Arc::new(meta),
            download_dir,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the download to completion: start the disk writer, query the
    /// tracker, spawn one session per peer, and wait for the writer to
    /// drain before splitting the staging file into the declared layout.
    #[tracing::instrument(name = "torrent", skip_all, fields(name = %self.meta.info.name))]
    pub async fn run(&self) -> Result<(), Error> {
        let info_hash = self.meta.info_hash();
        info!(
            "starting {} ({}, {} pieces), info hash {info_hash}",
            self.meta.info.name,
            human_bytes(self.meta.total_size()),
            self.meta.piece_count(),
        );

        let (downloader, writer_rx) = Downloader::new(self.meta.clone())?;
        let downloader = Arc::new(downloader);

        let (file, torrent_dir) =
            disk::create_sparse_file(&self.meta, &self.download_dir).await?;
        let writer = disk::Writer::new(file, self.meta.piece_count());
        let mut writer_handle = spawn(writer.run(writer_rx));

        let mut tracker =
            Tracker::connect_to(&self.meta.announce_addr()?).await?;
        let (_, peers) = tracker
            .announce(
                info_hash,
                self.meta.total_size(),
                CONFIG.local_peer_port,
            )
            .await?;

        if peers.is_empty() {
            self.cancel.cancel();
            return Err(Error::NoPeers);
        }

        let ctx = Arc::new(SessionCtx {
            meta: self.meta.clone(),
            downloader: downloader.clone(),
            cancel: self.cancel.clone(),
        });

        let mut handles = Vec::with_capacity(peers.len());
        for addr in peers {
            let ctx = ctx.clone();
            handles.push(spawn(async move {
                match PeerSession::connect(addr, ctx).await {
                    Ok(mut session) => {
                        if let Err(e) = session.run().await {
                            debug!("{addr} session closed: {e}");
                        }
                    }
                    Err(e) => debug!("{addr} could not be connected: {e}"),
                }
            }));
        }

        let ticker = spawn(Self::progress_ticker(
            downloader.clone(),
            self.cancel.clone(),
        ));

        // the writer finishing means every piece was verified, persisted
        // and fsynced; sessions finishing first means we ran out of peers
        let sessions = async move {
            for handle in handles {
                let _ = handle.await;
            }
        };
        tokio::pin!(sessions);

        let result: Result<(), Error> = select! {
            res = &mut writer_handle => match res {
                Ok(inner) => inner,
                Err(e) => Err(Error::TaskJoin(e)),
            },
            _ = &mut sessions => {
                if downloader.is_complete().await {
                    match writer_handle.await {
                        Ok(inner) => inner,
                        Err(e) => Err(Error::TaskJoin(e)),
                    }
                } else {
                    Err(Error::DownloadIncomplete)
                }
            }
        };

        self.cancel.cancel();
        let _ = ticker.await;
        result?;

        let progress = downloader.progress().await;
        info!(
            "all {} blocks downloaded and verified, splitting files",
            progress.total_blocks
        );

        disk::split_into_files(&self.meta, &torrent_dir).await?;
        info!("{} is complete", self.meta.info.name);

        Ok(())
    }

    /// Stop every session and the ticker. The writer still drains whatever
    /// was verified before the signal.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn progress_ticker(
        downloader: Arc<Downloader>,
        cancel: CancellationToken,
    ) {
        let mut tick = interval(PROGRESS_INTERVAL);

        loop {
            select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    let p = downloader.progress().await;
                    info!(
                        "progress: {}/{} blocks downloaded, {} requested",
                        p.downloaded_blocks, p.total_blocks, p.requested_blocks
                    );

                    if p.downloaded_blocks == p.total_blocks {
                        return;
                    }
                }
            }
        }
    }
}
