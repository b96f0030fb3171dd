//! A library for leeching over the BitTorrent protocol V1.
//!
//! This is the library behind remora, a download-only BitTorrent client:
//! given a metainfo file it contacts the UDP tracker, negotiates the peer
//! wire protocol with every returned peer in parallel, downloads and
//! SHA-1-verifies every piece, persists them through a single disk writer,
//! and finally splits the staging file into the declared file tree.
//!
//! The building blocks are usable on their own: the [`bencode`] codec, the
//! typed [`metainfo`] model, the [`tracker`] client, the [`tcp_wire`]
//! codecs and the [`peer`] session engine.
//!
//! # Example
//!
//! ```no_run
//! use remora::{metainfo::Metainfo, torrent::Torrent};
//!
//! # async fn run() -> Result<(), remora::error::Error> {
//! let buf = tokio::fs::read("debian.torrent").await?;
//! let meta = Metainfo::parse(&buf)?;
//!
//! let torrent = Torrent::new(meta, "./downloads".into());
//! torrent.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod tcp_wire;
pub mod torrent;
pub mod tracker;
pub mod utils;
