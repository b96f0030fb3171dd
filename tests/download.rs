//! End-to-end download against an in-process mock UDP tracker and a mock
//! seeding peer: announce, handshake, bitfield/unchoke, block requests,
//! piece verification, persistence, and the final file split.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use hashbrown::HashMap;
use sha1::{Digest, Sha1};
use tokio::{
    net::{TcpListener, UdpSocket},
    time::timeout,
};
use tokio_util::codec::{Framed, FramedParts};

use remora::{
    bencode::{self, Value},
    metainfo::Metainfo,
    peer::PeerId,
    tcp_wire::{
        codec::{Message, MessageCodec},
        handshake::{Handshake, HandshakeCodec},
        Block, BLOCK_LEN,
    },
    torrent::Torrent,
    tracker::{announce, connect},
};

const PIECE_LEN: u32 = 2 * BLOCK_LEN;

/// Deterministic, non-zero content so overwrite probes and hash checks mean
/// something.
fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251 + 1) as u8).collect()
}

fn sha1_of(buf: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(buf);
    hasher.finalize().into()
}

/// A multi-file torrent over `content`, with one nested path.
fn build_metainfo(announce_url: &str, content: &[u8]) -> Vec<u8> {
    let pieces: Vec<u8> = content
        .chunks(PIECE_LEN as usize)
        .flat_map(|chunk| sha1_of(chunk))
        .collect();

    let files = Value::List(vec![
        Value::Dict(BTreeMap::from([
            (b"length".to_vec(), Value::Int(25_000)),
            (
                b"path".to_vec(),
                Value::List(vec![
                    Value::Str(b"docs".to_vec()),
                    Value::Str(b"readme.txt".to_vec()),
                ]),
            ),
        ])),
        Value::Dict(BTreeMap::from([
            (b"length".to_vec(), Value::Int(15_000)),
            (
                b"path".to_vec(),
                Value::List(vec![Value::Str(b"data.bin".to_vec())]),
            ),
        ])),
    ]);

    assert_eq!(content.len(), 40_000);

    let info = Value::Dict(BTreeMap::from([
        (b"files".to_vec(), files),
        (b"name".to_vec(), Value::Str(b"bundle".to_vec())),
        (b"piece length".to_vec(), Value::Int(PIECE_LEN as i64)),
        (b"pieces".to_vec(), Value::Str(pieces)),
    ]));
    let root = Value::Dict(BTreeMap::from([
        (
            b"announce".to_vec(),
            Value::Str(announce_url.as_bytes().to_vec()),
        ),
        (b"info".to_vec(), info),
    ]));

    bencode::encode(&root)
}

/// Minimal BEP 15 tracker: answers one connect and one announce, handing
/// out the given peers. The trailing garbage tests partial-record discard.
async fn run_mock_tracker(socket: UdpSocket, peers: Vec<SocketAddr>) {
    let mut connections: HashMap<SocketAddr, u64> = HashMap::new();
    let mut buf = [0u8; announce::Request::LEN + 1];

    loop {
        let Ok((len, who)) = socket.recv_from(&mut buf).await else {
            return;
        };

        match len {
            connect::Request::LEN => {
                let req = connect::Request::deserialize(&buf[..len]).unwrap();
                let connection_id = rand_u64();
                connections.insert(who, connection_id);

                let res = connect::Response {
                    action: 0,
                    transaction_id: req.transaction_id,
                    connection_id,
                };
                socket.send_to(&res.serialize(), who).await.unwrap();
            }
            announce::Request::LEN => {
                let req = announce::Request::deserialize(&buf[..len]).unwrap();
                assert_eq!(connections.get(&who), Some(&req.connection_id));
                assert_eq!(req.num_want, -1);
                assert_eq!(&req.peer_id.0[..8], b"-AT0001-");

                let res = announce::Response {
                    action: 1,
                    transaction_id: req.transaction_id,
                    interval: 1800,
                    leechers: 1,
                    seeders: peers.len() as u32,
                };

                let mut wire = res.serialize().to_vec();
                for peer in &peers {
                    let SocketAddr::V4(v4) = peer else { panic!() };
                    wire.extend_from_slice(&v4.ip().octets());
                    wire.extend_from_slice(&v4.port().to_be_bytes());
                }
                // a trailing partial record the client must discard
                wire.extend_from_slice(&[9, 9, 9]);

                socket.send_to(&wire, who).await.unwrap();
            }
            _ => panic!("unexpected datagram of {len} bytes"),
        }
    }
}

fn rand_u64() -> u64 {
    rand::random()
}

/// A seeder that has every piece: handshakes, advertises its bitfield (with
/// a phantom pad bit set), unchokes, and serves block requests until the
/// leecher hangs up.
async fn run_mock_seeder(
    listener: TcpListener,
    info_hash: [u8; 20],
    content: Vec<u8>,
) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut socket = Framed::new(stream, HandshakeCodec);

    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash.0, info_hash);
    assert_eq!(&theirs.peer_id.0[..8], b"-AT0001-");

    socket
        .send(Handshake::new(theirs.info_hash, PeerId(*b"-MK0001-seederseeder")))
        .await
        .unwrap();

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    let piece_count = content.len().div_ceil(PIECE_LEN as usize);
    assert_eq!(piece_count, 2);

    // pieces 0 and 1, plus a pad bit the leecher must not act on
    let bitfield = remora::bitfield::Bitfield::from_vec(vec![0b1110_0000]);
    socket.send(Message::Bitfield(bitfield)).await.unwrap();
    socket.send(Message::Unchoke).await.unwrap();

    while let Some(Ok(msg)) = socket.next().await {
        match msg {
            Message::Interested | Message::KeepAlive => {}
            Message::Request(info) => {
                assert!((info.index as usize) < piece_count, "phantom piece");
                assert!(info.len <= BLOCK_LEN);

                let start = info.index as usize * PIECE_LEN as usize
                    + info.begin as usize;
                let block = content[start..start + info.len as usize].to_vec();

                socket
                    .send(Message::Piece(Block {
                        index: info.index as usize,
                        begin: info.begin,
                        block,
                    }))
                    .await
                    .unwrap();
            }
            other => panic!("seeder got unexpected message {other:?}"),
        }
    }
}

fn scratch_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("remora-e2e-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[tokio::test]
async fn downloads_verifies_and_splits_a_torrent() {
    let content = content(40_000);

    let seeder_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_addr = seeder_listener.local_addr().unwrap();

    let tracker_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tracker_addr = tracker_socket.local_addr().unwrap();

    let raw = build_metainfo(
        &format!("udp://{tracker_addr}/announce"),
        &content,
    );
    let meta = Metainfo::parse(&raw).unwrap();
    let info_hash = meta.info_hash().0;

    tokio::spawn(run_mock_tracker(tracker_socket, vec![seeder_addr]));
    tokio::spawn(run_mock_seeder(
        seeder_listener,
        info_hash,
        content.clone(),
    ));

    let download_dir = scratch_dir("full");
    let torrent = Torrent::new(meta, download_dir.display().to_string());

    timeout(Duration::from_secs(30), torrent.run())
        .await
        .expect("download did not finish in time")
        .expect("download failed");

    let bundle = download_dir.join("bundle");

    let staged = std::fs::read(bundle.join("torrent.data")).unwrap();
    assert_eq!(staged, content);

    // every piece on disk hashes to its declared value
    for (index, chunk) in content.chunks(PIECE_LEN as usize).enumerate() {
        let offset = index * PIECE_LEN as usize;
        assert_eq!(
            sha1_of(&staged[offset..offset + chunk.len()]),
            sha1_of(chunk)
        );
    }

    let readme = std::fs::read(bundle.join("docs/readme.txt")).unwrap();
    let data = std::fs::read(bundle.join("data.bin")).unwrap();
    assert_eq!(readme, content[..25_000]);
    assert_eq!(data, content[25_000..]);

    let _ = std::fs::remove_dir_all(&download_dir);
}

#[tokio::test]
async fn fails_when_the_only_peer_is_unreachable() {
    let content = content(40_000);

    let tracker_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tracker_addr = tracker_socket.local_addr().unwrap();

    // a peer nobody listens on
    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let raw = build_metainfo(
        &format!("udp://{tracker_addr}/announce"),
        &content,
    );
    let meta = Metainfo::parse(&raw).unwrap();

    tokio::spawn(run_mock_tracker(tracker_socket, vec![dead_addr]));

    let download_dir = scratch_dir("dead");
    let torrent = Torrent::new(meta, download_dir.display().to_string());

    let result = timeout(Duration::from_secs(30), torrent.run())
        .await
        .expect("run did not finish in time");
    assert!(matches!(
        result,
        Err(remora::error::Error::DownloadIncomplete)
    ));

    let _ = std::fs::remove_dir_all(&download_dir);
}
