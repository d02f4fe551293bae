//! In-process fake peers and tracker for session and download tests.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddrV4},
    sync::{Arc, Mutex},
    time::Duration,
};

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use crate::{
    config::ClientConfig,
    message::{Bitfield, HandShake, Message, Piece},
    metainfo::{FileEntry, TorrentMetadata},
    peer::SessionContext,
    scheduler::PieceScheduler,
    storage::MemorySink,
};

pub const INFO_HASH: [u8; 20] = [0x5a; 20];

pub fn test_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_secs(2),
        tracker_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Content split into pieces with deterministic, index-dependent bytes.
pub fn content(total: usize, piece_length: usize) -> Vec<Vec<u8>> {
    let bytes: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    bytes.chunks(piece_length).map(<[u8]>::to_vec).collect()
}

pub fn metadata(pieces: &[Vec<u8>], piece_length: u32, announce: &str) -> TorrentMetadata {
    let length = pieces.iter().map(|p| p.len() as u64).sum();
    TorrentMetadata {
        announce: announce.to_string(),
        announce_list: Vec::new(),
        info_hash: INFO_HASH,
        length,
        name: "fake.bin".to_string(),
        piece_length,
        piece_hashes: pieces.iter().map(|p| Sha1::digest(p).into()).collect(),
        files: vec![FileEntry {
            path: vec!["fake.bin".to_string()],
            length,
        }],
    }
}

pub fn context(
    metadata: TorrentMetadata,
    config: ClientConfig,
) -> (SessionContext, Arc<PieceScheduler>, Arc<MemorySink>) {
    let scheduler = Arc::new(PieceScheduler::from_metadata(&metadata, config.block_size));
    let sink = Arc::new(MemorySink::new());
    let ctx = SessionContext {
        metadata: Arc::new(metadata),
        scheduler: scheduler.clone(),
        sink: sink.clone(),
        config: Arc::new(config),
    };
    (ctx, scheduler, sink)
}

#[derive(Debug, Clone)]
pub struct FakePeer {
    pub pieces: Vec<Vec<u8>>,
    /// Indices advertised in the bitfield; `None` advertises all.
    pub have: Option<Vec<u32>>,
    /// Info hash echoed in the handshake reply.
    pub reply_hash: [u8; 20],
    /// Pieces whose first delivery is corrupted.
    pub corrupt_once: Vec<u32>,
    /// Pieces corrupted on every delivery.
    pub always_corrupt: Vec<u32>,
    pub keep_alive_first: bool,
    /// Answers the first request with Choke then Unchoke, dropping it.
    pub choke_first_request: bool,
}

impl FakePeer {
    pub fn new(pieces: Vec<Vec<u8>>) -> Self {
        Self {
            pieces,
            have: None,
            reply_hash: INFO_HASH,
            corrupt_once: Vec::new(),
            always_corrupt: Vec::new(),
            keep_alive_first: false,
            choke_first_request: false,
        }
    }

    /// Serves every incoming connection until the test ends.
    pub async fn spawn(self) -> SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = Arc::new(self);
        let corrupted = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let peer = peer.clone();
                let corrupted = corrupted.clone();
                tokio::spawn(async move {
                    let _ = peer.serve(stream, corrupted).await;
                });
            }
        });
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    async fn serve(
        &self,
        mut stream: TcpStream,
        corrupted: Arc<Mutex<HashSet<u32>>>,
    ) -> anyhow::Result<()> {
        let limit = Duration::from_secs(5);
        Message::read_handshake(&mut stream, limit).await?;
        stream
            .write_all(&HandShake::new(self.reply_hash, [0x11; 20]).as_bytes())
            .await?;

        if self.keep_alive_first {
            stream.write_all(&Message::KeepAlive.as_bytes()).await?;
        }
        let count = self.pieces.len() as u32;
        let mut bitfield = Bitfield::new(count);
        match &self.have {
            Some(have) => have.iter().for_each(|&i| bitfield.set_piece(i)),
            None => (0..count).for_each(|i| bitfield.set_piece(i)),
        }
        stream
            .write_all(&Message::Bitfield(bitfield).as_bytes())
            .await?;

        while Message::from_stream(&mut stream, limit).await? != Message::Interested {}
        stream.write_all(&Message::UnChoke.as_bytes()).await?;

        let mut dropped_request = false;
        loop {
            let Message::Request(request) = Message::from_stream(&mut stream, limit).await? else {
                continue;
            };
            if self.choke_first_request && !dropped_request {
                dropped_request = true;
                stream.write_all(&Message::Choke.as_bytes()).await?;
                stream.write_all(&Message::UnChoke.as_bytes()).await?;
                continue;
            }
            let piece = &self.pieces[request.index as usize];
            let begin = request.begin as usize;
            let mut block = piece[begin..begin + request.length as usize].to_vec();
            let corrupt = self.always_corrupt.contains(&request.index)
                || (self.corrupt_once.contains(&request.index)
                    && corrupted.lock().unwrap().insert(request.index));
            if corrupt {
                block.iter_mut().for_each(|b| *b = !*b);
            }
            let msg = Message::Piece(Piece::new(request.index, request.begin, &block));
            stream.write_all(&msg.as_bytes()).await?;
        }
    }
}

/// A listener address with nothing accepting on it.
pub async fn dead_endpoint() -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

/// Answers one HTTP request with `body` and yields the request head.
pub async fn spawn_tracker(body: Vec<u8>) -> (SocketAddrV4, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);
        stream.write_all(&response).await.unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8_lossy(&head).into_owned()
    });
    (SocketAddrV4::new(Ipv4Addr::LOCALHOST, port), handle)
}

pub fn compact_peers(peers: &[SocketAddrV4]) -> Vec<u8> {
    peers
        .iter()
        .flat_map(|peer| {
            let mut entry = peer.ip().octets().to_vec();
            entry.extend_from_slice(&peer.port().to_be_bytes());
            entry
        })
        .collect()
}
