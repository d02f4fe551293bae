use std::{net::SocketAddrV4, sync::Arc};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};

use crate::{
    config::ClientConfig,
    message::{Bitfield, HandShake, Message, MessageError, Piece},
    metainfo::TorrentMetadata,
    piece::{BlockError, VerificationError},
    scheduler::PieceScheduler,
    storage::PieceSink,
};

/// A session gives up on a peer after this many corrupt pieces from it.
const MAX_HASH_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("handshake info hash mismatch")]
    InfoHashMismatch,
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("write error: {0}")]
    Write(std::io::Error),
    #[error("unexpected piece #{got} while downloading #{claimed}")]
    UnexpectedPiece { got: u32, claimed: u32 },
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("{0} pieces failed verification")]
    TooManyHashFailures(u32),
    #[error("piece sink: {0}")]
    Sink(std::io::Error),
    #[error("no buffer for claimed piece #{0}")]
    MissingBuffer(u32),
    #[error("not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Choked,
    Requesting,
    Closed(Outcome),
}

/// Shared handles every session of one download works against.
#[derive(Clone)]
pub struct SessionContext {
    pub metadata: Arc<TorrentMetadata>,
    pub scheduler: Arc<PieceScheduler>,
    pub sink: Arc<dyn PieceSink>,
    pub config: Arc<ClientConfig>,
}

/// A piece index held by one session. Dropping it hands the index back to
/// the scheduler, including when the session task unwinds; completed
/// indices are not requeued.
struct Claim {
    index: u32,
    scheduler: Arc<PieceScheduler>,
}

impl Claim {
    fn new(index: u32, scheduler: Arc<PieceScheduler>) -> Self {
        Self { index, scheduler }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.scheduler.release(self.index);
    }
}

enum PeerEvent {
    Continue,
    Exit,
}

/// One connection to one peer, owned by the task that runs it.
pub struct PeerSession {
    addr: SocketAddrV4,
    state: SessionState,
    stream: Option<TcpStream>,
    bitfield: Option<Bitfield>,
    claimed: Option<Claim>,
    retries: u32,
    hash_failures: u32,
    ctx: SessionContext,
}

impl PeerSession {
    pub fn new(addr: SocketAddrV4, ctx: SessionContext) -> Self {
        Self {
            addr,
            state: SessionState::Connecting,
            stream: None,
            bitfield: None,
            claimed: None,
            retries: 0,
            hash_failures: 0,
            ctx,
        }
    }

    /// Drives the session to completion.
    ///
    /// Never returns an error: failures release the claimed piece and put the
    /// peer in the scheduler's failed set.
    pub async fn run(mut self) -> SessionState {
        let result = self.drive().await;
        self.claimed = None;
        self.stream = None;
        self.state = match result {
            Ok(()) => {
                info!("peer {} done", self.addr);
                SessionState::Closed(Outcome::Ok)
            }
            Err(err) => {
                warn!("peer {} disconnect cause of error: {}", self.addr, err);
                self.ctx.scheduler.mark_failed(self.addr);
                SessionState::Closed(Outcome::Failed)
            }
        };
        self.state
    }

    async fn drive(&mut self) -> Result<(), PeerError> {
        self.try_connect().await?;
        self.handshake().await?;
        loop {
            let limit = self.ctx.config.read_timeout;
            let msg = Message::from_stream(self.stream()?, limit).await?;
            if let PeerEvent::Exit = self.process_msg(msg).await? {
                return Ok(());
            }
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, PeerError> {
        self.stream.as_mut().ok_or(PeerError::NotConnected)
    }

    async fn try_connect(&mut self) -> Result<(), PeerError> {
        self.state = SessionState::Connecting;
        let stream = timeout(self.ctx.config.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout)?
            .map_err(PeerError::Connect)?;
        self.stream = Some(stream);
        info!("peer connected: {}", self.addr);
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), PeerError> {
        self.state = SessionState::Handshaking;
        let info_hash = self.ctx.metadata.info_hash;
        let ours = HandShake::new(info_hash, self.ctx.config.peer_id);
        self.write(&ours.as_bytes()).await?;

        let limit = self.ctx.config.read_timeout;
        let theirs = Message::read_handshake(self.stream()?, limit).await?;
        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        self.state = SessionState::AwaitingBitfield;
        info!("handshake success with peer: {}", self.addr);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        self.stream()?
            .write_all(bytes)
            .await
            .map_err(PeerError::Write)
    }

    async fn send_message(&mut self, msg: Message) -> Result<(), PeerError> {
        self.write(&msg.as_bytes()).await
    }

    async fn process_msg(&mut self, msg: Message) -> Result<PeerEvent, PeerError> {
        match msg {
            Message::KeepAlive => {
                self.retries += 1;
                debug!("keep-alive #{} from peer: {}", self.retries, self.addr);
            }
            Message::Bitfield(bitfield) => {
                debug!(
                    "get bitfield, length={}, from peer: {}",
                    bitfield.len(),
                    self.addr
                );
                self.bitfield = Some(bitfield);
                if self.state == SessionState::AwaitingBitfield {
                    self.state = SessionState::Choked;
                }
                self.send_message(Message::Interested).await?;
            }
            Message::UnChoke => {
                debug!("peer is unchoked: {}", self.addr);
                // a choke drops pending requests, so ask again for the claimed piece
                match self.claimed.as_ref().map(|claim| claim.index) {
                    Some(index) => self.request_block(index).await?,
                    None => return self.request_next_piece().await,
                }
            }
            Message::Piece(piece) => return self.on_piece(piece).await,
            other => debug!("ignoring {:?} from peer: {}", other, self.addr),
        }
        Ok(PeerEvent::Continue)
    }

    /// Claims the next piece this peer holds and requests its first block.
    async fn request_next_piece(&mut self) -> Result<PeerEvent, PeerError> {
        let claimed = match &self.bitfield {
            Some(bitfield) => self.ctx.scheduler.claim_next(bitfield),
            None => None,
        };
        let Some(index) = claimed else {
            info!("no more pieces to fetch from peer: {}", self.addr);
            return Ok(PeerEvent::Exit);
        };
        self.claimed = Some(Claim::new(index, self.ctx.scheduler.clone()));
        self.state = SessionState::Requesting;
        self.request_block(index).await?;
        Ok(PeerEvent::Continue)
    }

    async fn request_block(&mut self, index: u32) -> Result<(), PeerError> {
        if let Some(request) = self.ctx.scheduler.next_request(index) {
            debug!(
                "request piece #{} offset {} from peer: {}",
                index, request.begin, self.addr
            );
            self.send_message(Message::Request(request)).await?;
        }
        Ok(())
    }

    async fn on_piece(&mut self, piece: Piece) -> Result<PeerEvent, PeerError> {
        let Some(index) = self.claimed.as_ref().map(|claim| claim.index) else {
            debug!("unsolicited piece #{} from peer: {}", piece.index, self.addr);
            return Ok(PeerEvent::Continue);
        };
        if piece.index != index && self.ctx.scheduler.is_completed(piece.index) {
            debug!("stale block of piece #{} from peer: {}", piece.index, self.addr);
            return Ok(PeerEvent::Continue);
        }
        if piece.index != index {
            return Err(PeerError::UnexpectedPiece {
                got: piece.index,
                claimed: index,
            });
        }
        let full = self
            .ctx
            .scheduler
            .put_block(index, piece.begin, &piece.block)?;
        if !full {
            self.request_block(index).await?;
            return Ok(PeerEvent::Continue);
        }

        let buffer = self
            .ctx
            .scheduler
            .take_buffer(index)
            .ok_or(PeerError::MissingBuffer(index))?;
        let expected = self
            .ctx
            .metadata
            .piece_hash(index)
            .copied()
            .unwrap_or_default();
        match buffer.verify(&expected) {
            Ok(()) => {
                // the claim stays set until the sink accepts the bytes, so a
                // sink failure hands the piece back through `run`
                self.ctx
                    .sink
                    .store(index, &buffer.into_bytes())
                    .map_err(PeerError::Sink)?;
                self.ctx.scheduler.complete(index);
                self.claimed = None;
                info!(
                    "piece #{} verified ({}/{}) from peer: {}",
                    index,
                    self.ctx.scheduler.completed_count(),
                    self.ctx.scheduler.piece_count(),
                    self.addr
                );
            }
            Err(err) => self.reject_piece(err)?,
        }
        self.request_next_piece().await
    }

    /// Hands a corrupt piece back to the queue for any peer to retry.
    fn reject_piece(&mut self, err: VerificationError) -> Result<(), PeerError> {
        error!("{} from peer: {}", err, self.addr);
        self.claimed = None;
        self.hash_failures += 1;
        if self.hash_failures >= MAX_HASH_FAILURES {
            return Err(PeerError::TooManyHashFailures(self.hash_failures));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{content, context, dead_endpoint, metadata, test_config, FakePeer};

    #[tokio::test]
    async fn downloads_two_pieces_from_one_peer() {
        let pieces = content(32000, 16384);
        let meta = metadata(&pieces, 16384, "http://unused/announce");
        let (ctx, scheduler, sink) = context(meta, test_config());
        let mut peer = FakePeer::new(pieces.clone());
        peer.keep_alive_first = true;
        let addr = peer.spawn().await;

        let state = PeerSession::new(addr, ctx).run().await;

        assert_eq!(state, SessionState::Closed(Outcome::Ok));
        assert_eq!(scheduler.completed_pieces(), vec![0, 1]);
        assert_eq!(sink.store_calls(), 2);
        assert_eq!(sink.piece(0).unwrap(), pieces[0]);
        assert_eq!(sink.piece(1).unwrap().len(), 32000 - 16384);
        assert_eq!(sink.assemble(), pieces.concat());
        assert!(!scheduler.is_failed(&addr));
    }

    #[tokio::test]
    async fn assembles_multi_block_pieces() {
        let pieces = content(100_000, 40_000);
        let meta = metadata(&pieces, 40_000, "http://unused/announce");
        let (ctx, scheduler, sink) = context(meta, test_config());
        let addr = FakePeer::new(pieces.clone()).spawn().await;

        let state = PeerSession::new(addr, ctx).run().await;

        assert_eq!(state, SessionState::Closed(Outcome::Ok));
        assert!(scheduler.is_complete());
        assert_eq!(sink.assemble(), pieces.concat());
    }

    #[tokio::test]
    async fn handshake_mismatch_only_fails_this_peer() {
        let pieces = content(32000, 16384);
        let meta = metadata(&pieces, 16384, "http://unused/announce");
        let (ctx, scheduler, sink) = context(meta, test_config());
        let mut peer = FakePeer::new(pieces);
        peer.reply_hash = [0xee; 20];
        let addr = peer.spawn().await;

        let state = PeerSession::new(addr, ctx).run().await;

        assert_eq!(state, SessionState::Closed(Outcome::Failed));
        assert!(scheduler.is_failed(&addr));
        assert_eq!(scheduler.queued_count(), 2);
        assert_eq!(scheduler.in_flight_count(), 0);
        assert_eq!(scheduler.completed_count(), 0);
        assert_eq!(sink.store_calls(), 0);
    }

    #[tokio::test]
    async fn requests_again_after_choke_and_unchoke() {
        let pieces = content(32000, 16384);
        let meta = metadata(&pieces, 16384, "http://unused/announce");
        let (ctx, scheduler, sink) = context(meta, test_config());
        let mut peer = FakePeer::new(pieces.clone());
        peer.choke_first_request = true;
        let addr = peer.spawn().await;

        let state = PeerSession::new(addr, ctx).run().await;

        assert_eq!(state, SessionState::Closed(Outcome::Ok));
        assert_eq!(scheduler.completed_pieces(), vec![0, 1]);
        assert_eq!(sink.assemble(), pieces.concat());
        assert!(!scheduler.is_failed(&addr));
    }

    #[tokio::test]
    async fn claim_returns_to_queue_when_task_panics() {
        let scheduler = Arc::new(PieceScheduler::new(2, 16, 32, 16));
        let mut bitfield = Bitfield::new(2);
        bitfield.set_piece(0);
        let index = scheduler.claim_next(&bitfield).unwrap();
        let claim = Claim::new(index, scheduler.clone());
        assert_eq!(scheduler.queued_count(), 1);

        let task = tokio::spawn(async move {
            let _claim = claim;
            panic!("session crashed");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(scheduler.queued_count(), 2);
        assert_eq!(scheduler.in_flight_count(), 0);
        assert_eq!(scheduler.claim_next(&bitfield), Some(0));
    }

    #[tokio::test]
    async fn completed_claim_is_not_requeued() {
        let scheduler = Arc::new(PieceScheduler::new(1, 16, 16, 16));
        let mut bitfield = Bitfield::new(1);
        bitfield.set_piece(0);
        let claim = Claim::new(scheduler.claim_next(&bitfield).unwrap(), scheduler.clone());
        scheduler.complete(0);
        drop(claim);
        assert_eq!(scheduler.queued_count(), 0);
        assert!(scheduler.is_complete());
    }

    #[tokio::test]
    async fn unreachable_peer_is_marked_failed() {
        let pieces = content(100, 64);
        let (ctx, scheduler, _) = context(metadata(&pieces, 64, "http://x/a"), test_config());
        let addr = dead_endpoint().await;

        let state = PeerSession::new(addr, ctx).run().await;

        assert_eq!(state, SessionState::Closed(Outcome::Failed));
        assert_eq!(scheduler.take_failed(), vec![addr]);
    }

    #[tokio::test]
    async fn corrupt_piece_is_requeued_not_stored() {
        let pieces = content(32000, 16384);
        let meta = metadata(&pieces, 16384, "http://unused/announce");
        let (ctx, scheduler, sink) = context(meta, test_config());
        let mut peer = FakePeer::new(pieces.clone());
        peer.corrupt_once = vec![0];
        let addr = peer.spawn().await;

        let state = PeerSession::new(addr, ctx).run().await;

        assert_eq!(state, SessionState::Closed(Outcome::Ok));
        assert_eq!(scheduler.completed_pieces(), vec![0, 1]);
        // the corrupted delivery never reached the sink
        assert_eq!(sink.store_calls(), 2);
        assert_eq!(sink.piece(0).unwrap(), pieces[0]);
    }

    #[tokio::test]
    async fn persistently_corrupt_peer_is_dropped() {
        let pieces = content(1000, 100);
        let meta = metadata(&pieces, 100, "http://unused/announce");
        let (ctx, scheduler, sink) = context(meta, test_config());
        let mut peer = FakePeer::new(pieces);
        peer.always_corrupt = (0..10).collect();
        let addr = peer.spawn().await;

        let state = PeerSession::new(addr, ctx).run().await;

        assert_eq!(state, SessionState::Closed(Outcome::Failed));
        assert_eq!(sink.store_calls(), 0);
        assert_eq!(scheduler.completed_count(), 0);
        assert_eq!(scheduler.queued_count(), 10);
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn peer_without_useful_pieces_exits_cleanly() {
        let pieces = content(32000, 16384);
        let meta = metadata(&pieces, 16384, "http://unused/announce");
        let (ctx, scheduler, _) = context(meta, test_config());
        let mut peer = FakePeer::new(pieces);
        peer.have = Some(Vec::new());
        let addr = peer.spawn().await;

        let state = PeerSession::new(addr, ctx).run().await;

        assert_eq!(state, SessionState::Closed(Outcome::Ok));
        assert_eq!(scheduler.queued_count(), 2);
        assert!(!scheduler.is_failed(&addr));
    }
}
