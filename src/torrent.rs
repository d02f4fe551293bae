use std::{collections::HashSet, net::SocketAddrV4, sync::Arc};

use log::{error, info, warn};
use thiserror::Error;
use tokio::task::JoinSet;

use crate::{
    config::{ClientConfig, ConfigError},
    metainfo::TorrentMetadata,
    peer::{PeerSession, SessionContext},
    scheduler::PieceScheduler,
    storage::PieceSink,
    tracker::{TrackerClient, TrackerError},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("tracker returned no peers")]
    NoPeers,
    #[error("download incomplete: {completed}/{total} pieces after {rounds} rounds")]
    Incomplete { completed: u32, total: u32, rounds: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    /// Session rounds run, the first one included.
    pub rounds: u32,
    pub completed: u32,
}

#[derive(Debug)]
pub struct TorrentClient {
    metadata: Arc<TorrentMetadata>,
    config: Arc<ClientConfig>,
    tracker: TrackerClient,
}

impl TorrentClient {
    pub fn new(metadata: TorrentMetadata, config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let tracker = TrackerClient::new(config.tracker_timeout)?;
        Ok(Self {
            metadata: Arc::new(metadata),
            config: Arc::new(config),
            tracker,
        })
    }

    pub fn with_tracker(mut self, tracker: TrackerClient) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn look_for_peers(&self) -> Result<Vec<SocketAddrV4>, TrackerError> {
        let response = self
            .tracker
            .announce(&self.metadata, &self.config.peer_id, self.config.port)
            .await?;
        let mut peers = response.peers;
        let mut seen = HashSet::new();
        peers.retain(|peer| seen.insert(*peer));
        Ok(peers)
    }

    /// Announces once, then downloads every piece into `sink`.
    pub async fn download(&self, sink: Arc<dyn PieceSink>) -> Result<DownloadReport, DownloadError> {
        let peers = self.look_for_peers().await?;
        if peers.is_empty() {
            return Err(DownloadError::NoPeers);
        }
        self.download_from(&peers, sink).await
    }

    /// Runs session rounds against `peers` until every piece is verified or
    /// `max_rounds` is spent.
    ///
    /// A retry round relaunches the peers that failed in the previous round,
    /// or all of `peers` when none failed.
    pub async fn download_from(
        &self,
        peers: &[SocketAddrV4],
        sink: Arc<dyn PieceSink>,
    ) -> Result<DownloadReport, DownloadError> {
        let scheduler = Arc::new(PieceScheduler::from_metadata(
            &self.metadata,
            self.config.block_size,
        ));
        let ctx = SessionContext {
            metadata: self.metadata.clone(),
            scheduler: scheduler.clone(),
            sink,
            config: self.config.clone(),
        };
        let total = scheduler.piece_count();
        let max_rounds = self.config.max_rounds.max(1);

        let mut batch = peers.to_vec();
        let mut rounds = 0;
        while !scheduler.is_complete() {
            if rounds == max_rounds || peers.is_empty() {
                return Err(DownloadError::Incomplete {
                    completed: scheduler.completed_count(),
                    total,
                    rounds,
                });
            }
            if rounds > 0 {
                let delay = self.config.backoff(rounds);
                warn!(
                    "{}/{} pieces after round {}, retrying {} peers in {:?}",
                    scheduler.completed_count(),
                    total,
                    rounds,
                    batch.len(),
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            rounds += 1;
            info!("round {}: starting {} peer sessions", rounds, batch.len());
            run_round(&ctx, &batch).await;

            batch = scheduler.take_failed();
            if batch.is_empty() {
                batch = peers.to_vec();
            }
        }

        info!("all {} pieces verified after {} rounds", total, rounds);
        Ok(DownloadReport {
            rounds,
            completed: scheduler.completed_count(),
        })
    }
}

/// Runs one session per peer in parallel and waits for all of them.
async fn run_round(ctx: &SessionContext, peers: &[SocketAddrV4]) {
    let mut sessions = JoinSet::new();
    for &peer in peers {
        sessions.spawn(PeerSession::new(peer, ctx.clone()).run());
    }
    while let Some(joined) = sessions.join_next().await {
        if let Err(err) = joined {
            error!("peer session task aborted: {}", err);
        }
    }
}
