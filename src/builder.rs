use std::{path::Path, time::Duration};

use anyhow::{anyhow, Result};
use log::info;

use crate::{config::ClientConfig, metainfo::TorrentMetadata, torrent::TorrentClient};

#[derive(Debug, Default)]
pub struct TorrentClientBuilder {
    metadata: Option<TorrentMetadata>,
    config: ClientConfig,
}

impl TorrentClientBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_torrent_path<T>(self, path: T) -> Result<Self>
    where
        T: AsRef<Path>,
    {
        let bytes = std::fs::read(path.as_ref())?;
        self.add_torrent_bytes(&bytes)
    }

    pub async fn add_torrent_url(self, url: &str) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(concat!("bitleech/", env!("CARGO_PKG_VERSION")))
            .timeout(self.config.tracker_timeout)
            .build()?;
        let bytes = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        self.add_torrent_bytes(&bytes)
    }

    pub fn add_torrent_bytes(mut self, bytes: &[u8]) -> Result<Self> {
        let metadata = TorrentMetadata::from_bytes(bytes)?;
        info!(
            "loaded torrent {} ({} bytes, {} pieces, info hash {})",
            metadata.name,
            metadata.length,
            metadata.piece_count(),
            metadata.info_hash_hex()
        );
        self.metadata = Some(metadata);
        Ok(self)
    }

    pub fn set_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_peer_id(mut self, id: [u8; 20]) -> Self {
        self.config.peer_id = id;
        self
    }

    pub fn set_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn set_connect_timeout(mut self, limit: Duration) -> Self {
        self.config.connect_timeout = limit;
        self
    }

    pub fn set_read_timeout(mut self, limit: Duration) -> Self {
        self.config.read_timeout = limit;
        self
    }

    pub fn set_tracker_timeout(mut self, limit: Duration) -> Self {
        self.config.tracker_timeout = limit;
        self
    }

    pub fn set_block_size(mut self, size: u32) -> Self {
        self.config.block_size = size;
        self
    }

    pub fn set_max_rounds(mut self, rounds: u32) -> Self {
        self.config.max_rounds = rounds;
        self
    }

    pub fn set_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.initial_backoff = initial;
        self.config.max_backoff = max;
        self
    }

    pub fn build(self) -> Result<TorrentClient> {
        let metadata = self
            .metadata
            .ok_or_else(|| anyhow!("no torrent added to the builder"))?;
        Ok(TorrentClient::new(metadata, self.config)?)
    }
}
