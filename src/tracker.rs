use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use log::{info, warn};
use thiserror::Error;
use url::{form_urlencoded, Url};

use crate::{
    bencode::{decode, DecodeError, Value},
    metainfo::TorrentMetadata,
};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bencode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid announce url: {0}")]
    InvalidUrl(String),
    #[error("tracker returned error: {0}")]
    Failure(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Announce endpoint picked from the metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Http(Url),
    /// Recognised but not implemented; announcing over it yields no peers.
    Udp(Url),
}

impl Transport {
    fn parse(raw: &str) -> Result<Self, TrackerError> {
        let url = Url::parse(raw).map_err(|_| TrackerError::InvalidUrl(raw.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(url)),
            "udp" => Ok(Self::Udp(url)),
            _ => Err(TrackerError::InvalidUrl(raw.to_string())),
        }
    }

    /// Picks the announce endpoint, preferring HTTP(S) tiers over UDP ones.
    pub fn select(metadata: &TorrentMetadata) -> Result<Self, TrackerError> {
        let tiers: Vec<&str> = metadata
            .announce_list
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        if tiers.is_empty() {
            return Self::parse(&metadata.announce);
        }
        let candidates: Vec<Self> = tiers
            .into_iter()
            .filter_map(|raw| Self::parse(raw).ok())
            .collect();
        candidates
            .iter()
            .find(|t| matches!(t, Self::Http(_)))
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| TrackerError::InvalidUrl(metadata.announce.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub failure_reason: Option<String>,
    pub warning_message: Option<String>,
    /// Re-announce interval in seconds.
    pub interval: u64,
    pub tracker_id: Option<String>,
    /// Seeders.
    pub complete: Option<u64>,
    /// Leechers.
    pub incomplete: Option<u64>,
    pub peers: Vec<SocketAddrV4>,
}

impl AnnounceResponse {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, TrackerError> {
        let value = decode(buf)?;
        if value.as_dict().is_none() {
            return Err(TrackerError::InvalidResponse("expected dict".into()));
        }
        let text = |key: &[u8]| value.get(key).and_then(Value::as_str).map(String::from);
        let count = |key: &[u8]| {
            value
                .get(key)
                .and_then(Value::as_integer)
                .and_then(|v| u64::try_from(v).ok())
        };
        let peers = match value.get(b"peers") {
            Some(Value::Bytes(compact)) => parse_compact_peers(compact)?,
            Some(Value::List(list)) => list.iter().filter_map(parse_peer_dict).collect(),
            Some(_) => return Err(TrackerError::InvalidResponse("peers".into())),
            None => Vec::new(),
        };
        Ok(Self {
            failure_reason: text(b"failure reason"),
            warning_message: text(b"warning message"),
            interval: count(b"interval").unwrap_or_default(),
            tracker_id: text(b"tracker id"),
            complete: count(b"complete"),
            incomplete: count(b"incomplete"),
            peers,
        })
    }
}

/// Expands a compact peer list: 4 address bytes then a big-endian port, per peer.
pub fn parse_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddrV4>, TrackerError> {
    if buf.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse(format!(
            "compact peer list of {} bytes",
            buf.len()
        )));
    }
    Ok(buf
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

fn parse_peer_dict(peer: &Value) -> Option<SocketAddrV4> {
    let ip: Ipv4Addr = peer.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(peer.get(b"port")?.as_integer()?).ok()?;
    Some(SocketAddrV4::new(ip, port))
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    client: reqwest::Client,
}

impl TrackerClient {
    pub fn new(timeout: Duration) -> Result<Self, TrackerError> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(concat!("bitleech/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds the announce URL. `info_hash` and `peer_id` are percent-encoded
    /// byte for byte; existing query parameters on `base` are kept.
    pub fn announce_url(
        base: &Url,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        left: u64,
    ) -> Url {
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
            form_urlencoded::byte_serialize(info_hash).collect::<String>(),
            form_urlencoded::byte_serialize(peer_id).collect::<String>(),
            port,
            left
        );
        let mut url = base.clone();
        let query = match base.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
            _ => query,
        };
        url.set_query(Some(&query));
        url
    }

    pub async fn announce(
        &self,
        metadata: &TorrentMetadata,
        peer_id: &[u8; 20],
        port: u16,
    ) -> Result<AnnounceResponse, TrackerError> {
        let base = match Transport::select(metadata)? {
            Transport::Http(url) => url,
            Transport::Udp(url) => {
                warn!("udp tracker {} is not supported, no peers announced", url);
                return Ok(AnnounceResponse {
                    warning_message: Some(format!("udp tracker {url} not supported")),
                    ..Default::default()
                });
            }
        };
        let url = Self::announce_url(&base, &metadata.info_hash, peer_id, port, metadata.length);
        info!("announce to {}", base);

        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let response = AnnounceResponse::from_bytes(&body)?;
        if let Some(reason) = response.failure_reason {
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = &response.warning_message {
            warn!("tracker warning: {}", warning);
        }
        info!(
            "tracker returned {} peers (seeders {:?}, leechers {:?}, interval {}s)",
            response.peers.len(),
            response.complete,
            response.incomplete,
            response.interval
        );
        Ok(response)
    }
}
