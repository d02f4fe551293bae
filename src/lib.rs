pub mod bencode;
mod builder;
pub mod config;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod scheduler;
pub mod storage;
mod torrent;
pub mod tracker;

#[cfg(test)]
mod testutil;

pub use builder::TorrentClientBuilder;
pub use torrent::{ClientError, DownloadError, DownloadReport, TorrentClient};
