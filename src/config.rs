use std::time::Duration;

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MAX_MESSAGE_LEN;

const PEER_ID_PREFIX: &[u8; 8] = b"-BL0001-";

/// Largest block whose Piece frame (tag, index, begin, block) fits one message.
pub const MAX_BLOCK_SIZE: u32 = MAX_MESSAGE_LEN - 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block size {0} must be in 1..={MAX_BLOCK_SIZE}")]
    BlockSize(u32),
}

/// Tunables shared by the tracker client, the peer sessions and the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub peer_id: [u8; 20],
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub tracker_timeout: Duration,
    pub block_size: u32,
    /// Upper bound on download rounds, the first one included.
    pub max_rounds: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            port: 6881,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(10),
            tracker_timeout: Duration::from_secs(30),
            block_size: 1 << 14,
            max_rounds: 8,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        Ok(())
    }

    /// Delay before retry round `round` (1-based), doubling up to `max_backoff`.
    pub fn backoff(&self, round: u32) -> Duration {
        let factor = 1u32 << round.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Azureus-style peer id: client prefix followed by 12 random alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut id[8..] {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_carry_prefix_and_differ() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(&a[..8], PEER_ID_PREFIX);
        assert!(a[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(a, b);
    }

    #[test]
    fn validates_block_size() {
        assert_eq!(ClientConfig::default().validate(), Ok(()));
        for block_size in [0, MAX_BLOCK_SIZE + 1] {
            let config = ClientConfig {
                block_size,
                ..Default::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::BlockSize(block_size)));
        }
        let largest = ClientConfig {
            block_size: MAX_BLOCK_SIZE,
            ..Default::default()
        };
        assert_eq!(largest.validate(), Ok(()));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ClientConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(40), Duration::from_millis(500));
    }
}
