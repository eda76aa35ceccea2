//! Configuration file support for the Cascade ledger.
//!
//! Loads optional `cascade.toml` from the data directory. If no config file
//! exists, defaults are used. Consensus parameters are immutable once loaded
//! and are threaded through constructors rather than read from globals.

use serde::Deserialize;
use std::path::Path;

use crate::identity::AccountId;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub node: NodeConfig,
    pub consensus: ConsensusConfig,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
    pub collapse_interval_ms: u64,
    pub accept_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "./cascade-data".into(),
            collapse_interval_ms: crate::constants::DEFAULT_COLLAPSE_INTERVAL_MS,
            accept_interval_ms: crate::constants::DEFAULT_ACCEPT_INTERVAL_MS,
        }
    }
}

/// Consensus parameters section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Floor applied to a voter's stake before vote weighting.
    pub minimum_stake: u64,
    /// Fraction of stake weight in (0.5, 1.0] required to win a sync batch.
    pub sync_vote_threshold: f64,
    /// Hex-encoded 32-byte account exempt from transaction fees.
    pub faucet_address: String,
    /// Settlement delay for reward withdrawals, in rounds.
    pub reward_withdrawals_round_limit: u64,
    /// Snowball stability threshold.
    pub beta1: u32,
    /// Snowball quorum threshold.
    pub beta2: u32,
    /// Number of votes sampled per voting batch.
    pub snowball_k: usize,
    /// Contract memory page size in bytes.
    pub page_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            minimum_stake: crate::constants::DEFAULT_MINIMUM_STAKE,
            sync_vote_threshold: crate::constants::DEFAULT_SYNC_VOTE_THRESHOLD,
            faucet_address: hex::encode([0u8; 32]),
            reward_withdrawals_round_limit: crate::constants::DEFAULT_REWARD_WITHDRAWALS_ROUND_LIMIT,
            beta1: crate::constants::DEFAULT_BETA1,
            beta2: crate::constants::DEFAULT_BETA2,
            snowball_k: crate::constants::DEFAULT_SNOWBALL_K,
            page_size: crate::constants::DEFAULT_PAGE_SIZE,
        }
    }
}

impl ConsensusConfig {
    /// Parse the configured faucet address, falling back to the all-zero
    /// account when the string is malformed.
    pub fn faucet(&self) -> AccountId {
        AccountId::from_hex(&self.faucet_address).unwrap_or_default()
    }
}

impl CascadeConfig {
    /// Load configuration from `cascade.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("cascade.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
