//! Configuration for ContribChain nodes
//!
//! Configuration is supplied by the caller as plain structs; every field has a
//! default so partial documents deserialize cleanly.

use crate::error::ChainError;
use crate::transaction::{Amount, TokenKind};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ChainError> {
        self.chain.validate()?;
        self.network.validate()
    }
}

/// An opening balance written into the genesis block.
#[derive(Debug, Clone, Deserialize)]
pub struct GenesisAllocation {
    pub identity: String,
    pub token: TokenKind,
    pub amount: Amount,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub difficulty: u32,
    pub adjust_difficulty: bool,
    pub max_difficulty: u32,
    pub target_block_time_ms: u64,
    pub max_block_transactions: usize,
    pub max_mempool_size: usize,
    pub duplicate_window_ms: u64,
    pub block_max_future_ms: u64,
    pub block_max_age_ms: u64,
    pub genesis_timestamp: u64,
    pub genesis_allocations: Vec<GenesisAllocation>,
    pub validator_reward: Amount,
    pub balance_cache_size: usize,
    pub transactions: TransactionRules,
    pub consensus: ConsensusConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty: 2,
            adjust_difficulty: false,
            max_difficulty: 6,
            target_block_time_ms: 10_000,
            max_block_transactions: 100,
            max_mempool_size: 10_000,
            duplicate_window_ms: 5_000,
            block_max_future_ms: 60_000,
            block_max_age_ms: 24 * 60 * 60 * 1000,
            // 2023-01-01T00:00:00Z
            genesis_timestamp: 1_672_531_200_000,
            genesis_allocations: Vec::new(),
            validator_reward: Amount::from_tokens(5),
            balance_cache_size: 1_024,
            transactions: TransactionRules::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

impl ChainConfig {
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.difficulty > self.max_difficulty {
            return Err(ChainError::InvalidBlock(format!(
                "difficulty {} exceeds max_difficulty {}",
                self.difficulty, self.max_difficulty
            )));
        }
        if self.max_block_transactions == 0 {
            return Err(ChainError::InvalidBlock(
                "max_block_transactions must be positive".to_string(),
            ));
        }
        if self.max_mempool_size == 0 {
            return Err(ChainError::InvalidTransaction(
                "max_mempool_size must be positive".to_string(),
            ));
        }
        for allocation in &self.genesis_allocations {
            if !crate::identity::is_acceptable(
                &allocation.identity,
                self.transactions.allow_test_identities,
            ) {
                return Err(ChainError::InvalidTransaction(format!(
                    "genesis allocation to malformed identity {}",
                    allocation.identity
                )));
            }
        }
        self.consensus.validate()
    }
}

/// Freshness and identity rules applied to every transaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransactionRules {
    pub max_age_ms: u64,
    pub max_future_ms: u64,
    pub allow_test_identities: bool,
}

impl Default for TransactionRules {
    fn default() -> Self {
        Self {
            max_age_ms: 10 * 60 * 1000,
            max_future_ms: 60 * 1000,
            allow_test_identities: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub min_score: u64,
    pub block_reward_score: u64,
    /// Number of most recent selections inspected by the repeat-selection cap.
    pub selection_window: usize,
    pub max_selections_in_window: usize,
    pub history_capacity: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_score: 10,
            block_reward_score: 50,
            selection_window: 10,
            max_selections_in_window: 3,
            history_capacity: 100,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.history_capacity < self.selection_window {
            return Err(ChainError::Consensus(format!(
                "history_capacity {} is smaller than selection_window {}",
                self.history_capacity, self.selection_window
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub seed_peers: Vec<String>,
    pub max_peers: usize,
    pub auth_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub peer_timeout_ms: u64,
    pub sync_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub rate_limit_messages: u32,
    pub rate_limit_window_ms: u64,
    pub connection_attempt_limit: u32,
    pub connection_attempt_window_ms: u64,
    pub message_max_age_ms: u64,
    pub message_max_future_ms: u64,
    pub max_frame_bytes: usize,
    /// Most blocks served in one sync response.
    pub sync_page_blocks: usize,
    pub maintenance_interval_ms: u64,
    pub discovery_share_limit: usize,
    /// Hex-encoded secp256k1 secret key. A fresh key is generated when absent.
    pub node_secret_key: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 6001,
            seed_peers: Vec::new(),
            max_peers: 50,
            auth_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            peer_timeout_ms: 90_000,
            sync_timeout_ms: 30_000,
            dial_timeout_ms: 10_000,
            rate_limit_messages: 100,
            rate_limit_window_ms: 60_000,
            connection_attempt_limit: 10,
            connection_attempt_window_ms: 10 * 60 * 1000,
            message_max_age_ms: 5 * 60 * 1000,
            message_max_future_ms: 60_000,
            max_frame_bytes: 4 * 1024 * 1024,
            sync_page_blocks: 500,
            maintenance_interval_ms: 1_000,
            discovery_share_limit: 10,
            node_secret_key: None,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.max_peers == 0 {
            return Err(ChainError::NetworkError(
                "max_peers must be positive".to_string(),
            ));
        }
        if self.rate_limit_messages == 0 || self.rate_limit_window_ms == 0 {
            return Err(ChainError::NetworkError(
                "rate limit must allow at least one message per window".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.peer_timeout_ms {
            return Err(ChainError::NetworkError(format!(
                "heartbeat interval {}ms must be shorter than peer timeout {}ms",
                self.heartbeat_interval_ms, self.peer_timeout_ms
            )));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ChainError::NetworkError(
                "maintenance_interval_ms must be positive".to_string(),
            ));
        }
        if self.sync_page_blocks == 0 {
            return Err(ChainError::NetworkError(
                "sync_page_blocks must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn connection_attempt_window(&self) -> Duration {
        Duration::from_millis(self.connection_attempt_window_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}
