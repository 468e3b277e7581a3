// src/config.rs

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::epoch_key::MAX_EPOCH_TREE_DEPTH;
use crate::error::{Error, Result};

/// Environment variable overriding `server.url`.
pub const SERVER_ENV: &str = "SERVER";
/// Environment variable overriding `chain.rpc_url`.
pub const ETH_PROVIDER_ENV: &str = "DEFAULT_ETH_PROVIDER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub chain: ChainConfig,
    pub server: ServerConfig,
    pub ledger: LedgerConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Address of the ledger contract emitting the events
    pub ledger_address: String,
    /// Address of the social contract tracking airdrops
    pub social_address: String,
    /// Logs are read from the block after this one
    pub genesis_block: u64,
    /// Blocks to wait before a log counts as final
    pub confirmations: u64,
    pub tx_timeout_secs: u64,
    pub receipt_poll_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub attester_id: u64,
    pub num_epoch_key_nonce_per_epoch: u64,
    pub max_reputation_budget: u64,
    pub epoch_tree_depth: u8,
    pub post_reputation: u64,
    pub comment_reputation: u64,
    pub airdrop_reputation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_millis: u64,
    /// Widest block range requested in one `get_logs` call
    pub max_block_range: u64,
    pub sync_timeout_secs: u64,
    /// Consecutive failed ticks before lag is reported as an error
    pub persistent_failure_threshold: u32,
    pub epoch_tick_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            chain: ChainConfig::default(),
            server: ServerConfig::default(),
            ledger: LedgerConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            ledger_address: String::new(),
            social_address: String::new(),
            genesis_block: 0,
            confirmations: 0,
            tx_timeout_secs: 300,
            receipt_poll_millis: 1000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { url: "http://localhost:3001".to_string(), request_timeout_secs: 60 }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            attester_id: 1,
            num_epoch_key_nonce_per_epoch: 3,
            max_reputation_budget: 10,
            epoch_tree_depth: 32,
            post_reputation: 5,
            comment_reputation: 3,
            airdrop_reputation: 30,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_millis: 1000,
            max_block_range: 10_000,
            sync_timeout_secs: 120,
            persistent_failure_threshold: 10,
            epoch_tick_secs: 1,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self { Self { path: "./data/repledger".to_string() } }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_millis) }

    pub fn sync_timeout(&self) -> Duration { Duration::from_secs(self.sync_timeout_secs) }

    pub fn epoch_tick(&self) -> Duration { Duration::from_secs(self.epoch_tick_secs) }
}

impl Config {
    /// Loads the configuration from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Configuration(e.to_string()))?;
        }
        let contents = toml::to_string(self).map_err(|e| Error::Configuration(e.to_string()))?;
        fs::write(path, contents).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup(SERVER_ENV).filter(|v| !v.is_empty()) {
            self.server.url = server;
        }
        if let Some(provider) = lookup(ETH_PROVIDER_ENV).filter(|v| !v.is_empty()) {
            self.chain.rpc_url = provider;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let depth = self.ledger.epoch_tree_depth;
        if depth == 0 || depth > MAX_EPOCH_TREE_DEPTH {
            return Err(Error::Configuration(format!(
                "epoch_tree_depth must be in 1..={MAX_EPOCH_TREE_DEPTH}, got {depth}"
            )));
        }
        if self.ledger.num_epoch_key_nonce_per_epoch == 0 {
            return Err(Error::Configuration("num_epoch_key_nonce_per_epoch must be positive".into()));
        }
        if self.ledger.max_reputation_budget == 0 {
            return Err(Error::Configuration("max_reputation_budget must be positive".into()));
        }
        if self.sync.poll_interval_millis == 0 {
            return Err(Error::Configuration("poll_interval_millis must be positive".into()));
        }
        if self.sync.max_block_range == 0 {
            return Err(Error::Configuration("max_block_range must be positive".into()));
        }
        Ok(())
    }

    /// Base URL of the submission server without a trailing slash.
    pub fn server_url(&self) -> &str { self.server.url.trim_end_matches('/') }
}
