use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{AccountId, AssetId, Permission};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub rpc_listen: SocketAddr,
    #[serde(default = "default_max_txs_per_proposal")]
    pub max_txs_per_proposal: usize,
    #[serde(default = "default_proposal_interval_ms")]
    pub proposal_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_dedup_window_heights")]
    pub dedup_window_heights: usize,
    #[serde(default = "default_max_timestamp_skew_ms")]
    pub max_timestamp_skew_ms: u64,
    #[serde(default = "default_max_signatures_per_tx")]
    pub max_signatures_per_tx: usize,
    #[serde(default = "default_consensus_round_timeout_ms")]
    pub consensus_round_timeout_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    /// Base addresses of the other ledger peers, e.g. `http://10.0.0.2:7410`.
    #[serde(default)]
    pub peers: Vec<String>,
    pub genesis: GenesisConfig,
}

fn default_max_txs_per_proposal() -> usize {
    10
}

fn default_proposal_interval_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    4_096
}

fn default_dedup_window_heights() -> usize {
    5
}

fn default_max_timestamp_skew_ms() -> u64 {
    24 * 60 * 60 * 1_000
}

fn default_max_signatures_per_tx() -> usize {
    10
}

fn default_consensus_round_timeout_ms() -> u64 {
    3_000
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_fetch_retries() -> u32 {
    3
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn proposal_interval(&self) -> Duration {
        Duration::from_millis(self.proposal_interval_ms)
    }

    pub fn consensus_round_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_round_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            rpc_listen: "127.0.0.1:7410".parse().expect("valid socket addr"),
            max_txs_per_proposal: default_max_txs_per_proposal(),
            proposal_interval_ms: default_proposal_interval_ms(),
            queue_capacity: default_queue_capacity(),
            dedup_window_heights: default_dedup_window_heights(),
            max_timestamp_skew_ms: default_max_timestamp_skew_ms(),
            max_signatures_per_tx: default_max_signatures_per_tx(),
            consensus_round_timeout_ms: default_consensus_round_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            fetch_retries: default_fetch_retries(),
            peers: Vec::new(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    #[serde(default)]
    pub assets: Vec<GenesisAsset>,
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
    #[serde(default)]
    pub peers: Vec<GenesisPeer>,
    #[serde(default)]
    pub permissions: Vec<GenesisPermission>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "vellum-local".to_string(),
            assets: Vec::new(),
            accounts: Vec::new(),
            peers: Vec::new(),
            permissions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAsset {
    pub asset_id: AssetId,
    #[serde(default)]
    pub precision: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub account_id: AccountId,
    /// Hex-encoded ed25519 public key registered as the first signatory.
    pub public_key: String,
    #[serde(default)]
    pub balances: Vec<GenesisBalance>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisBalance {
    pub asset_id: AssetId,
    pub amount: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisPeer {
    pub address: String,
    pub public_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisPermission {
    pub account_id: AccountId,
    pub permission: Permission,
}
