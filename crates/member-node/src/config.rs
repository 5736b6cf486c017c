//! Node configuration.

use anyhow::{bail, Result};
use member_chain::{BlockStoreMode, ChainStateConfig};
use member_consensus::{ChainParams, Network};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Byte budgets for the node's memory caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBudgets {
    /// Block database cache.
    pub block_db: usize,
    /// Undo data cache.
    pub undo: usize,
    /// Block index cache.
    pub block_index: usize,
    /// Transaction index cache.
    pub tx_index: usize,
    /// Coin database cache.
    pub coin_db: usize,
    /// In-memory coin cache; exceeding it triggers an opportunistic flush.
    pub coin_cache: usize,
}

impl Default for CacheBudgets {
    fn default() -> Self {
        Self {
            block_db: 8 * 1024 * 1024,
            undo: 4 * 1024 * 1024,
            block_index: 16 * 1024 * 1024,
            tx_index: 8 * 1024 * 1024,
            coin_db: 64 * 1024 * 1024,
            coin_cache: 256 * 1024 * 1024,
        }
    }
}

impl CacheBudgets {
    /// Combined budget for the shared storage block cache.
    pub fn storage_cache_bytes(&self) -> usize {
        self.block_db + self.undo + self.block_index + self.tx_index + self.coin_db
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network name (mainnet, testnet, testnet4, scalenet, nol, regtest).
    pub network: String,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Store block bodies in the key-value database instead of sequential
    /// flat files.
    #[serde(default)]
    pub use_block_db: bool,
    /// Maintain the txid index.
    #[serde(default)]
    pub txindex: bool,
    /// Blocks of body data to keep; negative keeps everything.
    #[serde(default = "default_blocks_to_keep")]
    pub blocks_to_keep: i64,
    /// Validation worker threads (0 selects half the cores).
    #[serde(default)]
    pub validation_threads: usize,
    /// Override for the excessive-block acceptance threshold.
    #[serde(default)]
    pub excessive_block_size: Option<u64>,
    /// Signature cache budget in bytes.
    #[serde(default = "default_sig_cache_bytes")]
    pub sig_cache_bytes: usize,
    /// Memory cache budgets.
    #[serde(default)]
    pub cache: CacheBudgets,
}

fn default_blocks_to_keep() -> i64 {
    -1
}

fn default_sig_cache_bytes() -> usize {
    32 * 1024 * 1024
}

impl NodeConfig {
    /// Defaults for a network and data directory.
    pub fn new(network: Network, data_dir: PathBuf) -> Self {
        Self {
            network: network.name().to_string(),
            data_dir,
            use_block_db: false,
            txindex: false,
            blocks_to_keep: -1,
            validation_threads: 0,
            excessive_block_size: None,
            sig_cache_bytes: default_sig_cache_bytes(),
            cache: CacheBudgets::default(),
        }
    }

    /// Resolve the network name.
    pub fn network(&self) -> Result<Network> {
        Ok(match self.network.as_str() {
            "mainnet" => Network::Mainnet,
            "testnet" => Network::Testnet,
            "testnet4" => Network::Testnet4,
            "scalenet" => Network::Scalenet,
            "nol" => Network::Nol,
            "regtest" => Network::Regtest,
            other => bail!("unknown network: {other}"),
        })
    }

    /// Build the chain-state configuration.
    pub fn chain_config(&self) -> Result<ChainStateConfig> {
        let params = ChainParams::for_network(self.network()?);
        let mut config = ChainStateConfig::new(params);
        config.store_mode = if self.use_block_db {
            BlockStoreMode::BlockDb
        } else {
            BlockStoreMode::SequentialFiles
        };
        config.blocks_dir = self.data_dir.join("blocks");
        config.txindex = self.txindex;
        config.coin_cache_budget = self.cache.coin_cache;
        config.blocks_to_keep = self.blocks_to_keep;
        if let Some(threshold) = self.excessive_block_size {
            config.accept_threshold_bytes = threshold;
        }
        Ok(config)
    }

    /// Path of the node database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}
