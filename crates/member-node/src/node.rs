//! Node assembly.
//!
//! `Node` wires the storage, chain state, validation coordinator, signature
//! cache, and interest table into one context value. Nothing here is a
//! process-wide global; collaborators receive references.

use crate::config::NodeConfig;
use anyhow::{bail, Context, Result};
use member_chain::{ChainState, ChainResult, SubmitOutcome, TipInfo, ValidationCoordinator};
use member_consensus::{
    pow, script, Block, BlockHeader, Coin, Hash256, OutPoint, RateTable, SigCache, Transaction,
    TxIn, TxOut,
};
use member_storage::{Database, Storage};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Seconds of tip age below which the node reports itself synced.
const SYNCED_TIP_AGE_SECS: u64 = 24 * 60 * 60;

/// Scratchpad for the generate path. Production miners bring the full
/// memory-hard buffer; the built-in generator is for regtest.
const GENERATE_SCRATCHPAD_BYTES: usize = 1 << 20;

/// The assembled node context.
pub struct Node {
    config: NodeConfig,
    chain: Arc<ChainState>,
    coordinator: Option<ValidationCoordinator>,
    rates: Arc<RateTable>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Node {
    /// Open a node: verify the interest table, open storage, load the
    /// chain, and start the validation coordinator.
    pub fn open(config: NodeConfig) -> Result<Self> {
        // Rate data must be identical across all systems; a node that
        // disagrees about interest must not come up.
        let rates = RateTable::new();
        if !rates.verify_integrity() {
            error!(
                hash = rates.dump_hash(),
                expected = member_consensus::interest::EXPECTED_DUMP_HASH,
                "Rate table digest mismatch"
            );
            std::process::abort();
        }
        let rates = Arc::new(rates);
        info!("Rate table verified");

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data directory {:?}", config.data_dir))?;

        let storage: Arc<dyn Storage> = Arc::new(
            Database::open_with_cache(config.db_path(), config.cache.storage_cache_bytes())
                .context("opening node database")?,
        );

        let sig_cache = Arc::new(SigCache::new(config.sig_cache_bytes));
        let chain = Arc::new(
            ChainState::open(
                config.chain_config()?,
                storage,
                Arc::clone(&rates),
                sig_cache,
                unix_now(),
            )
            .context("loading chain state")?,
        );

        let coordinator = ValidationCoordinator::new(Arc::clone(&chain), config.validation_threads);

        let tip = chain.tip();
        info!(
            network = %config.network,
            height = tip.height,
            tip = %tip.hash,
            "Node started"
        );

        Ok(Self {
            config,
            chain,
            coordinator: Some(coordinator),
            rates,
        })
    }

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The chain state.
    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    /// The interest table.
    pub fn rates(&self) -> &Arc<RateTable> {
        &self.rates
    }

    /// Submit a block for validation and wait for its outcome.
    pub fn submit_block(&self, block: &Block) -> ChainResult<SubmitOutcome> {
        let coordinator = self
            .coordinator
            .as_ref()
            .expect("coordinator runs until shutdown");
        let handle = coordinator.submit(block, unix_now())?;
        Ok(handle.wait())
    }

    /// Current tip.
    pub fn get_tip(&self) -> TipInfo {
        self.chain.tip()
    }

    /// Fetch a block body.
    pub fn get_block(&self, hash: &Hash256) -> ChainResult<Block> {
        self.chain.get_block(hash)
    }

    /// Fetch an unspent coin as of the tip.
    pub fn get_coin(&self, outpoint: &OutPoint) -> ChainResult<Option<Coin>> {
        self.chain.get_coin(outpoint)
    }

    /// Mark a block invalid and move the tip off it.
    pub fn invalidate_block(&self, hash: &Hash256) -> ChainResult<()> {
        self.chain.invalidate_block(hash)
    }

    /// Clear a block's failure flags and re-run activation.
    pub fn reconsider_block(&self, hash: &Hash256) -> ChainResult<()> {
        self.chain.reconsider_block(hash)
    }

    /// Health probe: the tip is recent enough that the node considers
    /// itself caught up.
    pub fn is_synced(&self) -> bool {
        let tip = self.chain.tip();
        let tip_block = match self.chain.get_block(&tip.hash) {
            Ok(block) => block,
            Err(_) => return false,
        };
        unix_now().saturating_sub(tip_block.header.time as u64) < SYNCED_TIP_AGE_SECS
    }

    /// Mine and submit one block on top of the current tip, paying the
    /// subsidy to the given script. Runs the pattern search per nonce the
    /// way external miners do; practical only against easy targets.
    pub fn generate_block(&self, payout_script: Vec<u8>) -> Result<Block> {
        let tip = self.get_tip();
        let height = tip.height + 1;
        let params = self.chain.params();

        let coinbase = Transaction {
            version: Transaction::CURRENT_VERSION,
            inputs: vec![TxIn::new(
                OutPoint::null(),
                script::coinbase_height_script(height),
            )],
            outputs: vec![TxOut::new(params.allowed_subsidy(height), payout_script)],
            lock_time: 0,
        };

        let tip_block = self.get_block(&tip.hash)?;
        let mut block = Block {
            header: BlockHeader {
                version: member_consensus::params::BASE_VERSION,
                prev_hash: tip.hash,
                merkle_root: Hash256::ZERO,
                time: unix_now().max(tip_block.header.time as u64 + 1) as u32,
                bits: params.pow_limit_bits,
                nonce: 0,
            },
            txs: vec![coinbase],
        };
        block.header.merkle_root = block.compute_merkle_root();

        let target = pow::decode_compact(block.header.bits);
        let mut scratchpad = vec![0u8; GENERATE_SCRATCHPAD_BYTES];
        loop {
            let (best, collisions) = member_mining::find_best_pattern_hash(
                &block.header,
                &mut scratchpad,
                2,
            )?;
            let best_value = num_bigint::BigUint::from_bytes_le(best.as_bytes());
            if collisions > 0 && best_value < target.target {
                debug!(nonce = block.header.nonce, collisions, "Solved candidate");
                break;
            }
            block.header.nonce = match block.header.nonce.checked_add(1) {
                Some(nonce) => nonce,
                None => bail!("nonce space exhausted for candidate"),
            };
        }

        match self.submit_block(&block)? {
            SubmitOutcome::Committed | SubmitOutcome::Activated => Ok(block),
            other => bail!("generated block not accepted: {other:?}"),
        }
    }

    /// Quiesce: stop the coordinator, join its workers, and flush state.
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.shutdown().context("stopping coordinator")?;
        }
        self.chain.flush().context("flushing chain state")?;
        info!("Node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use member_consensus::Network;
    use tempfile::TempDir;

    fn open_regtest() -> (Node, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = NodeConfig::new(Network::Regtest, tmp.path().to_path_buf());
        (Node::open(config).unwrap(), tmp)
    }

    #[test]
    fn test_node_opens_at_genesis() {
        let (node, _tmp) = open_regtest();
        let tip = node.get_tip();
        assert_eq!(tip.height, 0);
        let genesis = node.get_block(&tip.hash).unwrap();
        assert_eq!(genesis.hash(), tip.hash);
        node.shutdown().unwrap();
    }

    #[test]
    fn test_generate_block_advances_tip() {
        let (node, _tmp) = open_regtest();
        let block = node
            .generate_block(vec![member_consensus::script::OP_1])
            .unwrap();
        assert_eq!(node.get_tip().hash, block.hash());
        assert_eq!(node.get_tip().height, 1);

        // The coinbase coin exists with the right anchor height.
        let op = OutPoint::new(block.txs[0].txid(), 0);
        let coin = node.get_coin(&op).unwrap().unwrap();
        assert!(coin.is_coinbase);
        assert_eq!(coin.height, 1);
        node.shutdown().unwrap();
    }

    #[test]
    fn test_node_restart_keeps_tip() {
        let tmp = TempDir::new().unwrap();
        let config = NodeConfig::new(Network::Regtest, tmp.path().to_path_buf());
        let hash = {
            let node = Node::open(config.clone()).unwrap();
            let hash = node.get_tip().hash;
            node.shutdown().unwrap();
            hash
        };
        let node = Node::open(config).unwrap();
        assert_eq!(node.get_tip().hash, hash);
        node.shutdown().unwrap();
    }
}
