//! Test harness: a chain state over a temporary database with UTXO-set
//! introspection.

use crate::generators::{mine_block, regtest_params, TEST_NOW};
use member_chain::{BlockStoreMode, ChainState, ChainStateConfig, TipInfo};
use member_consensus::{Block, Coin, OutPoint, RateTable, SigCache, Transaction};
use member_storage::{ColumnFamily, Database, Storage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// A regtest chain over a temporary directory, torn down on drop.
pub struct TestChain {
    chain: Arc<ChainState>,
    storage: Arc<dyn Storage>,
    temp_dir: TempDir,
}

impl TestChain {
    /// Open a fresh chain.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        Self::open_in(temp_dir)
    }

    /// Open (or reopen) a chain in the given directory.
    pub fn open_in(temp_dir: TempDir) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(
            Database::open(temp_dir.path().join("db")).expect("open database"),
        );
        let mut config = ChainStateConfig::new(regtest_params());
        config.store_mode = BlockStoreMode::BlockDb;
        config.blocks_dir = temp_dir.path().join("blocks");
        let chain = Arc::new(
            ChainState::open(
                config,
                Arc::clone(&storage),
                Arc::new(RateTable::new()),
                Arc::new(SigCache::new(1 << 20)),
                TEST_NOW,
            )
            .expect("open chain"),
        );
        Self {
            chain,
            storage,
            temp_dir,
        }
    }

    /// Simulate a restart: drop the chain state and reopen the same
    /// directory.
    pub fn restart(self) -> Self {
        let TestChain {
            chain,
            storage,
            temp_dir,
        } = self;
        drop(chain);
        drop(storage);
        Self::open_in(temp_dir)
    }

    /// The chain state.
    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    /// Current tip.
    pub fn tip(&self) -> TipInfo {
        self.chain.tip()
    }

    /// Mine and connect one block carrying `txs`, returning it.
    pub fn mine_and_process(&self, txs: Vec<Transaction>, tweak: u8) -> Block {
        let tip = self.tip();
        let block = mine_block(
            self.chain.params(),
            tip.hash,
            tip.height + 1,
            txs,
            tweak,
        );
        self.chain
            .process_block(&block, TEST_NOW)
            .expect("block connects");
        block
    }

    /// Mine `count` empty blocks.
    pub fn mine_empty(&self, count: u32, tweak: u8) {
        for _ in 0..count {
            self.mine_and_process(Vec::new(), tweak);
        }
    }

    /// The complete flushed UTXO set, ordered for comparison.
    pub fn utxo_set(&self) -> BTreeMap<OutPoint, Coin> {
        self.chain.flush().expect("flush");
        let mut set = BTreeMap::new();
        for (key, value) in self.storage.iter(ColumnFamily::Utxo).expect("iterate utxo") {
            let outpoint = OutPoint::from_key(&key).expect("valid utxo key");
            let coin = Coin::deserialize(&value).expect("valid coin");
            set.insert(outpoint, coin);
        }
        set
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}
