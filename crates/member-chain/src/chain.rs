//! The chain-activation state machine.
//!
//! Owns the block index, the block store, and the shared coins cache, and
//! serializes every tip mutation through a single commit lock. Candidate
//! blocks are validated into private cache forks; the committer merges the
//! winning fork, records undo data, and advances the active chain. Failed
//! connects mark the offender and activation retries with the next-best
//! chain.

use crate::index::{BlockIndex, BlockIndexId, BlockStatus};
use crate::store::{BlockStore, BlockStoreMode};
use crate::{ChainError, ChainResult};
use member_consensus::{
    block_validation, pow, Block, CancelToken, ChainParams, Coin, Hash256, OutPoint, RateTable,
    SigCache, ValidationError,
};
use member_state::{
    connect_block, disconnect_block, CoinsCache, CoinsDb, CoinsView, CoinsViewErrorCatcher,
    ConnectContext, SharedCoins,
};
use member_storage::{ColumnFamily, Storage};
use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Full blocks retained below the tip regardless of the pruning target.
pub const MIN_BLOCKS_TO_KEEP: u32 = 288;

/// Construction-time options for [`ChainState`].
#[derive(Debug, Clone)]
pub struct ChainStateConfig {
    /// Consensus parameters.
    pub params: ChainParams,
    /// Block body storage layout.
    pub store_mode: BlockStoreMode,
    /// Directory for flat block files (sequential-files mode).
    pub blocks_dir: PathBuf,
    /// Maintain the txid index.
    pub txindex: bool,
    /// Byte budget for the shared coins cache; exceeding it triggers an
    /// opportunistic flush once the tip is stable.
    pub coin_cache_budget: usize,
    /// Blocks of body data to keep; negative keeps everything.
    pub blocks_to_keep: i64,
    /// Node-local acceptance threshold for excessive blocks. Blocks larger
    /// than this (but within the consensus cap) only activate once buried
    /// `excessive_accept_depth` deep.
    pub accept_threshold_bytes: u64,
    /// Depth an excessive block must be buried before its chain activates.
    pub excessive_accept_depth: u32,
}

impl ChainStateConfig {
    /// Defaults for the given parameters.
    pub fn new(params: ChainParams) -> Self {
        let accept_threshold_bytes = params.excessive_block_size;
        let excessive_accept_depth = params.excessive_accept_depth;
        Self {
            params,
            store_mode: BlockStoreMode::SequentialFiles,
            blocks_dir: PathBuf::from("blocks"),
            txindex: false,
            coin_cache_budget: 64 * 1024 * 1024,
            blocks_to_keep: -1,
            accept_threshold_bytes,
            excessive_accept_depth,
        }
    }
}

/// A snapshot of the active tip.
#[derive(Debug, Clone)]
pub struct TipInfo {
    /// Tip block hash.
    pub hash: Hash256,
    /// Tip height.
    pub height: u32,
    /// Cumulative work.
    pub work: BigUint,
}

/// Outcome of the tip-extension fast path.
#[derive(Debug)]
pub enum CommitOutcome {
    /// The block was committed and is the new tip.
    Committed,
    /// Validation succeeded but another block claimed the parent first; the
    /// fork was discarded and the block stays valid in the index.
    Lost,
    /// The block does not extend the current tip; activation ran instead.
    Activated,
    /// The worker observed cancellation.
    Canceled,
    /// Validation failed; the block is marked in the index.
    Invalid(ValidationError),
}

/// The chain state machine.
pub struct ChainState {
    params: ChainParams,
    rates: Arc<RateTable>,
    sig_cache: Arc<SigCache>,
    storage: Arc<dyn Storage>,
    store: BlockStore,
    coins_db: CoinsDb,
    shared_coins: Arc<SharedCoins>,
    index: RwLock<BlockIndex>,
    active: RwLock<Vec<BlockIndexId>>,
    commit_lock: Mutex<()>,
    rejected_hashes: Mutex<HashSet<Hash256>>,
    config: ChainStateConfig,
}

impl ChainState {
    /// Open the chain state: load or create genesis, rebuild the index,
    /// clear context-dependent failure flags from the prior run, and adopt
    /// the most-work chain.
    pub fn open(
        config: ChainStateConfig,
        storage: Arc<dyn Storage>,
        rates: Arc<RateTable>,
        sig_cache: Arc<SigCache>,
        now: u64,
    ) -> ChainResult<Self> {
        let store = BlockStore::open(
            config.store_mode,
            Arc::clone(&storage),
            config.blocks_dir.clone(),
            config.txindex,
        )?;
        let coins_db = CoinsDb::new(Arc::clone(&storage));
        let catcher: Arc<dyn CoinsView> = Arc::new(CoinsViewErrorCatcher::new(CoinsDb::new(
            Arc::clone(&storage),
        )));
        let shared_coins = Arc::new(SharedCoins::new(CoinsCache::new(catcher)));

        let state = Self {
            params: config.params.clone(),
            rates,
            sig_cache,
            storage,
            store,
            coins_db,
            shared_coins,
            index: RwLock::new(BlockIndex::new()),
            active: RwLock::new(Vec::new()),
            commit_lock: Mutex::new(()),
            rejected_hashes: Mutex::new(HashSet::new()),
            config,
        };

        state.load_index(now)?;
        state.activate_best_chain()?;
        Ok(state)
    }

    fn load_index(&self, now: u64) -> ChainResult<()> {
        let genesis = self.params.genesis_block();
        let genesis_hash = genesis.hash();

        let mut loaded: Vec<(member_consensus::BlockHeader, u32, BlockStatus, u64, _)> = Vec::new();
        for (_key, value) in self.storage.iter(ColumnFamily::BlockIndex)? {
            loaded.push(BlockIndex::deserialize_entry(&value)?);
        }

        let mut index = self.index.write();
        if loaded.is_empty() {
            // Fresh datadir: persist genesis.
            let location = self.store.write_block(&genesis)?;
            let mut status = BlockStatus::HAS_DATA;
            status.set(BlockStatus::VALID);
            let id = index.insert_header(genesis.header, status, Some(location))?;
            self.persist_entry(&index, id)?;
            drop(index);

            {
                let mut coins = self.shared_coins.write();
                coins.set_best_block(genesis_hash);
                coins.flush(&self.coins_db)?;
            }
            *self.active.write() = vec![id];
            info!(%genesis_hash, network = self.params.network.name(), "Initialized new chain");
            return Ok(());
        }

        // Insert parents before children.
        loaded.sort_by_key(|(_, height, ..)| *height);
        if loaded[0].0.hash() != genesis_hash {
            return Err(ChainError::WrongGenesis);
        }
        let mut cleared = Vec::new();
        for (header, _height, mut status, sequence, location) in loaded {
            if (header.time as u64) > now + block_validation::MAX_FUTURE_BLOCK_TIME {
                return Err(ChainError::BlockFromFuture);
            }
            // Startup reconsideration: context-dependent failures from a
            // prior run are forgiven; context-free ones are not.
            if status.has(BlockStatus::FAILED) {
                status.clear(BlockStatus::FAILED);
                cleared.push(header.hash());
            }
            let id = index.insert_header(header, status, location)?;
            index.entry_mut(id).sequence = sequence;
        }
        if !cleared.is_empty() {
            info!(count = cleared.len(), "Cleared failure flags for reconsideration");
            for hash in &cleared {
                let id = index.get_id(hash).expect("just inserted");
                self.persist_entry(&index, id)?;
            }
        }

        // Rebuild the active chain from the coins best-block marker.
        let best = self.coins_db.best_block().map_err(ChainError::State)?;
        let tip_id = match best {
            Some(hash) => index.get_id(&hash).ok_or(ChainError::WrongGenesis)?,
            None => index.get_id(&genesis_hash).ok_or(ChainError::WrongGenesis)?,
        };
        let chain = index.chain_to(tip_id);
        drop(index);
        *self.active.write() = chain;
        Ok(())
    }

    fn persist_entry(&self, index: &BlockIndex, id: BlockIndexId) -> ChainResult<()> {
        let entry = index.entry(id);
        self.storage.put(
            ColumnFamily::BlockIndex,
            entry.hash.as_bytes(),
            &BlockIndex::serialize_entry(entry),
        )?;
        Ok(())
    }

    /// Chain parameters.
    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// The shared coins cache (workers fork from it).
    pub fn shared_coins(&self) -> &Arc<SharedCoins> {
        &self.shared_coins
    }

    /// Snapshot the active tip. Lock order is index before active,
    /// matching every other site.
    pub fn tip(&self) -> TipInfo {
        let index = self.index.read();
        let active = self.active.read();
        let id = *active.last().expect("active chain is never empty");
        let entry = index.entry(id);
        TipInfo {
            hash: entry.hash,
            height: entry.height,
            work: entry.chain_work.clone(),
        }
    }

    /// Read a block body by hash.
    pub fn get_block(&self, hash: &Hash256) -> ChainResult<Block> {
        let index = self.index.read();
        let id = index.get_id(hash).ok_or(ChainError::UnknownBlock(*hash))?;
        let entry = index.entry(id);
        let location = entry
            .location
            .ok_or(ChainError::UnknownBlock(*hash))?;
        drop(index);
        self.store.read_block(hash, location)
    }

    /// Look up an unspent coin as of the current tip.
    pub fn get_coin(&self, outpoint: &OutPoint) -> ChainResult<Option<Coin>> {
        Ok(self.shared_coins.get_coin(outpoint).map_err(ChainError::State)?)
    }

    /// Status of an indexed block.
    pub fn block_status(&self, hash: &Hash256) -> Option<BlockStatus> {
        let index = self.index.read();
        index.get_id(hash).map(|id| index.entry(id).status)
    }

    fn connect_ctx<'a>(&'a self, cancel: &'a CancelToken) -> ConnectContext<'a> {
        ConnectContext {
            params: &self.params,
            rates: &self.rates,
            sig_cache: &self.sig_cache,
            cancel,
            check_scripts: true,
        }
    }

    /// Accept a block into the store and index after context-free and
    /// header-context checks. Does not activate; callers schedule the block
    /// with the coordinator or call [`ChainState::activate_best_chain`].
    #[instrument(skip_all, fields(hash = %block.hash()))]
    pub fn accept_block(&self, block: &Block, now: u64) -> ChainResult<BlockIndexId> {
        let hash = block.hash();
        if self.rejected_hashes.lock().contains(&hash) {
            return Err(ChainError::Validation(ValidationError::bad_structure(
                "block was previously rejected as permanently invalid",
            )));
        }
        if let Some(id) = self.index.read().get_id(&hash) {
            return Ok(id);
        }

        if let Err(err) = block_validation::check_block(block, &self.params) {
            if err.is_permanent() {
                self.rejected_hashes.lock().insert(hash);
            }
            return Err(ChainError::Validation(err));
        }

        let index = self.index.read();
        let parent_id = index
            .get_id(&block.header.prev_hash)
            .ok_or(ChainError::UnknownParent(block.header.prev_hash))?;
        let ancestor_times =
            index.ancestor_times(parent_id, block_validation::MEDIAN_TIME_SPAN);
        let required_bits = self.required_bits(&index, parent_id);
        drop(index);

        if let Err(err) = block_validation::contextual_check_header(
            &block.header,
            &ancestor_times,
            required_bits,
            now,
            &self.params,
        ) {
            if err.is_permanent() {
                self.rejected_hashes.lock().insert(hash);
            }
            return Err(ChainError::Validation(err));
        }

        let location = self.store.write_block(block)?;
        let mut status = BlockStatus::HAS_DATA;
        if block.serialized_size() as u64 > self.config.accept_threshold_bytes {
            status.set(BlockStatus::EXCESSIVE);
        }

        let mut index = self.index.write();
        let id = index.insert_header(block.header, status, Some(location))?;
        self.persist_entry(&index, id)?;
        debug!(height = index.entry(id).height, "Block accepted into index");
        Ok(id)
    }

    /// Required `bits` for a child of `parent_id`.
    fn required_bits(&self, index: &BlockIndex, parent_id: BlockIndexId) -> u32 {
        let parent = index.entry(parent_id);
        let next_height = parent.height + 1;
        if self.params.no_retargeting
            || next_height % self.params.retarget_interval != 0
            || next_height < self.params.retarget_interval
        {
            return parent.header.bits;
        }
        let first_height = parent.height + 1 - self.params.retarget_interval;
        let first = index
            .ancestor(parent_id, first_height)
            .map(|id| index.entry(id).header.time)
            .unwrap_or(parent.header.time);
        pow::next_work_required(first, parent.header.time, parent.header.bits, &self.params)
    }

    /// Whether every block from the fork with the active chain up to
    /// `tip_id` is connectable: data present, not failed, and any excessive
    /// block buried deep enough.
    fn chain_is_connectable(
        &self,
        index: &BlockIndex,
        active_set: &HashSet<BlockIndexId>,
        tip_id: BlockIndexId,
    ) -> bool {
        let tip_height = index.entry(tip_id).height;

        let mut cursor = Some(tip_id);
        while let Some(id) = cursor {
            if active_set.contains(&id) {
                break;
            }
            let entry = index.entry(id);
            if !entry.status.has(BlockStatus::HAS_DATA) || entry.status.is_failed() {
                return false;
            }
            if entry.status.has(BlockStatus::EXCESSIVE)
                && tip_height - entry.height < self.config.excessive_accept_depth
            {
                return false;
            }
            cursor = entry.parent;
        }
        true
    }

    /// The most-work connectable tip: candidates ordered by descending
    /// cumulative work, ties broken by earliest receipt.
    fn find_most_work_chain(
        &self,
        index: &BlockIndex,
        active_set: &HashSet<BlockIndexId>,
    ) -> Option<BlockIndexId> {
        let mut best: Option<BlockIndexId> = None;
        for id in index.ids() {
            let entry = index.entry(id);
            if !entry.status.has(BlockStatus::HAS_DATA) || entry.status.is_failed() {
                continue;
            }
            if !self.chain_is_connectable(index, active_set, id) {
                continue;
            }
            best = match best {
                None => Some(id),
                Some(current) => {
                    let cur = index.entry(current);
                    if entry.chain_work > cur.chain_work
                        || (entry.chain_work == cur.chain_work && entry.sequence < cur.sequence)
                    {
                        Some(id)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best
    }

    /// Drive the active chain to the most-work connectable tip, retrying
    /// past blocks that fail to connect.
    pub fn activate_best_chain(&self) -> ChainResult<()> {
        loop {
            let (target, tip_id, tip_failed) = {
                let index = self.index.read();
                let active = self.active.read();
                let tip_id = *active.last().expect("active chain is never empty");
                let failed = active.iter().any(|id| index.entry(*id).status.is_failed());
                let active_set: HashSet<BlockIndexId> = active.iter().copied().collect();
                (
                    self.find_most_work_chain(&index, &active_set),
                    tip_id,
                    failed,
                )
            };
            let Some(target) = target else {
                return Ok(());
            };
            if target == tip_id {
                return Ok(());
            }

            // Switch only for strictly more work, unless the active chain
            // itself carries a failed block and must be abandoned.
            if !tip_failed {
                let index = self.index.read();
                if index.entry(target).chain_work <= index.entry(tip_id).chain_work {
                    return Ok(());
                }
            }

            match self.reorg_to(target) {
                Ok(true) => continue,
                Ok(false) => continue, // offender marked; rescan
                Err(e) => return Err(e),
            }
        }
    }

    /// Reorganize the active chain to `target`. Returns `Ok(true)` on
    /// success and `Ok(false)` when a connect failed and the offender was
    /// marked (the caller rescans).
    #[instrument(skip(self), fields(target = target.0))]
    fn reorg_to(&self, target: BlockIndexId) -> ChainResult<bool> {
        let _commit = self.commit_lock.lock();

        let (to_disconnect, to_connect) = {
            let index = self.index.read();
            let active = self.active.read();
            let tip_id = *active.last().expect("active chain is never empty");
            let fork = index
                .fork_point(tip_id, target)
                .expect("all entries share the genesis ancestor");
            let fork_height = index.entry(fork).height;

            let to_disconnect: Vec<BlockIndexId> = active
                .iter()
                .copied()
                .filter(|id| index.entry(*id).height > fork_height)
                .rev()
                .collect();

            let mut to_connect: Vec<BlockIndexId> = Vec::new();
            let mut cursor = Some(target);
            while let Some(id) = cursor {
                if id == fork {
                    break;
                }
                to_connect.push(id);
                cursor = index.entry(id).parent;
            }
            to_connect.reverse();
            (to_disconnect, to_connect)
        };

        if !to_disconnect.is_empty() {
            info!(
                disconnect = to_disconnect.len(),
                connect = to_connect.len(),
                "Reorganizing chain"
            );
        }

        // Build the whole transition in a private fork; the shared cache
        // only changes if every step succeeds.
        let cancel = CancelToken::new();
        let mut fork_cache = CoinsCache::new(
            Arc::clone(self.shared_coins()) as Arc<dyn CoinsView>
        );
        let mut new_undos: Vec<(Hash256, member_state::BlockUndo)> = Vec::new();

        {
            let index = self.index.read();
            for id in &to_disconnect {
                let entry = index.entry(*id);
                let block = self
                    .store
                    .read_block(&entry.hash, entry.location.ok_or(ChainError::UnknownBlock(entry.hash))?)?;
                let undo = self.store.read_undo(&entry.hash)?;
                disconnect_block(&block, &undo, &mut fork_cache)
                    .map_err(ChainError::Validation)?;
            }

            for id in &to_connect {
                let entry = index.entry(*id);
                let block = self
                    .store
                    .read_block(&entry.hash, entry.location.ok_or(ChainError::UnknownBlock(entry.hash))?)?;
                match connect_block(&block, entry.height, &mut fork_cache, &self.connect_ctx(&cancel)) {
                    Ok(result) => new_undos.push((entry.hash, result.undo)),
                    Err(err) => {
                        let offender = *id;
                        let offender_hash = entry.hash;
                        drop(index);
                        warn!(%offender_hash, error = %err, "Connect failed during reorg; marking invalid");
                        self.mark_failed(offender, &err)?;
                        return Ok(false);
                    }
                }
            }
        }

        for (hash, undo) in &new_undos {
            self.store.write_undo(hash, undo)?;
        }

        // Commit: merge the fork, update statuses and the active chain.
        {
            let (entries, best) = fork_cache.into_entries();
            self.shared_coins
                .write()
                .apply_entries(entries, best)
                .map_err(ChainError::State)?;
        }
        {
            let mut index = self.index.write();
            for id in &to_connect {
                index.entry_mut(*id).status.set(BlockStatus::VALID);
                self.persist_entry(&index, *id)?;
            }
            let new_chain = index.chain_to(target);
            *self.active.write() = new_chain;
        }
        let tip = self.tip();
        info!(height = tip.height, hash = %tip.hash, "New chain tip");

        self.maybe_flush()?;
        Ok(true)
    }

    /// Mark a block (and its descendants) as failed. Context-free failures
    /// are permanent; context-dependent ones clear on restart.
    fn mark_failed(&self, id: BlockIndexId, err: &ValidationError) -> ChainResult<()> {
        let flag = if err.is_permanent() {
            BlockStatus::FAILED_VALID
        } else {
            BlockStatus::FAILED
        };
        let mut index = self.index.write();
        index.entry_mut(id).status.set(flag);
        self.persist_entry(&index, id)?;

        // Descendants inherit the context-dependent flag.
        let descendant_ids: Vec<BlockIndexId> = index
            .ids()
            .filter(|other| *other != id && index.is_ancestor(id, *other))
            .collect();
        for other in descendant_ids {
            index.entry_mut(other).status.set(BlockStatus::FAILED);
            self.persist_entry(&index, other)?;
        }
        Ok(())
    }

    /// Tip-extension fast path used by validation workers: validate into a
    /// private fork, then commit under the commit lock if the parent is
    /// still the tip. First successful committer wins; later finishers for
    /// the same parent are discarded but stay valid in the index.
    pub fn validate_and_commit(
        &self,
        id: BlockIndexId,
        cancel: &CancelToken,
    ) -> ChainResult<CommitOutcome> {
        let (block, height, parent_id, hash) = {
            let index = self.index.read();
            let entry = index.entry(id);
            let location = entry.location.ok_or(ChainError::UnknownBlock(entry.hash))?;
            (
                self.store.read_block(&entry.hash, location)?,
                entry.height,
                entry.parent,
                entry.hash,
            )
        };

        let tip_at_start = self.tip();
        if parent_id.map(|p| self.index.read().entry(p).hash) != Some(tip_at_start.hash) {
            // Not a tip extension; run full activation instead.
            self.activate_best_chain()?;
            return Ok(CommitOutcome::Activated);
        }

        let mut fork_cache = CoinsCache::new(
            Arc::clone(self.shared_coins()) as Arc<dyn CoinsView>
        );
        let result = match connect_block(&block, height, &mut fork_cache, &self.connect_ctx(cancel))
        {
            Ok(result) => result,
            Err(err) if err.kind == member_consensus::ValidationKind::Canceled => {
                return Ok(CommitOutcome::Canceled);
            }
            Err(err) => {
                self.mark_failed(id, &err)?;
                return Ok(CommitOutcome::Invalid(err));
            }
        };

        // The block validated; remember that even if it loses the race.
        {
            let mut index = self.index.write();
            index.entry_mut(id).status.set(BlockStatus::VALID);
            self.persist_entry(&index, id)?;
        }

        let _commit = self.commit_lock.lock();
        if self.tip().hash != tip_at_start.hash {
            debug!(%hash, "Validated block lost the commit race");
            return Ok(CommitOutcome::Lost);
        }

        self.store.write_undo(&hash, &result.undo)?;
        {
            let (entries, best) = fork_cache.into_entries();
            self.shared_coins
                .write()
                .apply_entries(entries, best)
                .map_err(ChainError::State)?;
        }
        self.active.write().push(id);
        info!(height, %hash, "New chain tip");

        self.maybe_flush()?;
        Ok(CommitOutcome::Committed)
    }

    /// Mark a block invalid by operator request and move the tip off it.
    pub fn invalidate_block(&self, hash: &Hash256) -> ChainResult<()> {
        let id = self
            .index
            .read()
            .get_id(hash)
            .ok_or(ChainError::UnknownBlock(*hash))?;
        self.mark_failed(id, &ValidationError::missing_inputs("invalidated by operator"))?;
        self.activate_best_chain()
    }

    /// Clear context-dependent failure flags on a block, its ancestors, and
    /// its descendants, then re-run activation.
    pub fn reconsider_block(&self, hash: &Hash256) -> ChainResult<()> {
        let id = {
            let index = self.index.read();
            index.get_id(hash).ok_or(ChainError::UnknownBlock(*hash))?
        };
        {
            let mut index = self.index.write();
            let related: Vec<BlockIndexId> = index
                .ids()
                .filter(|other| {
                    *other == id
                        || index.is_ancestor(*other, id)
                        || index.is_ancestor(id, *other)
                })
                .collect();
            for other in related {
                if index.entry(other).status.has(BlockStatus::FAILED) {
                    index.entry_mut(other).status.clear(BlockStatus::FAILED);
                    self.persist_entry(&index, other)?;
                }
            }
        }
        self.activate_best_chain()
    }

    /// Flush the shared coins cache when it exceeds its budget. The caller
    /// holds or has just released the commit lock, so the tip is stable.
    fn maybe_flush(&self) -> ChainResult<()> {
        let over_budget =
            self.shared_coins.read().estimated_size_bytes() > self.config.coin_cache_budget;
        if over_budget {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush the shared coins cache to the base database.
    pub fn flush(&self) -> ChainResult<()> {
        let mut coins = self.shared_coins.write();
        let entries = coins.entry_count();
        coins.flush(&self.coins_db).map_err(ChainError::State)?;
        debug!(entries, "Coins cache flushed");
        Ok(())
    }

    /// Prune block bodies and undo data more than `MIN_BLOCKS_TO_KEEP` (or
    /// the configured keep window, whichever is larger) below the tip.
    /// Consensus state is untouched; pruned entries lose `HAS_DATA`.
    pub fn prune(&self) -> ChainResult<u32> {
        if self.config.blocks_to_keep < 0 {
            return Ok(0);
        }
        let keep = (self.config.blocks_to_keep as u32).max(MIN_BLOCKS_TO_KEEP);
        let tip_height = self.tip().height;
        let Some(cutoff) = tip_height.checked_sub(keep) else {
            return Ok(0);
        };

        // Everything below the cutoff must already be final; flush so undo
        // data below the snapshot is no longer needed.
        self.flush()?;

        let mut pruned = 0u32;
        let mut index = self.index.write();
        let prune_ids: Vec<BlockIndexId> = index
            .ids()
            .filter(|id| {
                let entry = index.entry(*id);
                entry.height > 0
                    && entry.height < cutoff
                    && entry.status.has(BlockStatus::HAS_DATA)
            })
            .collect();
        for id in prune_ids {
            let hash = index.entry(id).hash;
            self.store.delete_block(&hash)?;
            self.store.delete_undo(&hash)?;
            index.entry_mut(id).status.clear(BlockStatus::HAS_DATA);
            self.persist_entry(&index, id)?;
            pruned += 1;
        }
        if pruned > 0 {
            info!(pruned, cutoff, "Pruned block data");
        }
        Ok(pruned)
    }

    /// Convenience for callers without a coordinator: accept then activate.
    pub fn process_block(&self, block: &Block, now: u64) -> ChainResult<TipInfo> {
        self.accept_block(block, now)?;
        self.activate_best_chain()?;
        Ok(self.tip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use member_consensus::chain_params::Network;
    use member_consensus::script;
    use member_consensus::{BlockHeader, Transaction, TxIn, TxOut, COIN};
    use member_storage::Database;
    use tempfile::TempDir;

    const NOW: u64 = 1_800_000_000;

    struct TestChain {
        state: ChainState,
        _tmp: TempDir,
    }

    fn open_chain() -> TestChain {
        let tmp = TempDir::new().unwrap();
        let state = open_at(&tmp);
        TestChain { state, _tmp: tmp }
    }

    fn open_at(tmp: &TempDir) -> ChainState {
        let params = ChainParams::for_network(Network::Regtest);
        let storage: Arc<dyn Storage> =
            Arc::new(Database::open(tmp.path().join("db")).unwrap());
        let mut config = ChainStateConfig::new(params);
        config.store_mode = BlockStoreMode::BlockDb;
        config.blocks_dir = tmp.path().join("blocks");
        ChainState::open(
            config,
            storage,
            Arc::new(RateTable::new()),
            Arc::new(SigCache::new(1 << 20)),
            NOW,
        )
        .unwrap()
    }

    fn coinbase_at(height: u32, tweak: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn::new(
                member_consensus::OutPoint::null(),
                script::coinbase_height_script(height),
            )],
            outputs: vec![TxOut::new(50 * COIN, vec![script::OP_1, tweak as u8])],
            lock_time: 0,
        }
    }

    fn mine_on(state: &ChainState, prev: &TipInfo, tweak: u32) -> Block {
        let height = prev.height + 1;
        let mut block = Block {
            header: BlockHeader {
                version: member_consensus::params::BASE_VERSION,
                prev_hash: prev.hash,
                merkle_root: Hash256::ZERO,
                time: state.params().genesis_time + height * 80 + tweak,
                bits: state.params().pow_limit_bits,
                nonce: 0,
            },
            txs: vec![coinbase_at(height, tweak)],
        };
        block.header.merkle_root = block.compute_merkle_root();
        while pow::check_proof_of_work(&block.header, state.params()).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    #[test]
    fn test_open_initializes_genesis() {
        let chain = open_chain();
        let tip = chain.state.tip();
        assert_eq!(tip.height, 0);
        assert_eq!(
            tip.hash,
            chain.state.params().genesis_block().hash()
        );
    }

    #[test]
    fn test_extend_chain() {
        let chain = open_chain();
        let b1 = mine_on(&chain.state, &chain.state.tip(), 0);
        let tip = chain.state.process_block(&b1, NOW).unwrap();
        assert_eq!(tip.height, 1);
        assert_eq!(tip.hash, b1.hash());

        let b2 = mine_on(&chain.state, &tip, 0);
        let tip = chain.state.process_block(&b2, NOW).unwrap();
        assert_eq!(tip.height, 2);

        // The coinbase coin is queryable at the tip.
        let op = member_consensus::OutPoint::new(b1.txs[0].txid(), 0);
        let coin = chain.state.get_coin(&op).unwrap().unwrap();
        assert_eq!(coin.height, 1);
        assert!(coin.is_coinbase);
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let chain = open_chain();
        let fake_tip = TipInfo {
            hash: member_consensus::hash::sha256d(b"elsewhere"),
            height: 0,
            work: BigUint::default(),
        };
        let orphan = mine_on(&chain.state, &fake_tip, 0);
        assert!(matches!(
            chain.state.accept_block(&orphan, NOW),
            Err(ChainError::UnknownParent(_))
        ));
    }

    #[test]
    fn test_longer_fork_wins() {
        let chain = open_chain();
        let genesis_tip = chain.state.tip();

        // Chain A: two blocks.
        let a1 = mine_on(&chain.state, &genesis_tip, 1);
        chain.state.process_block(&a1, NOW).unwrap();
        let a2 = mine_on(&chain.state, &chain.state.tip(), 1);
        chain.state.process_block(&a2, NOW).unwrap();
        assert_eq!(chain.state.tip().hash, a2.hash());

        // Chain B: three blocks from genesis.
        let b1 = mine_on(&chain.state, &genesis_tip, 2);
        chain.state.process_block(&b1, NOW).unwrap();
        // Tip unchanged: equal work does not displace.
        assert_eq!(chain.state.tip().hash, a2.hash());

        let b1_tip = TipInfo {
            hash: b1.hash(),
            height: 1,
            work: BigUint::default(),
        };
        let b2 = mine_on(&chain.state, &b1_tip, 2);
        chain.state.process_block(&b2, NOW).unwrap();
        let b2_tip = TipInfo {
            hash: b2.hash(),
            height: 2,
            work: BigUint::default(),
        };
        let b3 = mine_on(&chain.state, &b2_tip, 2);
        let tip = chain.state.process_block(&b3, NOW).unwrap();

        assert_eq!(tip.height, 3);
        assert_eq!(tip.hash, b3.hash());
    }

    #[test]
    fn test_invalidate_and_reconsider() {
        let chain = open_chain();
        let b1 = mine_on(&chain.state, &chain.state.tip(), 0);
        chain.state.process_block(&b1, NOW).unwrap();
        let b2 = mine_on(&chain.state, &chain.state.tip(), 0);
        chain.state.process_block(&b2, NOW).unwrap();

        chain.state.invalidate_block(&b2.hash()).unwrap();
        assert_eq!(chain.state.tip().hash, b1.hash());
        let status = chain.state.block_status(&b2.hash()).unwrap();
        assert!(status.has(BlockStatus::FAILED));

        chain.state.reconsider_block(&b2.hash()).unwrap();
        assert_eq!(chain.state.tip().hash, b2.hash());
    }

    #[test]
    fn test_failure_flags_clear_on_restart() {
        let tmp = TempDir::new().unwrap();
        let (b1_hash, b2_hash) = {
            let state = open_at(&tmp);
            let b1 = mine_on(&state, &state.tip(), 0);
            state.process_block(&b1, NOW).unwrap();
            let b2 = mine_on(&state, &state.tip(), 0);
            state.process_block(&b2, NOW).unwrap();
            state.invalidate_block(&b2.hash()).unwrap();
            assert_eq!(state.tip().hash, b1.hash());
            state.flush().unwrap();
            (b1.hash(), b2.hash())
        };

        // Restart: the FAILED flag clears and the best-work tip returns.
        let state = open_at(&tmp);
        let status = state.block_status(&b2_hash).unwrap();
        assert!(!status.is_failed());
        assert_eq!(state.tip().hash, b2_hash);
        assert_ne!(state.tip().hash, b1_hash);
    }

    #[test]
    fn test_wrong_genesis_detected() {
        let tmp = TempDir::new().unwrap();
        {
            let _state = open_at(&tmp);
        }
        // Reopen the same datadir with mainnet parameters.
        let storage: Arc<dyn Storage> =
            Arc::new(Database::open(tmp.path().join("db")).unwrap());
        let mut config = ChainStateConfig::new(ChainParams::for_network(Network::Mainnet));
        config.store_mode = BlockStoreMode::BlockDb;
        config.blocks_dir = tmp.path().join("blocks");
        let result = ChainState::open(
            config,
            storage,
            Arc::new(RateTable::new()),
            Arc::new(SigCache::new(1 << 20)),
            NOW,
        );
        assert!(matches!(result, Err(ChainError::WrongGenesis)));
    }

    #[test]
    fn test_validate_and_commit_fast_path() {
        let chain = open_chain();
        let b1 = mine_on(&chain.state, &chain.state.tip(), 0);
        let id = chain.state.accept_block(&b1, NOW).unwrap();
        let cancel = CancelToken::new();
        let outcome = chain.state.validate_and_commit(id, &cancel).unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed));
        assert_eq!(chain.state.tip().hash, b1.hash());
    }

    #[test]
    fn test_equal_work_sibling_does_not_displace_tip() {
        let chain = open_chain();
        let genesis_tip = chain.state.tip();
        let b1 = mine_on(&chain.state, &genesis_tip, 1);
        let b2 = mine_on(&chain.state, &genesis_tip, 2);
        let id1 = chain.state.accept_block(&b1, NOW).unwrap();
        let id2 = chain.state.accept_block(&b2, NOW).unwrap();

        let cancel = CancelToken::new();
        assert!(matches!(
            chain.state.validate_and_commit(id1, &cancel).unwrap(),
            CommitOutcome::Committed
        ));
        // The sibling arrives after the commit: it no longer extends the
        // tip, activation runs, and the equal-work chain does not displace
        // the first committer.
        assert!(matches!(
            chain.state.validate_and_commit(id2, &cancel).unwrap(),
            CommitOutcome::Activated
        ));
        assert_eq!(chain.state.tip().hash, b1.hash());
        let status = chain.state.block_status(&b2.hash()).unwrap();
        assert!(!status.is_failed());

        // Invalidating the winner promotes the sibling.
        chain.state.invalidate_block(&b1.hash()).unwrap();
        assert_eq!(chain.state.tip().hash, b2.hash());
    }

    #[test]
    fn test_pruning_clears_block_data() {
        let tmp = TempDir::new().unwrap();
        let params = ChainParams::for_network(Network::Regtest);
        let storage: Arc<dyn Storage> =
            Arc::new(Database::open(tmp.path().join("db")).unwrap());
        let mut config = ChainStateConfig::new(params);
        config.store_mode = BlockStoreMode::BlockDb;
        config.blocks_dir = tmp.path().join("blocks");
        config.blocks_to_keep = 0; // floor of MIN_BLOCKS_TO_KEEP applies
        let state = ChainState::open(
            config,
            storage,
            Arc::new(RateTable::new()),
            Arc::new(SigCache::new(1 << 20)),
            NOW,
        )
        .unwrap();

        let b1 = mine_on(&state, &state.tip(), 0);
        state.process_block(&b1, NOW).unwrap();
        // Far too shallow to prune anything.
        assert_eq!(state.prune().unwrap(), 0);
        assert!(state.get_block(&b1.hash()).is_ok());
    }
}
