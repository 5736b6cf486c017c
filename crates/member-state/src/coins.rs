//! The layered coins view.
//!
//! Three layers compose by delegation: `CoinsDb` reads and batch-writes the
//! storage backend, `CoinsViewErrorCatcher` turns read failures into a
//! process abort (a node that cannot trust its UTXO reads must not keep
//! validating), and `CoinsCache` holds pending mutations in memory with
//! dirty/fresh tracking until a single batched flush.

use crate::{columns, StateError, StateResult};
use member_consensus::{Coin, Hash256, OutPoint};
use member_storage::{Storage, WriteBatch};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Metadata key for the block hash the UTXO set is consistent with.
const BEST_BLOCK_KEY: &[u8] = b"coins_best_block";

/// Read access to a coins view.
pub trait CoinsView: Send + Sync {
    /// Look up an unspent coin.
    fn get_coin(&self, outpoint: &OutPoint) -> StateResult<Option<Coin>>;

    /// Whether an unspent coin exists at the outpoint.
    fn have_coin(&self, outpoint: &OutPoint) -> StateResult<bool> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// The block hash this view is consistent with.
    fn best_block(&self) -> StateResult<Option<Hash256>>;
}

/// Base view over the storage backend.
pub struct CoinsDb {
    storage: Arc<dyn Storage>,
}

impl CoinsDb {
    /// Create a base view.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Apply a set of coin changes and the new best-block marker in one
    /// atomic batch. `None` coin values are deletions.
    pub fn batch_write<I>(&self, changes: I, best_block: Option<Hash256>) -> StateResult<()>
    where
        I: IntoIterator<Item = (OutPoint, Option<Coin>)>,
    {
        let mut batch = WriteBatch::new();
        let mut count = 0usize;
        for (outpoint, coin) in changes {
            match coin {
                Some(coin) => batch.put(columns::UTXO, outpoint.to_key().to_vec(), coin.serialize()),
                None => batch.delete(columns::UTXO, outpoint.to_key().to_vec()),
            }
            count += 1;
        }
        if let Some(hash) = best_block {
            batch.put(columns::METADATA, BEST_BLOCK_KEY, hash.as_bytes().to_vec());
        }
        self.storage.write_batch(batch)?;
        debug!(count, "Coins batch written");
        Ok(())
    }
}

impl CoinsView for CoinsDb {
    fn get_coin(&self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        match self.storage.get(columns::UTXO, &outpoint.to_key())? {
            Some(bytes) => Ok(Some(Coin::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> StateResult<Option<Hash256>> {
        match self.storage.get(columns::METADATA, BEST_BLOCK_KEY)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Some(Hash256(arr)))
            }
            Some(_) => Err(StateError::Serialization(
                "best-block marker has wrong length".into(),
            )),
            None => Ok(None),
        }
    }
}

/// Wrapper that aborts the process on read failure instead of reporting a
/// missing coin. Writes are not wrapped; write failures are the committer's
/// to surface.
pub struct CoinsViewErrorCatcher {
    inner: CoinsDb,
}

impl CoinsViewErrorCatcher {
    /// Wrap a base view.
    pub fn new(inner: CoinsDb) -> Self {
        Self { inner }
    }

    /// The wrapped base, for batch writes.
    pub fn base(&self) -> &CoinsDb {
        &self.inner
    }

    fn die(err: &StateError) -> ! {
        error!(error = %err, "Corrupted block database detected: error reading from coin database");
        std::process::abort();
    }
}

impl CoinsView for CoinsViewErrorCatcher {
    fn get_coin(&self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        match self.inner.get_coin(outpoint) {
            Ok(coin) => Ok(coin),
            Err(err) => Self::die(&err),
        }
    }

    fn best_block(&self) -> StateResult<Option<Hash256>> {
        match self.inner.best_block() {
            Ok(hash) => Ok(hash),
            Err(err) => Self::die(&err),
        }
    }
}

/// One cached coin slot. `dirty` means the slot differs from the parent
/// view; `fresh` means the coin never existed in the base, so a spend can
/// drop the slot without writing anything.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The coin, or `None` once spent.
    pub coin: Option<Coin>,
    /// Slot differs from the parent view.
    pub dirty: bool,
    /// Coin was created above the base and never written down.
    pub fresh: bool,
}

/// In-memory coins layer over any parent view.
pub struct CoinsCache {
    parent: Arc<dyn CoinsView>,
    entries: HashMap<OutPoint, CacheEntry>,
    best_block: Option<Hash256>,
}

impl CoinsCache {
    /// Create an empty cache over the parent view.
    pub fn new(parent: Arc<dyn CoinsView>) -> Self {
        Self {
            parent,
            entries: HashMap::new(),
            best_block: None,
        }
    }

    /// Cache-first lookup that memoizes parent hits.
    pub fn fetch_coin(&mut self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        if let Some(entry) = self.entries.get(outpoint) {
            return Ok(entry.coin.clone());
        }
        let coin = self.parent.get_coin(outpoint)?;
        if let Some(coin) = &coin {
            self.entries.insert(
                *outpoint,
                CacheEntry {
                    coin: Some(coin.clone()),
                    dirty: false,
                    fresh: false,
                },
            );
        }
        Ok(coin)
    }

    /// Add a coin. Fails when an unspent coin already occupies the outpoint
    /// and overwriting was not requested.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        possible_overwrite: bool,
    ) -> StateResult<()> {
        let fresh = match self.entries.get(&outpoint) {
            Some(entry) => {
                if entry.coin.is_some() && !possible_overwrite {
                    return Err(StateError::CoinExists(outpoint.to_string()));
                }
                // Re-adding over a slot spent in this cache: freshness is
                // whatever the slot already established.
                entry.fresh
            }
            None => {
                if !possible_overwrite && self.parent.have_coin(&outpoint)? {
                    return Err(StateError::CoinExists(outpoint.to_string()));
                }
                !possible_overwrite
            }
        };
        self.entries.insert(
            outpoint,
            CacheEntry {
                coin: Some(coin),
                dirty: true,
                fresh,
            },
        );
        Ok(())
    }

    /// Spend a coin, returning the pre-spend record for undo. A fresh coin
    /// is dropped without leaving a tombstone for the base.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        let coin = self.fetch_coin(outpoint)?;
        let Some(coin) = coin else {
            return Ok(None);
        };
        let entry = self
            .entries
            .get_mut(outpoint)
            .expect("fetch_coin memoized the entry");
        if entry.fresh {
            self.entries.remove(outpoint);
        } else {
            entry.coin = None;
            entry.dirty = true;
        }
        Ok(Some(coin))
    }

    /// The block hash this cache is consistent with, falling back to the
    /// parent when unset.
    pub fn cached_best_block(&self) -> StateResult<Option<Hash256>> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.parent.best_block(),
        }
    }

    /// Move the best-block marker.
    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    /// Number of cached slots.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Rough memory footprint for the cache budget.
    pub fn estimated_size_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, e)| {
                96 + e
                    .coin
                    .as_ref()
                    .map(|c| c.output.script_pubkey.len())
                    .unwrap_or(0)
            })
            .sum()
    }

    /// Consume the cache into its pending entries.
    pub fn into_entries(self) -> (HashMap<OutPoint, CacheEntry>, Option<Hash256>) {
        (self.entries, self.best_block)
    }

    /// Merge a child fork's entries into this cache, preserving dirty and
    /// fresh semantics: a fresh-and-spent child slot cancels out, a spend of
    /// a fresh slot here removes the slot entirely.
    #[instrument(skip_all, fields(entries = entries.len()))]
    pub fn apply_entries(
        &mut self,
        entries: HashMap<OutPoint, CacheEntry>,
        best_block: Option<Hash256>,
    ) -> StateResult<()> {
        for (outpoint, child) in entries {
            if !child.dirty {
                continue;
            }
            match self.entries.get_mut(&outpoint) {
                None => {
                    if !(child.fresh && child.coin.is_none()) {
                        self.entries.insert(outpoint, child);
                    }
                }
                Some(existing) => {
                    if child.fresh && existing.coin.is_some() {
                        return Err(StateError::CoinExists(format!(
                            "fresh child coin collides at {}",
                            outpoint
                        )));
                    }
                    if existing.fresh && child.coin.is_none() {
                        self.entries.remove(&outpoint);
                    } else {
                        existing.coin = child.coin;
                        existing.dirty = true;
                    }
                }
            }
        }
        if best_block.is_some() {
            self.best_block = best_block;
        }
        Ok(())
    }

    /// Write all pending mutations to the base in one batch and clear the
    /// cache. Fresh-and-spent slots vanish without touching the base.
    pub fn flush(&mut self, base: &CoinsDb) -> StateResult<()> {
        let entries = std::mem::take(&mut self.entries);
        let changes = entries.into_iter().filter_map(|(outpoint, entry)| {
            if !entry.dirty {
                return None;
            }
            if entry.fresh && entry.coin.is_none() {
                return None;
            }
            Some((outpoint, entry.coin))
        });
        base.batch_write(changes, self.best_block)?;
        Ok(())
    }
}

impl CoinsView for CoinsCache {
    fn get_coin(&self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.parent.get_coin(outpoint),
        }
    }

    fn best_block(&self) -> StateResult<Option<Hash256>> {
        self.cached_best_block()
    }
}

/// The shared tip cache: a [`CoinsCache`] behind a read-write lock so
/// validation workers can fork read-only views while the committer holds
/// exclusive access for merges and flushes.
pub struct SharedCoins {
    inner: RwLock<CoinsCache>,
}

impl SharedCoins {
    /// Wrap a cache.
    pub fn new(cache: CoinsCache) -> Self {
        Self {
            inner: RwLock::new(cache),
        }
    }

    /// Exclusive access for the committer.
    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, CoinsCache> {
        self.inner.write()
    }

    /// Shared read access.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, CoinsCache> {
        self.inner.read()
    }
}

impl CoinsView for SharedCoins {
    fn get_coin(&self, outpoint: &OutPoint) -> StateResult<Option<Coin>> {
        CoinsView::get_coin(&*self.inner.read(), outpoint)
    }

    fn best_block(&self) -> StateResult<Option<Hash256>> {
        self.inner.read().cached_best_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use member_consensus::hash::sha256d;
    use member_consensus::{TxOut, COIN};
    use member_storage::Database;
    use tempfile::TempDir;

    fn coin(value: i64, height: u32) -> Coin {
        Coin::new(TxOut::new(value, vec![0x51]), height, false)
    }

    fn outpoint(seed: &[u8], index: u32) -> OutPoint {
        OutPoint::new(sha256d(seed), index)
    }

    fn db_backed() -> (Arc<CoinsViewErrorCatcher>, CoinsDb, TempDir) {
        let tmp = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(Database::open(tmp.path()).unwrap());
        let catcher = Arc::new(CoinsViewErrorCatcher::new(CoinsDb::new(Arc::clone(&storage))));
        (catcher, CoinsDb::new(storage), tmp)
    }

    #[test]
    fn test_db_roundtrip() {
        let (_, db, _tmp) = db_backed();
        let op = outpoint(b"a", 0);
        db.batch_write([(op, Some(coin(COIN, 5)))], Some(sha256d(b"tip")))
            .unwrap();
        assert_eq!(db.get_coin(&op).unwrap(), Some(coin(COIN, 5)));
        assert_eq!(db.best_block().unwrap(), Some(sha256d(b"tip")));

        db.batch_write([(op, None)], None).unwrap();
        assert_eq!(db.get_coin(&op).unwrap(), None);
    }

    #[test]
    fn test_cache_add_spend_fresh() {
        let (catcher, db, _tmp) = db_backed();
        let mut cache = CoinsCache::new(catcher);
        let op = outpoint(b"fresh", 0);

        cache.add_coin(op, coin(COIN, 1), false).unwrap();
        assert!(cache.fetch_coin(&op).unwrap().is_some());

        // Fresh coin spent before any flush: the slot disappears and the
        // flush writes nothing for it.
        let spent = cache.spend_coin(&op).unwrap().unwrap();
        assert_eq!(spent, coin(COIN, 1));
        assert_eq!(cache.entry_count(), 0);

        cache.flush(&db).unwrap();
        assert_eq!(db.get_coin(&op).unwrap(), None);
    }

    #[test]
    fn test_cache_overwrite_rules() {
        let (catcher, _db, _tmp) = db_backed();
        let mut cache = CoinsCache::new(catcher);
        let op = outpoint(b"dup", 0);

        cache.add_coin(op, coin(COIN, 1), false).unwrap();
        assert!(cache.add_coin(op, coin(2 * COIN, 2), false).is_err());
        cache.add_coin(op, coin(2 * COIN, 2), true).unwrap();
        assert_eq!(cache.fetch_coin(&op).unwrap(), Some(coin(2 * COIN, 2)));
    }

    #[test]
    fn test_flush_then_read_through() {
        let (catcher, db, _tmp) = db_backed();
        let mut cache = CoinsCache::new(Arc::clone(&catcher) as Arc<dyn CoinsView>);
        let op = outpoint(b"persist", 3);

        cache.add_coin(op, coin(7 * COIN, 9), false).unwrap();
        cache.set_best_block(sha256d(b"b1"));
        cache.flush(&db).unwrap();

        // A new cache over the same base sees the flushed coin.
        let mut fresh_cache = CoinsCache::new(catcher);
        assert_eq!(fresh_cache.fetch_coin(&op).unwrap(), Some(coin(7 * COIN, 9)));
        assert_eq!(db.best_block().unwrap(), Some(sha256d(b"b1")));
    }

    #[test]
    fn test_spend_persisted_coin_writes_tombstone() {
        let (catcher, db, _tmp) = db_backed();
        let op = outpoint(b"spendme", 0);
        db.batch_write([(op, Some(coin(COIN, 1)))], None).unwrap();

        let mut cache = CoinsCache::new(catcher);
        assert!(cache.spend_coin(&op).unwrap().is_some());
        cache.flush(&db).unwrap();
        assert_eq!(db.get_coin(&op).unwrap(), None);
    }

    #[test]
    fn test_fork_commit_into_shared() {
        let (catcher, _db, _tmp) = db_backed();
        let shared = Arc::new(SharedCoins::new(CoinsCache::new(catcher)));
        let op_parent = outpoint(b"parent", 0);
        shared
            .write()
            .add_coin(op_parent, coin(COIN, 1), false)
            .unwrap();

        // Fork, mutate privately, shared cache unchanged.
        let mut fork = CoinsCache::new(Arc::clone(&shared) as Arc<dyn CoinsView>);
        let op_child = outpoint(b"child", 0);
        fork.spend_coin(&op_parent).unwrap().unwrap();
        fork.add_coin(op_child, coin(2 * COIN, 2), false).unwrap();
        assert!(CoinsView::get_coin(&*shared.read(), &op_parent)
            .unwrap()
            .is_some());

        // Commit the fork.
        let (entries, best) = fork.into_entries();
        shared.write().apply_entries(entries, best).unwrap();
        assert!(CoinsView::get_coin(&*shared.read(), &op_parent)
            .unwrap()
            .is_none());
        assert!(CoinsView::get_coin(&*shared.read(), &op_child)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_abandoned_fork_leaves_shared_untouched() {
        let (catcher, _db, _tmp) = db_backed();
        let shared = Arc::new(SharedCoins::new(CoinsCache::new(catcher)));
        let op = outpoint(b"stay", 0);
        shared.write().add_coin(op, coin(COIN, 1), false).unwrap();

        {
            let mut fork = CoinsCache::new(Arc::clone(&shared) as Arc<dyn CoinsView>);
            fork.spend_coin(&op).unwrap();
            // Fork dropped without commit.
        }
        assert!(CoinsView::get_coin(&*shared.read(), &op).unwrap().is_some());
    }
}
