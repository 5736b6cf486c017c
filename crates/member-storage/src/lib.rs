//! # member-storage
//!
//! RocksDB-backed storage abstraction for the Membercoin node: column
//! families per data type, atomic batch writes, and a `Storage` trait so the
//! state and chain layers can be exercised against any backend.
//!
//! ## Column families
//!
//! - `Headers`: block headers by block hash
//! - `Blocks`: full block bodies by block hash (block-db mode)
//! - `BlockIndex`: persisted index entries by block hash
//! - `Utxo`: unspent coins by outpoint
//! - `UndoData`: per-block undo records by block hash
//! - `TxIndex`: optional txid -> block locator index
//! - `Metadata`: tips, flags, and other node metadata

mod batch;
mod database;
mod error;

pub use batch::WriteBatch;
pub use database::{ColumnFamily, Database};
pub use error::{StorageError, StorageResult};

/// Storage operations the node's layers build on. Implemented by the
/// RocksDB [`Database`]; mockable in tests.
pub trait Storage: Send + Sync {
    /// Get a value by key from a column family.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Put a key-value pair into a column family.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Delete a key from a column family.
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()>;

    /// Whether a key exists in a column family.
    fn contains(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Execute a batch of writes atomically.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Iterate a column family from the start.
    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;
}
