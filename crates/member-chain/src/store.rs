//! Block body, undo, and transaction-index storage.
//!
//! Two interchangeable layouts: append-only sequential flat files
//! (`blkNNNNN.dat`, length-prefixed records addressed by `(file, offset)`
//! locators) or the key-value block database. Undo records and the optional
//! txindex always live in the database.

use crate::{ChainError, ChainResult};
use member_consensus::{Block, Hash256};
use member_state::BlockUndo;
use member_storage::{ColumnFamily, Storage, WriteBatch};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Bytes after which a new flat file is started.
const MAX_BLOCKFILE_SIZE: u64 = 128 * 1024 * 1024;

/// Where a block body is stored. In block-db mode the locator is
/// degenerate; the hash is the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    /// Flat-file number, `u32::MAX` in block-db mode.
    pub file: u32,
    /// Byte offset of the record inside the file.
    pub offset: u64,
}

impl BlockLocation {
    /// The locator used in block-db mode.
    pub fn in_db() -> Self {
        Self {
            file: u32::MAX,
            offset: 0,
        }
    }
}

/// Storage mode, selectable by the node's `use_block_db` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStoreMode {
    /// Append-only `blkNNNNN.dat` files.
    SequentialFiles,
    /// Key-value block database.
    BlockDb,
}

struct FileCursor {
    file: u32,
    offset: u64,
}

/// Block body store plus undo and txindex persistence.
pub struct BlockStore {
    mode: BlockStoreMode,
    storage: Arc<dyn Storage>,
    blocks_dir: PathBuf,
    cursor: Mutex<FileCursor>,
    txindex_enabled: bool,
}

impl BlockStore {
    /// Open a store. `blocks_dir` is only used (and created) in
    /// sequential-files mode.
    pub fn open(
        mode: BlockStoreMode,
        storage: Arc<dyn Storage>,
        blocks_dir: PathBuf,
        txindex_enabled: bool,
    ) -> ChainResult<Self> {
        let mut cursor = FileCursor { file: 0, offset: 0 };
        if mode == BlockStoreMode::SequentialFiles {
            std::fs::create_dir_all(&blocks_dir)?;
            // Resume appending at the end of the newest file.
            while blocks_dir.join(blockfile_name(cursor.file + 1)).exists() {
                cursor.file += 1;
            }
            let path = blocks_dir.join(blockfile_name(cursor.file));
            if path.exists() {
                cursor.offset = std::fs::metadata(&path)?.len();
            }
            info!(file = cursor.file, offset = cursor.offset, "Block file store opened");
        }
        Ok(Self {
            mode,
            storage,
            blocks_dir,
            cursor: Mutex::new(cursor),
            txindex_enabled,
        })
    }

    /// The active storage mode.
    pub fn mode(&self) -> BlockStoreMode {
        self.mode
    }

    /// Persist a block body, returning its locator.
    pub fn write_block(&self, block: &Block) -> ChainResult<BlockLocation> {
        let bytes = block.serialize();
        let hash = block.hash();

        let location = match self.mode {
            BlockStoreMode::BlockDb => {
                self.storage
                    .put(ColumnFamily::Blocks, hash.as_bytes(), &bytes)?;
                BlockLocation::in_db()
            }
            BlockStoreMode::SequentialFiles => {
                let mut cursor = self.cursor.lock();
                if cursor.offset >= MAX_BLOCKFILE_SIZE {
                    cursor.file += 1;
                    cursor.offset = 0;
                }
                let path = self.blocks_dir.join(blockfile_name(cursor.file));
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                let record_offset = cursor.offset;
                file.write_all(&(bytes.len() as u32).to_le_bytes())?;
                file.write_all(&bytes)?;
                cursor.offset += 4 + bytes.len() as u64;
                BlockLocation {
                    file: cursor.file,
                    offset: record_offset,
                }
            }
        };

        if self.txindex_enabled {
            let mut batch = WriteBatch::with_capacity(block.txs.len());
            for tx in &block.txs {
                batch.put(
                    ColumnFamily::TxIndex,
                    tx.txid().as_bytes().to_vec(),
                    hash.as_bytes().to_vec(),
                );
            }
            self.storage.write_batch(batch)?;
        }

        debug!(%hash, size = bytes.len(), "Block stored");
        Ok(location)
    }

    /// Read a block body back.
    pub fn read_block(&self, hash: &Hash256, location: BlockLocation) -> ChainResult<Block> {
        let bytes = match self.mode {
            BlockStoreMode::BlockDb => self
                .storage
                .get(ColumnFamily::Blocks, hash.as_bytes())?
                .ok_or(ChainError::UnknownBlock(*hash))?,
            BlockStoreMode::SequentialFiles => {
                let path = self.blocks_dir.join(blockfile_name(location.file));
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(location.offset))?;
                let mut len_bytes = [0u8; 4];
                file.read_exact(&mut len_bytes)?;
                let len = u32::from_le_bytes(len_bytes) as usize;
                let mut bytes = vec![0u8; len];
                file.read_exact(&mut bytes)?;
                bytes
            }
        };
        let block = Block::deserialize(&bytes)?;
        if block.hash() != *hash {
            return Err(ChainError::Storage(
                member_storage::StorageError::Corruption(format!(
                    "stored block hashes to {}, expected {}",
                    block.hash(),
                    hash
                )),
            ));
        }
        Ok(block)
    }

    /// Delete a block body (block-db mode only; flat files are pruned by
    /// whole-file removal elsewhere).
    pub fn delete_block(&self, hash: &Hash256) -> ChainResult<()> {
        if self.mode == BlockStoreMode::BlockDb {
            self.storage.delete(ColumnFamily::Blocks, hash.as_bytes())?;
        }
        Ok(())
    }

    /// Persist undo data for a block.
    pub fn write_undo(&self, hash: &Hash256, undo: &BlockUndo) -> ChainResult<()> {
        self.storage
            .put(ColumnFamily::UndoData, hash.as_bytes(), &undo.serialize())?;
        Ok(())
    }

    /// Read undo data for a block.
    pub fn read_undo(&self, hash: &Hash256) -> ChainResult<BlockUndo> {
        let bytes = self
            .storage
            .get(ColumnFamily::UndoData, hash.as_bytes())?
            .ok_or(ChainError::UnknownBlock(*hash))?;
        Ok(BlockUndo::deserialize(&bytes)?)
    }

    /// Delete undo data.
    pub fn delete_undo(&self, hash: &Hash256) -> ChainResult<()> {
        self.storage.delete(ColumnFamily::UndoData, hash.as_bytes())?;
        Ok(())
    }

    /// Look up the block hash containing a transaction (txindex mode).
    pub fn tx_block_hash(&self, txid: &Hash256) -> ChainResult<Option<Hash256>> {
        if !self.txindex_enabled {
            return Ok(None);
        }
        match self.storage.get(ColumnFamily::TxIndex, txid.as_bytes())? {
            Some(bytes) if bytes.len() == 32 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Some(Hash256(arr)))
            }
            _ => Ok(None),
        }
    }
}

fn blockfile_name(file: u32) -> String {
    format!("blk{:05}.dat", file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use member_consensus::chain_params::{ChainParams, Network};
    use member_storage::Database;
    use tempfile::TempDir;

    fn genesis() -> Block {
        ChainParams::for_network(Network::Regtest).genesis_block()
    }

    fn open_store(mode: BlockStoreMode, txindex: bool) -> (BlockStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(Database::open(tmp.path().join("db")).unwrap());
        let store =
            BlockStore::open(mode, storage, tmp.path().join("blocks"), txindex).unwrap();
        (store, tmp)
    }

    #[test]
    fn test_block_db_roundtrip() {
        let (store, _tmp) = open_store(BlockStoreMode::BlockDb, false);
        let block = genesis();
        let location = store.write_block(&block).unwrap();
        assert_eq!(location, BlockLocation::in_db());
        let read = store.read_block(&block.hash(), location).unwrap();
        assert_eq!(read, block);
    }

    #[test]
    fn test_sequential_files_roundtrip() {
        let (store, _tmp) = open_store(BlockStoreMode::SequentialFiles, false);
        let block = genesis();
        let loc1 = store.write_block(&block).unwrap();
        let loc2 = store.write_block(&block).unwrap();
        assert_eq!(loc1.file, 0);
        assert!(loc2.offset > loc1.offset);

        assert_eq!(store.read_block(&block.hash(), loc1).unwrap(), block);
        assert_eq!(store.read_block(&block.hash(), loc2).unwrap(), block);
    }

    #[test]
    fn test_sequential_files_resume_appending() {
        let tmp = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(Database::open(tmp.path().join("db")).unwrap());
        let block = genesis();

        let loc1 = {
            let store = BlockStore::open(
                BlockStoreMode::SequentialFiles,
                Arc::clone(&storage),
                tmp.path().join("blocks"),
                false,
            )
            .unwrap();
            store.write_block(&block).unwrap()
        };

        // Reopen: the cursor resumes past the existing record.
        let store = BlockStore::open(
            BlockStoreMode::SequentialFiles,
            storage,
            tmp.path().join("blocks"),
            false,
        )
        .unwrap();
        let loc2 = store.write_block(&block).unwrap();
        assert!(loc2.offset > loc1.offset);
        assert_eq!(store.read_block(&block.hash(), loc1).unwrap(), block);
    }

    #[test]
    fn test_undo_roundtrip() {
        let (store, _tmp) = open_store(BlockStoreMode::BlockDb, false);
        let hash = genesis().hash();
        let undo = BlockUndo::default();
        store.write_undo(&hash, &undo).unwrap();
        assert_eq!(store.read_undo(&hash).unwrap(), undo);
        store.delete_undo(&hash).unwrap();
        assert!(store.read_undo(&hash).is_err());
    }

    #[test]
    fn test_txindex_lookup() {
        let (store, _tmp) = open_store(BlockStoreMode::BlockDb, true);
        let block = genesis();
        store.write_block(&block).unwrap();
        let txid = block.txs[0].txid();
        assert_eq!(store.tx_block_hash(&txid).unwrap(), Some(block.hash()));
        assert_eq!(store.tx_block_hash(&Hash256::ZERO).unwrap(), None);
    }
}
