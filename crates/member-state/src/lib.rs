//! # member-state
//!
//! UTXO state management for the Membercoin node.
//!
//! This crate provides:
//! - The layered coins view: a storage-backed base, an error-catching
//!   wrapper that treats read failures as fatal corruption, and an
//!   in-memory cache with dirty/fresh tracking
//! - Per-block undo data for rollback
//! - Block connection and disconnection against a coins cache, including
//!   the interest-aware conservation rules
//!
//! ## Architecture
//!
//! Validation workers fork a private [`CoinsCache`] from the shared tip
//! cache, connect a candidate block into the fork, and the winning fork is
//! merged back by the committer. The base database is only written by
//! [`CoinsCache::flush`].

mod coins;
mod connect;
mod error;
mod undo;

pub use coins::{
    CacheEntry, CoinsCache, CoinsDb, CoinsView, CoinsViewErrorCatcher, SharedCoins,
};
pub use connect::{connect_block, disconnect_block, ConnectContext, ConnectResult};
pub use error::{StateError, StateResult};
pub use undo::{BlockUndo, TxUndo};

use member_storage::ColumnFamily;

/// State-related column families.
pub mod columns {
    use super::ColumnFamily;

    /// Unspent coins.
    pub const UTXO: ColumnFamily = ColumnFamily::Utxo;
    /// Undo data.
    pub const UNDO: ColumnFamily = ColumnFamily::UndoData;
    /// Metadata (best-block marker).
    pub const METADATA: ColumnFamily = ColumnFamily::Metadata;
}
