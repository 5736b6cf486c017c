//! # member-consensus
//!
//! Consensus rules for the Membercoin blockchain.
//!
//! This crate provides:
//! - Block header hashing (Blake3 outer hash, SHA-256d mid-hash) and
//!   proof-of-work verification
//! - The interest accrual engine (per-block compounding rate table and
//!   output valuation)
//! - Transaction and block validation rules
//! - A consensus script interpreter with a bounded signature cache
//!
//! ## Proof-of-Work
//!
//! The block hash is the Blake3 digest of the 80-byte header serialization,
//! interpreted as a little-endian 256-bit integer and compared strictly
//! against the target decoded from `bits`. The SHA-256d mid-hash of the same
//! bytes seeds the miner-side pattern search but never participates in
//! verification.
//!
//! ## Interest
//!
//! Every unspent output accrues interest of `1 + 2^-22` per block, saturating
//! after one year (404,420 blocks). Conservation is enforced on *effective*
//! input value rather than face value; the difference funds fees.

mod amount;
mod cancel;
mod error;
pub mod block;
pub mod block_validation;
pub mod chain_params;
pub mod hash;
pub mod interest;
pub mod pow;
pub mod script;
pub mod serialize;
pub mod sigcache;
pub mod tx;
pub mod tx_validation;

pub use amount::{money_range, Amount, COIN, MAX_MONEY};
pub use cancel::CancelToken;
pub use block::{Block, BlockHeader};
pub use block_validation::{check_block, check_tx_ordering, contextual_check_header};
pub use chain_params::{ChainParams, Network};
pub use error::{
    ConsensusError, ConsensusResult, ValidationError, ValidationKind, ValidationResult,
};
pub use hash::Hash256;
pub use interest::{RateTable, MAX_PERIOD, ONEDAY};
pub use pow::{check_proof_of_work, decode_compact, encode_compact, work_for_bits, CompactTarget};
pub use sigcache::SigCache;
pub use tx::{Coin, OutPoint, Transaction, TxIn, TxOut};
pub use tx_validation::{check_transaction, check_tx_inputs};

/// Network-wide consensus parameters.
pub mod params {
    /// Expected serialized size of a block header in bytes.
    pub const SERIALIZED_HEADER_SIZE: usize = 80;

    /// Base header version (BIP9-style version bits base).
    pub const BASE_VERSION: i32 = 0x2000_0000;

    /// Coinbase outputs can only be spent after this many blocks.
    pub const COINBASE_MATURITY: u32 = 20;

    /// Minimum allowed serialized transaction size in bytes.
    pub const MIN_TX_SIZE: usize = 100;

    /// Maximum signature operations per megabyte of block (rounded up).
    pub const MAX_BLOCK_SIGOPS_PER_MB: u64 = 20_000;

    /// Maximum signature operations in a single transaction.
    pub const MAX_TX_SIGOPS_COUNT: u64 = 20_000;

    /// Ratio between the maximum block size and the maximum executed
    /// signature checks in the block.
    pub const BLOCK_MAXBYTES_MAXSIGCHECKS_RATIO: u64 = 141;

    /// One megabyte, the sigops scaling unit.
    pub const ONE_MEGABYTE: u64 = 1_000_000;

    /// Maximum sigops allowed in a block of the given serialized size.
    pub fn max_block_sigops(block_size: u64) -> u64 {
        let mb_rounded_up = 1 + (block_size.saturating_sub(1)) / ONE_MEGABYTE;
        mb_rounded_up * MAX_BLOCK_SIGOPS_PER_MB
    }

    /// Maximum executed signature checks for the given maximum block size.
    pub fn max_block_sigchecks(max_block_size: u64) -> u64 {
        max_block_size / BLOCK_MAXBYTES_MAXSIGCHECKS_RATIO
    }
}
