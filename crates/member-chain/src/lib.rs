//! # member-chain
//!
//! Chain management for the Membercoin node.
//!
//! This crate provides:
//! - The block-index arena: every header that passed context-free checks,
//!   with per-entry cumulative work and status flags
//! - Block and undo storage in either sequential flat files or the block
//!   database, plus the optional transaction index
//! - The chain-activation state machine: most-work selection, reorg,
//!   invalidation and reconsideration, pruning accounting
//! - The parallel validation coordinator that races same-parent candidates
//!   across a worker pool with commit-wins resolution

mod chain;
mod coordinator;
mod error;
mod index;
mod store;

pub use chain::{ChainState, ChainStateConfig, CommitOutcome, TipInfo, MIN_BLOCKS_TO_KEEP};
pub use coordinator::{SubmitOutcome, TaskHandle, ValidationCoordinator};
pub use error::{ChainError, ChainResult};
pub use index::{BlockIndex, BlockIndexEntry, BlockIndexId, BlockStatus};
pub use store::{BlockLocation, BlockStore, BlockStoreMode};
