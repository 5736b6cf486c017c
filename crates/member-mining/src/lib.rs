//! # member-mining
//!
//! Mining-side proof-of-work for Membercoin.
//!
//! This crate provides:
//! - The memory-hard pattern search seeded by the header's SHA-256d
//!   mid-hash over an externally provided scratchpad
//! - Best-candidate selection against the Blake3 outer hash
//! - A pool of CPU mining workers scanning the nonce space
//!
//! Consensus verification never consults any of this: a block is valid
//! when its Blake3 outer hash beats the target, full stop. The pattern
//! search only shapes how miners find such headers.

mod error;
pub mod patternsearch;
pub mod worker;

pub use error::{MiningError, MiningResult};
pub use patternsearch::{find_best_pattern_hash, pattern_search, DEFAULT_SCRATCHPAD_BYTES};
pub use worker::{FoundBlock, MiningTask, WorkerPool};
