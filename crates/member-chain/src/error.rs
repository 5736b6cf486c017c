//! Error types for chain management.

use member_consensus::Hash256;
use thiserror::Error;

/// Chain management errors.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] member_storage::StorageError),

    /// State error.
    #[error("State error: {0}")]
    State(#[from] member_state::StateError),

    /// Consensus-level error.
    #[error("Consensus error: {0}")]
    Consensus(#[from] member_consensus::ConsensusError),

    /// Validation verdict.
    #[error("Validation failed: {0}")]
    Validation(#[from] member_consensus::ValidationError),

    /// A block references a parent the index has never seen.
    #[error("Unknown parent block: {0}")]
    UnknownParent(Hash256),

    /// A block hash is not in the index.
    #[error("Unknown block: {0}")]
    UnknownBlock(Hash256),

    /// The data directory belongs to a different network.
    #[error("Incorrect or no genesis block found")]
    WrongGenesis,

    /// A stored block's timestamp implies gross clock skew.
    #[error("Block database contains a block from the future")]
    BlockFromFuture,

    /// I/O error from the flat-file block store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
