//! Error types for state management.

use thiserror::Error;

/// State management errors.
#[derive(Error, Debug)]
pub enum StateError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] member_storage::StorageError),

    /// Consensus-level error (serialization and friends).
    #[error("Consensus error: {0}")]
    Consensus(#[from] member_consensus::ConsensusError),

    /// A coin already exists where a fresh add was attempted.
    #[error("Coin already exists: {0}")]
    CoinExists(String),

    /// Undo data is inconsistent with the block being disconnected.
    #[error("Undo data mismatch: {0}")]
    UndoMismatch(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;
