//! Error types for mining.

use thiserror::Error;

/// Mining errors.
#[derive(Error, Debug)]
pub enum MiningError {
    /// The scratchpad buffer cannot host the search.
    #[error("Scratchpad too small: {0} bytes")]
    ScratchpadTooSmall(usize),

    /// The difficulty target is unusable.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

/// Result type for mining operations.
pub type MiningResult<T> = Result<T, MiningError>;
