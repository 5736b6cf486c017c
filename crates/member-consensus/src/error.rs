//! Error types for consensus validation.

use thiserror::Error;

/// Consensus-level errors for operations that are not block-validation
/// verdicts (serialization, malformed parameters, arithmetic bounds).
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Amount outside the valid monetary range.
    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    /// Malformed script.
    #[error("Script error: {0}")]
    Script(String),

    /// Invalid chain parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// The category of a block- or transaction-validation failure.
///
/// `BadPow` and `BadStructure` are context-free: a block failing them is
/// permanently invalid and never retried. The remaining kinds depend on chain
/// context and are eligible for clearing at startup reconsideration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    /// Proof-of-work does not meet the declared target.
    BadPow,
    /// Structural rule violated (empty block, oversize, bad merkle root...).
    BadStructure,
    /// An input's coin was not found in the UTXO view.
    MissingInputs,
    /// Effective input value does not cover face output value, or the
    /// coinbase claims more than subsidy plus fees.
    BadConservation,
    /// Script execution or signature verification failed.
    BadScript,
    /// The storage layer failed while validating.
    IoFailure,
    /// The worker observed its cancellation flag. Not an error verdict.
    Canceled,
}

/// A validation verdict carrying its category and a human-readable context
/// string.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {context}")]
pub struct ValidationError {
    /// Failure category.
    pub kind: ValidationKind,
    /// Where and why the rule fired.
    pub context: String,
}

impl ValidationError {
    /// Create a verdict with the given kind and context.
    pub fn new(kind: ValidationKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
        }
    }

    /// Bad proof-of-work.
    pub fn bad_pow(context: impl Into<String>) -> Self {
        Self::new(ValidationKind::BadPow, context)
    }

    /// Structural failure.
    pub fn bad_structure(context: impl Into<String>) -> Self {
        Self::new(ValidationKind::BadStructure, context)
    }

    /// Missing input coin.
    pub fn missing_inputs(context: impl Into<String>) -> Self {
        Self::new(ValidationKind::MissingInputs, context)
    }

    /// Conservation violated.
    pub fn bad_conservation(context: impl Into<String>) -> Self {
        Self::new(ValidationKind::BadConservation, context)
    }

    /// Script failure.
    pub fn bad_script(context: impl Into<String>) -> Self {
        Self::new(ValidationKind::BadScript, context)
    }

    /// Cooperative cancellation observed.
    pub fn canceled() -> Self {
        Self::new(ValidationKind::Canceled, "validation canceled")
    }

    /// Whether this failure is context-free and therefore permanent. Blocks
    /// failing for context-dependent reasons keep their data and may be
    /// reconsidered on startup.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind,
            ValidationKind::BadPow | ValidationKind::BadStructure
        )
    }
}

/// Result type for validation verdicts.
pub type ValidationResult<T> = Result<T, ValidationError>;
