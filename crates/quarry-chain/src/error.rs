//! Validation error types.

use crate::hash::BlockHash;
use thiserror::Error;

/// Reasons a block fails stateless sanity validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Block carries no transactions.
    #[error("block has no transactions")]
    NoTransactions,

    /// Compact target does not decode to a usable value.
    #[error("compact target {bits:#010x} is invalid")]
    InvalidTarget { bits: u32 },

    /// Decoded target is easier than the chain allows.
    #[error("proof-of-work target {bits:#010x} exceeds the chain limit")]
    TargetAboveLimit { bits: u32 },

    /// Block hash does not satisfy the claimed target.
    #[error("block hash {hash} does not satisfy its proof-of-work target")]
    InsufficientPow { hash: BlockHash },

    /// Block timestamp too far ahead of the network-adjusted clock.
    #[error("block timestamp {timestamp} is too far ahead of adjusted time {adjusted}")]
    TimestampTooFar { timestamp: i64, adjusted: i64 },

    /// First transaction is not a coinbase.
    #[error("first transaction is not a coinbase")]
    MissingCoinbase,

    /// A non-first transaction is a coinbase.
    #[error("transaction {index} is an unexpected coinbase")]
    UnexpectedCoinbase { index: usize },

    /// Two transactions share an id.
    #[error("duplicate transaction {txid}")]
    DuplicateTransaction { txid: BlockHash },

    /// Recomputed merkle root disagrees with the header.
    #[error("computed merkle root {computed} does not match header root {expected}")]
    MerkleMismatch {
        computed: BlockHash,
        expected: BlockHash,
    },
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;
