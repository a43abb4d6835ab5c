//! Dispatcher error types.

use thiserror::Error;

/// Errors surfaced synchronously by dispatcher construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The configured target peer count is zero.
    #[error("target peer count must be at least 1")]
    InvalidTargetPeers,

    /// The configured batch limit exceeds what the protocol allows.
    #[error("max invs per request must be at most {max}, got {got}")]
    MaxRequestInvsTooLarge { got: usize, max: usize },
}

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
