//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetError {
    /// The backend node could not be queried for its peer list.
    #[error("backend error: {0}")]
    Backend(String),

    /// Establishing the transport to a peer failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// A service-flag string from the backend could not be decoded.
    #[error("invalid service flags {value:?}: {reason}")]
    InvalidServices { value: String, reason: String },

    /// The peer did not complete the version exchange in time.
    #[error("timed out waiting for protocol negotiation")]
    HandshakeTimeout,

    /// The peer connection is gone.
    #[error("peer disconnected")]
    Disconnected,

    /// Shutdown was signalled while the operation was in flight.
    #[error("shutting down")]
    ShuttingDown,
}

/// Result type for network operations.
pub type NetResult<T> = Result<T, NetError>;
