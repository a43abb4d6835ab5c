//! # quarry-chain
//!
//! Chain-level building blocks for the pruned block dispatcher:
//! - Block, header, and transaction structures with their canonical hashing
//! - Chain parameters (network identity and proof-of-work limit)
//! - Stateless block sanity validation
//! - A median network-adjusted time source fed by peer version messages

mod block;
mod error;
mod hash;
mod params;
mod timesource;
mod validation;

pub use block::{merkle_root, Block, BlockHeader, Transaction, TxIn, TxOut};
pub use error::{ValidationError, ValidationResult};
pub use hash::{sha256d, BlockHash};
pub use params::{ChainParams, Network};
pub use timesource::MedianTime;
pub use validation::{check_block_sanity, check_proof_of_work, compact_to_target};

/// Maximum number of seconds a block timestamp may be ahead of the
/// network-adjusted time before the block is rejected.
pub const MAX_FUTURE_BLOCK_TIME_SECS: i64 = 2 * 60 * 60;
