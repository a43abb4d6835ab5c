//! # quarry-dispatch
//!
//! The pruned block dispatcher. A wallet backed by a pruned node cannot ask
//! that node for historical blocks; this crate obtains them from the
//! network instead. It connects to a bounded subset of the backend's own
//! peers, multiplexes block requests onto them with retry and peer ranking,
//! sanity-checks every response, bans peers that serve invalid data, and
//! fans validated blocks out to every caller waiting on them.
//!
//! Entry point: [`PrunedBlockDispatcher`].

mod dispatch;
mod error;
mod ranking;
mod registry;
mod work;

pub use dispatch::{
    DispatcherConfig, PrunedBlockDispatcher, DEFAULT_NUM_TARGET_PEERS,
    DEFAULT_PEER_READY_TIMEOUT, DEFAULT_REFRESH_INTERVAL,
};
pub use error::{DispatchError, DispatchResult};
pub use ranking::PeerRanking;
pub use registry::{PendingBlocks, ResolveOutcome};
pub use work::{Progress, QueryError, QueryOptions, Request, ResponseHandler, WorkManager};
